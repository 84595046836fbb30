#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tempfile::TempDir;

fn nucleus(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("nucleus-config").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("NUCLEUS_CONFIG")
        .env_remove("NUCLEUS_AWS_BIN")
        .env_remove("NUCLEUS_MAX_CONCURRENCY")
        .env_remove("NUCLEUS_DISPATCH_TIMEOUT_SECONDS")
        .env_remove("LOG_LEVEL");
    cmd
}

fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

const NUCLEUS_EVENT: &str = r#"{
  "RequestType": "Create",
  "RequestId": "11111111-2222-3333-4444-555555555555",
  "StackId": "arn:aws:cloudformation:us-west-2:123456789012:stack/omni-nucleus/guid",
  "LogicalResourceId": "NucleusServerConfig",
  "ResponseURL": "https://example.invalid/response",
  "ResourceProperties": {
    "ServiceToken": "arn:aws:lambda:us-west-2:123456789012:function:cfg",
    "primaryInstanceId": "i-primary",
    "standbyInstanceId": "i-standby",
    "artifactsBucket": "omni-artifacts",
    "reverseProxyDomain": "nucleus.example.com",
    "nucleusBuild": "nucleus-stack-2023.1.0",
    "ovMainLoginSecretArn": "main",
    "ovServiceLoginSecretArn": "svc",
    "region": "us-west-2"
  }
}"#;

fn proxy_event(request_type: &str, group: &str) -> String {
    format!(
        r#"{{
  "RequestType": "{request_type}",
  "RequestId": "req-2",
  "StackId": "arn:aws:cloudformation:us-west-2:123456789012:stack/omni-rp/guid",
  "LogicalResourceId": "ReverseProxyConfig",
  "ResourceProperties": {{
    "ARTIFACTS_BUCKET_NAME": "omni-artifacts",
    "FULL_DOMAIN": "nucleus.example.com",
    "RP_AUTOSCALING_GROUP_NAME": "{group}",
    "NUCLEUS_SERVER_ADDRESS": "nucleus.internal"
  }}
}}"#
    )
}

/// A fake `aws` client: secrets resolve to password `p1`, `rp-asg` is an
/// empty group, every SSM command succeeds except on `i-broken`.
fn fake_aws(dir: &TempDir) -> PathBuf {
    let script = r#"#!/bin/sh
case "$1 $2" in
"secretsmanager get-secret-value")
  echo '{"SecretString":"{\"password\":\"p1\"}"}' ;;
"autoscaling describe-auto-scaling-groups")
  if [ "$4" = "rp-asg" ]; then
    echo '{"AutoScalingGroups":[{"AutoScalingGroupName":"rp-asg","Instances":[]}]}'
  else
    echo '{"AutoScalingGroups":[]}'
  fi ;;
"ssm send-command")
  echo "{\"Command\":{\"CommandId\":\"cmd-$6\"}}" ;;
"ssm get-command-invocation")
  if [ "$4" = "cmd-i-broken" ]; then
    echo '{"Status":"Failed","ResponseCode":1,"StandardErrorContent":"nst: command not found"}'
  else
    echo '{"Status":"Success","ResponseCode":0,"StandardOutputContent":"ok"}'
  fi ;;
"ec2 stop-instances")
  echo '{"StoppingInstances":[]}' ;;
*)
  echo "unexpected call" >&2; exit 2 ;;
esac
"#;
    let path = write(dir, "aws", script);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn fast_settings(dir: &TempDir) -> PathBuf {
    write(dir, "nucleus.yaml", "dispatch:\n  poll_interval_seconds: 0\n")
}

// ---------------------------------------------------------------------------
// render
// ---------------------------------------------------------------------------

#[test]
fn render_prints_redacted_nucleus_script() {
    let dir = TempDir::new().unwrap();
    let event = write(&dir, "event.json", NUCLEUS_EVENT);
    nucleus(&dir)
        .args(["render", "--event"])
        .arg(&event)
        .assert()
        .success()
        .stdout(predicate::str::contains("generate-nucleus-stack"))
        .stdout(predicate::str::contains("--master-password ********"))
        .stdout(predicate::str::contains("master_password>").not())
        .stdout(predicate::str::contains("# targets:  instances[i-primary,i-standby]"));
}

#[test]
fn render_reads_event_from_stdin() {
    let dir = TempDir::new().unwrap();
    nucleus(&dir)
        .args(["render", "--event", "-"])
        .write_stdin(proxy_event("Update", "rp-asg"))
        .assert()
        .success()
        .stdout(predicate::str::contains("rpt generate-nginx-config"))
        .stdout(predicate::str::contains("# targets:  group:rp-asg"));
}

#[test]
fn render_json_lists_lines_and_selector() {
    let dir = TempDir::new().unwrap();
    let event = write(&dir, "event.json", &proxy_event("Create", "rp-asg"));
    let output = nucleus(&dir)
        .args(["--json", "render", "--event"])
        .arg(&event)
        .output()
        .unwrap();
    assert!(output.status.success());
    let v: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(v["template"], "reverse_proxy");
    assert_eq!(v["selector"]["type"], "group");
    assert_eq!(v["lines"].as_array().unwrap().len(), 14);
}

#[test]
fn render_delete_event_fails() {
    let dir = TempDir::new().unwrap();
    let event = write(&dir, "event.json", &proxy_event("Delete", "rp-asg"));
    nucleus(&dir)
        .args(["render", "--event"])
        .arg(&event)
        .assert()
        .failure()
        .stderr(predicate::str::contains("delete events"));
}

#[test]
fn malformed_event_is_rejected() {
    let dir = TempDir::new().unwrap();
    let event = write(&dir, "event.json", "{ not json");
    nucleus(&dir)
        .args(["render", "--event"])
        .arg(&event)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid lifecycle event"));
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

#[test]
fn config_show_merges_file_and_env() {
    let dir = TempDir::new().unwrap();
    let settings = write(&dir, "nucleus.yaml", "log_level: debug\ndispatch:\n  timeout_seconds: 120\n");
    nucleus(&dir)
        .args(["config", "show", "--config"])
        .arg(&settings)
        .env("NUCLEUS_MAX_CONCURRENCY", "3")
        .assert()
        .success()
        .stdout(predicate::str::contains("timeout_seconds: 120"))
        .stdout(predicate::str::contains("max_concurrency: 3"))
        .stdout(predicate::str::contains("log_level: debug"));
}

#[test]
fn config_validate_clean() {
    let dir = TempDir::new().unwrap();
    nucleus(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Settings are valid"));
}

#[test]
fn config_validate_reports_bad_env() {
    let dir = TempDir::new().unwrap();
    nucleus(&dir)
        .args(["config", "validate"])
        .env("NUCLEUS_DISPATCH_TIMEOUT_SECONDS", "soon")
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error] NUCLEUS_DISPATCH_TIMEOUT_SECONDS"));
}

#[test]
fn missing_settings_file_fails() {
    let dir = TempDir::new().unwrap();
    nucleus(&dir)
        .args(["config", "show", "--config", "nope.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load settings"));
}

// ---------------------------------------------------------------------------
// handle
// ---------------------------------------------------------------------------

#[test]
fn handle_nucleus_event_succeeds() {
    let dir = TempDir::new().unwrap();
    let aws = fake_aws(&dir);
    let settings = fast_settings(&dir);
    let event = write(&dir, "event.json", NUCLEUS_EVENT);
    let output = nucleus(&dir)
        .env("NUCLEUS_AWS_BIN", &aws)
        .args(["--json", "handle", "--event"])
        .arg(&event)
        .arg("--config")
        .arg(&settings)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let body: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(body["Status"], "SUCCESS");
    assert_eq!(body["PhysicalResourceId"], "omni-nucleus_NucleusServerConfig_11111111");
    assert_eq!(body["Data"]["Instances"], serde_json::json!(["i-primary", "i-standby"]));
}

#[test]
fn handle_table_output_shows_post_action() {
    let dir = TempDir::new().unwrap();
    let aws = fake_aws(&dir);
    let settings = fast_settings(&dir);
    let event = write(&dir, "event.json", NUCLEUS_EVENT);
    nucleus(&dir)
        .env("NUCLEUS_AWS_BIN", &aws)
        .args(["handle", "--config"])
        .arg(&settings)
        .arg("--event")
        .arg(&event)
        .assert()
        .success()
        .stdout(predicate::str::contains("Success: configured 2 instance(s)"))
        .stdout(predicate::str::contains("stop"));
}

#[test]
fn handle_partial_failure_lists_every_instance() {
    let dir = TempDir::new().unwrap();
    let aws = fake_aws(&dir);
    let settings = fast_settings(&dir);
    let event = write(&dir, "event.json", &NUCLEUS_EVENT.replace("i-standby", "i-broken"));
    nucleus(&dir)
        .env("NUCLEUS_AWS_BIN", &aws)
        .args(["handle", "--config"])
        .arg(&settings)
        .arg("--event")
        .arg(&event)
        .assert()
        .failure()
        .stdout(predicate::str::contains("Failed: 1 of 2 instance(s) failed"))
        .stdout(predicate::str::is_match(r"i-primary\s+succeeded").unwrap())
        .stdout(predicate::str::is_match(r"i-broken\s+failed").unwrap())
        .stdout(predicate::str::contains("nst: command not found"));
}

#[test]
fn handle_partial_failure_json_names_failed_instances() {
    let dir = TempDir::new().unwrap();
    let aws = fake_aws(&dir);
    let settings = fast_settings(&dir);
    let event = write(&dir, "event.json", &NUCLEUS_EVENT.replace("i-standby", "i-broken"));
    let output = nucleus(&dir)
        .env("NUCLEUS_AWS_BIN", &aws)
        .args(["--json", "handle", "--config"])
        .arg(&settings)
        .arg("--event")
        .arg(&event)
        .output()
        .unwrap();
    assert!(!output.status.success());
    let body: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(body["Status"], "FAILED");
    assert_eq!(body["Data"]["ErrorKind"], "instances_failed");
    assert_eq!(body["Data"]["Instances"], serde_json::json!(["i-primary", "i-broken"]));
    assert_eq!(body["Data"]["Failed"], serde_json::json!(["i-broken"]));
}

#[test]
fn handle_empty_group_succeeds_with_no_instances() {
    let dir = TempDir::new().unwrap();
    let aws = fake_aws(&dir);
    nucleus(&dir)
        .env("NUCLEUS_AWS_BIN", &aws)
        .args(["--json", "handle"])
        .write_stdin(proxy_event("Create", "rp-asg"))
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""Status": "SUCCESS""#));
}

#[test]
fn handle_missing_group_fails() {
    let dir = TempDir::new().unwrap();
    let aws = fake_aws(&dir);
    nucleus(&dir)
        .env("NUCLEUS_AWS_BIN", &aws)
        .args(["--json", "handle"])
        .write_stdin(proxy_event("Update", "missing-asg"))
        .assert()
        .failure()
        .stdout(predicate::str::contains(r#""Status": "FAILED""#))
        .stdout(predicate::str::contains("group_not_found"))
        .stderr(predicate::str::contains("instance group not found: missing-asg"));
}

#[test]
fn handle_delete_is_accepted() {
    let dir = TempDir::new().unwrap();
    let aws = fake_aws(&dir);
    nucleus(&dir)
        .env("NUCLEUS_AWS_BIN", &aws)
        .args(["handle"])
        .write_stdin(proxy_event("Delete", "rp-asg"))
        .assert()
        .success()
        .stdout(predicate::str::contains("Delete accepted, nothing to do"));
}
