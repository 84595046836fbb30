use serde::de::DeserializeOwned;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nucleus_core::config::AwsSettings;
use tokio::process::Command;

use crate::error::{AwsCliError, Result};

// ─── AwsCli ───────────────────────────────────────────────────────────────

/// A handle on the `aws` command-line client.
///
/// Every call runs `aws <service> <operation> … --output json` and decodes
/// stdout. Failures are classified from stderr (see [`AwsCliError`]). The
/// child is killed if the calling future is dropped, so a cancelled
/// invocation does not leave clients running.
#[derive(Debug, Clone)]
pub struct AwsCli {
    bin: PathBuf,
    region: Option<String>,
    profile: Option<String>,
    call_timeout: Option<Duration>,
}

impl AwsCli {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            region: None,
            profile: None,
            call_timeout: None,
        }
    }

    /// Use `settings.bin`, or find `aws` on `PATH`. Region, profile and the
    /// per-call limit come from the same settings.
    pub fn from_settings(settings: &AwsSettings) -> Result<Self> {
        let bin = match &settings.bin {
            Some(bin) => bin.clone(),
            None => which::which("aws").map_err(|_| AwsCliError::NotInstalled)?,
        };
        let mut cli = Self::new(bin);
        cli.region = settings.region.clone();
        cli.profile = settings.profile.clone();
        cli.call_timeout = settings.call_timeout();
        Ok(cli)
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn bin(&self) -> &Path {
        &self.bin
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout
    }

    /// Run `aws <service> <operation> <args…>` and decode its JSON output.
    /// Empty output decodes as JSON `null`.
    pub async fn call<T, I, S>(&self, service: &str, operation: &str, args: I) -> Result<T>
    where
        T: DeserializeOwned,
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let label = format!("{service} {operation}");
        let mut cmd = self.command(service, operation, args);
        tracing::debug!(call = %label, region = ?self.region, "aws call");

        let output = match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| AwsCliError::Timeout {
                    operation: label.clone(),
                    seconds: limit.as_secs(),
                })??,
            None => cmd.output().await?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let err = AwsCliError::from_stderr(&label, &stderr, output.status.code());
            tracing::debug!(call = %label, code = ?err.code(), "aws call failed");
            return Err(err);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let body = if stdout.trim().is_empty() {
            "null"
        } else {
            stdout.trim()
        };
        serde_json::from_str(body).map_err(|source| AwsCliError::Parse {
            operation: label,
            source,
        })
    }

    fn command<I, S>(&self, service: &str, operation: &str, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut cmd = Command::new(&self.bin);
        cmd.arg(service)
            .arg(operation)
            .args(args.into_iter().map(Into::<OsString>::into))
            .arg("--output")
            .arg("json")
            .arg("--no-cli-pager");
        if let Some(region) = &self.region {
            cmd.arg("--region").arg(region);
        }
        if let Some(profile) = &self.profile {
            cmd.arg("--profile").arg(profile);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeAws;
    use serde_json::Value;

    fn settings(fake: &FakeAws) -> AwsSettings {
        AwsSettings {
            bin: Some(fake.cli().bin().to_path_buf()),
            ..AwsSettings::default()
        }
    }

    #[tokio::test]
    async fn decodes_stdout_json() {
        let fake = FakeAws::new(r#"echo '{"Answer": 42}'"#);
        let v: Value = fake.cli().call("sts", "get-caller-identity", Vec::<String>::new()).await.unwrap();
        assert_eq!(v["Answer"], 42);
    }

    #[tokio::test]
    async fn passes_region_profile_and_output_flags() {
        let fake = FakeAws::new(r#"echo "$@" > "$FAKE_AWS_DIR/args"; echo '{}'"#);
        let cli = AwsCli::from_settings(&AwsSettings {
            region: Some("us-west-2".into()),
            profile: Some("ops".into()),
            ..settings(&fake)
        })
        .unwrap();
        let _: Value = cli.call("ec2", "stop-instances", ["--instance-ids", "i-1"]).await.unwrap();
        let args = fake.read("args");
        assert!(args.starts_with("ec2 stop-instances --instance-ids i-1 --output json"));
        assert!(args.contains("--region us-west-2"));
        assert!(args.contains("--profile ops"));
    }

    #[tokio::test]
    async fn empty_stdout_is_null() {
        let fake = FakeAws::new("true");
        let v: Value = fake.cli().call("ec2", "noop", Vec::<String>::new()).await.unwrap();
        assert!(v.is_null());
    }

    #[tokio::test]
    async fn non_zero_exit_is_classified() {
        let fake = FakeAws::new(
            r#"echo "An error occurred (AccessDeniedException) when calling the GetSecretValue operation: no" >&2; exit 254"#,
        );
        let err = fake
            .cli()
            .call::<Value, _, _>("secretsmanager", "get-secret-value", ["--secret-id", "x"])
            .await
            .unwrap_err();
        assert!(err.has_code("AccessDeniedException"));
    }

    #[tokio::test]
    async fn garbage_stdout_is_parse_error() {
        let fake = FakeAws::new("echo not-json");
        let err = fake
            .cli()
            .call::<Value, _, _>("ssm", "describe", Vec::<String>::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AwsCliError::Parse { .. }));
    }

    #[tokio::test]
    async fn slow_call_times_out() {
        let fake = FakeAws::new("sleep 5");
        let cli = AwsCli::from_settings(&AwsSettings {
            call_timeout_seconds: 1,
            ..settings(&fake)
        })
        .unwrap();
        let err = cli
            .call::<Value, _, _>("ssm", "slow", Vec::<String>::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AwsCliError::Timeout { .. }));
    }

    #[test]
    fn explicit_bin_skips_path_lookup() {
        let settings = AwsSettings {
            bin: Some(PathBuf::from("/opt/aws/bin/aws")),
            region: Some("eu-west-1".into()),
            ..AwsSettings::default()
        };
        let cli = AwsCli::from_settings(&settings).unwrap();
        assert_eq!(cli.bin(), Path::new("/opt/aws/bin/aws"));
        assert_eq!(cli.region(), Some("eu-west-1"));
        assert_eq!(cli.call_timeout(), Some(Duration::from_secs(120)));
    }
}
