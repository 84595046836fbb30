use async_trait::async_trait;
use serde::Deserialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use nucleus_core::config::DispatchSettings;
use nucleus_core::error::{ConfigError, Result};
use nucleus_core::executor::RemoteExecutor;
use nucleus_core::script::Script;
use nucleus_core::types::{ExecutionResult, InstanceId};

use crate::error::AwsCliError;
use crate::process::AwsCli;

/// The only document this executor sends.
pub const SHELL_DOCUMENT: &str = "AWS-RunShellScript";

/// Most slack granted on top of the command timeout before we stop waiting
/// on SSM. Shorter command timeouts get a grace of the same length.
const MAX_WAIT_GRACE: Duration = Duration::from_secs(60);

// ─── SsmExecutor ──────────────────────────────────────────────────────────

/// Remote executor backed by SSM Run Command.
///
/// Sends the script with `send-command` and polls `get-command-invocation`
/// until SSM reports a terminal status.
#[derive(Clone)]
pub struct SsmExecutor {
    cli: Arc<AwsCli>,
    poll_interval: Duration,
    command_timeout: Duration,
}

impl SsmExecutor {
    pub fn new(cli: Arc<AwsCli>) -> Self {
        Self::from_settings(cli, &DispatchSettings::default())
    }

    pub fn from_settings(cli: Arc<AwsCli>, settings: &DispatchSettings) -> Self {
        Self {
            cli,
            poll_interval: settings.poll_interval(),
            command_timeout: settings.command_timeout(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Issue the command and return its id.
    async fn send(&self, instance: &InstanceId, script: &Script) -> Result<String> {
        let params = serde_json::json!({
            "commands": script.lines(),
            "executionTimeout": [self.command_timeout.as_secs().to_string()],
        });
        // Parameters hold the rendered script (credentials included), so they
        // go through a private temp file instead of argv.
        let mut file = tempfile::Builder::new()
            .prefix("nucleus-ssm-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| invocation(instance, e))?;
        serde_json::to_writer(&mut file, &params).map_err(|e| invocation(instance, e))?;
        file.flush().map_err(|e| invocation(instance, e))?;

        let parameters = format!("file://{}", file.path().display());
        let out: SendCommandOutput = self
            .cli
            .call(
                "ssm",
                "send-command",
                [
                    "--document-name",
                    SHELL_DOCUMENT,
                    "--instance-ids",
                    instance.as_str(),
                    "--comment",
                    "nucleus configuration",
                    "--parameters",
                    parameters.as_str(),
                ],
            )
            .await
            .map_err(|e| invocation(instance, script.redact(&e.to_string())))?;
        Ok(out.command.command_id)
    }

    /// One `get-command-invocation` call. `None` while SSM has not registered
    /// the invocation yet.
    async fn status(&self, instance: &InstanceId, command_id: &str) -> Result<Option<Invocation>> {
        let res: std::result::Result<Invocation, AwsCliError> = self
            .cli
            .call(
                "ssm",
                "get-command-invocation",
                ["--command-id", command_id, "--instance-id", instance.as_str()],
            )
            .await;
        match res {
            Ok(inv) => Ok(Some(inv)),
            Err(e) if e.has_code("InvocationDoesNotExist") => Ok(None),
            Err(e) => Err(invocation(instance, e)),
        }
    }
}

#[async_trait]
impl RemoteExecutor for SsmExecutor {
    async fn execute(&self, instance: &InstanceId, script: &Script) -> Result<ExecutionResult> {
        let command_id = self.send(instance, script).await?;
        tracing::info!(instance = %instance, command_id = %command_id, "command sent");

        let wait = self.command_timeout + self.command_timeout.min(MAX_WAIT_GRACE);
        let give_up = tokio::time::Instant::now() + wait;
        loop {
            tokio::time::sleep(self.poll_interval).await;

            let last_status = match self.status(instance, &command_id).await? {
                Some(inv) if inv.is_terminal() => return Ok(inv.into_result(instance)),
                Some(inv) => {
                    tracing::debug!(instance = %instance, status = %inv.status, "command status");
                    format!("still {}", inv.status)
                }
                None => {
                    tracing::debug!(instance = %instance, command_id = %command_id, "invocation not registered yet");
                    "never registered".to_string()
                }
            };
            if tokio::time::Instant::now() >= give_up {
                return Ok(ExecutionResult::timed_out(
                    instance.clone(),
                    format!("command {command_id} {last_status} after {}s", wait.as_secs()),
                ));
            }
        }
    }
}

fn invocation(instance: &InstanceId, reason: impl ToString) -> ConfigError {
    ConfigError::DispatchInvocation {
        instance: instance.to_string(),
        reason: reason.to_string(),
    }
}

// ─── Output types ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SendCommandOutput {
    #[serde(rename = "Command")]
    command: SentCommand,
}

#[derive(Deserialize)]
struct SentCommand {
    #[serde(rename = "CommandId")]
    command_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Invocation {
    status: String,
    #[serde(default)]
    status_details: String,
    #[serde(default)]
    response_code: Option<i64>,
    #[serde(default)]
    standard_output_content: String,
    #[serde(default)]
    standard_error_content: String,
}

impl Invocation {
    fn is_terminal(&self) -> bool {
        !matches!(
            self.status.as_str(),
            "Pending" | "InProgress" | "Delayed" | "Cancelling"
        )
    }

    fn into_result(self, instance: &InstanceId) -> ExecutionResult {
        if self.status == "Success" {
            return ExecutionResult::succeeded(instance.clone(), self.standard_output_content);
        }
        let mut detail = if self.status_details.is_empty() || self.status_details == self.status {
            self.status.clone()
        } else {
            format!("{} ({})", self.status, self.status_details)
        };
        if let Some(code) = self.response_code.filter(|c| *c >= 0) {
            detail.push_str(&format!(", exit {code}"));
        }
        if let Some(line) = self
            .standard_error_content
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
        {
            detail.push_str(&format!(": {}", line.trim()));
        }
        if matches!(self.status.as_str(), "TimedOut") {
            return ExecutionResult::timed_out(instance.clone(), detail);
        }
        ExecutionResult::failed(instance.clone(), self.standard_output_content, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeAws;
    use nucleus_core::error::ErrorKind;
    use nucleus_core::types::ExecutionStatus;

    const SENT: &str = r#"{"Command":{"CommandId":"cmd-123","DocumentName":"AWS-RunShellScript"}}"#;

    /// Fake that answers `send-command` and then serves `get-command-invocation`
    /// responses from `$FAKE_AWS_DIR/inv.N`, one per poll.
    fn fake(invocations: &[&str]) -> FakeAws {
        let body = format!(
            r#"case "$2" in
send-command)
  echo "$@" > "$FAKE_AWS_DIR/send_args"
  for a in "$@"; do case "$a" in file://*) cp "${{a#file://}}" "$FAKE_AWS_DIR/params.json";; esac; done
  echo '{SENT}'
  ;;
get-command-invocation)
  n=$(cat "$FAKE_AWS_DIR/polls" 2>/dev/null || echo 0)
  n=$((n+1))
  echo $n > "$FAKE_AWS_DIR/polls"
  f="$FAKE_AWS_DIR/inv.$n"
  [ -f "$f" ] || f="$FAKE_AWS_DIR/inv.last"
  case "$(cat "$f")" in
  missing)
    echo "An error occurred (InvocationDoesNotExist) when calling the GetCommandInvocation operation: " >&2
    exit 254 ;;
  denied)
    echo "An error occurred (AccessDeniedException) when calling the GetCommandInvocation operation: not authorized" >&2
    exit 254 ;;
  esac
  cat "$f"
  ;;
esac"#
        );
        let fake = FakeAws::new(&body);
        for (i, inv) in invocations.iter().enumerate() {
            fake.write(&format!("inv.{}", i + 1), inv);
        }
        if let Some(last) = invocations.last() {
            fake.write("inv.last", last);
        }
        fake
    }

    fn executor(fake: &FakeAws) -> SsmExecutor {
        SsmExecutor::new(Arc::new(fake.cli())).with_poll_interval(Duration::from_millis(5))
    }

    fn script() -> Script {
        Script::with_sensitive(
            vec!["echo start".into(), "nst --master-password 'p1'".into()],
            vec!["p1".into()],
        )
    }

    #[tokio::test]
    async fn success_after_polling() {
        let fake = fake(&[
            "missing",
            r#"{"Status":"InProgress","StatusDetails":"InProgress"}"#,
            r#"{"Status":"Success","StatusDetails":"Success","ResponseCode":0,"StandardOutputContent":"done\n"}"#,
        ]);
        let result = executor(&fake)
            .execute(&InstanceId::new("i-1"), &script())
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.output, "done\n");
        assert_eq!(fake.read("polls"), "3");
    }

    #[tokio::test]
    async fn sends_shell_document_with_params_file() {
        let fake = fake(&[r#"{"Status":"Success"}"#]);
        executor(&fake)
            .execute(&InstanceId::new("i-1"), &script())
            .await
            .unwrap();
        let args = fake.read("send_args");
        assert!(args.contains("--document-name AWS-RunShellScript"));
        assert!(args.contains("--instance-ids i-1"));
        assert!(!args.contains("p1"));

        let params: serde_json::Value = serde_json::from_str(&fake.read("params.json")).unwrap();
        assert_eq!(params["commands"][1], "nst --master-password 'p1'");
        assert_eq!(params["executionTimeout"][0], "600");
    }

    #[tokio::test]
    async fn failed_command_is_recorded_not_raised() {
        let fake = fake(&[
            r#"{"Status":"Failed","StatusDetails":"Failed","ResponseCode":2,"StandardOutputContent":"partial","StandardErrorContent":"pip3: not found\n"}"#,
        ]);
        let result = executor(&fake)
            .execute(&InstanceId::new("i-1"), &script())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error_kind, Some(ErrorKind::DispatchExecution));
        assert_eq!(result.output, "partial");
        assert_eq!(result.error.as_deref(), Some("Failed, exit 2: pip3: not found"));
    }

    #[tokio::test]
    async fn ssm_timeout_is_reported_as_timeout() {
        let fake = fake(&[r#"{"Status":"TimedOut","StatusDetails":"ExecutionTimedOut","ResponseCode":-1}"#]);
        let result = executor(&fake)
            .execute(&InstanceId::new("i-1"), &script())
            .await
            .unwrap();
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(result.error.as_deref(), Some("TimedOut (ExecutionTimedOut)"));
    }

    #[tokio::test]
    async fn unknown_instance_is_invocation_error() {
        let fake = FakeAws::new(
            r#"echo "An error occurred (InvalidInstanceId) when calling the SendCommand operation: Instances [[i-nope]] not in a valid state" >&2; exit 254"#,
        );
        let err = executor(&fake)
            .execute(&InstanceId::new("i-nope"), &script())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DispatchInvocation);
        assert!(err.to_string().contains("i-nope"));
    }

    /// Executor whose command timeout (and so its grace) is zero: it gives
    /// up after the first poll that does not report a terminal status.
    fn impatient(fake: &FakeAws) -> SsmExecutor {
        let settings = DispatchSettings {
            command_timeout_seconds: 0,
            poll_interval_seconds: 0,
            ..DispatchSettings::default()
        };
        SsmExecutor::from_settings(Arc::new(fake.cli()), &settings)
    }

    #[tokio::test]
    async fn invocation_that_never_registers_times_out() {
        let fake = fake(&["missing"]);
        let result = impatient(&fake)
            .execute(&InstanceId::new("i-1"), &script())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(
            result.error.as_deref(),
            Some("command cmd-123 never registered after 0s")
        );
        assert_eq!(fake.read("polls"), "1");
    }

    #[tokio::test]
    async fn command_stuck_in_progress_times_out() {
        let fake = fake(&[r#"{"Status":"InProgress","StatusDetails":"InProgress"}"#]);
        let result = impatient(&fake)
            .execute(&InstanceId::new("i-1"), &script())
            .await
            .unwrap();
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert!(result.error.as_deref().unwrap().contains("still InProgress"));
    }

    #[tokio::test]
    async fn status_error_after_send_is_invocation_error() {
        let fake = fake(&["denied"]);
        let err = executor(&fake)
            .execute(&InstanceId::new("i-1"), &script())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DispatchInvocation);
        assert!(err.to_string().contains("AccessDeniedException"));
        assert_eq!(fake.read("polls"), "1");
    }

    #[test]
    fn non_terminal_statuses() {
        let inv = |s: &str| Invocation {
            status: s.into(),
            status_details: String::new(),
            response_code: None,
            standard_output_content: String::new(),
            standard_error_content: String::new(),
        };
        assert!(!inv("Pending").is_terminal());
        assert!(!inv("InProgress").is_terminal());
        assert!(inv("Success").is_terminal());
        assert!(inv("Cancelled").is_terminal());
    }
}
