use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AwsCliError {
    #[error("aws command-line client not found (install it or set aws.bin / NUCLEUS_AWS_BIN)")]
    NotInstalled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The client ran and exited non-zero. `code` is the AWS error code
    /// parsed from stderr when present (e.g. `ResourceNotFoundException`).
    #[error("aws {operation} failed{}: {message}", code_suffix(.code))]
    Command {
        operation: String,
        code: Option<String>,
        message: String,
    },

    #[error("could not parse output of aws {operation}: {source}")]
    Parse {
        operation: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("aws {operation} did not finish within {seconds}s")]
    Timeout { operation: String, seconds: u64 },
}

impl AwsCliError {
    /// Build a `Command` error from the client's stderr.
    pub fn from_stderr(operation: &str, stderr: &str, exit_code: Option<i32>) -> Self {
        let stderr = stderr.trim();
        let message = match (stderr.is_empty(), exit_code) {
            (false, _) => last_line(stderr).to_string(),
            (true, Some(code)) => format!("exited with code {code}"),
            (true, None) => "terminated by signal".to_string(),
        };
        AwsCliError::Command {
            operation: operation.to_string(),
            code: error_code(stderr),
            message,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            AwsCliError::Command { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn has_code(&self, wanted: &str) -> bool {
        self.code() == Some(wanted)
    }

    /// The request was well-formed but names something that does not exist.
    pub fn is_not_found(&self) -> bool {
        self.code().is_some_and(|c| {
            c == "ResourceNotFoundException" || c.starts_with("InvalidInstanceID.NotFound")
        })
    }
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default()
}

static CODE_RE: OnceLock<Regex> = OnceLock::new();

fn code_re() -> &'static Regex {
    CODE_RE.get_or_init(|| Regex::new(r"An error occurred \(([A-Za-z0-9.:_\-]+)\)").unwrap())
}

fn error_code(stderr: &str) -> Option<String> {
    code_re()
        .captures(stderr)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or(text)
        .trim()
}

pub type Result<T> = std::result::Result<T, AwsCliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_error_code_from_stderr() {
        let err = AwsCliError::from_stderr(
            "secretsmanager get-secret-value",
            "\nAn error occurred (ResourceNotFoundException) when calling the GetSecretValue \
             operation: Secrets Manager can't find the specified secret.\n",
            Some(254),
        );
        assert_eq!(err.code(), Some("ResourceNotFoundException"));
        assert!(err.is_not_found());
        assert!(err.to_string().contains("(ResourceNotFoundException)"));
    }

    #[test]
    fn invalid_instance_id_code() {
        let err = AwsCliError::from_stderr(
            "ssm send-command",
            "An error occurred (InvalidInstanceId) when calling the SendCommand operation: ",
            Some(254),
        );
        assert!(err.has_code("InvalidInstanceId"));
        assert!(!err.is_not_found());
    }

    #[test]
    fn empty_stderr_reports_exit_code() {
        let err = AwsCliError::from_stderr("ec2 stop-instances", "", Some(2));
        assert_eq!(err.code(), None);
        assert_eq!(err.to_string(), "aws ec2 stop-instances failed: exited with code 2");
    }

    #[test]
    fn connection_errors_have_no_code() {
        let err = AwsCliError::from_stderr(
            "ssm send-command",
            "Could not connect to the endpoint URL: \"https://ssm.us-west-2.amazonaws.com/\"",
            Some(255),
        );
        assert_eq!(err.code(), None);
        assert!(err.to_string().contains("Could not connect"));
    }
}
