use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// DispatchSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Deadline for the whole fan-out of one invocation.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Parallel dispatch cap. `None` means one slot per resolved target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    /// Backend-side timeout for a single remote command.
    #[serde(default = "default_command_timeout_seconds")]
    pub command_timeout_seconds: u64,
    /// Limit for one post-action. Runs after the dispatch result is recorded,
    /// outside the fan-out deadline.
    #[serde(default = "default_post_action_timeout_seconds")]
    pub post_action_timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    900
}

fn default_poll_interval_seconds() -> u64 {
    3
}

fn default_command_timeout_seconds() -> u64 {
    600
}

fn default_post_action_timeout_seconds() -> u64 {
    120
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            max_concurrency: None,
            poll_interval_seconds: default_poll_interval_seconds(),
            command_timeout_seconds: default_command_timeout_seconds(),
            post_action_timeout_seconds: default_post_action_timeout_seconds(),
        }
    }
}

impl DispatchSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    pub fn post_action_timeout(&self) -> Duration {
        Duration::from_secs(self.post_action_timeout_seconds)
    }

    /// Effective parallelism for `targets` resolved instances (at least 1).
    pub fn concurrency_for(&self, targets: usize) -> usize {
        let cap = self.max_concurrency.unwrap_or(targets);
        cap.min(targets).max(1)
    }
}

// ---------------------------------------------------------------------------
// AwsSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsSettings {
    /// Path to the `aws` client. Looked up on `PATH` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    /// Limit for a single `aws` client call; 0 disables it.
    #[serde(default = "default_call_timeout_seconds")]
    pub call_timeout_seconds: u64,
}

fn default_call_timeout_seconds() -> u64 {
    120
}

impl Default for AwsSettings {
    fn default() -> Self {
        Self {
            bin: None,
            region: None,
            profile: None,
            call_timeout_seconds: default_call_timeout_seconds(),
        }
    }
}

impl AwsSettings {
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_seconds > 0).then(|| Duration::from_secs(self.call_timeout_seconds))
    }
}

// ---------------------------------------------------------------------------
// Settings (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub aws: AwsSettings,
    /// Problems found while applying environment overrides.
    #[serde(skip)]
    env_problems: Vec<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            dispatch: DispatchSettings::default(),
            aws: AwsSettings::default(),
            env_problems: Vec::new(),
        }
    }
}

impl Settings {
    /// Load from an optional YAML file, then apply process environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(p) => Self::from_yaml(&std::fs::read_to_string(p)?)?,
            None => Self::default(),
        };
        settings.apply_env(|k| std::env::var(k).ok());
        Ok(settings)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(data)?)
    }

    /// Apply overrides from an environment lookup.
    ///
    /// `LOG_LEVEL`, `AWS_REGION` (or `AWS_DEFAULT_REGION`), `AWS_PROFILE`,
    /// `NUCLEUS_AWS_BIN`, `NUCLEUS_AWS_CALL_TIMEOUT_SECONDS`,
    /// `NUCLEUS_DISPATCH_TIMEOUT_SECONDS`, `NUCLEUS_MAX_CONCURRENCY`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());

        if let Some(level) = get("LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(region) = get("AWS_REGION").or_else(|| get("AWS_DEFAULT_REGION")) {
            self.aws.region = Some(region);
        }
        if let Some(profile) = get("AWS_PROFILE") {
            self.aws.profile = Some(profile);
        }
        if let Some(bin) = get("NUCLEUS_AWS_BIN") {
            self.aws.bin = Some(PathBuf::from(bin));
        }
        if let Some(raw) = get("NUCLEUS_AWS_CALL_TIMEOUT_SECONDS") {
            match raw.trim().parse::<u64>() {
                Ok(secs) => self.aws.call_timeout_seconds = secs,
                Err(_) => self
                    .env_problems
                    .push(format!("NUCLEUS_AWS_CALL_TIMEOUT_SECONDS='{raw}' is not a number")),
            }
        }
        if let Some(raw) = get("NUCLEUS_DISPATCH_TIMEOUT_SECONDS") {
            match raw.trim().parse::<u64>() {
                Ok(secs) => self.dispatch.timeout_seconds = secs,
                Err(_) => self
                    .env_problems
                    .push(format!("NUCLEUS_DISPATCH_TIMEOUT_SECONDS='{raw}' is not a number")),
            }
        }
        if let Some(raw) = get("NUCLEUS_MAX_CONCURRENCY") {
            match raw.trim().parse::<usize>() {
                Ok(n) => self.dispatch.max_concurrency = Some(n),
                Err(_) => self
                    .env_problems
                    .push(format!("NUCLEUS_MAX_CONCURRENCY='{raw}' is not a number")),
            }
        }
    }

    /// `EnvFilter` directive for the configured level. Accepts Python-style
    /// names (`WARNING`, `CRITICAL`); anything unrecognised falls back to `info`.
    pub fn log_filter(&self) -> String {
        normalize_level(&self.log_level)
            .unwrap_or("info")
            .to_string()
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        for problem in &self.env_problems {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: problem.clone(),
            });
        }

        if normalize_level(&self.log_level).is_none() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "unknown log_level '{}', falling back to 'info'",
                    self.log_level
                ),
            });
        }

        if self.dispatch.timeout_seconds == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "dispatch.timeout_seconds is 0: every dispatch would time out"
                    .to_string(),
            });
        }

        if self.dispatch.max_concurrency == Some(0) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "dispatch.max_concurrency is 0, treated as 1".to_string(),
            });
        }

        if self.dispatch.poll_interval_seconds == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "dispatch.poll_interval_seconds is 0: the executor will poll in a tight loop"
                    .to_string(),
            });
        }

        if self.dispatch.command_timeout_seconds > self.dispatch.timeout_seconds {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "dispatch.command_timeout_seconds ({}) exceeds dispatch.timeout_seconds ({}); \
                     slow commands will be reported as timed out",
                    self.dispatch.command_timeout_seconds, self.dispatch.timeout_seconds
                ),
            });
        }

        if self.dispatch.post_action_timeout_seconds == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "dispatch.post_action_timeout_seconds is 0: every post-action will fail"
                    .to_string(),
            });
        }

        if self.aws.call_timeout_seconds == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "aws.call_timeout_seconds is 0: a hung aws client blocks the invocation"
                    .to_string(),
            });
        }

        warnings
    }
}

fn normalize_level(level: &str) -> Option<&'static str> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" | "critical" | "fatal" => Some("error"),
        "off" => Some("off"),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
