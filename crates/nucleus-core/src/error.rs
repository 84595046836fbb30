use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::InstanceFailure;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("secret not found: {0}")]
    SecretNotFound(String),

    #[error("secret '{name}' could not be decoded: {reason}")]
    SecretDecode { name: String, reason: String },

    #[error("secret store unavailable while reading '{name}': {reason}")]
    SecretStoreUnavailable { name: String, reason: String },

    #[error("template error: {0}")]
    Template(String),

    #[error("instance group not found: {0}")]
    GroupNotFound(String),

    #[error("inventory unavailable: {0}")]
    InventoryUnavailable(String),

    #[error("request resolved to no target instances")]
    NoTargets,

    #[error("could not invoke remote execution on {instance}: {reason}")]
    DispatchInvocation { instance: String, reason: String },

    #[error("remote execution failed on {instance}: {detail}")]
    DispatchExecution { instance: String, detail: String },

    #[error("post-configuration action '{action}' failed on {instance}: {reason}")]
    PostAction {
        instance: String,
        action: String,
        reason: String,
    },

    #[error("{} of {total} instance(s) failed: {}", .failures.len(), summarize(.failures))]
    InstancesFailed {
        total: usize,
        failures: Vec<InstanceFailure>,
    },

    #[error("invalid lifecycle event: {0}")]
    InvalidEvent(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Coarse classification used as a structured log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SecretNotFound,
    SecretDecode,
    SecretStoreUnavailable,
    Template,
    GroupNotFound,
    InventoryUnavailable,
    NoTargets,
    DispatchInvocation,
    DispatchExecution,
    PostAction,
    Timeout,
    InstancesFailed,
    InvalidEvent,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SecretNotFound => "secret_not_found",
            ErrorKind::SecretDecode => "secret_decode",
            ErrorKind::SecretStoreUnavailable => "secret_store_unavailable",
            ErrorKind::Template => "template",
            ErrorKind::GroupNotFound => "group_not_found",
            ErrorKind::InventoryUnavailable => "inventory_unavailable",
            ErrorKind::NoTargets => "no_targets",
            ErrorKind::DispatchInvocation => "dispatch_invocation",
            ErrorKind::DispatchExecution => "dispatch_execution",
            ErrorKind::PostAction => "post_action",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InstancesFailed => "instances_failed",
            ErrorKind::InvalidEvent => "invalid_event",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::SecretNotFound(_) => ErrorKind::SecretNotFound,
            ConfigError::SecretDecode { .. } => ErrorKind::SecretDecode,
            ConfigError::SecretStoreUnavailable { .. } => ErrorKind::SecretStoreUnavailable,
            ConfigError::Template(_) => ErrorKind::Template,
            ConfigError::GroupNotFound(_) => ErrorKind::GroupNotFound,
            ConfigError::InventoryUnavailable(_) => ErrorKind::InventoryUnavailable,
            ConfigError::NoTargets => ErrorKind::NoTargets,
            ConfigError::DispatchInvocation { .. } => ErrorKind::DispatchInvocation,
            ConfigError::DispatchExecution { .. } => ErrorKind::DispatchExecution,
            ConfigError::PostAction { .. } => ErrorKind::PostAction,
            ConfigError::InstancesFailed { .. } => ErrorKind::InstancesFailed,
            ConfigError::InvalidEvent(_) => ErrorKind::InvalidEvent,
            ConfigError::Io(_) | ConfigError::Yaml(_) | ConfigError::Json(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Errors raised before any dispatch happens (secrets, script, targets).
    pub fn is_prerequisite(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::SecretNotFound
                | ErrorKind::SecretDecode
                | ErrorKind::SecretStoreUnavailable
                | ErrorKind::Template
                | ErrorKind::GroupNotFound
                | ErrorKind::InventoryUnavailable
                | ErrorKind::NoTargets
        )
    }
}

fn summarize(failures: &[InstanceFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.instance_id, f.detail))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, ConfigError>;
