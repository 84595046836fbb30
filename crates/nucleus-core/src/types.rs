use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{ConfigError, ErrorKind, Result};
use crate::script::ScriptTemplate;

// ---------------------------------------------------------------------------
// InstanceId
// ---------------------------------------------------------------------------

/// Opaque managed-instance identifier (e.g. `i-0123456789abcdef0`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// TargetSelector / PostAction
// ---------------------------------------------------------------------------

/// Which instances a request should be dispatched to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetSelector {
    /// Instance ids named directly by the request. No inventory lookup.
    Explicit { instances: Vec<InstanceId> },
    /// A logical instance group (an auto scaling group) resolved at request time.
    Group { name: String },
}

impl TargetSelector {
    pub fn explicit<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<InstanceId>,
    {
        TargetSelector::Explicit {
            instances: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn group(name: impl Into<String>) -> Self {
        TargetSelector::Group { name: name.into() }
    }
}

impl fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSelector::Explicit { instances } => {
                let ids: Vec<&str> = instances.iter().map(InstanceId::as_str).collect();
                write!(f, "instances[{}]", ids.join(","))
            }
            TargetSelector::Group { name } => write!(f, "group:{name}"),
        }
    }
}

/// Side effect performed on an instance after its configuration succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostAction {
    /// Stop the instance (used for the warm standby Nucleus server).
    Stop,
}

impl PostAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostAction::Stop => "stop",
        }
    }
}

impl fmt::Display for PostAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SecretRef
// ---------------------------------------------------------------------------

/// A secret the script needs: which secret, which field of its JSON payload,
/// and the credential name the value is bound to in the script template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub secret_id: String,
    #[serde(default = "default_secret_field")]
    pub field: String,
    pub binding: String,
}

fn default_secret_field() -> String {
    "password".to_string()
}

impl SecretRef {
    pub fn password(secret_id: impl Into<String>, binding: impl Into<String>) -> Self {
        Self {
            secret_id: secret_id.into(),
            field: default_secret_field(),
            binding: binding.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ReconfigurationRequest
// ---------------------------------------------------------------------------

/// One reconfiguration request, built once per lifecycle event and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconfigurationRequest {
    pub template: ScriptTemplate,
    pub selector: TargetSelector,
    pub artifacts_bucket: String,
    pub domain: String,
    /// Addresses interpolated into the script (e.g. the Nucleus server the
    /// reverse proxy forwards to).
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nucleus_build: Option<String>,
    #[serde(default)]
    pub secrets: Vec<SecretRef>,
    #[serde(default)]
    pub post_actions: BTreeMap<InstanceId, PostAction>,
    /// Treat an empty resolved target set as `NoTargets` instead of a no-op.
    #[serde(default)]
    pub require_targets: bool,
}

impl ReconfigurationRequest {
    pub fn post_action_for(&self, id: &InstanceId) -> Option<PostAction> {
        self.post_actions.get(id).copied()
    }
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    /// Never dispatched: the invocation was cancelled or hit its deadline first.
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostActionOutcome {
    pub action: PostAction,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of dispatching the script to one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub instance_id: InstanceId,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_action: Option<PostActionOutcome>,
}

impl ExecutionResult {
    pub fn succeeded(instance_id: InstanceId, output: impl Into<String>) -> Self {
        Self {
            instance_id,
            status: ExecutionStatus::Succeeded,
            output: output.into(),
            error: None,
            error_kind: None,
            finished_at: Utc::now(),
            post_action: None,
        }
    }

    /// A recorded remote failure: the command ran and reported a failure.
    pub fn failed(
        instance_id: InstanceId,
        output: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::failed_with(
            instance_id,
            ErrorKind::DispatchExecution,
            output.into(),
            detail.into(),
        )
    }

    /// An invocation error turned into a recorded failure for this instance.
    pub fn from_error(instance_id: InstanceId, err: &ConfigError) -> Self {
        Self::failed_with(instance_id, err.kind(), String::new(), err.to_string())
    }

    /// The command may have been issued but its terminal state was never observed.
    pub fn timed_out(instance_id: InstanceId, detail: impl Into<String>) -> Self {
        Self::failed_with(instance_id, ErrorKind::Timeout, String::new(), detail.into())
    }

    pub fn not_attempted(instance_id: InstanceId, reason: impl Into<String>) -> Self {
        Self {
            instance_id,
            status: ExecutionStatus::NotAttempted,
            output: String::new(),
            error: Some(reason.into()),
            error_kind: Some(ErrorKind::Timeout),
            finished_at: Utc::now(),
            post_action: None,
        }
    }

    fn failed_with(instance_id: InstanceId, kind: ErrorKind, output: String, detail: String) -> Self {
        Self {
            instance_id,
            status: ExecutionStatus::Failed,
            output,
            error: Some(detail),
            error_kind: Some(kind),
            finished_at: Utc::now(),
            post_action: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }
}

// ---------------------------------------------------------------------------
// AggregateResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Succeeded,
    Failed,
}

/// One failed instance, as surfaced in logs and in `InstancesFailed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFailure {
    pub instance_id: InstanceId,
    pub kind: ErrorKind,
    pub detail: String,
}

/// Combined outcome of one `configure` call. One entry per targeted instance,
/// in resolution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub invocation_id: Uuid,
    pub status: OverallStatus,
    pub results: Vec<ExecutionResult>,
}

impl AggregateResult {
    pub fn from_results(invocation_id: Uuid, results: Vec<ExecutionResult>) -> Self {
        let status = if results.iter().all(ExecutionResult::is_success) {
            OverallStatus::Succeeded
        } else {
            OverallStatus::Failed
        };
        Self {
            invocation_id,
            status,
            results,
        }
    }

    pub fn empty(invocation_id: Uuid) -> Self {
        Self::from_results(invocation_id, Vec::new())
    }

    pub fn is_success(&self) -> bool {
        self.status == OverallStatus::Succeeded
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get(&self, id: &InstanceId) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| &r.instance_id == id)
    }

    pub fn failures(&self) -> Vec<InstanceFailure> {
        self.results
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| InstanceFailure {
                instance_id: r.instance_id.clone(),
                kind: r.error_kind.unwrap_or(ErrorKind::DispatchExecution),
                detail: r.error.clone().unwrap_or_else(|| "failed".to_string()),
            })
            .collect()
    }

    pub fn post_action_failures(&self) -> Vec<InstanceFailure> {
        self.results
            .iter()
            .filter_map(|r| {
                let outcome = r.post_action.as_ref()?;
                if outcome.succeeded {
                    return None;
                }
                Some(InstanceFailure {
                    instance_id: r.instance_id.clone(),
                    kind: ErrorKind::PostAction,
                    detail: outcome.error.clone().unwrap_or_default(),
                })
            })
            .collect()
    }

    /// `Ok(self)` when every instance succeeded, `InstancesFailed` otherwise.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        Err(ConfigError::InstancesFailed {
            total: self.results.len(),
            failures: self.failures(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_aggregate_succeeds() {
        let agg = AggregateResult::empty(Uuid::new_v4());
        assert!(agg.is_success());
        assert!(agg.is_empty());
        assert!(agg.into_result().is_ok());
    }

    #[test]
    fn one_failure_fails_the_aggregate() {
        let agg = AggregateResult::from_results(
            Uuid::new_v4(),
            vec![
                ExecutionResult::succeeded("i-a".into(), "ok"),
                ExecutionResult::failed("i-b".into(), "", "exit status 2"),
            ],
        );
        assert_eq!(agg.status, OverallStatus::Failed);
        let failures = agg.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].instance_id.as_str(), "i-b");
        assert_eq!(failures[0].kind, ErrorKind::DispatchExecution);

        let err = agg.into_result().unwrap_err();
        assert!(matches!(err, ConfigError::InstancesFailed { total: 2, .. }));
    }

    #[test]
    fn not_attempted_counts_as_failure() {
        let agg = AggregateResult::from_results(
            Uuid::new_v4(),
            vec![ExecutionResult::not_attempted("i-a".into(), "cancelled")],
        );
        assert!(!agg.is_success());
    }

    #[test]
    fn post_action_failure_does_not_fail_aggregate() {
        let mut standby = ExecutionResult::succeeded("i-standby".into(), "");
        standby.post_action = Some(PostActionOutcome {
            action: PostAction::Stop,
            succeeded: false,
            error: Some("IncorrectInstanceState".into()),
        });
        let agg = AggregateResult::from_results(Uuid::new_v4(), vec![standby]);
        assert!(agg.is_success());
        assert_eq!(agg.post_action_failures().len(), 1);
    }

    #[test]
    fn selector_json_is_tagged() {
        let sel = TargetSelector::group("rp-asg");
        let json = serde_json::to_string(&sel).unwrap();
        assert!(json.contains("\"type\":\"group\""));
        let explicit = TargetSelector::explicit(["i-1", "i-2"]);
        assert_eq!(explicit.to_string(), "instances[i-1,i-2]");
    }

    #[test]
    fn secret_ref_field_defaults_to_password() {
        let r: SecretRef =
            serde_json::from_str(r#"{"secret_id":"main","binding":"master_password"}"#).unwrap();
        assert_eq!(r.field, "password");
    }
}
