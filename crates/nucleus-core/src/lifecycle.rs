//! Stack lifecycle events.
//!
//! Translates CloudFormation custom-resource events into
//! [`ReconfigurationRequest`]s, runs them through the orchestrator and builds
//! the response body the dispatcher expects. Sending that body to
//! `ResponseURL` is left to the caller.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ConfigError, ErrorKind, Result};
use crate::orchestrator::ConfigurationOrchestrator;
use crate::script::{ScriptTemplate, MASTER_PASSWORD, SERVICE_PASSWORD};
use crate::types::{
    AggregateResult, InstanceId, PostAction, ReconfigurationRequest, SecretRef, TargetSelector,
};

// ---------------------------------------------------------------------------
// LifecycleEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestType::Create => "Create",
            RequestType::Update => "Update",
            RequestType::Delete => "Delete",
        };
        f.write_str(s)
    }
}

/// Inbound custom-resource event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LifecycleEvent {
    pub request_type: RequestType,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub stack_id: String,
    #[serde(default)]
    pub logical_resource_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_resource_id: Option<String>,
    #[serde(default, rename = "ResponseURL", skip_serializing_if = "Option::is_none")]
    pub response_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub resource_properties: Map<String, Value>,
}

impl LifecycleEvent {
    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(|e| ConfigError::InvalidEvent(e.to_string()))
    }

    /// Region stamped into the resource properties, if any.
    pub fn region(&self) -> Option<&str> {
        self.resource_properties
            .get("region")
            .and_then(Value::as_str)
            .filter(|r| !r.is_empty())
    }

    /// Physical id to report: the one the stack already knows, or a new one
    /// derived from the stack name, logical id and request id.
    pub fn physical_resource_id(&self) -> String {
        if let Some(id) = self.physical_resource_id.as_deref().filter(|id| !id.is_empty()) {
            return id.to_string();
        }
        let stack_name = self.stack_id.split('/').nth(1).unwrap_or("stack");
        let suffix: String = self
            .request_id
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .take(8)
            .collect();
        format!("{stack_name}_{}_{suffix}", self.logical_resource_id)
    }

    pub fn resource(&self) -> Result<ResourceProperties> {
        ResourceProperties::from_map(&self.resource_properties)
    }
}

// ---------------------------------------------------------------------------
// ResourceProperties
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NucleusServerProperties {
    pub primary_instance_id: String,
    pub standby_instance_id: String,
    pub artifacts_bucket: String,
    pub reverse_proxy_domain: String,
    pub nucleus_build: String,
    pub ov_main_login_secret_arn: String,
    pub ov_service_login_secret_arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ReverseProxyProperties {
    pub artifacts_bucket_name: String,
    pub full_domain: String,
    pub rp_autoscaling_group_name: String,
    pub nucleus_server_address: String,
}

/// The two resource shapes this handler configures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceProperties {
    NucleusServer(NucleusServerProperties),
    ReverseProxy(ReverseProxyProperties),
}

impl ResourceProperties {
    /// Pick the shape by its distinguishing key. Unknown extra keys
    /// (`ServiceToken`, `region`, ...) are ignored.
    pub fn from_map(props: &Map<String, Value>) -> Result<Self> {
        let value = Value::Object(props.clone());
        if props.contains_key("primaryInstanceId") {
            serde_json::from_value(value)
                .map(ResourceProperties::NucleusServer)
                .map_err(|e| ConfigError::InvalidEvent(format!("nucleus server properties: {e}")))
        } else if props.contains_key("RP_AUTOSCALING_GROUP_NAME") {
            serde_json::from_value(value)
                .map(ResourceProperties::ReverseProxy)
                .map_err(|e| ConfigError::InvalidEvent(format!("reverse proxy properties: {e}")))
        } else {
            Err(ConfigError::InvalidEvent(
                "resource properties match neither a Nucleus server nor a reverse proxy resource"
                    .to_string(),
            ))
        }
    }

    pub fn into_request(self) -> ReconfigurationRequest {
        match self {
            ResourceProperties::NucleusServer(p) => {
                let primary = InstanceId::new(p.primary_instance_id);
                let standby = InstanceId::new(p.standby_instance_id);
                let mut post_actions = BTreeMap::new();
                post_actions.insert(standby.clone(), PostAction::Stop);
                ReconfigurationRequest {
                    template: ScriptTemplate::NucleusServer,
                    selector: TargetSelector::Explicit {
                        instances: vec![primary, standby],
                    },
                    artifacts_bucket: p.artifacts_bucket,
                    domain: p.reverse_proxy_domain,
                    addresses: Vec::new(),
                    nucleus_build: Some(p.nucleus_build),
                    secrets: vec![
                        SecretRef::password(p.ov_main_login_secret_arn, MASTER_PASSWORD),
                        SecretRef::password(p.ov_service_login_secret_arn, SERVICE_PASSWORD),
                    ],
                    post_actions,
                    require_targets: false,
                }
            }
            ResourceProperties::ReverseProxy(p) => ReconfigurationRequest {
                template: ScriptTemplate::ReverseProxy,
                selector: TargetSelector::group(p.rp_autoscaling_group_name),
                artifacts_bucket: p.artifacts_bucket_name,
                domain: p.full_domain,
                addresses: vec![p.nucleus_server_address],
                nucleus_build: None,
                secrets: Vec::new(),
                post_actions: BTreeMap::new(),
                require_targets: false,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// LifecycleOutcome / LifecycleResponse
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleOutcome {
    pub request_type: RequestType,
    pub physical_resource_id: String,
    /// `None` for deletes, which are not dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregateResult>,
}

impl LifecycleOutcome {
    pub fn is_success(&self) -> bool {
        self.aggregate.as_ref().map_or(true, AggregateResult::is_success)
    }

    /// The error describing failed instances, if any.
    pub fn failure(&self) -> Option<ConfigError> {
        self.aggregate
            .as_ref()
            .and_then(|agg| agg.clone().into_result().err())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
    Failed,
}

/// Custom-resource response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LifecycleResponse {
    pub status: ResponseStatus,
    pub reason: String,
    pub physical_resource_id: String,
    pub stack_id: String,
    pub request_id: String,
    pub logical_resource_id: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl LifecycleResponse {
    /// Response for a handled event. A dispatched request with failed
    /// instances is FAILED but still lists every instance and which failed.
    pub fn from_outcome(event: &LifecycleEvent, outcome: &LifecycleOutcome) -> Self {
        let mut data = Map::new();
        if let Some(agg) = &outcome.aggregate {
            data.insert("InvocationId".into(), Value::String(agg.invocation_id.to_string()));
            data.insert("Instances".into(), instance_list(agg.results.iter().map(|r| &r.instance_id)));
        }

        if let Some(err) = outcome.failure() {
            if let Some(agg) = &outcome.aggregate {
                let failures = agg.failures();
                data.insert("Failed".into(), instance_list(failures.iter().map(|f| &f.instance_id)));
            }
            let mut response = Self::failure(event, &err);
            response.physical_resource_id = outcome.physical_resource_id.clone();
            response.data.extend(data);
            return response;
        }

        let reason = match &outcome.aggregate {
            Some(agg) => format!("configured {} instance(s)", agg.len()),
            None => format!("{} accepted, nothing to do", outcome.request_type),
        };
        Self {
            status: ResponseStatus::Success,
            reason,
            physical_resource_id: outcome.physical_resource_id.clone(),
            stack_id: event.stack_id.clone(),
            request_id: event.request_id.clone(),
            logical_resource_id: event.logical_resource_id.clone(),
            data,
        }
    }

    pub fn failure(event: &LifecycleEvent, err: &ConfigError) -> Self {
        Self::failed_with(event, err.kind(), err.to_string())
    }

    /// A failed response for errors raised outside the orchestrator.
    pub fn failed_with(event: &LifecycleEvent, kind: ErrorKind, reason: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("ErrorKind".into(), Value::String(kind.to_string()));
        Self {
            status: ResponseStatus::Failed,
            reason: reason.into(),
            physical_resource_id: event.physical_resource_id(),
            stack_id: event.stack_id.clone(),
            request_id: event.request_id.clone(),
            logical_resource_id: event.logical_resource_id.clone(),
            data,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

fn instance_list<'a>(ids: impl Iterator<Item = &'a InstanceId>) -> Value {
    Value::Array(ids.map(|id| Value::String(id.to_string())).collect())
}

// ---------------------------------------------------------------------------
// LifecycleAdapter
// ---------------------------------------------------------------------------

pub struct LifecycleAdapter {
    orchestrator: ConfigurationOrchestrator,
}

impl LifecycleAdapter {
    pub fn new(orchestrator: ConfigurationOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// The request a create/update event maps to. `None` for deletes.
    pub fn request_for(event: &LifecycleEvent) -> Result<Option<ReconfigurationRequest>> {
        match event.request_type {
            RequestType::Delete => Ok(None),
            RequestType::Create | RequestType::Update => Ok(Some(event.resource()?.into_request())),
        }
    }

    /// Handle one event. `Err` means nothing was dispatched (invalid event or a
    /// failed prerequisite). Instance failures come back inside the outcome,
    /// see [`LifecycleOutcome::is_success`].
    pub async fn handle(&self, event: &LifecycleEvent) -> Result<LifecycleOutcome> {
        let physical_resource_id = event.physical_resource_id();
        tracing::info!(
            request_type = %event.request_type,
            logical_id = %event.logical_resource_id,
            request_id = %event.request_id,
            "lifecycle event received"
        );

        let Some(request) = Self::request_for(event).inspect_err(|e| {
            tracing::error!(kind = %e.kind(), error = %e, "invalid lifecycle event");
        })?
        else {
            tracing::info!(
                physical_id = %physical_resource_id,
                "delete requested, remote configuration left in place"
            );
            return Ok(LifecycleOutcome {
                request_type: event.request_type,
                physical_resource_id,
                aggregate: None,
            });
        };

        let aggregate = self
            .orchestrator
            .configure(&request)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    request_type = %event.request_type,
                    kind = %e.kind(),
                    error = %e,
                    "lifecycle operation failed"
                );
            })?;

        let outcome = LifecycleOutcome {
            request_type: event.request_type,
            physical_resource_id,
            aggregate: Some(aggregate),
        };
        if let Some(e) = outcome.failure() {
            tracing::error!(
                request_type = %event.request_type,
                kind = %e.kind(),
                error = %e,
                "lifecycle operation failed"
            );
        }
        Ok(outcome)
    }

    /// Handle an event and fold the result into a response body. Never fails.
    pub async fn respond(&self, event: &LifecycleEvent) -> LifecycleResponse {
        match self.handle(event).await {
            Ok(outcome) => LifecycleResponse::from_outcome(event, &outcome),
            Err(e) => LifecycleResponse::failure(event, &e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
