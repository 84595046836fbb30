use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use nucleus_core::error::{ConfigError, Result};
use nucleus_core::inventory::InstanceInventory;
use nucleus_core::types::{InstanceId, PostAction};

use crate::process::AwsCli;

/// Instance inventory backed by EC2 Auto Scaling (group membership) and EC2
/// (`stop-instances`).
#[derive(Clone)]
pub struct AutoScalingInventory {
    cli: Arc<AwsCli>,
}

impl AutoScalingInventory {
    pub fn new(cli: Arc<AwsCli>) -> Self {
        Self { cli }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeGroupsOutput {
    #[serde(default)]
    auto_scaling_groups: Vec<Group>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Group {
    auto_scaling_group_name: String,
    #[serde(default)]
    instances: Vec<Member>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Member {
    instance_id: String,
    lifecycle_state: String,
}

impl Member {
    /// Running or on its way up. Terminating, detaching and standby members
    /// are skipped.
    fn is_live(&self) -> bool {
        self.lifecycle_state == "InService" || self.lifecycle_state.starts_with("Pending")
    }
}

#[async_trait]
impl InstanceInventory for AutoScalingInventory {
    async fn resolve_group(&self, group: &str) -> Result<Option<Vec<InstanceId>>> {
        let out: DescribeGroupsOutput = self
            .cli
            .call(
                "autoscaling",
                "describe-auto-scaling-groups",
                ["--auto-scaling-group-names", group],
            )
            .await
            .map_err(|e| ConfigError::InventoryUnavailable(e.to_string()))?;

        let Some(found) = out
            .auto_scaling_groups
            .into_iter()
            .find(|g| g.auto_scaling_group_name == group)
        else {
            return Ok(None);
        };

        let total = found.instances.len();
        let live: Vec<InstanceId> = found
            .instances
            .into_iter()
            .filter(Member::is_live)
            .map(|m| InstanceId::new(m.instance_id))
            .collect();
        tracing::debug!(group, total, live = live.len(), "auto scaling group described");
        Ok(Some(live))
    }

    async fn stop_instances(&self, ids: &[InstanceId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut args = vec!["--instance-ids".to_string()];
        args.extend(ids.iter().map(|id| id.to_string()));
        let _: serde_json::Value = self
            .cli
            .call("ec2", "stop-instances", args)
            .await
            .map_err(|e| ConfigError::PostAction {
                instance: ids
                    .iter()
                    .map(InstanceId::as_str)
                    .collect::<Vec<_>>()
                    .join(","),
                action: PostAction::Stop.to_string(),
                reason: e.to_string(),
            })?;
        tracing::info!(instances = ?ids, "stop requested");
        Ok(())
    }
}
