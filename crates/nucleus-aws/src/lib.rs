//! `nucleus-aws` — AWS backends for the Nucleus configuration core.
//!
//! Every backend drives the `aws` command-line client as a subprocess, so the
//! process needs nothing but the client and whatever credentials it would pick
//! up on its own (instance role, `AWS_PROFILE`, environment).
//!
//! # Architecture
//!
//! ```text
//! AwsSettings
//!     │
//!     ▼
//! AwsCli                ← spawns `aws <service> <operation> … --output json`
//!     │                    classifies failures from stderr
//!     ├─► SecretsManagerStore   (SecretStore)        secretsmanager get-secret-value
//!     ├─► SsmExecutor           (RemoteExecutor)     ssm send-command + get-command-invocation
//!     └─► AutoScalingInventory  (InstanceInventory)  autoscaling describe-auto-scaling-groups,
//!                                                    ec2 stop-instances
//! ```

pub mod autoscaling;
pub mod error;
pub mod process;
pub mod secrets_manager;
pub mod ssm;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use nucleus_core::config::Settings;
use nucleus_core::orchestrator::ConfigurationOrchestrator;
use nucleus_core::script::TemplateScriptBuilder;

pub use autoscaling::AutoScalingInventory;
pub use error::{AwsCliError, Result};
pub use process::AwsCli;
pub use secrets_manager::SecretsManagerStore;
pub use ssm::SsmExecutor;

/// Wire an orchestrator to the AWS backends.
///
/// `fallback_region` is used when neither the settings nor the environment
/// name a region (the lifecycle event carries one).
pub fn orchestrator(
    settings: &Settings,
    fallback_region: Option<&str>,
) -> Result<ConfigurationOrchestrator> {
    let mut cli = AwsCli::from_settings(&settings.aws)?;
    if cli.region().is_none() {
        if let Some(region) = fallback_region {
            cli = cli.with_region(region);
        }
    }
    let cli = Arc::new(cli);
    tracing::debug!(
        bin = %cli.bin().display(),
        region = ?cli.region(),
        call_timeout = ?cli.call_timeout(),
        "aws backends ready"
    );

    Ok(ConfigurationOrchestrator::new(
        Arc::new(SecretsManagerStore::new(cli.clone())),
        Arc::new(AutoScalingInventory::new(cli.clone())),
        Arc::new(SsmExecutor::from_settings(cli, &settings.dispatch)),
        Arc::new(TemplateScriptBuilder),
    )
    .with_dispatch(settings.dispatch.clone()))
}
