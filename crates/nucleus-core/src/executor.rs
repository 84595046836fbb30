use async_trait::async_trait;

use crate::error::Result;
use crate::script::Script;
use crate::types::{ExecutionResult, InstanceId};

/// Runs a shell script on one managed instance and waits for a terminal status.
///
/// A command that ran and failed is `Ok` with a `Failed` [`ExecutionResult`];
/// `Err` is reserved for failures where the remote outcome is unknowable
/// (`DispatchInvocation`: unknown instance, permission denied, backend
/// unreachable). Only shell scripts are supported.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, instance: &InstanceId, script: &Script) -> Result<ExecutionResult>;
}
