pub mod config;
pub mod error;
pub mod executor;
pub mod inventory;
pub mod lifecycle;
pub mod memory;
pub mod orchestrator;
pub mod script;
pub mod secrets;
pub mod types;

pub use error::{ConfigError, ErrorKind, Result};
pub use executor::RemoteExecutor;
pub use inventory::{InstanceInventory, InstanceResolver};
pub use lifecycle::{LifecycleAdapter, LifecycleEvent, LifecycleResponse};
pub use orchestrator::ConfigurationOrchestrator;
pub use script::{Script, ScriptBuilder, ScriptParams, ScriptTemplate, TemplateScriptBuilder};
pub use secrets::{Secret, SecretResolver, SecretStore};
pub use types::{
    AggregateResult, ExecutionResult, ExecutionStatus, InstanceId, PostAction,
    ReconfigurationRequest, SecretRef, TargetSelector,
};
