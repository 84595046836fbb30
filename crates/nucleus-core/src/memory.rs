//! In-memory backends.
//!
//! Stand-ins for the secret store, instance inventory and remote executor.
//! They record every call so tests can assert on what the orchestrator did.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::executor::RemoteExecutor;
use crate::inventory::InstanceInventory;
use crate::script::Script;
use crate::secrets::SecretStore;
use crate::types::{ExecutionResult, InstanceId};

// ---------------------------------------------------------------------------
// MemorySecretStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
    reads: AtomicUsize,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(self, name: &str, payload: &str) -> Self {
        self.insert(name, payload);
        self
    }

    pub fn insert(&self, name: &str, payload: &str) {
        if let Ok(mut s) = self.secrets.lock() {
            s.insert(name.to_string(), payload.to_string());
        }
    }

    /// Make every read fail with `SecretStoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(&self, name: &str) -> Result<String> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ConfigError::SecretStoreUnavailable {
                name: name.to_string(),
                reason: "store marked unavailable".to_string(),
            });
        }
        self.secrets
            .lock()
            .ok()
            .and_then(|s| s.get(name).cloned())
            .ok_or_else(|| ConfigError::SecretNotFound(name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// MemoryInventory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryInventory {
    groups: HashMap<String, Vec<InstanceId>>,
    failing_stops: HashSet<InstanceId>,
    hanging_stops: HashSet<InstanceId>,
    lookups: AtomicUsize,
    stops: Mutex<Vec<Vec<InstanceId>>>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, name: &str, members: &[&str]) -> Self {
        self.groups.insert(
            name.to_string(),
            members.iter().map(|m| InstanceId::new(*m)).collect(),
        );
        self
    }

    /// Make `stop_instances` fail whenever it is asked to stop `id`.
    pub fn with_stop_failure(mut self, id: &str) -> Self {
        self.failing_stops.insert(InstanceId::new(id));
        self
    }

    /// Make `stop_instances` never return when asked to stop `id`.
    pub fn with_stop_hang(mut self, id: &str) -> Self {
        self.hanging_stops.insert(InstanceId::new(id));
        self
    }

    pub fn group_lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Every `stop_instances` call, in call order.
    pub fn stop_calls(&self) -> Vec<Vec<InstanceId>> {
        self.stops.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl InstanceInventory for MemoryInventory {
    async fn resolve_group(&self, group: &str) -> Result<Option<Vec<InstanceId>>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.groups.get(group).cloned())
    }

    async fn stop_instances(&self, ids: &[InstanceId]) -> Result<()> {
        if let Ok(mut s) = self.stops.lock() {
            s.push(ids.to_vec());
        }
        if ids.iter().any(|id| self.hanging_stops.contains(id)) {
            std::future::pending::<()>().await;
        }
        if let Some(bad) = ids.iter().find(|id| self.failing_stops.contains(*id)) {
            return Err(ConfigError::PostAction {
                instance: bad.to_string(),
                action: "stop".to_string(),
                reason: "IncorrectInstanceState".to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingExecutor
// ---------------------------------------------------------------------------

/// What a [`RecordingExecutor`] does when asked to run on an instance.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed(String),
    /// The command ran and reported failure.
    Fail(String),
    /// The command could not be issued at all.
    InvocationError(String),
    /// Sleep, then succeed.
    Delay(Duration),
    /// Never complete.
    Hang,
}

#[derive(Default)]
pub struct RecordingExecutor {
    behaviors: HashMap<InstanceId, Behavior>,
    calls: Mutex<Vec<(InstanceId, Vec<String>)>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl RecordingExecutor {
    /// Every instance succeeds unless configured otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(InstanceId::new(id), behavior);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn called_instances(&self) -> Vec<InstanceId> {
        self.calls
            .lock()
            .map(|c| c.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    /// Script lines received by each call, in call order.
    pub fn scripts(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .map(|c| c.iter().map(|(_, lines)| lines.clone()).collect())
            .unwrap_or_default()
    }

    /// Highest number of concurrently running `execute` calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteExecutor for RecordingExecutor {
    async fn execute(&self, instance: &InstanceId, script: &Script) -> Result<ExecutionResult> {
        if let Ok(mut c) = self.calls.lock() {
            c.push((instance.clone(), script.lines().to_vec()));
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        match self.behaviors.get(instance) {
            None => Ok(ExecutionResult::succeeded(instance.clone(), "")),
            Some(Behavior::Succeed(out)) => Ok(ExecutionResult::succeeded(instance.clone(), out)),
            Some(Behavior::Fail(detail)) => {
                Ok(ExecutionResult::failed(instance.clone(), "", detail))
            }
            Some(Behavior::InvocationError(reason)) => Err(ConfigError::DispatchInvocation {
                instance: instance.to_string(),
                reason: reason.clone(),
            }),
            Some(Behavior::Delay(d)) => {
                tokio::time::sleep(*d).await;
                Ok(ExecutionResult::succeeded(instance.clone(), ""))
            }
            Some(Behavior::Hang) => std::future::pending().await,
        }
    }
}
