//! The configuration pipeline.
//!
//! One [`ConfigurationOrchestrator::configure`] call walks a fixed sequence of
//! stages:
//!
//! ```text
//! ResolvingSecrets ─► BuildingScript ─► ResolvingTargets ─► Dispatching ─► Aggregating
//!        │                  │                  │                                │
//!        └──────── any error: Failed, nothing dispatched ──┘        Succeeded | Failed
//! ```
//!
//! The first three stages are prerequisites: an error there is returned as-is
//! and no instance is touched. Dispatch is a bounded fan-out where every
//! instance gets exactly one [`ExecutionResult`], whatever happens to its
//! siblings. Post-actions run once the fan-out is over, each under its own
//! time limit, and never change a dispatch result. Nothing is kept between
//! calls.

use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::DispatchSettings;
use crate::error::{ConfigError, Result};
use crate::executor::RemoteExecutor;
use crate::inventory::{InstanceInventory, InstanceResolver};
use crate::script::{Script, ScriptBuilder, ScriptParams};
use crate::secrets::{Secret, SecretResolver, SecretStore};
use crate::types::{
    AggregateResult, ExecutionResult, InstanceId, PostAction, PostActionOutcome,
    ReconfigurationRequest,
};

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ResolvingSecrets,
    BuildingScript,
    ResolvingTargets,
    Dispatching,
    Aggregating,
    Succeeded,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ResolvingSecrets => "resolving_secrets",
            Stage::BuildingScript => "building_script",
            Stage::ResolvingTargets => "resolving_targets",
            Stage::Dispatching => "dispatching",
            Stage::Aggregating => "aggregating",
            Stage::Succeeded => "succeeded",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a fan-out stopped before every dispatch finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Deadline,
    Cancelled,
}

impl Interrupt {
    fn describe(&self) -> &'static str {
        match self {
            Interrupt::Deadline => "dispatch deadline elapsed",
            Interrupt::Cancelled => "invocation cancelled",
        }
    }
}

// ---------------------------------------------------------------------------
// ConfigurationOrchestrator
// ---------------------------------------------------------------------------

/// Backends are injected once and shared by every call; each must be safe
/// for concurrent use.
#[derive(Clone)]
pub struct ConfigurationOrchestrator {
    secrets: SecretResolver,
    builder: Arc<dyn ScriptBuilder>,
    targets: InstanceResolver,
    inventory: Arc<dyn InstanceInventory>,
    executor: Arc<dyn RemoteExecutor>,
    dispatch: DispatchSettings,
}

impl ConfigurationOrchestrator {
    pub fn new(
        store: Arc<dyn SecretStore>,
        inventory: Arc<dyn InstanceInventory>,
        executor: Arc<dyn RemoteExecutor>,
        builder: Arc<dyn ScriptBuilder>,
    ) -> Self {
        Self {
            secrets: SecretResolver::new(store),
            builder,
            targets: InstanceResolver::new(inventory.clone()),
            inventory,
            executor,
            dispatch: DispatchSettings::default(),
        }
    }

    pub fn with_dispatch(mut self, dispatch: DispatchSettings) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn dispatch_settings(&self) -> &DispatchSettings {
        &self.dispatch
    }

    /// Run one reconfiguration under the configured dispatch deadline.
    ///
    /// `Err` means a prerequisite failed and nothing was dispatched. Per-instance
    /// failures are reported inside the returned [`AggregateResult`].
    pub async fn configure(&self, req: &ReconfigurationRequest) -> Result<AggregateResult> {
        self.configure_until(req, std::future::pending()).await
    }

    /// Like [`configure`](Self::configure), but stops dispatching as soon as
    /// `cancel` completes. Dispatches already issued are reported as timed
    /// out, queued ones as not attempted.
    pub async fn configure_until<C>(
        &self,
        req: &ReconfigurationRequest,
        cancel: C,
    ) -> Result<AggregateResult>
    where
        C: Future<Output = ()> + Send,
    {
        let invocation = Uuid::new_v4();
        let span = tracing::info_span!("configure", invocation = %invocation);
        self.run(invocation, req, cancel).instrument(span).await
    }

    async fn run<C>(
        &self,
        invocation: Uuid,
        req: &ReconfigurationRequest,
        cancel: C,
    ) -> Result<AggregateResult>
    where
        C: Future<Output = ()> + Send,
    {
        tracing::info!(
            template = %req.template,
            selector = %req.selector,
            bucket = %req.artifacts_bucket,
            domain = %req.domain,
            secrets = req.secrets.len(),
            "configuration requested"
        );

        enter(Stage::ResolvingSecrets);
        let credentials = self
            .resolve_credentials(req)
            .await
            .map_err(|e| failed(Stage::ResolvingSecrets, e))?;

        enter(Stage::BuildingScript);
        let params = ScriptParams::from_request(req, credentials);
        let script = self
            .builder
            .build(&params)
            .map_err(|e| failed(Stage::BuildingScript, e))?;
        tracing::debug!(lines = ?script.redacted_lines(), "script built");

        enter(Stage::ResolvingTargets);
        let targets = self
            .targets
            .resolve(&req.selector)
            .await
            .map_err(|e| failed(Stage::ResolvingTargets, e))?;
        if targets.is_empty() {
            if req.require_targets {
                return Err(failed(Stage::ResolvingTargets, ConfigError::NoTargets));
            }
            tracing::info!(selector = %req.selector, "no targets resolved, nothing to dispatch");
            enter(Stage::Succeeded);
            return Ok(AggregateResult::empty(invocation));
        }

        enter(Stage::Dispatching);
        let (mut results, interrupted) = self.fan_out(&script, &targets, cancel).await;
        self.run_post_actions(req, &mut results, interrupted).await;

        enter(Stage::Aggregating);
        let aggregate = AggregateResult::from_results(invocation, results);
        for failure in aggregate.failures() {
            tracing::warn!(
                instance = %failure.instance_id,
                kind = %failure.kind,
                error = %failure.detail,
                "instance not configured"
            );
        }
        let succeeded = aggregate.results.iter().filter(|r| r.is_success()).count();
        if aggregate.is_success() {
            enter(Stage::Succeeded);
            tracing::info!(instances = aggregate.len(), "configuration succeeded");
        } else {
            enter(Stage::Failed);
            tracing::error!(
                instances = aggregate.len(),
                succeeded,
                failed = aggregate.len() - succeeded,
                "configuration failed"
            );
        }
        Ok(aggregate)
    }

    /// Resolve every referenced secret (each distinct secret once) and bind
    /// the requested fields. Stops at the first error.
    async fn resolve_credentials(
        &self,
        req: &ReconfigurationRequest,
    ) -> Result<BTreeMap<String, String>> {
        let mut fetched: HashMap<&str, Secret> = HashMap::new();
        let mut credentials = BTreeMap::new();
        for secret_ref in &req.secrets {
            let id = secret_ref.secret_id.as_str();
            if !fetched.contains_key(id) {
                let secret = self.secrets.resolve(id).await?;
                fetched.insert(id, secret);
            }
            if let Some(secret) = fetched.get(id) {
                let value = secret.require(&secret_ref.field)?;
                credentials.insert(secret_ref.binding.clone(), value.to_string());
            }
        }
        Ok(credentials)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Dispatch to every target with bounded parallelism. Results come back in
    /// target order regardless of completion order, along with the reason the
    /// fan-out stopped early, if it did.
    async fn fan_out<C>(
        &self,
        script: &Script,
        targets: &[InstanceId],
        cancel: C,
    ) -> (Vec<ExecutionResult>, Option<Interrupt>)
    where
        C: Future<Output = ()> + Send,
    {
        let limit = self.dispatch.concurrency_for(targets.len());
        tracing::debug!(targets = targets.len(), limit, "dispatching");

        let started: Vec<AtomicBool> = targets.iter().map(|_| AtomicBool::new(false)).collect();
        let mut slots: Vec<Option<ExecutionResult>> = vec![None; targets.len()];

        let interrupted = {
            let started = &started;
            let mut pending = stream::iter(targets.iter().enumerate())
                .map(|(idx, id)| async move {
                    started[idx].store(true, Ordering::SeqCst);
                    (idx, self.dispatch_one(id, script).await)
                })
                .buffer_unordered(limit);

            let deadline = tokio::time::sleep(self.dispatch.timeout());
            tokio::pin!(deadline);
            tokio::pin!(cancel);

            loop {
                tokio::select! {
                    next = pending.next() => match next {
                        Some((idx, result)) => slots[idx] = Some(result),
                        None => break None,
                    },
                    _ = &mut deadline => break Some(Interrupt::Deadline),
                    _ = &mut cancel => break Some(Interrupt::Cancelled),
                }
            }
        };

        if let Some(reason) = interrupted {
            tracing::warn!(
                reason = reason.describe(),
                timeout_seconds = self.dispatch.timeout_seconds,
                "dispatch interrupted"
            );
        }

        let results = targets
            .iter()
            .zip(slots)
            .zip(&started)
            .map(|((id, slot), was_started)| match slot {
                Some(result) => result,
                None => {
                    let reason = interrupted.unwrap_or(Interrupt::Cancelled).describe();
                    if was_started.load(Ordering::SeqCst) {
                        ExecutionResult::timed_out(
                            id.clone(),
                            format!("{reason} before a terminal status was observed"),
                        )
                    } else {
                        ExecutionResult::not_attempted(id.clone(), reason)
                    }
                }
            })
            .collect();
        (results, interrupted)
    }

    async fn dispatch_one(&self, id: &InstanceId, script: &Script) -> ExecutionResult {
        tracing::info!(instance = %id, lines = script.len(), "dispatching script");
        let mut result = match self.executor.execute(id, script).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(instance = %id, kind = %e.kind(), error = %script.redact(&e.to_string()), "dispatch invocation failed");
                ExecutionResult::from_error(id.clone(), &e)
            }
        };
        result.instance_id = id.clone();
        result.output = script.redact(&result.output);
        result.error = result.error.map(|e| script.redact(&e));

        if result.is_success() {
            tracing::info!(instance = %id, "dispatch succeeded");
        } else {
            tracing::warn!(
                instance = %id,
                status = ?result.status,
                error = result.error.as_deref().unwrap_or(""),
                "dispatch failed"
            );
        }
        result
    }

    // -----------------------------------------------------------------------
    // Post-actions
    // -----------------------------------------------------------------------

    /// Run the post-action of every successfully configured instance. Dispatch
    /// results are final by now; an outcome here only fills `post_action`.
    async fn run_post_actions(
        &self,
        req: &ReconfigurationRequest,
        results: &mut [ExecutionResult],
        interrupted: Option<Interrupt>,
    ) {
        let due: Vec<(usize, InstanceId, PostAction)> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_success())
            .filter_map(|(idx, r)| {
                req.post_action_for(&r.instance_id)
                    .map(|action| (idx, r.instance_id.clone(), action))
            })
            .collect();
        if due.is_empty() {
            return;
        }

        if interrupted == Some(Interrupt::Cancelled) {
            for (idx, id, action) in due {
                tracing::warn!(instance = %id, action = %action, "post-action skipped, invocation cancelled");
                results[idx].post_action = Some(PostActionOutcome {
                    action,
                    succeeded: false,
                    error: Some(format!("{} before the post-action ran", Interrupt::Cancelled.describe())),
                });
            }
            return;
        }

        let limit = self.dispatch.concurrency_for(due.len());
        let outcomes: Vec<(usize, PostActionOutcome)> = stream::iter(due)
            .map(|(idx, id, action)| async move { (idx, self.post_action(&id, action).await) })
            .buffer_unordered(limit)
            .collect()
            .await;
        for (idx, outcome) in outcomes {
            results[idx].post_action = Some(outcome);
        }
    }

    async fn post_action(&self, id: &InstanceId, action: PostAction) -> PostActionOutcome {
        let limit = self.dispatch.post_action_timeout();
        let run = async {
            match action {
                PostAction::Stop => self.inventory.stop_instances(std::slice::from_ref(id)).await,
            }
        };
        let outcome = match tokio::time::timeout(limit, run).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ConfigError::PostAction {
                instance: id.to_string(),
                action: action.to_string(),
                reason: format!("no answer within {}s", limit.as_secs()),
            }),
        };
        match outcome {
            Ok(()) => {
                tracing::info!(instance = %id, action = %action, "post-action completed");
                PostActionOutcome {
                    action,
                    succeeded: true,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(instance = %id, action = %action, error = %e, "post-action failed");
                PostActionOutcome {
                    action,
                    succeeded: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

fn enter(stage: Stage) {
    tracing::debug!(stage = %stage, "stage");
}

fn failed(stage: Stage, err: ConfigError) -> ConfigError {
    tracing::error!(stage = %stage, kind = %err.kind(), error = %err, "configuration aborted");
    enter(Stage::Failed);
    err
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
