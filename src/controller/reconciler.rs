//! Reconciliation pipeline.
//!
//! Two stages, connected by a `tokio::sync::watch` channel that only ever
//! holds the newest [`ActiveResourceSet`]:
//!
//! - [`Ingest`] feeds watcher events through the [`WorkingSet`], coalesces
//!   bursts for the debounce window, and publishes one set per window.
//! - [`run_target`] drives one proxy target through the
//!   [`ReconcileStateMachine`]: compile the newest set, apply it, retry with
//!   backoff, and abandon a failing generation as soon as newer input exists.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::state_machine::{
    LoopEvent, ReconcilePhase, ReconcileStateMachine, TransitionContext, TransitionResult,
    determine_failure_event,
};
use super::status::{StatusSink, StatusUpdate};
use crate::applier::{ApplyError, ConfigApplier};
use crate::compiler::{CompileWarning, CompiledSnapshot, Compiler};
use crate::health::HealthState;
use crate::policy::validation::detect_conflicts;
use crate::policy::{ActiveResourceSet, Admission, WorkingSet};
use crate::watcher::{ResourceEvent, ResourceKey, ResourceKind};

/// Timing knobs for the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSettings {
    /// Coalescing window, measured from the first pending change.
    pub debounce: Duration,
    /// Apply retry schedule.
    pub backoff: Backoff,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            backoff: Backoff::default(),
        }
    }
}

/// Channel carrying the newest active set to the target workers.
///
/// The initial empty set counts as seen, so workers wait for the first
/// published set before doing anything.
pub fn active_set_channel() -> (
    watch::Sender<Arc<ActiveResourceSet>>,
    watch::Receiver<Arc<ActiveResourceSet>>,
) {
    watch::channel(Arc::new(ActiveResourceSet::default()))
}

/// Validation and debounce stage.
pub struct Ingest {
    working: WorkingSet,
    tx: watch::Sender<Arc<ActiveResourceSet>>,
    sink: Arc<dyn StatusSink>,
    health: Option<Arc<HealthState>>,
    debounce: Duration,
    /// Losers reported in the last published set.
    conflicted: BTreeSet<ResourceKey>,
}

impl Ingest {
    pub fn new(
        tx: watch::Sender<Arc<ActiveResourceSet>>,
        sink: Arc<dyn StatusSink>,
        health: Option<Arc<HealthState>>,
        settings: &ReconcileSettings,
    ) -> Self {
        Self {
            working: WorkingSet::new(),
            tx,
            sink,
            health,
            debounce: settings.debounce,
            conflicted: BTreeSet::new(),
        }
    }

    /// Consume events until the stream ends or `cancel` fires.
    ///
    /// A change pending when the stream ends is still published.
    pub async fn run<S>(mut self, events: S, cancel: CancellationToken)
    where
        S: Stream<Item = ResourceEvent> + Send,
    {
        let mut events = std::pin::pin!(events);
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Ingest cancelled");
                    return;
                }
                _ = sleep_until(deadline) => {
                    deadline = None;
                    self.publish();
                }
                event = events.next() => {
                    let Some(event) = event else {
                        break;
                    };
                    if self.ingest(&event) && deadline.is_none() {
                        deadline = Some(Instant::now() + self.debounce);
                    }
                }
            }
        }

        if deadline.is_some() {
            self.publish();
        }
        info!("Event stream closed, ingest stopped");
    }

    /// Feed one event through the working set. Returns whether the active
    /// content changed.
    pub fn ingest(&mut self, event: &ResourceEvent) -> bool {
        if let Some(health) = &self.health {
            health.metrics.record_event(event.kind, event.event_type);
        }
        let before = self.working.revision();
        let generation = event.payload.as_ref().and_then(|p| p.generation());

        match self.working.apply(event) {
            Admission::Accepted => {
                debug!(key = %event.key, event = %event.event_type, "Accepted");
                // An accepted update clears Degraded; report the conflict
                // again if it persists.
                self.conflicted.remove(&event.key);
                self.sink.publish(StatusUpdate::Accepted {
                    key: event.key.clone(),
                    generation,
                });
                if event.kind == ResourceKind::ConfigMap {
                    self.report_ignored_records();
                }
            }
            Admission::Rejected(error) => {
                warn!(key = %event.key, field = %error.field, message = %error.message, "ValidationFailed");
                if let Some(health) = &self.health {
                    health.metrics.record_validation_error(event.kind);
                }
                self.sink
                    .publish(StatusUpdate::Invalid { error, generation });
            }
            Admission::Removed => {
                debug!(key = %event.key, "Removed");
                self.conflicted.remove(&event.key);
            }
            Admission::Unchanged => {}
        }

        self.working.revision() != before
    }

    fn report_ignored_records(&self) {
        let Some(records) = self.working.records() else {
            return;
        };
        for error in &records.ignored {
            warn!(key = %error.key, field = %error.field, message = %error.message, "Ignoring record");
            if let Some(health) = &self.health {
                health.metrics.record_validation_error(ResourceKind::ConfigMap);
            }
            self.sink.publish(StatusUpdate::Warning {
                key: error.key.clone(),
                reason: "InvalidRecord",
                message: error.to_string(),
            });
        }
    }

    /// Freeze the working set and hand it to the workers.
    pub fn publish(&mut self) {
        let set = Arc::new(self.working.snapshot());
        if let Some(health) = &self.health {
            for kind in ResourceKind::ALL {
                health.metrics.set_active_resources(kind, set.count(kind));
            }
        }
        self.report_conflicts(&set);
        info!(
            revision = set.revision,
            ingresses = set.ingresses.len(),
            caching_policies = set.caching.len(),
            sni_policies = set.sni.len(),
            secrets = set.secrets.len(),
            "Publishing active resource set"
        );
        self.tx.send_replace(set);
    }

    fn report_conflicts(&mut self, set: &ActiveResourceSet) {
        let mut losers = BTreeSet::new();
        for conflict in detect_conflicts(set) {
            let fresh = !self.conflicted.contains(&conflict.loser);
            losers.insert(conflict.loser.clone());
            if !fresh {
                continue;
            }
            warn!(
                winner = %conflict.winner,
                loser = %conflict.loser,
                on = %conflict.target,
                "Conflict"
            );
            if let Some(health) = &self.health {
                health.metrics.conflicts_total.inc();
            }
            self.sink.publish(StatusUpdate::Conflict(conflict));
        }
        for key in self.conflicted.difference(&losers) {
            if self.working.is_active(key) {
                self.sink
                    .publish(StatusUpdate::ConflictResolved { key: key.clone() });
            }
        }
        self.conflicted = losers;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn step(
    sm: &ReconcileStateMachine,
    target: &str,
    phase: ReconcilePhase,
    event: LoopEvent,
    ctx: &TransitionContext,
) -> ReconcilePhase {
    match sm.transition(phase, event, ctx) {
        TransitionResult::Success {
            from,
            to,
            description,
            ..
        } => {
            debug!(proxy = %target, from = %from, to = %to, event = %event, "{}", description);
            to
        }
        other => {
            error!(proxy = %target, phase = %phase, event = %event, result = ?other, "Invalid loop transition, going idle");
            ReconcilePhase::Idle
        }
    }
}

/// Drive one proxy target until cancelled, the channel closes, or the
/// target halts. Returns the phase the loop stopped in.
///
/// An apply in progress always runs to completion; cancellation is only
/// observed while idle or backing off.
pub async fn run_target<A>(
    applier: Arc<A>,
    compiler: Arc<Compiler>,
    mut rx: watch::Receiver<Arc<ActiveResourceSet>>,
    sink: Arc<dyn StatusSink>,
    health: Option<Arc<HealthState>>,
    settings: ReconcileSettings,
    cancel: CancellationToken,
) -> ReconcilePhase
where
    A: ConfigApplier + ?Sized,
{
    let sm = ReconcileStateMachine::new();
    let target = applier.target().to_string();
    let max_attempts = settings.backoff.max_attempts;

    let mut phase = ReconcilePhase::Idle;
    let mut applied_generation: Option<u64> = None;
    let mut pending: Option<Arc<CompiledSnapshot>> = None;
    let mut attempts = 0u32;
    let mut last_error: Option<ApplyError> = None;
    // Digest the proxy refused; only different output is worth applying.
    let mut rejected_digest: Option<String> = None;
    let mut warned: BTreeSet<CompileWarning> = BTreeSet::new();

    info!(proxy = %target, "Starting target worker");

    loop {
        match phase {
            ReconcilePhase::Idle => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                phase = step(
                    &sm,
                    &target,
                    phase,
                    LoopEvent::InputChanged,
                    &TransitionContext::default(),
                );
            }

            ReconcilePhase::Compiling => {
                if cancel.is_cancelled() {
                    break;
                }
                let set = rx.borrow_and_update().clone();
                let ctx = TransitionContext::default();
                match compiler.compile(&set) {
                    Err(e) => {
                        error!(proxy = %target, revision = set.revision, error = %e, "Compile failed, halting target");
                        sink.publish(StatusUpdate::Halted {
                            target: target.clone(),
                            message: e.to_string(),
                            resources: set.resources(),
                        });
                        if let Some(health) = &health {
                            health.metrics.record_apply(&target, "halted");
                            health.set_ready(false).await;
                        }
                        phase = step(&sm, &target, phase, LoopEvent::CompileFailed, &ctx);
                    }
                    Ok(snapshot) => {
                        let current: BTreeSet<CompileWarning> =
                            snapshot.config.warnings.iter().cloned().collect();
                        for warning in current.difference(&warned) {
                            sink.publish(StatusUpdate::Warning {
                                key: warning.key.clone(),
                                reason: warning.reason,
                                message: warning.message.clone(),
                            });
                        }
                        warned = current;

                        if applied_generation == Some(snapshot.generation) {
                            debug!(proxy = %target, generation = snapshot.generation, "Generation already applied");
                            phase =
                                step(&sm, &target, phase, LoopEvent::GenerationUnchanged, &ctx);
                        } else if rejected_digest.as_deref() == Some(snapshot.digest.as_str()) {
                            debug!(proxy = %target, generation = snapshot.generation, "Output matches rejected configuration, waiting for a fix");
                            phase =
                                step(&sm, &target, phase, LoopEvent::GenerationUnchanged, &ctx);
                        } else {
                            attempts = 0;
                            last_error = None;
                            pending = Some(snapshot);
                            phase = step(&sm, &target, phase, LoopEvent::SnapshotReady, &ctx);
                        }
                    }
                }
            }

            ReconcilePhase::Applying => {
                let Some(snapshot) = pending.clone() else {
                    phase = ReconcilePhase::Idle;
                    continue;
                };
                let ctx = TransitionContext::new(attempts, max_attempts);
                match applier.apply(&snapshot).await {
                    Ok(report) => {
                        applied_generation = Some(snapshot.generation);
                        rejected_digest = None;
                        if let Some(health) = &health {
                            health.metrics.record_apply(&target, "success");
                            health.metrics.record_applied(
                                &target,
                                snapshot.generation,
                                report.proxy_reload_latency.map(|d| d.as_secs_f64()),
                            );
                            health.set_ready(true).await;
                            health.touch_applied();
                        }
                        info!(
                            proxy = %target,
                            generation = snapshot.generation,
                            changed = report.changed,
                            reload_ms = report.proxy_reload_latency.map(|d| d.as_millis() as u64),
                            "Applied configuration"
                        );
                        sink.publish(StatusUpdate::Applied {
                            target: target.clone(),
                            generation: snapshot.generation,
                            resources: snapshot.resources.clone(),
                        });
                        phase = step(&sm, &target, phase, LoopEvent::ApplySucceeded, &ctx);
                    }
                    Err(e) => {
                        attempts += 1;
                        let permanent = !e.is_retryable();
                        if let Some(health) = &health {
                            health.metrics.record_apply(&target, "failure");
                        }
                        warn!(
                            proxy = %target,
                            generation = snapshot.generation,
                            attempt = attempts,
                            permanent,
                            error = %e,
                            "{}",
                            e.reason()
                        );
                        sink.publish(StatusUpdate::ApplyFailed {
                            target: target.clone(),
                            generation: snapshot.generation,
                            resources: snapshot.resources.clone(),
                            reason: e.reason(),
                            message: e.to_string(),
                            permanent,
                        });
                        if permanent {
                            rejected_digest = Some(snapshot.digest.clone());
                        }
                        last_error = Some(e);
                        phase = step(&sm, &target, phase, LoopEvent::ApplyFailed, &ctx);
                    }
                }
            }

            ReconcilePhase::Applied => {
                phase = step(
                    &sm,
                    &target,
                    phase,
                    LoopEvent::Settled,
                    &TransitionContext::default(),
                );
            }

            ReconcilePhase::Failed => {
                let mut ctx = TransitionContext::new(attempts, max_attempts)
                    .with_permanent(last_error.as_ref().is_some_and(|e| !e.is_retryable()))
                    .with_input_changed(rx.has_changed().unwrap_or(false));
                if let Some(e) = &last_error {
                    ctx = ctx.with_error(e.to_string());
                }

                let mut event = determine_failure_event(&ctx);
                if event == LoopEvent::RetryScheduled {
                    let delay = settings.backoff.delay(attempts);
                    debug!(proxy = %target, attempt = attempts, delay_ms = delay.as_millis() as u64, "Backing off");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            info!(proxy = %target, "Newer input arrived, abandoning failed generation");
                            ctx = ctx.with_input_changed(true);
                            event = LoopEvent::Superseded;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                } else if event == LoopEvent::GaveUp {
                    warn!(
                        proxy = %target,
                        attempts,
                        error = ctx.error_message.as_deref().unwrap_or_default(),
                        "Giving up on generation until input changes"
                    );
                }
                phase = step(&sm, &target, phase, event, &ctx);
            }

            ReconcilePhase::Halted => break,
        }
    }

    info!(proxy = %target, phase = %phase, "Target worker stopped");
    phase
}
