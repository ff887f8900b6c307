//! Writes [`StatusUpdate`]s to the cluster.
//!
//! The pipeline publishes into a bounded queue through
//! [`QueueStatusSink`]; a single [`StatusWriter`] task drains it. Policy
//! CRDs get their status subresource patched, every other kind gets a
//! Kubernetes Event. Only the elected leader writes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use kube::Api;
use kube::api::{Patch, PatchParams};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::context::{Context, FIELD_MANAGER};
use super::error::Result;
use super::status::{StatusSink, StatusUpdate, next_policy_status, status_changed};
use crate::crd::{CachingPolicy, PolicyStatus, SNIPolicy};
use crate::health::HealthState;
use crate::watcher::{ResourceKey, ResourceKind};

/// Non-blocking sink feeding the status queue.
pub struct QueueStatusSink {
    tx: mpsc::Sender<StatusUpdate>,
    health: Option<Arc<HealthState>>,
}

/// Create a sink and the receiving end of its queue.
pub fn status_queue(
    capacity: usize,
    health: Option<Arc<HealthState>>,
) -> (QueueStatusSink, mpsc::Receiver<StatusUpdate>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (QueueStatusSink { tx, health }, rx)
}

impl StatusSink for QueueStatusSink {
    fn publish(&self, update: StatusUpdate) {
        match self.tx.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                warn!(update = update.name(), "Status queue full, dropping update");
                if let Some(health) = &self.health {
                    health.metrics.status_dropped_total.inc();
                }
            }
            Err(TrySendError::Closed(update)) => {
                debug!(update = update.name(), "Status writer stopped, dropping update");
            }
        }
    }
}

/// Drains the status queue into the API server.
pub struct StatusWriter {
    ctx: Context,
    is_leader: Arc<AtomicBool>,
    /// Metadata generation last announced as applied, per non-CRD object.
    announced: HashMap<ResourceKey, Option<i64>>,
    /// Status patches that failed with a retryable error, due at the instant.
    retries: BTreeMap<ResourceKey, PendingWrite>,
}

#[derive(Debug)]
struct PendingWrite {
    due: Instant,
    update: StatusUpdate,
    generation: Option<i64>,
}

impl StatusWriter {
    pub fn new(ctx: Context, is_leader: Arc<AtomicBool>) -> Self {
        Self {
            ctx,
            is_leader,
            announced: HashMap::new(),
            retries: BTreeMap::new(),
        }
    }

    /// Process updates until cancelled or the queue closes.
    pub async fn run(mut self, mut rx: mpsc::Receiver<StatusUpdate>, cancel: CancellationToken) {
        info!("Starting status writer");
        loop {
            let next_retry = self.retries.values().map(|p| p.due).min();
            tokio::select! {
                _ = cancel.cancelled() => break,
                update = rx.recv() => match update {
                    Some(update) => self.handle(update).await,
                    None => break,
                },
                _ = sleep_until(next_retry) => self.retry_due().await,
            }
        }
        if !self.retries.is_empty() {
            debug!(pending = self.retries.len(), "Dropping pending status retries");
        }
        info!("Status writer stopped");
    }

    async fn handle(&mut self, update: StatusUpdate) {
        if !self.is_leader.load(Ordering::Relaxed) {
            trace!(update = update.name(), "Not leader, skipping status update");
            return;
        }
        for (key, generation) in update.subjects() {
            if key.kind.has_status_subresource() {
                // a newer update replaces whatever was waiting for this key
                self.retries.remove(&key);
                self.write_or_schedule(key, update.clone(), generation).await;
            } else {
                self.publish_event(&key, &update, generation).await;
            }
        }
    }

    async fn retry_due(&mut self) {
        let now = Instant::now();
        let due: Vec<ResourceKey> = self
            .retries
            .iter()
            .filter(|(_, p)| p.due <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            let Some(pending) = self.retries.remove(&key) else {
                continue;
            };
            if !self.is_leader.load(Ordering::Relaxed) {
                continue;
            }
            debug!(%key, update = pending.update.name(), "Retrying status patch");
            self.write_or_schedule(key, pending.update, pending.generation)
                .await;
        }
    }

    async fn write_or_schedule(
        &mut self,
        key: ResourceKey,
        update: StatusUpdate,
        generation: Option<i64>,
    ) {
        match self.write_policy_status(&key, &update, generation).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(%key, "Policy deleted before status write");
            }
            Err(e) => {
                let retryable = e.is_retryable();
                warn!(
                    %key,
                    update = update.name(),
                    retryable,
                    error = %e,
                    "Failed to patch status"
                );
                if retryable {
                    self.retries.insert(
                        key,
                        PendingWrite {
                            due: Instant::now() + e.requeue_after(),
                            update,
                            generation,
                        },
                    );
                }
            }
        }
    }

    async fn current_status(&self, key: &ResourceKey) -> Result<Option<PolicyStatus>> {
        let client = self.ctx.client.clone();
        Ok(match key.kind {
            ResourceKind::CachingPolicy => Api::<CachingPolicy>::namespaced(client, &key.namespace)
                .get_opt(&key.name)
                .await?
                .map(|p| p.status.unwrap_or_default()),
            ResourceKind::SniPolicy => Api::<SNIPolicy>::namespaced(client, &key.namespace)
                .get_opt(&key.name)
                .await?
                .map(|p| p.status.unwrap_or_default()),
            _ => None,
        })
    }

    async fn write_policy_status(
        &self,
        key: &ResourceKey,
        update: &StatusUpdate,
        generation: Option<i64>,
    ) -> Result<()> {
        let Some(current) = self.current_status(key).await? else {
            debug!(%key, "Policy no longer exists, skipping status");
            return Ok(());
        };
        let next = next_policy_status(&current, update, generation);
        if !status_changed(&current, &next) {
            return Ok(());
        }

        let patch = serde_json::json!({
            "status": serde_json::to_value(&next)?
        });
        let params = status_patch_params();
        let client = self.ctx.client.clone();
        match key.kind {
            ResourceKind::CachingPolicy => {
                Api::<CachingPolicy>::namespaced(client, &key.namespace)
                    .patch_status(&key.name, &params, &Patch::Merge(&patch))
                    .await?;
            }
            ResourceKind::SniPolicy => {
                Api::<SNIPolicy>::namespaced(client, &key.namespace)
                    .patch_status(&key.name, &params, &Patch::Merge(&patch))
                    .await?;
            }
            _ => return Ok(()),
        }
        debug!(%key, phase = %next.phase, update = update.name(), "Patched policy status");
        Ok(())
    }

    async fn publish_event(
        &mut self,
        key: &ResourceKey,
        update: &StatusUpdate,
        generation: Option<i64>,
    ) {
        let ctx = &self.ctx;
        match update {
            StatusUpdate::Accepted { .. } => {}
            StatusUpdate::Invalid { error, .. } => {
                ctx.publish_warning_event(
                    key,
                    "ValidationFailed",
                    "Validate",
                    Some(error.to_string()),
                )
                .await;
            }
            StatusUpdate::Conflict(conflict) => {
                ctx.publish_warning_event(key, "Conflict", "Resolve", Some(conflict.to_string()))
                    .await;
            }
            StatusUpdate::ConflictResolved { .. } => {
                ctx.publish_normal_event(
                    key,
                    "ConflictResolved",
                    "Resolve",
                    Some("no longer overridden".to_string()),
                )
                .await;
            }
            StatusUpdate::Warning {
                reason, message, ..
            } => {
                ctx.publish_warning_event(key, reason, "Compile", Some(message.clone()))
                    .await;
            }
            StatusUpdate::Applied {
                target,
                generation: applied,
                ..
            } => {
                if self.announced.get(key) == Some(&generation) {
                    return;
                }
                ctx.publish_normal_event(
                    key,
                    "Applied",
                    "Apply",
                    Some(format!("configuration generation {applied} live on {target}")),
                )
                .await;
                self.announced.insert(key.clone(), generation);
            }
            StatusUpdate::ApplyFailed {
                target,
                generation: failed,
                reason,
                message,
                ..
            } => {
                ctx.publish_warning_event(
                    key,
                    reason,
                    "Apply",
                    Some(format!("generation {failed} on {target}: {message}")),
                )
                .await;
            }
            StatusUpdate::Halted {
                target, message, ..
            } => {
                ctx.publish_warning_event(
                    key,
                    "Halted",
                    "Compile",
                    Some(format!("{target} halted: {message}")),
                )
                .await;
            }
        }
    }
}

/// Parameters for merge-patching a status subresource as this controller.
fn status_patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
