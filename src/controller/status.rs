//! Status reporting: what the pipeline reports, and how it maps onto the
//! policy status subresource.

use crate::crd::{Condition, ConditionType, PolicyPhase, PolicyStatus};
use crate::policy::{ConflictError, ResourceRef, ValidationError};
use crate::watcher::ResourceKey;

/// Something the controller wants recorded against one or more resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    /// A valid version was admitted to the active set.
    Accepted {
        key: ResourceKey,
        generation: Option<i64>,
    },
    /// The object failed validation and is excluded.
    Invalid {
        error: ValidationError,
        generation: Option<i64>,
    },
    /// The object lost a precedence conflict.
    Conflict(ConflictError),
    /// A conflict reported earlier no longer exists.
    ConflictResolved { key: ResourceKey },
    /// A non-fatal compile problem.
    Warning {
        key: ResourceKey,
        reason: &'static str,
        message: String,
    },
    /// A snapshot is live on a target.
    Applied {
        target: String,
        generation: u64,
        resources: Vec<ResourceRef>,
    },
    /// A snapshot could not be applied to a target.
    ApplyFailed {
        target: String,
        generation: u64,
        resources: Vec<ResourceRef>,
        reason: &'static str,
        message: String,
        permanent: bool,
    },
    /// A target stopped after a compiler invariant violation.
    Halted {
        target: String,
        message: String,
        resources: Vec<ResourceRef>,
    },
}

impl StatusUpdate {
    /// Resources this update is recorded against, with their metadata
    /// generation when known.
    pub fn subjects(&self) -> Vec<(ResourceKey, Option<i64>)> {
        match self {
            StatusUpdate::Accepted { key, generation } => vec![(key.clone(), *generation)],
            StatusUpdate::Invalid { error, generation } => vec![(error.key.clone(), *generation)],
            StatusUpdate::Conflict(conflict) => vec![(conflict.loser.clone(), None)],
            StatusUpdate::ConflictResolved { key } | StatusUpdate::Warning { key, .. } => {
                vec![(key.clone(), None)]
            }
            StatusUpdate::Applied { resources, .. }
            | StatusUpdate::ApplyFailed { resources, .. }
            | StatusUpdate::Halted { resources, .. } => resources
                .iter()
                .map(|r| (r.key.clone(), r.generation))
                .collect(),
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            StatusUpdate::Accepted { .. } => "Accepted",
            StatusUpdate::Invalid { .. } => "Invalid",
            StatusUpdate::Conflict(_) => "Conflict",
            StatusUpdate::ConflictResolved { .. } => "ConflictResolved",
            StatusUpdate::Warning { .. } => "Warning",
            StatusUpdate::Applied { .. } => "Applied",
            StatusUpdate::ApplyFailed { .. } => "ApplyFailed",
            StatusUpdate::Halted { .. } => "Halted",
        }
    }
}

/// Receiver of status updates.
///
/// `publish` must not block; the pipeline calls it inline.
pub trait StatusSink: Send + Sync + 'static {
    fn publish(&self, update: StatusUpdate);
}

/// Builder for managing conditions list
///
/// Starting from the current conditions keeps `lastTransitionTime` stable
/// when a condition's status does not change.
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
}

impl ConditionBuilder {
    pub fn new() -> Self {
        Self {
            conditions: Vec::new(),
        }
    }

    pub fn from_existing(conditions: &[Condition]) -> Self {
        Self {
            conditions: conditions.to_vec(),
        }
    }

    /// Add or update a condition
    pub fn set(&mut self, mut condition: Condition) -> &mut Self {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
        self
    }

    pub fn ready(
        &mut self,
        ready: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::ready(ready, reason, message, generation))
    }

    pub fn degraded(
        &mut self,
        degraded: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::degraded(degraded, reason, message, generation))
    }

    pub fn failed(
        &mut self,
        failed: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::failed(failed, reason, message, generation))
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

impl Default for ConditionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if a condition type is true
pub fn is_condition_true(conditions: &[Condition], condition_type: ConditionType) -> bool {
    let wanted = condition_type.to_string();
    conditions
        .iter()
        .find(|c| c.r#type == wanted)
        .is_some_and(|c| c.status == "True")
}

/// Status of a policy resource after `update`.
///
/// `generation` is the resource's metadata generation as carried by the
/// update, if any.
pub fn next_policy_status(
    current: &PolicyStatus,
    update: &StatusUpdate,
    generation: Option<i64>,
) -> PolicyStatus {
    let mut status = current.clone();
    if generation.is_some() {
        status.observed_generation = generation;
    }
    let generation = status.observed_generation;
    let mut conditions = ConditionBuilder::from_existing(&current.conditions);

    match update {
        StatusUpdate::Accepted { .. } => {
            conditions
                .failed(false, "Valid", "spec passed validation", generation)
                .degraded(false, "NoConflict", "no conflicting policy", generation);
            if status.phase != PolicyPhase::Applied {
                conditions.ready(false, "Pending", "waiting to be applied", generation);
                status.phase = PolicyPhase::Pending;
            }
            status.last_error = None;
        }
        StatusUpdate::Invalid { error, .. } => {
            let message = error.to_string();
            conditions
                .ready(false, "ValidationFailed", &message, generation)
                .failed(true, "ValidationFailed", &message, generation);
            status.phase = PolicyPhase::Failed;
            status.last_error = Some(message);
        }
        StatusUpdate::Conflict(conflict) => {
            let message = conflict.to_string();
            conditions.degraded(true, "Conflict", &message, generation);
            if status.phase != PolicyPhase::Failed {
                status.phase = PolicyPhase::Degraded;
            }
            status.last_error = Some(message);
        }
        StatusUpdate::ConflictResolved { .. } => {
            conditions.degraded(false, "NoConflict", "no conflicting policy", generation);
            if status.phase == PolicyPhase::Degraded {
                status.phase = if status.applied_generation.is_some() {
                    PolicyPhase::Applied
                } else {
                    PolicyPhase::Pending
                };
            }
            status.last_error = None;
        }
        StatusUpdate::Warning {
            reason, message, ..
        } => {
            conditions.degraded(true, reason, message, generation);
            if status.phase != PolicyPhase::Failed {
                status.phase = PolicyPhase::Degraded;
            }
            status.last_error = Some(message.clone());
        }
        StatusUpdate::Applied {
            target, generation: applied, ..
        } => {
            let message = format!("generation {applied} live on {target}");
            conditions
                .ready(true, "Applied", &message, generation)
                .failed(false, "Applied", &message, generation);
            status.applied_generation = Some(*applied);
            status.phase = if status.phase == PolicyPhase::Degraded {
                PolicyPhase::Degraded
            } else {
                PolicyPhase::Applied
            };
            if status.phase == PolicyPhase::Applied {
                status.last_error = None;
            }
        }
        StatusUpdate::ApplyFailed {
            reason,
            message,
            permanent,
            ..
        } => {
            conditions.failed(true, reason, message, generation);
            if *permanent {
                conditions.ready(false, reason, message, generation);
                status.phase = PolicyPhase::Failed;
            }
            status.last_error = Some(message.clone());
        }
        StatusUpdate::Halted { message, .. } => {
            conditions
                .ready(false, "Halted", message, generation)
                .failed(true, "Halted", message, generation);
            status.phase = PolicyPhase::Failed;
            status.last_error = Some(message.clone());
        }
    }

    status.conditions = conditions.build();
    status
}

/// Whether two statuses differ in anything but condition timestamps.
pub fn status_changed(a: &PolicyStatus, b: &PolicyStatus) -> bool {
    a.phase != b.phase
        || a.observed_generation != b.observed_generation
        || a.applied_generation != b.applied_generation
        || a.last_error != b.last_error
        || a.conditions.len() != b.conditions.len()
        || a
            .conditions
            .iter()
            .zip(&b.conditions)
            .any(|(x, y)| !x.same_state(y))
}
