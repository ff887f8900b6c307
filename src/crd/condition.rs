//! Status types shared by the policy custom resources.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition describes the state of a policy at a certain point.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: ConditionType,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Create a "Ready" condition.
    pub fn ready(ready: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new(ConditionType::Ready, ready, reason, message, generation)
    }

    /// Create a "Degraded" condition.
    pub fn degraded(degraded: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new(ConditionType::Degraded, degraded, reason, message, generation)
    }

    /// Create a "Failed" condition.
    pub fn failed(failed: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new(ConditionType::Failed, failed, reason, message, generation)
    }

    /// Whether this condition carries the same observable state as `other`,
    /// ignoring the transition timestamp.
    pub fn same_state(&self, other: &Condition) -> bool {
        self.r#type == other.r#type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
            && self.observed_generation == other.observed_generation
    }
}

/// Types of conditions reported on policy resources.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConditionType {
    /// The policy is part of the configuration live on the proxy.
    Ready,
    /// The policy is accepted but partially overridden or incomplete.
    Degraded,
    /// The policy was rejected or the proxy refused its configuration.
    Failed,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionType::Ready => write!(f, "Ready"),
            ConditionType::Degraded => write!(f, "Degraded"),
            ConditionType::Failed => write!(f, "Failed"),
        }
    }
}

/// Coarse lifecycle phase shown in `kubectl get`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum PolicyPhase {
    /// Accepted, not yet live on the proxy.
    #[default]
    Pending,
    /// Live on the proxy.
    Applied,
    /// Live, but overridden by a conflicting policy.
    Degraded,
    /// Rejected by validation or by the proxy.
    Failed,
}

impl std::fmt::Display for PolicyPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyPhase::Pending => write!(f, "Pending"),
            PolicyPhase::Applied => write!(f, "Applied"),
            PolicyPhase::Degraded => write!(f, "Degraded"),
            PolicyPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Status subresource shared by `CachingPolicy` and `SNIPolicy`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    /// Current phase.
    #[serde(default)]
    pub phase: PolicyPhase,

    /// Metadata generation last seen by the controller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Snapshot generation in which this policy was last applied to the proxy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_generation: Option<u64>,

    /// Most recent error attached to this policy, cleared on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Conditions describing the current state.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
