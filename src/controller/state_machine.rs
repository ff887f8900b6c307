//! Finite state machine for one proxy target's reconcile loop.
//!
//! Each managed target runs its own machine:
//!
//! ```text
//! Idle -> Compiling -> Applying -> Applied -> Idle
//!             |            |
//!             |            +-> Failed -> Applying   (retry after backoff)
//!             |                  |     -> Compiling (superseded by newer input)
//!             |                  |     -> Idle      (permanent or exhausted)
//!             +-> Halted (compile invariant violated; terminal)
//! ```
//!
//! Transitions are table-driven. Guards decide whether a failed apply may
//! be retried.

use std::fmt;

/// Where a target's loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReconcilePhase {
    /// Waiting for a new input set
    #[default]
    Idle,
    /// Compiling the newest input set
    Compiling,
    /// Handing a snapshot to the applier
    Applying,
    /// The snapshot is live on the target
    Applied,
    /// The last apply failed
    Failed,
    /// A compile invariant was violated; nothing more is applied
    Halted,
}

impl ReconcilePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReconcilePhase::Halted)
    }
}

impl fmt::Display for ReconcilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcilePhase::Idle => write!(f, "Idle"),
            ReconcilePhase::Compiling => write!(f, "Compiling"),
            ReconcilePhase::Applying => write!(f, "Applying"),
            ReconcilePhase::Applied => write!(f, "Applied"),
            ReconcilePhase::Failed => write!(f, "Failed"),
            ReconcilePhase::Halted => write!(f, "Halted"),
        }
    }
}

/// Events that drive the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopEvent {
    /// A newer input set was published
    InputChanged,
    /// The compiler reported an invariant violation
    CompileFailed,
    /// The compiled generation is already applied to this target
    GenerationUnchanged,
    /// A new snapshot needs applying
    SnapshotReady,
    ApplySucceeded,
    ApplyFailed,
    /// Backoff elapsed; apply the same snapshot again
    RetryScheduled,
    /// Newer input arrived during backoff
    Superseded,
    /// The failure is permanent or attempts are exhausted
    GaveUp,
    /// Applied result recorded
    Settled,
}

impl fmt::Display for LoopEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Facts the guards look at
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// Failed attempts for the current generation
    pub attempts: u32,
    /// Allowed attempts per generation (0 = unlimited)
    pub max_attempts: u32,
    /// The last failure cannot succeed on retry
    pub permanent: bool,
    /// A newer input set is waiting
    pub input_changed: bool,
    /// Error message of the last failure
    pub error_message: Option<String>,
}

impl TransitionContext {
    pub fn new(attempts: u32, max_attempts: u32) -> Self {
        Self {
            attempts,
            max_attempts,
            ..Default::default()
        }
    }

    /// Whether another attempt at the same generation is allowed
    pub fn can_retry(&self) -> bool {
        !self.permanent && (self.max_attempts == 0 || self.attempts < self.max_attempts)
    }

    pub fn with_permanent(mut self, permanent: bool) -> Self {
        self.permanent = permanent;
        self
    }

    pub fn with_input_changed(mut self, changed: bool) -> Self {
        self.input_changed = changed;
        self
    }

    pub fn with_error(mut self, message: String) -> Self {
        self.error_message = Some(message);
        self
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: ReconcilePhase,
    pub to: ReconcilePhase,
    pub event: LoopEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: ReconcilePhase,
        to: ReconcilePhase,
        event: LoopEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug, PartialEq, Eq)]
pub enum TransitionResult {
    Success {
        from: ReconcilePhase,
        to: ReconcilePhase,
        event: LoopEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: ReconcilePhase,
        event: LoopEvent,
    },
    GuardFailed {
        from: ReconcilePhase,
        to: ReconcilePhase,
        event: LoopEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Target phase of a successful transition
    pub fn next_phase(&self) -> Option<ReconcilePhase> {
        match self {
            TransitionResult::Success { to, .. } => Some(*to),
            _ => None,
        }
    }
}

/// Transition table for a target's reconcile loop
pub struct ReconcileStateMachine {
    transitions: Vec<Transition>,
}

impl Default for ReconcileStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconcileStateMachine {
    pub fn new() -> Self {
        use LoopEvent as E;
        use ReconcilePhase as P;
        Self {
            transitions: vec![
                Transition::new(P::Idle, P::Compiling, E::InputChanged, "New input set"),
                Transition::new(
                    P::Compiling,
                    P::Halted,
                    E::CompileFailed,
                    "Compiler invariant violated, halting target",
                ),
                Transition::new(
                    P::Compiling,
                    P::Idle,
                    E::GenerationUnchanged,
                    "Generation already applied",
                ),
                Transition::new(P::Compiling, P::Applying, E::SnapshotReady, "Applying snapshot"),
                Transition::new(P::Applying, P::Applied, E::ApplySucceeded, "Snapshot applied"),
                Transition::new(P::Applying, P::Failed, E::ApplyFailed, "Apply failed"),
                Transition::new(P::Applied, P::Idle, E::Settled, "Waiting for changes"),
                Transition::new(
                    P::Failed,
                    P::Applying,
                    E::RetryScheduled,
                    "Retrying apply after backoff",
                ),
                Transition::new(
                    P::Failed,
                    P::Compiling,
                    E::Superseded,
                    "Newer input supersedes failed generation",
                ),
                Transition::new(
                    P::Failed,
                    P::Idle,
                    E::GaveUp,
                    "Not retrying, waiting for new input",
                ),
                // Halted is terminal
            ],
        }
    }

    /// Attempt to transition to a new phase based on an event
    pub fn transition(
        &self,
        current: ReconcilePhase,
        event: LoopEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event);

        match transition {
            Some(t) => match self.check_guard(t, ctx) {
                Some(reason) => TransitionResult::GuardFailed {
                    from: t.from,
                    to: t.to,
                    event,
                    reason,
                },
                None => TransitionResult::Success {
                    from: t.from,
                    to: t.to,
                    event,
                    description: t.description,
                },
            },
            None => TransitionResult::InvalidTransition { current, event },
        }
    }

    /// Check if a transition exists (ignoring guards)
    pub fn can_transition(&self, from: ReconcilePhase, event: LoopEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.event == event)
    }

    /// Get all events accepted in a phase
    pub fn valid_events(&self, phase: ReconcilePhase) -> Vec<LoopEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == phase)
            .map(|t| t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match transition.event {
            LoopEvent::RetryScheduled if ctx.permanent => {
                Some("failure is permanent".to_string())
            }
            LoopEvent::RetryScheduled if !ctx.can_retry() => Some(format!(
                "attempts exhausted: {}/{}",
                ctx.attempts, ctx.max_attempts
            )),
            LoopEvent::GaveUp if ctx.can_retry() => Some(format!(
                "retry still allowed: {}/{}",
                ctx.attempts, ctx.max_attempts
            )),
            LoopEvent::Superseded if !ctx.input_changed => {
                Some("no newer input".to_string())
            }
            _ => None,
        }
    }
}

/// Pick the event that leaves the `Failed` phase
pub fn determine_failure_event(ctx: &TransitionContext) -> LoopEvent {
    if ctx.input_changed {
        LoopEvent::Superseded
    } else if ctx.can_retry() {
        LoopEvent::RetryScheduled
    } else {
        LoopEvent::GaveUp
    }
}
