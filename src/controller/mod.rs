//! Controller module for ats-ingress.
//!
//! Contains the reconcile pipeline, the per-target state machine, retry
//! backoff, error handling, and status reporting.

pub mod backoff;
pub mod context;
pub mod error;
pub mod reconciler;
pub mod reporter;
pub mod state_machine;
pub mod status;

pub use backoff::Backoff;
pub use context::{Context, FIELD_MANAGER};
pub use error::{Error, Result};
pub use reconciler::{Ingest, ReconcileSettings, active_set_channel, run_target};
pub use reporter::{QueueStatusSink, StatusWriter, status_queue};
pub use state_machine::{LoopEvent, ReconcilePhase, ReconcileStateMachine};
pub use status::{StatusSink, StatusUpdate};
