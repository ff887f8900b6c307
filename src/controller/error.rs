//! Error types for the controller.
//!
//! Aggregates the per-layer errors and classifies them for retry behavior.

use std::time::Duration;
use thiserror::Error;

use crate::applier::ApplyError;
use crate::compiler::CompileError;
use crate::policy::{ConflictError, ValidationError};
use crate::watcher::WatchError;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid object, excluded until corrected
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Object lost a precedence conflict
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// Watch stream failed and is being restarted
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// Applying a snapshot to the proxy failed
    #[error(transparent)]
    Apply(#[from] ApplyError),

    /// Compiler invariant violated; halts the target
    #[error("fatal: {0}")]
    Compile(#[from] CompileError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Watch(_) => true,
            Error::Apply(e) => e.is_retryable(),
            Error::Validation(_) | Error::Conflict(_) | Error::Compile(_) => false,
            Error::Serialization(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        if self.is_retryable() {
            Duration::from_secs(30)
        } else {
            // Wait for the next change to the object instead
            Duration::from_secs(3600)
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
