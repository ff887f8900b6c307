//! Config applier: pushes a [`CompiledSnapshot`] to a proxy target.
//!
//! [`FileApplier`] writes the rendered files into the Traffic Server config
//! directory and drives the proxy through a [`ProxyControl`] implementation,
//! normally [`TrafficCtl`].

mod file;
mod traffic_ctl;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::compiler::CompiledSnapshot;

pub use file::{FileApplier, FileApplierSettings};
pub use traffic_ctl::{ProxyControlError, TrafficCtl};

/// Outcome of a successful apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub generation: u64,
    /// False when the target already ran this configuration.
    pub changed: bool,
    /// Time the proxy took to reload, when a reload was issued.
    pub proxy_reload_latency: Option<Duration>,
}

/// Apply failures.
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy reload failed: {0}")]
    ReloadFailed(String),

    /// The proxy refused the configuration. Retrying the same files cannot
    /// succeed.
    #[error("proxy rejected configuration: {0}")]
    RejectedConfig(String),
}

impl ApplyError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ApplyError::WriteFailed { .. } | ApplyError::ReloadFailed(_) => true,
            ApplyError::RejectedConfig(_) => false,
        }
    }

    /// Short label for metrics and status reasons
    pub fn reason(&self) -> &'static str {
        match self {
            ApplyError::WriteFailed { .. } => "WriteFailed",
            ApplyError::ReloadFailed(_) => "ReloadFailed",
            ApplyError::RejectedConfig(_) => "RejectedConfig",
        }
    }
}

/// A managed proxy target.
#[async_trait]
pub trait ConfigApplier: Send + Sync + 'static {
    /// Name used in logs, metrics and status.
    fn target(&self) -> &str;

    /// Make the target run `snapshot`. Must be idempotent per digest.
    async fn apply(&self, snapshot: &CompiledSnapshot) -> Result<ApplyReport, ApplyError>;
}

/// Process-level control of the proxy.
#[async_trait]
pub trait ProxyControl: Send + Sync + 'static {
    /// Check the written configuration before it is activated.
    async fn verify(&self) -> Result<(), ProxyControlError>;

    /// Set one `proxy.config.*` record.
    async fn set_record(&self, name: &str, value: &str) -> Result<(), ProxyControlError>;

    /// Ask the proxy to reload its configuration files.
    async fn reload(&self) -> Result<(), ProxyControlError>;
}
