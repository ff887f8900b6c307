//! In-memory stand-ins for the proxy, the applier and the status writer.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use ats_ingress::applier::{
    ApplyError, ApplyReport, ConfigApplier, ProxyControl, ProxyControlError,
};
use ats_ingress::compiler::CompiledSnapshot;
use ats_ingress::controller::{StatusSink, StatusUpdate};

/// Records every status update.
#[derive(Default)]
pub struct RecordingSink {
    updates: Mutex<Vec<StatusUpdate>>,
}

impl RecordingSink {
    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.name() == name)
            .count()
    }
}

impl StatusSink for RecordingSink {
    fn publish(&self, update: StatusUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

/// Applier that records generations and fails on demand.
#[derive(Default)]
pub struct FakeApplier {
    applied: Mutex<Vec<u64>>,
    failures: Mutex<VecDeque<ApplyError>>,
    calls: AtomicUsize,
    apply_time: Option<Duration>,
}

impl FakeApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every apply takes `duration` of (tokio) time.
    pub fn slow(duration: Duration) -> Self {
        Self {
            apply_time: Some(duration),
            ..Self::default()
        }
    }

    /// Queue errors returned by the next applies, in order.
    pub fn fail_with(self, errors: impl IntoIterator<Item = ApplyError>) -> Self {
        self.failures.lock().unwrap().extend(errors);
        self
    }

    pub fn applied(&self) -> Vec<u64> {
        self.applied.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigApplier for FakeApplier {
    fn target(&self) -> &str {
        "fake"
    }

    async fn apply(&self, snapshot: &CompiledSnapshot) -> Result<ApplyReport, ApplyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(duration) = self.apply_time {
            tokio::time::sleep(duration).await;
        }
        let failure = self.failures.lock().unwrap().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        self.applied.lock().unwrap().push(snapshot.generation);
        Ok(ApplyReport {
            generation: snapshot.generation,
            changed: true,
            proxy_reload_latency: Some(Duration::from_millis(5)),
        })
    }
}

/// Proxy that remembers what it was asked to do.
#[derive(Default)]
pub struct FakeControl {
    pub reloads: AtomicUsize,
    pub verifies: AtomicUsize,
    pub records: Mutex<Vec<(String, String)>>,
    pub reject: AtomicBool,
    pub fail_reload: AtomicBool,
}

impl FakeControl {
    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

fn failed(command: &str, stderr: &str) -> ProxyControlError {
    ProxyControlError::Failed {
        command: command.to_string(),
        status: "exit status: 1".to_string(),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl ProxyControl for FakeControl {
    async fn verify(&self) -> Result<(), ProxyControlError> {
        self.verifies.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return Err(failed("traffic_server -C verify_config", "remap.config: bad line"));
        }
        Ok(())
    }

    async fn set_record(&self, name: &str, value: &str) -> Result<(), ProxyControlError> {
        self.records
            .lock()
            .unwrap()
            .push((name.to_string(), value.to_string()));
        Ok(())
    }

    async fn reload(&self) -> Result<(), ProxyControlError> {
        if self.fail_reload.load(Ordering::SeqCst) {
            return Err(failed("traffic_ctl config reload", "connection refused"));
        }
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
