//! ats-ingress library crate
//!
//! A Kubernetes ingress controller for Apache Traffic Server. Watched
//! objects flow through the validator into an immutable active set, which
//! each proxy target compiles into Traffic Server configuration and applies.

pub mod applier;
pub mod compiler;
pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod policy;
pub mod watcher;

pub use health::HealthState;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use futures::Stream;
use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use applier::{ConfigApplier, FileApplier, TrafficCtl};
use compiler::Compiler;
use config::ControllerArgs;
use controller::{
    Context, Ingest, ReconcilePhase, ReconcileSettings, StatusSink, StatusWriter,
    active_set_channel, run_target, status_queue,
};
use watcher::{ResourceEvent, ResourceWatcher};

/// How long the status writer may keep draining after the pipeline stops.
const STATUS_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handles of a running pipeline.
pub struct Pipeline {
    ingest: JoinHandle<()>,
    targets: Vec<(String, JoinHandle<ReconcilePhase>)>,
}

impl Pipeline {
    /// Wait for ingest and every target worker to stop. Returns each
    /// target's final phase.
    pub async fn join(self) -> Vec<(String, ReconcilePhase)> {
        if let Err(e) = self.ingest.await {
            error!(error = %e, "Ingest task panicked");
        }
        let mut phases = Vec::with_capacity(self.targets.len());
        for (target, handle) in self.targets {
            match handle.await {
                Ok(phase) => phases.push((target, phase)),
                Err(e) => error!(proxy = %target, error = %e, "Target worker panicked"),
            }
        }
        phases
    }
}

/// Start the ingest stage and one worker per target.
///
/// Everything stops when `events` ends or `cancel` fires; applies already
/// in flight finish first.
pub fn spawn_pipeline<S>(
    events: S,
    targets: Vec<Arc<dyn ConfigApplier>>,
    compiler: Arc<Compiler>,
    sink: Arc<dyn StatusSink>,
    health: Option<Arc<HealthState>>,
    settings: ReconcileSettings,
    cancel: CancellationToken,
) -> Pipeline
where
    S: Stream<Item = ResourceEvent> + Send + 'static,
{
    let (tx, rx) = active_set_channel();

    let targets = targets
        .into_iter()
        .map(|applier| {
            let name = applier.target().to_string();
            let handle = tokio::spawn(run_target(
                applier,
                compiler.clone(),
                rx.clone(),
                sink.clone(),
                health.clone(),
                settings.clone(),
                cancel.clone(),
            ));
            (name, handle)
        })
        .collect();

    let ingest = Ingest::new(tx, sink, health, &settings);
    let ingest = tokio::spawn(ingest.run(events, cancel));

    Pipeline { ingest, targets }
}

/// Run the controller against the cluster until `cancel` fires.
pub async fn run_controller(
    client: Client,
    args: &ControllerArgs,
    health: Arc<HealthState>,
    is_leader: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    info!(
        namespaces = ?args.namespaces,
        ingress_class = ?args.ingress_class,
        config_dir = %args.config_dir.display(),
        "Starting controller"
    );

    let (sink, status_rx) = status_queue(args.status_queue_capacity, Some(health.clone()));
    let writer = StatusWriter::new(Context::new(client.clone(), Some(health.clone())), is_leader);
    let writer_cancel = CancellationToken::new();
    let mut writer_handle = tokio::spawn(writer.run(status_rx, writer_cancel.clone()));

    let mut watcher = ResourceWatcher::new(client, args.watcher_settings(), health.clone());
    let events = watcher.stream(cancel.clone());

    let mut control = TrafficCtl::new(&args.traffic_ctl);
    if let Some(command) = &args.verify_command {
        control = control.with_verify_command(command);
    }
    let applier: Arc<dyn ConfigApplier> =
        Arc::new(FileApplier::new(args.applier_settings(), control));
    let compiler = Arc::new(Compiler::new(args.compile_options()).with_health(health.clone()));

    let pipeline = spawn_pipeline(
        events,
        vec![applier],
        compiler,
        Arc::new(sink),
        Some(health),
        args.reconcile_settings(),
        cancel.clone(),
    );
    for (target, phase) in pipeline.join().await {
        info!(proxy = %target, phase = %phase, "Target stopped");
    }
    watcher.join().await;

    // The sink is gone with the pipeline, so the writer stops once drained.
    if tokio::time::timeout(STATUS_DRAIN_TIMEOUT, &mut writer_handle)
        .await
        .is_err()
    {
        warn!("Status writer did not drain in time");
        writer_cancel.cancel();
        let _ = writer_handle.await;
    }
}
