//! Reconcile loop behaviour on paused tokio time.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use ats_ingress::applier::{ApplyError, ConfigApplier};
use ats_ingress::compiler::{CompileOptions, Compiler};
use ats_ingress::controller::{
    Backoff, ReconcilePhase, ReconcileSettings, StatusUpdate, active_set_channel, run_target,
};
use ats_ingress::policy::WorkingSet;
use ats_ingress::watcher::{EventType, Payload, ResourceEvent, ResourceKind};
use ats_ingress::{Pipeline, spawn_pipeline};

use crate::fakes::{FakeApplier, RecordingSink};
use crate::fixtures::*;

struct Harness {
    events: mpsc::Sender<ResourceEvent>,
    applier: Arc<FakeApplier>,
    sink: Arc<RecordingSink>,
    cancel: CancellationToken,
    pipeline: Pipeline,
}

impl Harness {
    fn start(applier: FakeApplier, settings: ReconcileSettings) -> Self {
        let (events, rx) = mpsc::channel(64);
        let applier = Arc::new(applier);
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        let targets: Vec<Arc<dyn ConfigApplier>> = vec![applier.clone()];
        let pipeline = spawn_pipeline(
            ReceiverStream::new(rx),
            targets,
            Arc::new(Compiler::new(CompileOptions::default())),
            sink.clone(),
            None,
            settings,
            cancel.clone(),
        );
        Self {
            events,
            applier,
            sink,
            cancel,
            pipeline,
        }
    }

    async fn send(&self, event: ResourceEvent) {
        self.events.send(event).await.unwrap();
    }

    async fn stop(self) -> Vec<(String, ReconcilePhase)> {
        self.cancel.cancel();
        self.pipeline.join().await
    }
}

fn ingress(name: &str, host: &str) -> ResourceEvent {
    added(IngressBuilder::new(name).rule(host, "/", "app", 80).build())
}

fn settings(base_ms: u64, max_attempts: u32) -> ReconcileSettings {
    ReconcileSettings {
        backoff: Backoff {
            base: Duration::from_millis(base_ms),
            max: Duration::from_secs(60),
            max_attempts,
        },
        ..Default::default()
    }
}

async fn advance(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

#[tokio::test(start_paused = true)]
async fn test_burst_is_applied_once() {
    let h = Harness::start(FakeApplier::new(), ReconcileSettings::default());

    h.send(ingress("a", "a.media.com")).await;
    h.send(ingress("b", "b.media.com")).await;
    h.send(added(CachingPolicyBuilder::new("cache").build())).await;
    advance(2).await;

    assert_eq!(h.applier.applied(), vec![1]);
    assert_eq!(h.sink.count("Accepted"), 3);
    assert_eq!(h.sink.count("Applied"), 1);

    let phases = h.stop().await;
    assert_eq!(phases, vec![("fake".to_string(), ReconcilePhase::Idle)]);
}

#[tokio::test(start_paused = true)]
async fn test_newer_input_supersedes_backoff() {
    let applier =
        FakeApplier::new().fail_with([ApplyError::ReloadFailed("connection refused".into())]);
    let h = Harness::start(applier, settings(10_000, 5));

    h.send(ingress("a", "a.media.com")).await;
    advance(1).await;
    assert_eq!(h.applier.calls(), 1);
    assert!(h.applier.applied().is_empty());

    // still inside the first backoff window
    h.send(ingress("b", "b.media.com")).await;
    advance(2).await;

    assert_eq!(h.applier.applied(), vec![2]);
    assert_eq!(h.applier.calls(), 2);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_rejected_config_is_not_retried() {
    let applier = FakeApplier::new().fail_with([ApplyError::RejectedConfig(
        "remap.config: bad line".into(),
    )]);
    let h = Harness::start(applier, settings(100, 5));

    h.send(ingress("a", "a.media.com")).await;
    advance(60).await;

    assert_eq!(h.applier.calls(), 1);
    assert!(h.applier.applied().is_empty());
    let failed: Vec<_> = h
        .sink
        .updates()
        .into_iter()
        .filter_map(|u| match u {
            StatusUpdate::ApplyFailed {
                reason, permanent, ..
            } => Some((reason, permanent)),
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec![("RejectedConfig", true)]);

    // a corrected input goes through
    h.send(ingress("b", "b.media.com")).await;
    advance(1).await;
    assert_eq!(h.applier.applied(), vec![2]);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_retried() {
    let applier = FakeApplier::new().fail_with([
        ApplyError::ReloadFailed("connection refused".into()),
        ApplyError::ReloadFailed("connection refused".into()),
    ]);
    let h = Harness::start(applier, settings(100, 5));

    h.send(ingress("a", "a.media.com")).await;
    advance(10).await;

    assert_eq!(h.applier.calls(), 3);
    assert_eq!(h.applier.applied(), vec![1]);
    assert_eq!(h.sink.count("ApplyFailed"), 2);
    assert_eq!(h.sink.count("Applied"), 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_attempts() {
    let applier = FakeApplier::new()
        .fail_with((0..5).map(|_| ApplyError::ReloadFailed("connection refused".into())));
    let h = Harness::start(applier, settings(100, 3));

    h.send(ingress("a", "a.media.com")).await;
    advance(120).await;

    assert_eq!(h.applier.calls(), 3);
    assert!(h.applier.applied().is_empty());

    let phases = h.stop().await;
    assert_eq!(phases[0].1, ReconcilePhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_output_skips_apply() {
    let h = Harness::start(FakeApplier::new(), ReconcileSettings::default());

    h.send(ingress("a", "a.media.com")).await;
    advance(1).await;
    assert_eq!(h.applier.calls(), 1);

    // nothing references this secret, so the rendered files do not change
    h.send(added(tls_secret(NAMESPACE, "unused"))).await;
    advance(1).await;

    assert_eq!(h.applier.calls(), 1);
    assert_eq!(h.applier.applied(), vec![1]);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_inflight_apply() {
    let h = Harness::start(
        FakeApplier::slow(Duration::from_secs(5)),
        ReconcileSettings::default(),
    );

    h.send(ingress("a", "a.media.com")).await;
    advance(1).await;
    assert_eq!(h.applier.calls(), 1);
    assert!(h.applier.applied().is_empty());

    let applier = h.applier.clone();
    h.stop().await;
    assert_eq!(applier.applied(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn test_compile_invariant_violation_halts_target() {
    let mut working = WorkingSet::new();
    working.apply(&ingress("a", "a.media.com"));
    let mut set = working.snapshot();

    // A validated set cannot contain a relative path; build one by hand.
    let (key, routes) = set.ingresses.iter().next().unwrap();
    let mut broken = routes.as_ref().clone();
    broken.rules[0].path = "relative".to_string();
    let key = key.clone();
    set.ingresses.insert(key, Arc::new(broken));
    set.revision += 1;

    let (tx, rx) = active_set_channel();
    let applier = Arc::new(FakeApplier::new());
    let sink = Arc::new(RecordingSink::default());
    let worker = tokio::spawn(run_target(
        applier.clone(),
        Arc::new(Compiler::new(CompileOptions::default())),
        rx,
        sink.clone(),
        None,
        ReconcileSettings::default(),
        CancellationToken::new(),
    ));

    tx.send_replace(Arc::new(set));
    let phase = worker.await.unwrap();

    assert_eq!(phase, ReconcilePhase::Halted);
    assert_eq!(applier.calls(), 0);
    assert_eq!(sink.count("Halted"), 1);
}

/// Same object with a bumped resourceVersion, as after a status write.
fn touched(event: &ResourceEvent, resource_version: &str) -> ResourceEvent {
    let mut payload = event.payload.clone().unwrap();
    match &mut payload {
        Payload::Ingress(obj) => {
            Arc::make_mut(obj).metadata.resource_version = Some(resource_version.to_string())
        }
        Payload::CachingPolicy(obj) => {
            Arc::make_mut(obj).metadata.resource_version = Some(resource_version.to_string())
        }
        _ => unreachable!(),
    }
    ResourceEvent {
        event_type: EventType::Update,
        payload: Some(payload),
        ..event.clone()
    }
}

#[tokio::test(start_paused = true)]
async fn test_rejected_output_is_not_reapplied_on_unrelated_change() {
    let applier = FakeApplier::new().fail_with([ApplyError::RejectedConfig(
        "remap.config: bad line".into(),
    )]);
    let h = Harness::start(applier, settings(100, 5));

    let a = ingress("a", "a.media.com");
    h.send(a.clone()).await;
    advance(1).await;
    assert_eq!(h.applier.calls(), 1);

    h.send(touched(&a, "2")).await;
    h.send(added(tls_secret(NAMESPACE, "unused"))).await;
    advance(60).await;

    assert_eq!(h.applier.calls(), 1);
    assert!(h.applier.applied().is_empty());
    // the touched ingress is not reported again, only the new secret
    assert_eq!(h.sink.count("Accepted"), 2);

    h.send(ingress("b", "b.media.com")).await;
    advance(1).await;
    assert_eq!(h.applier.applied(), vec![2]);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_conflict_survives_status_write_back() {
    let h = Harness::start(FakeApplier::new(), ReconcileSettings::default());

    let older = added(CachingPolicyBuilder::new("older").ttl(10).created(1_000).build());
    h.send(older.clone()).await;
    h.send(added(CachingPolicyBuilder::new("newer").ttl(20).created(2_000).build()))
        .await;
    advance(1).await;
    assert_eq!(h.sink.count("Conflict"), 1);
    assert_eq!(h.sink.count("Accepted"), 2);

    h.send(touched(&older, "2")).await;
    h.send(touched(&older, "3")).await;
    advance(2).await;

    assert_eq!(h.sink.count("Conflict"), 1);
    assert_eq!(h.sink.count("Accepted"), 2);
    assert_eq!(h.sink.count("ConflictResolved"), 0);
    assert_eq!(h.applier.applied(), vec![1]);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_compile_warning_reported_once() {
    let h = Harness::start(FakeApplier::new(), ReconcileSettings::default());

    h.send(added(
        IngressBuilder::new("secure")
            .rule("secure.media.com", "/", "app", 80)
            .tls(&["secure.media.com"], "absent")
            .build(),
    ))
    .await;
    advance(1).await;
    h.send(ingress("b", "b.media.com")).await;
    advance(1).await;

    assert_eq!(h.applier.applied(), vec![1, 2]);
    assert_eq!(h.sink.count("Warning"), 1);

    // the warning comes back once the problem reappears after a fix
    h.send(added(tls_secret(NAMESPACE, "absent"))).await;
    advance(1).await;
    h.send(deleted(ResourceKind::Secret, "absent")).await;
    advance(1).await;
    assert_eq!(h.sink.count("Warning"), 2);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_bad_record_key_is_reported_and_skipped() {
    let h = Harness::start(FakeApplier::new(), ReconcileSettings::default());

    h.send(added(records_configmap(
        NAMESPACE,
        "ats",
        &[("log.level", "1"), ("proxy.config.http.cache.http", "1")],
    )))
    .await;
    advance(1).await;

    assert_eq!(h.applier.applied(), vec![1]);
    let reasons: Vec<_> = h
        .sink
        .updates()
        .into_iter()
        .filter_map(|u| match u {
            StatusUpdate::Warning { reason, message, .. } => Some((reason, message)),
            _ => None,
        })
        .collect();
    assert_eq!(reasons.len(), 1);
    assert_eq!(reasons[0].0, "InvalidRecord");
    assert!(reasons[0].1.contains("data.log.level"));
    h.stop().await;
}
