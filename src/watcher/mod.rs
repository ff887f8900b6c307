//! Resource watcher: turns kube watch streams into [`ResourceEvent`]s.
//!
//! One task per [`ResourceKind`] runs a kube `watcher`. Each task feeds a
//! [`KindTracker`] that derives ADD/UPDATE/DELETE from resource versions and
//! diffs re-lists, so a restarted watch still reports objects deleted while
//! it was down. All tasks share one bounded channel; a full channel blocks
//! the tasks, which is the only backpressure in the pipeline.

pub mod event;
pub mod filter;
pub mod tracker;

use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use event::{EventType, Payload, ResourceEvent, ResourceKey, ResourceKind};
pub use filter::{FilterSettings, INGRESS_CLASS_ANNOTATION};
pub use tracker::KindTracker;

use crate::controller::backoff::Backoff;
use crate::crd::{CachingPolicy, SNIPolicy};
use crate::health::HealthState;
use crate::policy::validation::TLS_SECRET_TYPE;

/// A watch stream failed. The watch is restarted after a backoff.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("watch for {kind} interrupted: {message}")]
    Interrupted { kind: ResourceKind, message: String },
}

/// Where and what to watch.
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub filter: FilterSettings,
    /// Namespace the controller runs in; holds the records ConfigMap.
    pub controller_namespace: String,
    /// Name of the ConfigMap carrying `proxy.config.*` records.
    pub records_configmap: String,
    /// Capacity of the event queue.
    pub queue_capacity: usize,
    /// Delay schedule between watch restarts.
    pub restart_backoff: Backoff,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            filter: FilterSettings::default(),
            controller_namespace: "default".to_string(),
            records_configmap: "ats".to_string(),
            queue_capacity: 1024,
            restart_backoff: Backoff {
                max_attempts: 0,
                ..Backoff::default()
            },
        }
    }
}

/// Create a namespaced API when exactly one namespace is watched, else a
/// cluster-wide one.
fn scoped_api<K>(client: Client, filter: &FilterSettings) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match filter.namespaces.as_slice() {
        [only] => Api::namespaced(client, only),
        _ => Api::all(client),
    }
}

/// Watches every input kind and merges them into one event stream.
pub struct ResourceWatcher {
    client: Client,
    settings: Arc<WatcherSettings>,
    health: Arc<HealthState>,
    tasks: Vec<(ResourceKind, JoinHandle<()>)>,
}

impl ResourceWatcher {
    pub fn new(client: Client, settings: WatcherSettings, health: Arc<HealthState>) -> Self {
        Self {
            client,
            settings: Arc::new(settings),
            health,
            tasks: Vec::new(),
        }
    }

    /// Start one watch task per kind and return their merged events.
    ///
    /// The stream ends once every task has stopped, which only happens on
    /// cancellation or when the receiver is dropped.
    pub fn stream(&mut self, cancel: CancellationToken) -> ReceiverStream<ResourceEvent> {
        let (tx, rx) = mpsc::channel(self.settings.queue_capacity.max(1));
        for kind in ResourceKind::ALL {
            let handle = self.spawn_kind(kind, tx.clone(), cancel.clone());
            self.tasks.push((kind, handle));
        }
        ReceiverStream::new(rx)
    }

    /// Wait for every watch task to stop.
    pub async fn join(self) {
        join_watch_tasks(self.tasks).await;
    }

    fn spawn_kind(
        &self,
        kind: ResourceKind,
        tx: mpsc::Sender<ResourceEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let settings = self.settings.clone();
        let base = watcher::Config::default().any_semantic();
        let filter = Some(settings.filter.clone());
        let task = KindTask {
            kind,
            tx,
            cancel,
            health: self.health.clone(),
            backoff: settings.restart_backoff.clone(),
        };
        let client = self.client.clone();
        match kind {
            ResourceKind::Ingress => {
                let api = scoped_api::<Ingress>(client, &settings.filter);
                tokio::spawn(task.run(api, base, filter))
            }
            ResourceKind::CachingPolicy => {
                let api = scoped_api::<CachingPolicy>(client, &settings.filter);
                tokio::spawn(task.run(api, base, filter))
            }
            ResourceKind::SniPolicy => {
                let api = scoped_api::<SNIPolicy>(client, &settings.filter);
                tokio::spawn(task.run(api, base, filter))
            }
            ResourceKind::Secret => {
                let api = scoped_api::<Secret>(client, &settings.filter);
                let config = base.fields(&format!("type={TLS_SECRET_TYPE}"));
                tokio::spawn(task.run(api, config, filter))
            }
            ResourceKind::ConfigMap => {
                let api: Api<ConfigMap> =
                    Api::namespaced(client, &settings.controller_namespace);
                let config = base.fields(&format!("metadata.name={}", settings.records_configmap));
                // the records ConfigMap is ours; namespace filters do not apply
                tokio::spawn(task.run(api, config, None))
            }
        }
    }
}

/// State of one per-kind watch task.
struct KindTask {
    kind: ResourceKind,
    tx: mpsc::Sender<ResourceEvent>,
    cancel: CancellationToken,
    health: Arc<HealthState>,
    backoff: Backoff,
}

impl KindTask {
    async fn run<K>(self, api: Api<K>, config: watcher::Config, filter: Option<FilterSettings>)
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
        K: Into<Payload>,
    {
        let mut tracker = KindTracker::new(self.kind);
        let mut failures = 0u32;
        info!(kind = %self.kind, "Starting watch");

        loop {
            let mut stream = watcher(api.clone(), config.clone()).boxed();
            let error = loop {
                let next = tokio::select! {
                    _ = self.cancel.cancelled() => {
                        debug!(kind = %self.kind, "Watch cancelled");
                        return;
                    }
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(event)) => {
                        failures = 0;
                        for out in handle_event(&mut tracker, filter.as_ref(), event) {
                            if !self.emit(out).await {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };

            failures = failures.saturating_add(1);
            let err = WatchError::Interrupted {
                kind: self.kind,
                message: error,
            };
            self.health.metrics.record_watch_interruption(self.kind);
            let delay = self.backoff.delay(failures);
            warn!(
                kind = %self.kind,
                error = %err,
                attempt = failures,
                delay_ms = delay.as_millis(),
                "WatchInterrupted, restarting watch"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Send one event downstream. Returns false once the receiver is gone.
    async fn emit(&self, event: ResourceEvent) -> bool {
        debug!(key = %event.key, event = %event.event_type, "Emitting resource event");
        self.tx.send(event).await.is_ok()
    }
}

async fn join_watch_tasks(tasks: Vec<(ResourceKind, JoinHandle<()>)>) -> usize {
    let mut stopped = 0;
    for (kind, handle) in tasks {
        match handle.await {
            Ok(()) => stopped += 1,
            Err(e) => warn!(kind = %kind, error = %e, "Watch task failed"),
        }
    }
    stopped
}

/// Feed one raw watch event through the filter and tracker.
pub fn handle_event<K>(
    tracker: &mut KindTracker,
    filter: Option<&FilterSettings>,
    event: Event<K>,
) -> Vec<ResourceEvent>
where
    K: Into<Payload>,
{
    let admits = |payload: &Payload| filter.is_none_or(|f| f.admits(payload));
    match event {
        Event::Init => {
            tracker.begin_resync();
            Vec::new()
        }
        Event::InitApply(obj) => {
            let payload = obj.into();
            // objects outside the filter are left out of the listing and
            // therefore deleted if previously known
            if admits(&payload) {
                tracker.resync_item(payload).into_iter().collect()
            } else {
                Vec::new()
            }
        }
        Event::InitDone => tracker.finish_resync(),
        Event::Apply(obj) => {
            let payload = obj.into();
            if admits(&payload) {
                tracker.on_apply(payload).into_iter().collect()
            } else {
                tracker.on_delete(payload.key()).into_iter().collect()
            }
        }
        Event::Delete(obj) => {
            let payload: Payload = obj.into();
            tracker.on_delete(payload.key()).into_iter().collect()
        }
    }
}
