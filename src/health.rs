//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (200 once a configuration has been applied)
//! - `/metrics` - Prometheus metrics endpoint

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

use crate::watcher::{EventType, ResourceKind};

/// Labels for per-kind metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct KindLabels {
    pub kind: String,
}

impl EncodeLabelSet for KindLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("kind", self.kind.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for watch event metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct EventLabels {
    pub kind: String,
    pub event: String,
}

impl EncodeLabelSet for EventLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("kind", self.kind.as_str()).encode(encoder.encode_label())?;
        ("event", self.event.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for per-target metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct TargetLabels {
    pub target: String,
}

impl EncodeLabelSet for TargetLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("target", self.target.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for apply outcome metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ApplyLabels {
    pub target: String,
    pub result: String,
}

impl EncodeLabelSet for ApplyLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("target", self.target.as_str()).encode(encoder.encode_label())?;
        ("result", self.result.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for the controller
pub struct Metrics {
    /// Watch events by kind and type
    pub events_total: Family<EventLabels, Counter>,
    /// Objects rejected by validation
    pub validation_errors_total: Family<KindLabels, Counter>,
    /// Precedence conflicts detected
    pub conflicts_total: Counter,
    /// Watch streams that errored and were restarted
    pub watch_interruptions_total: Family<KindLabels, Counter>,
    /// Snapshots with a new generation
    pub snapshots_compiled_total: Counter,
    /// Apply attempts by outcome
    pub applies_total: Family<ApplyLabels, Counter>,
    /// Time taken by the proxy reload
    pub reload_duration_seconds: Family<TargetLabels, Histogram>,
    /// Generation currently applied per target
    pub applied_generation: Family<TargetLabels, Gauge>,
    /// Active objects by kind
    pub active_resources: Family<KindLabels, Gauge>,
    /// Status updates dropped on a full queue
    pub status_dropped_total: Counter,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let events_total = Family::<EventLabels, Counter>::default();
        registry.register(
            "ats_ingress_events",
            "Watch events received by kind and type",
            events_total.clone(),
        );

        let validation_errors_total = Family::<KindLabels, Counter>::default();
        registry.register(
            "ats_ingress_validation_errors",
            "Objects rejected by validation",
            validation_errors_total.clone(),
        );

        let conflicts_total = Counter::default();
        registry.register(
            "ats_ingress_conflicts",
            "Precedence conflicts between objects",
            conflicts_total.clone(),
        );

        let watch_interruptions_total = Family::<KindLabels, Counter>::default();
        registry.register(
            "ats_ingress_watch_interruptions",
            "Watch streams interrupted and restarted",
            watch_interruptions_total.clone(),
        );

        let snapshots_compiled_total = Counter::default();
        registry.register(
            "ats_ingress_snapshots_compiled",
            "Snapshots compiled with a new generation",
            snapshots_compiled_total.clone(),
        );

        let applies_total = Family::<ApplyLabels, Counter>::default();
        registry.register(
            "ats_ingress_applies",
            "Apply attempts by target and result",
            applies_total.clone(),
        );

        let reload_duration_seconds =
            Family::<TargetLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.005, 2.0, 12))
            });
        registry.register(
            "ats_ingress_reload_duration_seconds",
            "Duration of proxy configuration reloads in seconds",
            reload_duration_seconds.clone(),
        );

        let applied_generation = Family::<TargetLabels, Gauge>::default();
        registry.register(
            "ats_ingress_applied_generation",
            "Snapshot generation currently applied to each target",
            applied_generation.clone(),
        );

        let active_resources = Family::<KindLabels, Gauge>::default();
        registry.register(
            "ats_ingress_active_resources",
            "Validated objects in the active set by kind",
            active_resources.clone(),
        );

        let status_dropped_total = Counter::default();
        registry.register(
            "ats_ingress_status_dropped",
            "Status updates dropped because the status queue was full",
            status_dropped_total.clone(),
        );

        Self {
            events_total,
            validation_errors_total,
            conflicts_total,
            watch_interruptions_total,
            snapshots_compiled_total,
            applies_total,
            reload_duration_seconds,
            applied_generation,
            active_resources,
            status_dropped_total,
            registry,
        }
    }

    fn kind_labels(kind: ResourceKind) -> KindLabels {
        KindLabels {
            kind: kind.as_str().to_string(),
        }
    }

    pub fn record_event(&self, kind: ResourceKind, event: EventType) {
        let labels = EventLabels {
            kind: kind.as_str().to_string(),
            event: event.to_string(),
        };
        self.events_total.get_or_create(&labels).inc();
    }

    pub fn record_validation_error(&self, kind: ResourceKind) {
        self.validation_errors_total
            .get_or_create(&Self::kind_labels(kind))
            .inc();
    }

    pub fn record_watch_interruption(&self, kind: ResourceKind) {
        self.watch_interruptions_total
            .get_or_create(&Self::kind_labels(kind))
            .inc();
    }

    pub fn set_active_resources(&self, kind: ResourceKind, count: usize) {
        self.active_resources
            .get_or_create(&Self::kind_labels(kind))
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Record one apply attempt
    pub fn record_apply(&self, target: &str, result: &str) {
        let labels = ApplyLabels {
            target: target.to_string(),
            result: result.to_string(),
        };
        self.applies_total.get_or_create(&labels).inc();
    }

    /// Record a successful apply and the reload latency, if a reload happened
    pub fn record_applied(&self, target: &str, generation: u64, reload_secs: Option<f64>) {
        let labels = TargetLabels {
            target: target.to_string(),
        };
        self.applied_generation
            .get_or_create(&labels)
            .set(i64::try_from(generation).unwrap_or(i64::MAX));
        if let Some(secs) = reload_secs {
            self.reload_duration_seconds
                .get_or_create(&labels)
                .observe(secs);
        }
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether a configuration has been applied to the proxy
    ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Last successful apply (Unix epoch seconds)
    pub last_applied: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_applied: AtomicU64::new(0),
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    /// Stamp the last successful apply with the current time
    pub fn touch_applied(&self) {
        let now = jiff::Timestamp::now().as_second();
        self.last_applied
            .store(u64::try_from(now).unwrap_or(0), Ordering::Relaxed);
    }
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 until the first configuration reached the proxy.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the health server on `addr`
pub async fn run_health_server(
    state: Arc<HealthState>,
    addr: SocketAddr,
) -> Result<(), std::io::Error> {
    let app = create_router(state);

    info!(%addr, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
