//! Shared context for status reporting.
//!
//! Holds the Kubernetes client and the event reporter identity used for
//! status patches and Kubernetes Events.

use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};

use crate::health::HealthState;
use crate::watcher::ResourceKey;

/// Field manager name for status patches
pub const FIELD_MANAGER: &str = "ats-ingress";

/// Reference to the object a [`ResourceKey`] names, for event recording.
pub fn object_ref(key: &ResourceKey) -> ObjectReference {
    ObjectReference {
        api_version: Some(key.kind.api_version().to_string()),
        kind: Some(key.kind.as_str().to_string()),
        namespace: Some(key.namespace.clone()),
        name: Some(key.name.clone()),
        ..Default::default()
    }
}

/// Shared context for the status reporter
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Event reporter identity
    reporter: Reporter,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client, health_state: Option<Arc<HealthState>>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            health_state,
        }
    }

    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    async fn publish(
        &self,
        key: &ResourceKey,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = self.recorder();
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref(key),
            )
            .await
        {
            tracing::warn!(%key, reason = %reason, error = %e, "Failed to publish event");
        }
    }

    /// Publish a normal event for a resource
    pub async fn publish_normal_event(
        &self,
        key: &ResourceKey,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish(key, EventType::Normal, reason, action, note)
            .await;
    }

    /// Publish a warning event for a resource
    pub async fn publish_warning_event(
        &self,
        key: &ResourceKey,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish(key, EventType::Warning, reason, action, note)
            .await;
    }
}
