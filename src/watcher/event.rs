//! Normalised change events emitted by the resource watcher.

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;

use crate::crd::{CachingPolicy, SNIPolicy};

/// Kinds of cluster objects the controller consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Ingress,
    CachingPolicy,
    SniPolicy,
    Secret,
    ConfigMap,
}

impl ResourceKind {
    /// Every kind, in a stable order.
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Ingress,
        ResourceKind::CachingPolicy,
        ResourceKind::SniPolicy,
        ResourceKind::Secret,
        ResourceKind::ConfigMap,
    ];

    /// Kubernetes `kind` string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Ingress => "Ingress",
            ResourceKind::CachingPolicy => "CachingPolicy",
            ResourceKind::SniPolicy => "SNIPolicy",
            ResourceKind::Secret => "Secret",
            ResourceKind::ConfigMap => "ConfigMap",
        }
    }

    /// Kubernetes `apiVersion` string.
    pub fn api_version(&self) -> &'static str {
        match self {
            ResourceKind::Ingress => "networking.k8s.io/v1",
            ResourceKind::CachingPolicy | ResourceKind::SniPolicy => {
                "k8s.trafficserver.apache.com/v1alpha1"
            }
            ResourceKind::Secret | ResourceKind::ConfigMap => "v1",
        }
    }

    /// Whether status is written to a status subresource rather than Events.
    pub fn has_status_subresource(&self) -> bool {
        matches!(self, ResourceKind::CachingPolicy | ResourceKind::SniPolicy)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identity of a watched object.
///
/// Ordering is (kind, namespace, name) so maps keyed by it iterate
/// deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// `namespace/name`, used for tie-breaks and file names.
    pub fn namespaced_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// What happened to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Add,
    Update,
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Add => write!(f, "ADD"),
            EventType::Update => write!(f, "UPDATE"),
            EventType::Delete => write!(f, "DELETE"),
        }
    }
}

/// The object carried by an ADD or UPDATE event.
#[derive(Debug, Clone)]
pub enum Payload {
    Ingress(Arc<Ingress>),
    CachingPolicy(Arc<CachingPolicy>),
    SniPolicy(Arc<SNIPolicy>),
    Secret(Arc<Secret>),
    ConfigMap(Arc<ConfigMap>),
}

impl Payload {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Payload::Ingress(_) => ResourceKind::Ingress,
            Payload::CachingPolicy(_) => ResourceKind::CachingPolicy,
            Payload::SniPolicy(_) => ResourceKind::SniPolicy,
            Payload::Secret(_) => ResourceKind::Secret,
            Payload::ConfigMap(_) => ResourceKind::ConfigMap,
        }
    }

    /// Identity of the carried object.
    pub fn key(&self) -> ResourceKey {
        let (ns, name) = match self {
            Payload::Ingress(o) => (o.namespace(), o.name_any()),
            Payload::CachingPolicy(o) => (o.namespace(), o.name_any()),
            Payload::SniPolicy(o) => (o.namespace(), o.name_any()),
            Payload::Secret(o) => (o.namespace(), o.name_any()),
            Payload::ConfigMap(o) => (o.namespace(), o.name_any()),
        };
        ResourceKey::new(self.kind(), ns.unwrap_or_default(), name)
    }

    /// `metadata.generation`, which core kinds like Secret do not set.
    pub fn generation(&self) -> Option<i64> {
        match self {
            Payload::Ingress(o) => o.metadata.generation,
            Payload::CachingPolicy(o) => o.metadata.generation,
            Payload::SniPolicy(o) => o.metadata.generation,
            Payload::Secret(o) => o.metadata.generation,
            Payload::ConfigMap(o) => o.metadata.generation,
        }
    }

    pub fn resource_version(&self) -> Option<String> {
        match self {
            Payload::Ingress(o) => o.resource_version(),
            Payload::CachingPolicy(o) => o.resource_version(),
            Payload::SniPolicy(o) => o.resource_version(),
            Payload::Secret(o) => o.resource_version(),
            Payload::ConfigMap(o) => o.resource_version(),
        }
    }
}

impl From<Ingress> for Payload {
    fn from(o: Ingress) -> Self {
        Payload::Ingress(Arc::new(o))
    }
}

impl From<CachingPolicy> for Payload {
    fn from(o: CachingPolicy) -> Self {
        Payload::CachingPolicy(Arc::new(o))
    }
}

impl From<SNIPolicy> for Payload {
    fn from(o: SNIPolicy) -> Self {
        Payload::SniPolicy(Arc::new(o))
    }
}

impl From<Secret> for Payload {
    fn from(o: Secret) -> Self {
        Payload::Secret(Arc::new(o))
    }
}

impl From<ConfigMap> for Payload {
    fn from(o: ConfigMap) -> Self {
        Payload::ConfigMap(Arc::new(o))
    }
}

/// A normalised change to one watched object.
#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub kind: ResourceKind,
    pub key: ResourceKey,
    /// `None` for DELETE.
    pub payload: Option<Payload>,
    pub event_type: EventType,
}

impl ResourceEvent {
    /// ADD or UPDATE event for an object.
    pub fn upsert(event_type: EventType, payload: impl Into<Payload>) -> Self {
        let payload = payload.into();
        let key = payload.key();
        Self {
            kind: key.kind,
            key,
            payload: Some(payload),
            event_type,
        }
    }

    /// Tombstone for an object that no longer exists (or no longer matches filters).
    pub fn delete(key: ResourceKey) -> Self {
        Self {
            kind: key.kind,
            key,
            payload: None,
            event_type: EventType::Delete,
        }
    }
}
