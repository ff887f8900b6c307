//! The validator's working set and the immutable sets it hands out.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::{
    CachePolicy, IngressRoutes, RecordOverrides, ResourceRef, SniPolicySet, TlsBundle,
    ValidationError, validate_caching_policy, validate_ingress, validate_records,
    validate_sni_policy, validate_tls_secret,
};
use crate::watcher::{Payload, ResourceEvent, ResourceKey, ResourceKind};

/// Everything the compiler needs, frozen at one point in time.
///
/// Built by [`WorkingSet::snapshot`]; never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct ActiveResourceSet {
    /// Bumped by the working set on every change to active content.
    pub revision: u64,
    pub ingresses: BTreeMap<ResourceKey, Arc<IngressRoutes>>,
    pub caching: BTreeMap<ResourceKey, Arc<CachePolicy>>,
    pub sni: BTreeMap<ResourceKey, Arc<SniPolicySet>>,
    pub secrets: BTreeMap<ResourceKey, Arc<TlsBundle>>,
    pub records: Option<Arc<RecordOverrides>>,
}

impl ActiveResourceSet {
    /// All contributing resources, in key order.
    pub fn resources(&self) -> Vec<ResourceRef> {
        let mut refs: Vec<ResourceRef> = self
            .ingresses
            .values()
            .map(|r| ResourceRef::from(&r.origin))
            .chain(self.caching.values().map(|p| ResourceRef::from(&p.origin)))
            .chain(self.sni.values().map(|p| ResourceRef::from(&p.origin)))
            .chain(self.secrets.values().map(|s| ResourceRef::from(&s.origin)))
            .chain(self.records.iter().map(|r| ResourceRef::from(&r.origin)))
            .collect();
        refs.sort();
        refs
    }

    /// Number of active objects of a kind.
    pub fn count(&self, kind: ResourceKind) -> usize {
        match kind {
            ResourceKind::Ingress => self.ingresses.len(),
            ResourceKind::CachingPolicy => self.caching.len(),
            ResourceKind::SniPolicy => self.sni.len(),
            ResourceKind::Secret => self.secrets.len(),
            ResourceKind::ConfigMap => usize::from(self.records.is_some()),
        }
    }
}

/// Result of feeding one event into the working set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The object is valid and now part of the active set.
    Accepted,
    /// The object is invalid and excluded until corrected.
    Rejected(ValidationError),
    /// The object was deleted and left the active set.
    Removed,
    /// Nothing in the active set changed.
    Unchanged,
}

/// Validated objects keyed by [`ResourceKey`].
#[derive(Debug, Default)]
pub struct WorkingSet {
    active: ActiveResourceSet,
    rejected: BTreeMap<ResourceKey, ValidationError>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revision(&self) -> u64 {
        self.active.revision
    }

    /// Objects currently excluded because they failed validation.
    pub fn rejected(&self) -> impl Iterator<Item = &ValidationError> {
        self.rejected.values()
    }

    /// Whether a key is currently part of the active set.
    pub fn is_active(&self, key: &ResourceKey) -> bool {
        match key.kind {
            ResourceKind::Ingress => self.active.ingresses.contains_key(key),
            ResourceKind::CachingPolicy => self.active.caching.contains_key(key),
            ResourceKind::SniPolicy => self.active.sni.contains_key(key),
            ResourceKind::Secret => self.active.secrets.contains_key(key),
            ResourceKind::ConfigMap => self
                .active
                .records
                .as_ref()
                .is_some_and(|r| &r.origin.key == key),
        }
    }

    /// Validate and admit one event.
    pub fn apply(&mut self, event: &ResourceEvent) -> Admission {
        let Some(payload) = event.payload.as_ref() else {
            self.rejected.remove(&event.key);
            return if self.remove(&event.key) {
                self.active.revision += 1;
                debug!(key = %event.key, "Removed from working set");
                Admission::Removed
            } else {
                Admission::Unchanged
            };
        };

        match self.admit(payload) {
            Ok(true) => {
                self.rejected.remove(&event.key);
                self.active.revision += 1;
                Admission::Accepted
            }
            // a status write or a resync bumps resourceVersion without
            // touching the validated content
            Ok(false) => Admission::Unchanged,
            Err(err) => {
                let removed = self.remove(&event.key);
                if removed {
                    self.active.revision += 1;
                }
                if !removed && self.rejected.get(&event.key) == Some(&err) {
                    return Admission::Unchanged;
                }
                self.rejected.insert(event.key.clone(), err.clone());
                Admission::Rejected(err)
            }
        }
    }

    /// Validate a payload and store it. Returns whether the stored content
    /// changed.
    fn admit(&mut self, payload: &Payload) -> Result<bool, ValidationError> {
        let changed = match payload {
            Payload::Ingress(obj) => {
                let routes = validate_ingress(obj)?;
                upsert(&mut self.active.ingresses, routes.origin.key.clone(), routes)
            }
            Payload::CachingPolicy(obj) => {
                let policy = validate_caching_policy(obj)?;
                upsert(&mut self.active.caching, policy.origin.key.clone(), policy)
            }
            Payload::SniPolicy(obj) => {
                let policy = validate_sni_policy(obj)?;
                upsert(&mut self.active.sni, policy.origin.key.clone(), policy)
            }
            Payload::Secret(obj) => {
                let bundle = validate_tls_secret(obj)?;
                upsert(&mut self.active.secrets, bundle.origin.key.clone(), bundle)
            }
            Payload::ConfigMap(obj) => {
                let records = validate_records(obj)?;
                if self.active.records.as_deref() == Some(&records) {
                    false
                } else {
                    self.active.records = Some(Arc::new(records));
                    true
                }
            }
        };
        Ok(changed)
    }

    /// The active records ConfigMap, if any.
    pub fn records(&self) -> Option<&RecordOverrides> {
        self.active.records.as_deref()
    }

    fn remove(&mut self, key: &ResourceKey) -> bool {
        match key.kind {
            ResourceKind::Ingress => self.active.ingresses.remove(key).is_some(),
            ResourceKind::CachingPolicy => self.active.caching.remove(key).is_some(),
            ResourceKind::SniPolicy => self.active.sni.remove(key).is_some(),
            ResourceKind::Secret => self.active.secrets.remove(key).is_some(),
            ResourceKind::ConfigMap => {
                let present = self
                    .active
                    .records
                    .as_ref()
                    .is_some_and(|r| &r.origin.key == key);
                if present {
                    self.active.records = None;
                }
                present
            }
        }
    }

    /// Freeze the current active content.
    pub fn snapshot(&self) -> ActiveResourceSet {
        self.active.clone()
    }
}

/// Insert `value` unless an equal value is already stored under `key`.
fn upsert<T: PartialEq>(map: &mut BTreeMap<ResourceKey, Arc<T>>, key: ResourceKey, value: T) -> bool {
    if map.get(&key).is_some_and(|current| **current == value) {
        return false;
    }
    map.insert(key, Arc::new(value));
    true
}
