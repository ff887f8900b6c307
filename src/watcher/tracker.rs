//! Per-kind bookkeeping that turns raw watch events into ADD/UPDATE/DELETE.

use std::collections::BTreeMap;

use super::event::{EventType, Payload, ResourceEvent, ResourceKey, ResourceKind};

/// Remembers the last seen `resourceVersion` of every known object of one
/// kind.
///
/// A re-list (after a watch restart or a desync) is buffered between
/// [`begin_resync`](Self::begin_resync) and
/// [`finish_resync`](Self::finish_resync) and diffed against the known
/// keys, so objects deleted while the watch was down still produce DELETE.
#[derive(Debug)]
pub struct KindTracker {
    kind: ResourceKind,
    known: BTreeMap<ResourceKey, Option<String>>,
    listing: Option<BTreeMap<ResourceKey, Payload>>,
}

impl KindTracker {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            known: BTreeMap::new(),
            listing: None,
        }
    }

    /// An object was created or modified.
    pub fn on_apply(&mut self, payload: Payload) -> Option<ResourceEvent> {
        debug_assert_eq!(payload.kind(), self.kind);
        let key = payload.key();
        let version = payload.resource_version();
        let event_type = match self.known.get(&key) {
            None => EventType::Add,
            Some(previous) if version.is_some() && previous == &version => return None,
            Some(_) => EventType::Update,
        };
        self.known.insert(key, version);
        Some(ResourceEvent::upsert(event_type, payload))
    }

    /// An object was deleted. Unknown keys produce nothing.
    pub fn on_delete(&mut self, key: ResourceKey) -> Option<ResourceEvent> {
        self.known
            .remove(&key)
            .map(|_| ResourceEvent::delete(key))
    }

    /// Start buffering a re-list.
    pub fn begin_resync(&mut self) {
        self.listing = Some(BTreeMap::new());
    }

    /// Buffer one listed object. Outside a resync this behaves like
    /// [`on_apply`](Self::on_apply).
    pub fn resync_item(&mut self, payload: Payload) -> Option<ResourceEvent> {
        match self.listing.as_mut() {
            Some(listing) => {
                listing.insert(payload.key(), payload);
                None
            }
            None => self.on_apply(payload),
        }
    }

    /// Diff the buffered listing against known state.
    ///
    /// Listed keys are emitted as ADD or UPDATE through the same rules as
    /// [`on_apply`](Self::on_apply); known keys missing from the listing
    /// are emitted as DELETE.
    pub fn finish_resync(&mut self) -> Vec<ResourceEvent> {
        let Some(listing) = self.listing.take() else {
            return Vec::new();
        };
        let vanished: Vec<ResourceKey> = self
            .known
            .keys()
            .filter(|key| !listing.contains_key(key))
            .cloned()
            .collect();

        let mut events: Vec<ResourceEvent> = vanished
            .into_iter()
            .filter_map(|key| self.on_delete(key))
            .collect();
        events.extend(listing.into_values().filter_map(|p| self.on_apply(p)));
        events
    }
}
