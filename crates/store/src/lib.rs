//! Tether store: in-memory backend plus the watch-fed read cache (informer).
//!
//! The informer follows a coalesce-then-swap ingest model: watch deltas are coalesced
//! per key and published in small batches as immutable snapshots behind an `ArcSwap`,
//! so readers never take a lock.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use kube::core::DynamicObject;
use rustc_hash::{FxHashMap, FxHashSet};
use tether_core::{Delta, DeltaKind, ObjectExt, ObjectKey};

mod informer;
mod memory;

pub use informer::Informer;
pub use memory::MemoryStore;

/// Coalescing queue keyed by object key with FIFO order of first appearance.
#[derive(Default)]
pub struct Coalescer {
    map: FxHashMap<ObjectKey, Delta>,
    order: VecDeque<ObjectKey>,
}

impl Coalescer {
    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    pub fn push(&mut self, d: Delta) {
        let key = d.object.object_key();
        if !self.map.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.map.insert(key, d);
    }

    /// Drain all currently coalesced deltas.
    pub fn drain_ready(&mut self) -> Vec<Delta> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&key) {
                out.push(d);
            }
        }
        out
    }
}

/// Immutable view of one kind's cached objects.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub epoch: u64,
    pub items: FxHashMap<ObjectKey, Arc<DynamicObject>>,
}

/// Builds snapshots from deltas.
#[derive(Default)]
pub struct SnapshotBuilder {
    epoch: u64,
    items: FxHashMap<ObjectKey, Arc<DynamicObject>>,
}

impl SnapshotBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn epoch(&self) -> u64 { self.epoch }

    pub fn apply(&mut self, batch: &[Delta]) {
        for d in batch {
            let key = d.object.object_key();
            match d.kind {
                DeltaKind::Applied => { self.items.insert(key, Arc::new(d.object.clone())); }
                DeltaKind::Deleted => { self.items.remove(&key); }
            }
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    /// Deltas that turn the current items into exactly `listed`: every listed object is
    /// re-applied and anything missing from the list is reported deleted.
    pub fn replace_all(&self, listed: Vec<DynamicObject>) -> Vec<Delta> {
        let mut seen: FxHashSet<ObjectKey> = FxHashSet::default();
        let mut out = Vec::with_capacity(listed.len());
        for o in listed {
            seen.insert(o.object_key());
            out.push(Delta::applied(o));
        }
        for (key, o) in self.items.iter() {
            if !seen.contains(key) {
                out.push(Delta::deleted((**o).clone()));
            }
        }
        out
    }

    pub fn freeze(&self) -> Arc<Snapshot> {
        Arc::new(Snapshot { epoch: self.epoch, items: self.items.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{new_object, Gvk};

    fn cm(name: &str, v: &str) -> DynamicObject {
        new_object(&Gvk::new("", "v1", "ConfigMap"), Some("ns"), name, serde_json::json!({"data": {"v": v}}))
    }

    #[test]
    fn coalescer_keeps_latest_per_key_in_first_seen_order() {
        let mut c = Coalescer::default();
        c.push(Delta::applied(cm("a", "1")));
        c.push(Delta::applied(cm("b", "1")));
        c.push(Delta::applied(cm("a", "2")));
        c.push(Delta::deleted(cm("b", "1")));
        assert_eq!(c.len(), 2);
        let out = c.drain_ready();
        assert_eq!(out[0].object.metadata.name.as_deref(), Some("a"));
        assert_eq!(out[0].object.data["data"]["v"], "2");
        assert_eq!(out[1].kind, DeltaKind::Deleted);
        assert!(c.is_empty());
    }

    #[test]
    fn builder_replays_and_relists() {
        let mut b = SnapshotBuilder::new();
        b.apply(&[Delta::applied(cm("a", "1")), Delta::applied(cm("b", "1"))]);
        b.apply(&[Delta::deleted(cm("a", "1"))]);
        let snap = b.freeze();
        assert_eq!(snap.epoch, 2);
        assert_eq!(snap.items.len(), 1);

        let deltas = b.replace_all(vec![cm("c", "1")]);
        assert_eq!(deltas.len(), 2);
        assert!(deltas.iter().any(|d| d.kind == DeltaKind::Deleted && d.object.metadata.name.as_deref() == Some("b")));
        b.apply(&deltas);
        let snap = b.freeze();
        assert_eq!(snap.items.len(), 1);
        assert!(snap.items.contains_key(&ObjectKey::namespaced("ns", "c")));
    }
}
