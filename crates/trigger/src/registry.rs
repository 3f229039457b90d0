//! Sharded map of per-key trigger state: pending delays, merged origins and failure counts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use rustc_hash::FxHashMap;
use tether_core::ObjectId;

use crate::Origin;

const SHARDS: usize = 32;

#[derive(Debug, Clone, Copy)]
struct Delayed {
    due: Instant,
    generation: u64,
    origin: Origin,
}

#[derive(Debug, Default)]
struct Entry {
    delayed: Option<Delayed>,
    origin: Origin,
    failures: u32,
    last_error: Option<String>,
}

impl Entry {
    fn is_idle(&self) -> bool {
        self.delayed.is_none() && self.origin.is_empty() && self.failures == 0
    }
}

/// Registry view of one key, see [`TriggerRegistry::snapshot`].
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub id: ObjectId,
    pub due: Option<Instant>,
    pub failures: u32,
    pub last_error: Option<String>,
}

pub struct TriggerRegistry {
    shards: Box<[Mutex<FxHashMap<ObjectId, Entry>>]>,
    generation: AtomicU64,
}

impl Default for TriggerRegistry {
    fn default() -> Self { Self::new() }
}

impl TriggerRegistry {
    pub fn new() -> Self {
        let shards = (0..SHARDS).map(|_| Mutex::new(FxHashMap::default())).collect::<Vec<_>>();
        Self { shards: shards.into_boxed_slice(), generation: AtomicU64::new(0) }
    }

    fn shard(&self, id: &ObjectId) -> MutexGuard<'_, FxHashMap<ObjectId, Entry>> {
        let idx = (id.fnv() % self.shards.len() as u64) as usize;
        self.shards[idx].lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update<R>(&self, id: &ObjectId, f: impl FnOnce(&mut Entry) -> R) -> R {
        let mut shard = self.shard(id);
        let entry = shard.entry(id.clone()).or_default();
        let out = f(entry);
        if entry.is_idle() {
            shard.remove(id);
        }
        out
    }

    /// Record the origin of an immediate trigger and supersede any pending delayed one.
    pub fn note_immediate(&self, id: &ObjectId, origin: Origin) {
        self.update(id, |e| {
            e.delayed = None;
            e.origin = e.origin.merge(origin);
        })
    }

    /// Replace any pending delayed trigger; returns the generation the timer must present.
    pub fn set_delayed(&self, id: &ObjectId, due: Instant, origin: Origin) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.update(id, |e| e.delayed = Some(Delayed { due, generation, origin }));
        generation
    }

    /// Claim a delayed trigger when its timer fires. `None` when it was superseded.
    pub fn fire_delayed(&self, id: &ObjectId, generation: u64) -> Option<Origin> {
        self.update(id, |e| match e.delayed {
            Some(d) if d.generation == generation => {
                e.delayed = None;
                e.origin = e.origin.merge(d.origin);
                Some(d.origin)
            }
            _ => None,
        })
    }

    /// Take the merged origin of everything that triggered `id` since it was last pulled.
    pub fn take_origin(&self, id: &ObjectId) -> Origin {
        self.update(id, |e| std::mem::take(&mut e.origin))
    }

    /// Count one more consecutive failure and return the new count.
    pub fn record_failure(&self, id: &ObjectId, error: String) -> u32 {
        self.update(id, |e| {
            e.failures = e.failures.saturating_add(1);
            e.last_error = Some(error);
            e.failures
        })
    }

    pub fn forget_failures(&self, id: &ObjectId) {
        self.update(id, |e| {
            e.failures = 0;
            e.last_error = None;
        })
    }

    pub fn failures(&self, id: &ObjectId) -> u32 {
        self.shard(id).get(id).map(|e| e.failures).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).len()).sum()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.lock().unwrap_or_else(|e| e.into_inner());
            out.extend(shard.iter().map(|(id, e)| RegistryEntry {
                id: id.clone(),
                due: e.delayed.map(|d| d.due),
                failures: e.failures,
                last_error: e.last_error.clone(),
            }));
        }
        out
    }
}
