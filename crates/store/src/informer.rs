use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::StreamExt;
use kube::core::DynamicObject;
use metrics::counter;
use rustc_hash::FxHashMap;
use tether_core::{Backend, BackoffPolicy, Delta, DeltaKind, Gvk, LabelSelector, ListQuery, ObjectExt, ObjectKey};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Coalescer, Snapshot, SnapshotBuilder};

const FLUSH_EVERY: Duration = Duration::from_millis(8);
const RELIST_BACKOFF: BackoffPolicy =
    BackoffPolicy { first: Duration::from_millis(100), max: Duration::from_secs(30), factor: 2.0 };

/// List+watch read cache for one kind.
///
/// Readers go through [`Informer::get`]/[`Informer::current`] without locking. Every
/// published delta is re-broadcast to subscribers after the snapshot swap, so a
/// subscriber reacting to a delta always observes at least that state.
pub struct Informer {
    gvk: Gvk,
    query: ListQuery,
    backend: Arc<dyn Backend>,
    snap: ArcSwap<Snapshot>,
    epoch_tx: watch::Sender<u64>,
    events: broadcast::Sender<Delta>,
    tombstones: Mutex<FxHashMap<ObjectKey, Arc<DynamicObject>>>,
    keep_tombstones: AtomicBool,
}

impl Informer {
    pub fn new(backend: Arc<dyn Backend>, gvk: Gvk, query: ListQuery) -> Arc<Self> {
        let (epoch_tx, _) = watch::channel(0u64);
        let (events, _) = broadcast::channel(4096);
        Arc::new(Self {
            gvk,
            query,
            backend,
            snap: ArcSwap::from_pointee(Snapshot::default()),
            epoch_tx,
            events,
            tombstones: Mutex::new(FxHashMap::default()),
            keep_tombstones: AtomicBool::new(false),
        })
    }

    pub fn gvk(&self) -> &Gvk { &self.gvk }

    /// Subscribe before [`Informer::start`] to observe the initial list as deltas.
    pub fn subscribe(&self) -> broadcast::Receiver<Delta> { self.events.subscribe() }

    pub fn current(&self) -> Arc<Snapshot> { self.snap.load_full() }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<DynamicObject>> {
        self.snap.load().items.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<ObjectKey> { self.snap.load().items.keys().cloned().collect() }

    pub fn list(&self, selector: Option<&LabelSelector>) -> Vec<Arc<DynamicObject>> {
        self.snap
            .load()
            .items
            .values()
            .filter(|o| selector.map(|s| s.matches_opt(o.metadata.labels.as_ref())).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Remember deleted objects until [`Informer::forget_tombstone`]. Off by default: only
    /// kinds something dispatches (and so forgets) should keep them. Turning it off drops all.
    pub fn keep_tombstones(&self, keep: bool) {
        self.keep_tombstones.store(keep, Ordering::SeqCst);
        if !keep {
            self.tombstones().clear();
        }
    }

    pub fn tombstone_count(&self) -> usize { self.tombstones().len() }

    /// Last known state of an object deleted from the store, until forgotten.
    pub fn tombstone(&self, key: &ObjectKey) -> Option<Arc<DynamicObject>> {
        self.tombstones().get(key).cloned()
    }

    pub fn forget_tombstone(&self, key: &ObjectKey) { self.tombstones().remove(key); }

    pub fn is_synced(&self) -> bool { *self.epoch_tx.borrow() > 0 }

    /// Resolves once the first list has been published.
    pub async fn wait_synced(&self) {
        let mut rx = self.epoch_tx.subscribe();
        while *rx.borrow() == 0 {
            if rx.changed().await.is_err() { return; }
        }
    }

    pub fn start(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(token))
    }

    fn tombstones(&self) -> MutexGuard<'_, FxHashMap<ObjectKey, Arc<DynamicObject>>> {
        self.tombstones.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, builder: &mut SnapshotBuilder, batch: Vec<Delta>) {
        builder.apply(&batch);
        let next = builder.freeze();
        let epoch = next.epoch;
        self.snap.store(next);
        if self.keep_tombstones.load(Ordering::SeqCst) {
            let mut tombs = self.tombstones();
            for d in batch.iter() {
                let key = d.object.object_key();
                match d.kind {
                    DeltaKind::Deleted => { tombs.insert(key, Arc::new(d.object.clone())); }
                    DeltaKind::Applied => { tombs.remove(&key); }
                }
            }
        }
        self.epoch_tx.send_replace(epoch);
        counter!("informer_deltas_total", batch.len() as u64);
        for d in batch {
            let _ = self.events.send(d);
        }
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut builder = SnapshotBuilder::new();
        let mut attempt: u32 = 0;
        info!(gvk = %self.gvk, ns = ?self.query.namespace, "informer started");
        'relist: loop {
            if attempt > 0 {
                tokio::select! {
                    _ = token.cancelled() => break 'relist,
                    _ = tokio::time::sleep(RELIST_BACKOFF.after_failures(attempt)) => {}
                }
            }
            // Subscribe before listing so nothing between the two is missed.
            let mut stream = self.backend.watch(&self.gvk, &self.query);
            let listed = tokio::select! {
                _ = token.cancelled() => break 'relist,
                r = self.backend.list(&self.gvk, &self.query) => r,
            };
            match listed {
                Ok(items) => {
                    debug!(gvk = %self.gvk, count = items.len(), "informer listed");
                    let deltas = builder.replace_all(items);
                    self.publish(&mut builder, deltas);
                    attempt = 0;
                }
                Err(e) => {
                    warn!(gvk = %self.gvk, error = %e, "informer list failed; retrying");
                    attempt = attempt.saturating_add(1);
                    continue 'relist;
                }
            }

            let mut coalescer = Coalescer::default();
            let mut ticker = tokio::time::interval(FLUSH_EVERY);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        if !coalescer.is_empty() { self.publish(&mut builder, coalescer.drain_ready()); }
                        break 'relist;
                    }
                    next = stream.next() => match next {
                        Some(Ok(d)) => coalescer.push(d),
                        Some(Err(e)) => {
                            warn!(gvk = %self.gvk, error = %e, "watch error; relisting");
                            if !coalescer.is_empty() { self.publish(&mut builder, coalescer.drain_ready()); }
                            attempt = 1;
                            continue 'relist;
                        }
                        None => {
                            debug!(gvk = %self.gvk, "watch stream ended; relisting");
                            if !coalescer.is_empty() { self.publish(&mut builder, coalescer.drain_ready()); }
                            attempt = 1;
                            continue 'relist;
                        }
                    },
                    _ = ticker.tick() => {
                        if !coalescer.is_empty() { self.publish(&mut builder, coalescer.drain_ready()); }
                    }
                }
            }
        }
        info!(gvk = %self.gvk, "informer stopped");
    }
}
