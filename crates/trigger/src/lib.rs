//! Tether trigger: the trigger registry and the per-kind worker scheduler.
//!
//! Keys are routed to a lazily created pool for their kind, hashed onto one of the
//! pool's queue shards, and pulled by `workers` tasks per shard, each running up to
//! `threadiness` dispatches concurrently. A key is never dispatched twice at the same
//! time. Failed or panicking dispatches are requeued with exponential backoff.

#![forbid(unsafe_code)]

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures::FutureExt;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tether_core::{Gvk, ModuloKeyPlanner, ObjectId, ShardPlanner};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod queue;
mod registry;

pub use queue::{QueueSnapshot, WorkQueue};
pub use tether_core::BackoffPolicy;
pub use registry::{RegistryEntry, TriggerRegistry};

/// Why a key was queued. Coalesced triggers merge their origins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Origin(u8);

impl Origin {
    pub const WATCH: Origin = Origin(1);
    pub const TRIGGER: Origin = Origin(2);
    pub const RESYNC: Origin = Origin(4);

    pub fn merge(self, other: Origin) -> Origin { Origin(self.0 | other.0) }
    pub fn contains(self, other: Origin) -> bool { self.0 & other.0 == other.0 && other.0 != 0 }
    pub fn is_empty(self) -> bool { self.0 == 0 }

    /// True when nothing from a store watch contributed to this work item.
    pub fn is_synthetic(self) -> bool { !self.is_empty() && !self.contains(Origin::WATCH) }
}

/// One unit of work handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: ObjectId,
    pub origin: Origin,
}

/// Result of a successful dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    pub requeue_after: Option<Duration>,
}

impl Outcome {
    pub fn done() -> Self { Self::default() }
    pub fn requeue_after(d: Duration) -> Self { Self { requeue_after: Some(d) } }
}

/// The pipeline invoked for each pulled key.
#[async_trait::async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, item: WorkItem, ctx: CancellationToken) -> anyhow::Result<Outcome>;
}

/// Pool shape for one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Puller tasks per shard.
    pub workers: usize,
    /// Concurrent dispatches per puller.
    pub threadiness: usize,
    /// Independent queues; a key always lands on the same one.
    pub shards: usize,
}

impl Default for PoolConfig {
    fn default() -> Self { Self { workers: 1, threadiness: 4, shards: 1 } }
}

impl PoolConfig {
    fn normalized(self) -> Self {
        Self { workers: self.workers.max(1), threadiness: self.threadiness.max(1), shards: self.shards.max(1) }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    pub defaults: PoolConfig,
    pub kinds: FxHashMap<Gvk, PoolConfig>,
    pub backoff: BackoffPolicy,
}

impl SchedulerConfig {
    pub fn pool_for(&self, gvk: &Gvk) -> PoolConfig {
        self.kinds.get(gvk).copied().unwrap_or(self.defaults).normalized()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    InFlight,
    Queued,
    Delayed { due_in_ms: u64 },
    /// Tracked only for its failure count.
    Idle,
}

/// Debug view of one key known to the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerEntry {
    pub gvk: String,
    pub namespace: Option<String>,
    pub name: String,
    pub state: TriggerState,
    pub failures: u32,
    pub last_error: Option<String>,
}

struct KindPool {
    gvk: Gvk,
    config: PoolConfig,
    planner: ModuloKeyPlanner,
    queues: Box<[WorkQueue]>,
}

impl KindPool {
    fn new(gvk: Gvk, config: PoolConfig) -> Self {
        let queues = (0..config.shards).map(|_| WorkQueue::new()).collect::<Vec<_>>();
        Self { gvk, config, planner: ModuloKeyPlanner::new(config.shards), queues: queues.into_boxed_slice() }
    }

    fn queue(&self, id: &ObjectId) -> &WorkQueue { &self.queues[self.planner.plan(id)] }
}

struct Inner {
    dispatch: Arc<dyn Dispatch>,
    config: SchedulerConfig,
    registry: TriggerRegistry,
    pools: ArcSwap<FxHashMap<Gvk, Arc<KindPool>>>,
    create_lock: Mutex<()>,
    started: AtomicBool,
    token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap, cloneable handle to the scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(dispatch: Arc<dyn Dispatch>, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatch,
                config,
                registry: TriggerRegistry::new(),
                pools: ArcSwap::from_pointee(FxHashMap::default()),
                create_lock: Mutex::new(()),
                started: AtomicBool::new(false),
                token: CancellationToken::new(),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Begin pulling. Keys triggered before this stay queued until now.
    pub fn start(&self) {
        let _guard = self.inner.create_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let pools = self.inner.pools.load_full();
        info!(kinds = pools.len(), "scheduler started");
        for pool in pools.values() {
            self.inner.spawn_workers(pool);
        }
    }

    pub fn is_started(&self) -> bool { self.inner.started.load(Ordering::SeqCst) }

    /// Schedule `id`. A zero delay queues immediately; otherwise the key is queued
    /// once `delay` elapses unless a later trigger replaces the pending one.
    pub fn trigger(&self, id: ObjectId, delay: Duration, origin: Origin) {
        self.inner.trigger(id, delay, origin)
    }

    pub fn failures(&self, id: &ObjectId) -> u32 { self.inner.registry.failures(id) }

    /// Number of kinds with a live pool.
    pub fn pool_count(&self) -> usize { self.inner.pools.load().len() }

    pub fn debug_snapshot(&self) -> Vec<TriggerEntry> { self.inner.debug_snapshot() }

    /// Stop accepting work, cancel in-flight dispatches and wait for workers to exit.
    pub async fn shutdown(&self) {
        self.inner.token.cancel();
        for pool in self.inner.pools.load().values() {
            for q in pool.queues.iter() {
                q.shut_down();
            }
        }
        let handles = std::mem::take(&mut *self.inner.handles.lock().unwrap_or_else(|e| e.into_inner()));
        for h in handles {
            if let Err(e) = h.await {
                warn!(error = %e, "worker join failed");
            }
        }
        info!("scheduler stopped");
    }
}

impl Inner {
    fn pool(self: &Arc<Self>, gvk: &Gvk) -> Arc<KindPool> {
        if let Some(p) = self.pools.load().get(gvk) {
            return Arc::clone(p);
        }
        let _guard = self.create_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(p) = self.pools.load().get(gvk) {
            return Arc::clone(p);
        }
        let config = self.config.pool_for(gvk);
        let pool = Arc::new(KindPool::new(gvk.clone(), config));
        self.pools.rcu(|cur| {
            let mut next = (**cur).clone();
            next.insert(gvk.clone(), Arc::clone(&pool));
            next
        });
        debug!(gvk = %gvk, workers = config.workers, threadiness = config.threadiness, shards = config.shards, "pool created");
        if self.started.load(Ordering::SeqCst) {
            self.spawn_workers(&pool);
        }
        pool
    }

    fn spawn_workers(self: &Arc<Self>, pool: &Arc<KindPool>) {
        if self.token.is_cancelled() {
            return;
        }
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for shard in 0..pool.queues.len() {
            for _ in 0..pool.config.workers {
                handles.push(tokio::spawn(Arc::clone(self).puller(Arc::clone(pool), shard)));
            }
        }
    }

    fn trigger(self: &Arc<Self>, id: ObjectId, delay: Duration, origin: Origin) {
        if self.token.is_cancelled() {
            return;
        }
        let pool = self.pool(&id.gvk);
        if delay.is_zero() {
            self.registry.note_immediate(&id, origin);
            if !pool.queue(&id).add(id.clone()) {
                debug!(key = %id, "trigger coalesced");
            }
            return;
        }
        let generation = self.registry.set_delayed(&id, Instant::now() + delay, origin);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = this.token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if this.registry.fire_delayed(&id, generation).is_some() {
                        pool.queue(&id).add(id);
                    }
                }
            }
        });
    }

    async fn puller(self: Arc<Self>, pool: Arc<KindPool>, shard: usize) {
        let sem = Arc::new(Semaphore::new(pool.config.threadiness));
        let mut tasks = JoinSet::new();
        let queue = &pool.queues[shard];
        loop {
            let permit = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                Some(_) = tasks.join_next(), if !tasks.is_empty() => continue,
                p = Arc::clone(&sem).acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let id = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                next = queue.get() => match next {
                    Some(id) => id,
                    None => break,
                },
            };
            let this = Arc::clone(&self);
            let pool = Arc::clone(&pool);
            tasks.spawn(async move {
                this.run_one(&pool, shard, id).await;
                drop(permit);
            });
        }
        while tasks.join_next().await.is_some() {}
        debug!(gvk = %pool.gvk, shard, "puller exited");
    }

    async fn run_one(self: &Arc<Self>, pool: &KindPool, shard: usize, id: ObjectId) {
        let origin = self.registry.take_origin(&id);
        let ctx = self.token.child_token();
        let started = Instant::now();
        let item = WorkItem { id: id.clone(), origin };
        let result = AssertUnwindSafe(self.dispatch.dispatch(item, ctx.clone())).catch_unwind().await;
        counter!("dispatch_total", 1u64, "gvk" => pool.gvk.to_string());
        histogram!("dispatch_latency_ms", started.elapsed().as_secs_f64() * 1000.0);

        let failure = match result {
            Ok(Ok(outcome)) => {
                self.registry.forget_failures(&id);
                if let Some(after) = outcome.requeue_after {
                    self.trigger(id.clone(), after, Origin::TRIGGER);
                }
                None
            }
            Ok(Err(e)) => {
                counter!("dispatch_errors_total", 1u64, "gvk" => pool.gvk.to_string());
                Some(format!("{:#}", e))
            }
            Err(panic) => {
                counter!("dispatch_panics_total", 1u64, "gvk" => pool.gvk.to_string());
                let msg = panic_message(panic.as_ref());
                error!(key = %id, shard, panic = %msg, "dispatch panicked");
                Some(format!("panic: {}", msg))
            }
        };
        pool.queue(&id).done(&id);

        if let Some(err) = failure {
            if ctx.is_cancelled() {
                debug!(key = %id, error = %err, "dispatch cancelled; not requeued");
                return;
            }
            let failures = self.registry.record_failure(&id, err.clone());
            let delay = self.config.backoff.after_failures(failures);
            warn!(key = %id, failures, delay_ms = delay.as_millis() as u64, error = %err, "dispatch failed; requeueing");
            self.trigger(id, delay, Origin::TRIGGER);
        }
    }

    fn debug_snapshot(&self) -> Vec<TriggerEntry> {
        let now = Instant::now();
        let mut states: FxHashMap<ObjectId, TriggerState> = FxHashMap::default();
        let mut failures: FxHashMap<ObjectId, (u32, Option<String>)> = FxHashMap::default();
        for e in self.registry.snapshot() {
            if let Some(due) = e.due {
                let due_in_ms = due.saturating_duration_since(now).as_millis() as u64;
                states.insert(e.id.clone(), TriggerState::Delayed { due_in_ms });
            }
            failures.insert(e.id, (e.failures, e.last_error));
        }
        for pool in self.pools.load().values() {
            for q in pool.queues.iter() {
                let snap = q.snapshot();
                for id in snap.queued {
                    states.insert(id, TriggerState::Queued);
                }
                for id in snap.in_flight {
                    states.insert(id, TriggerState::InFlight);
                }
            }
        }
        for id in failures.keys() {
            states.entry(id.clone()).or_insert(TriggerState::Idle);
        }
        let mut out: Vec<TriggerEntry> = states
            .into_iter()
            .map(|(id, state)| {
                let (count, last_error) = failures.get(&id).cloned().unwrap_or((0, None));
                TriggerEntry {
                    gvk: id.gvk.to_string(),
                    namespace: id.key.namespace.clone(),
                    name: id.key.name.clone(),
                    state,
                    failures: count,
                    last_error,
                }
            })
            .collect();
        out.sort_by(|a, b| (&a.gvk, &a.namespace, &a.name).cmp(&(&b.gvk, &b.namespace, &b.name)));
        out
    }
}

fn panic_message(p: &(dyn Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_merges_and_classifies() {
        let o = Origin::TRIGGER.merge(Origin::RESYNC);
        assert!(o.contains(Origin::TRIGGER));
        assert!(o.is_synthetic());
        assert!(!o.merge(Origin::WATCH).is_synthetic());
        assert!(!Origin::default().is_synthetic());
        assert!(!Origin::default().contains(Origin::default()));
    }

    #[test]
    fn pool_config_is_normalized() {
        let mut cfg = SchedulerConfig::default();
        let gvk = Gvk::new("apps", "v1", "Deployment");
        cfg.kinds.insert(gvk.clone(), PoolConfig { workers: 0, threadiness: 0, shards: 3 });
        assert_eq!(cfg.pool_for(&gvk), PoolConfig { workers: 1, threadiness: 1, shards: 3 });
        assert_eq!(cfg.pool_for(&Gvk::new("", "v1", "Pod")), PoolConfig::default());
    }

    #[test]
    fn panic_payloads_are_readable() {
        let p: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(p.as_ref()), "boom");
        let p: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(p.as_ref()), "bang");
    }
}
