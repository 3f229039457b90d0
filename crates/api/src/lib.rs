//! Tether manager: the façade hosting applications build controllers with.
//!
//! A [`Manager`] owns the informers, the dispatcher, the scheduler and the apply
//! engine. Register routes and watches first, then call [`Manager::run`] with a
//! leadership gate; nothing is dispatched until the gate reads `true`.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use kube::core::DynamicObject;
use rustc_hash::FxHashSet;
use tether_apply::{Apply, ApplyError, ApplyReport, Recorded};
use tether_core::{Backend, Delta, Gvk, ObjectExt, ObjectId};
use tether_dispatch::{Dispatcher, Route};
use tether_store::Informer;
use tether_trigger::{Origin, Scheduler, TriggerEntry};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod config;
mod informers;

pub use config::{ConfigError, ManagerConfig};
pub use informers::InformerSet;

/// Maps a change of a watched kind to the keys that should be re-reconciled.
pub type WatchFn = Arc<dyn Fn(&Delta) -> Vec<ObjectId> + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    gvk: Gvk,
    name: String,
    map: WatchFn,
    origin: Origin,
}

#[derive(Default)]
struct Lifecycle {
    subscriptions: Vec<Subscription>,
    routed: FxHashSet<Gvk>,
    running: bool,
}

pub struct Manager {
    config: ManagerConfig,
    backend: Arc<dyn Backend>,
    informers: Arc<InformerSet>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Scheduler,
    apply: Apply,
    token: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Manager {
    pub fn new(backend: Arc<dyn Backend>, config: ManagerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let informers = Arc::new(InformerSet::new(backend.clone(), config.namespace.as_deref()));
        let apply = Apply::new(backend.clone());
        let dispatcher = Arc::new(Dispatcher::new(backend.clone(), informers.clone(), apply.clone()));
        let scheduler = Scheduler::new(dispatcher.clone(), config.scheduler_config()?);
        Ok(Self {
            config,
            backend,
            informers,
            dispatcher,
            scheduler,
            apply,
            token: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ManagerConfig { &self.config }
    pub fn backend(&self) -> &Arc<dyn Backend> { &self.backend }
    pub fn informers(&self) -> &Arc<InformerSet> { &self.informers }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> { self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()) }

    fn push_task(&self, h: JoinHandle<()>) { self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(h); }

    /// Register a route. Its kind gets an informer whose changes trigger the route.
    pub fn register(&self, route: Route) -> Arc<Route> {
        let gvk = route.gvk().clone();
        let route = self.dispatcher.register(route);
        if self.lifecycle().routed.insert(gvk.clone()) {
            self.informers.dispatched(&gvk);
            let map: WatchFn = Arc::new(|d: &Delta| d.object.object_id().ok().into_iter().collect());
            self.subscribe(Subscription { name: format!("routes/{}", gvk), gvk, map, origin: Origin::WATCH });
        }
        route
    }

    /// Reconcile `id` now, or after `delay`; a pending delayed trigger for the same key is replaced.
    pub fn trigger(&self, id: ObjectId, delay: Duration) { self.scheduler.trigger(id, delay, Origin::TRIGGER) }

    /// Re-trigger the keys `map` returns for each change of `gvk`.
    pub fn watch<F>(&self, gvk: Gvk, name: &str, map: F)
    where
        F: Fn(&Delta) -> Vec<ObjectId> + Send + Sync + 'static,
    {
        self.subscribe(Subscription { gvk, name: name.to_string(), map: Arc::new(map), origin: Origin::TRIGGER });
    }

    /// Re-trigger the recorded owner of kind `owner` whenever an object of `child` changes.
    pub fn watch_owned(&self, owner: Gvk, child: Gvk) {
        let name = format!("owned/{}/{}", owner, child);
        self.watch(child, &name, move |d| {
            Recorded::read(&d.object).and_then(|r| r.owner).filter(|o| o.gvk == owner).into_iter().collect()
        });
    }

    /// Delete objects of `gvk` whose recorded owner no longer exists.
    pub fn register_orphan_purger(&self, gvk: Gvk) -> Result<Arc<Route>, tether_dispatch::RouteError> {
        let apply = self.apply.clone();
        let route = Route::builder(&format!("orphan-purger/{}", gvk), gvk)
            .handle(move |req, _| {
                let apply = apply.clone();
                async move {
                    if let Some(obj) = req.object() {
                        apply.purge_orphan(obj).await?;
                    }
                    Ok(())
                }
            })
            .build()?;
        Ok(self.register(route))
    }

    /// The shared apply engine; re-scope it with `with_owner`/`with_set_id`.
    pub fn apply(&self) -> Apply { self.apply.clone() }

    pub async fn ensure(&self, objects: Vec<DynamicObject>) -> Result<ApplyReport, ApplyError> { self.apply.ensure(objects).await }

    pub async fn find_owner(&self, obj: &DynamicObject) -> Result<DynamicObject, ApplyError> { self.apply.find_owner(obj).await }

    pub async fn purge_orphan(&self, obj: &DynamicObject) -> Result<bool, ApplyError> { self.apply.purge_orphan(obj).await }

    /// Allow subcontext `from` to hand its objects over to subcontext `to`.
    pub fn register_migration(&self, from: &str, to: &str) { self.apply.register_migration(from, to) }

    pub fn debug_triggers(&self) -> Vec<TriggerEntry> { self.scheduler.debug_snapshot() }

    pub fn is_running(&self) -> bool { self.lifecycle().running }

    fn subscribe(&self, sub: Subscription) {
        let mut lc = self.lifecycle();
        lc.subscriptions.push(sub.clone());
        if lc.running {
            drop(lc);
            self.spawn_subscription(&sub);
        }
    }

    fn spawn_subscription(&self, sub: &Subscription) {
        let informer = self.informers.ensure(&sub.gvk);
        let rx = informer.subscribe();
        let pump = pump(rx, informer, self.scheduler.clone(), sub.clone(), self.token.child_token());
        self.push_task(tokio::spawn(pump));
        if let Some(h) = self.informers.start(&sub.gvk, &self.token) {
            self.push_task(h);
        }
        debug!(name = %sub.name, gvk = %sub.gvk, "subscription started");
    }

    /// Wait for leadership, run until it is lost or [`Manager::shutdown`] is called.
    ///
    /// A dropped gate sender freezes the gate at its last value.
    pub async fn run(&self, mut leader: watch::Receiver<bool>) -> anyhow::Result<()> {
        while !*leader.borrow_and_update() {
            tokio::select! {
                r = leader.changed() => if r.is_err() && !*leader.borrow() {
                    info!("leader gate closed before leadership was acquired");
                    return Ok(());
                },
                _ = self.token.cancelled() => return Ok(()),
            }
        }
        info!("leadership acquired");
        self.start().await?;
        loop {
            tokio::select! {
                r = leader.changed() => match r {
                    Ok(()) if *leader.borrow() => continue,
                    Ok(()) => {
                        info!("leadership lost");
                        break;
                    }
                    Err(_) => {
                        if *leader.borrow() {
                            self.token.cancelled().await;
                        }
                        break;
                    }
                },
                _ = self.token.cancelled() => break,
            }
        }
        self.shutdown().await;
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        let subs = {
            let mut lc = self.lifecycle();
            if lc.running {
                return Ok(());
            }
            lc.running = true;
            lc.subscriptions.clone()
        };
        for sub in subs.iter() {
            self.spawn_subscription(sub);
        }
        let informers = self.informers.all();
        info!(kinds = informers.len(), "waiting for caches to sync");
        for inf in informers.iter() {
            tokio::select! {
                _ = inf.wait_synced() => {}
                _ = self.token.cancelled() => anyhow::bail!("shut down while waiting for caches to sync"),
            }
        }
        self.scheduler.start();
        if let Some(every) = self.config.resync_interval() {
            let h = tokio::spawn(resync_loop(self.dispatcher.clone(), self.informers.clone(), self.scheduler.clone(), every, self.token.child_token()));
            self.push_task(h);
        }
        info!(routes = self.dispatcher.kinds().len(), "manager started");
        Ok(())
    }

    /// Stop informers and pumps, cancel in-flight dispatches and wait for everything to exit.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        self.scheduler.shutdown().await;
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for t in tasks {
            if let Err(e) = t.await {
                warn!(error = %e, "manager task join failed");
            }
        }
        self.lifecycle().running = false;
        info!("manager stopped");
    }
}

/// Forward informer deltas to the scheduler. A lagging receiver replays the whole cache.
async fn pump(mut rx: broadcast::Receiver<Delta>, informer: Arc<Informer>, scheduler: Scheduler, sub: Subscription, token: CancellationToken) {
    loop {
        let next = tokio::select! {
            r = rx.recv() => r,
            _ = token.cancelled() => return,
        };
        match next {
            Ok(d) => {
                for id in (sub.map)(&d) {
                    scheduler.trigger(id, Duration::ZERO, sub.origin);
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(name = %sub.name, gvk = %sub.gvk, skipped = n, "subscription lagged; replaying cache");
                for obj in informer.list(None) {
                    for id in (sub.map)(&Delta::applied((*obj).clone())) {
                        scheduler.trigger(id, Duration::ZERO, Origin::RESYNC);
                    }
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Periodically re-trigger every cached key of every routed kind.
async fn resync_loop(dispatcher: Arc<Dispatcher>, informers: Arc<InformerSet>, scheduler: Scheduler, every: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = token.cancelled() => return,
        }
        let mut total = 0usize;
        for gvk in dispatcher.kinds() {
            let Some(inf) = informers.informer(&gvk) else { continue };
            for key in inf.keys() {
                scheduler.trigger(ObjectId::new(gvk.clone(), key), Duration::ZERO, Origin::RESYNC);
                total += 1;
            }
        }
        debug!(keys = total, "resync");
    }
}
