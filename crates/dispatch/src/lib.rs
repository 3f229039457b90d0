//! Tether dispatch: resolve routes for a key and run their middleware chains.
//!
//! For every dispatched key the current object is read once, then each matching route
//! runs in registration order. A route registered with a finalizer gets the finalizer
//! added after its first successful run and runs its finalize handler, instead of the
//! normal one, once the object is marked for deletion. Objects a handler declares in
//! its [`Response`] are applied with the request object as owner.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use arc_swap::ArcSwap;
use kube::core::DynamicObject;
use rustc_hash::FxHashMap;
use tether_apply::Apply;
use tether_core::{Backend, Gvk, ObjectExt, ObjectId, StoreError};
use tether_trigger::{Dispatch, Outcome, WorkItem};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod middleware;
mod request;
mod route;

pub use middleware::{
    handler_fn, middleware_fn, ErrorPrefix, Handler, IgnoreFinalizing, IgnoreNil, IgnoreRemoved, Middleware, Next,
};
pub use request::{Request, Response};
pub use route::{OutputPolicy, Route, RouteBuilder, RouteError};

const FINALIZER_ATTEMPTS: u32 = 3;

/// Where the dispatcher reads current objects from.
#[async_trait::async_trait]
pub trait ObjectSource: Send + Sync + 'static {
    async fn get(&self, id: &ObjectId) -> Result<Option<Arc<DynamicObject>>, StoreError>;

    /// Last known state of a deleted object, if still remembered.
    fn tombstone(&self, _id: &ObjectId) -> Option<Arc<DynamicObject>> { None }

    fn forget_tombstone(&self, _id: &ObjectId) {}
}

/// Reads straight from the backend; no tombstones.
pub struct BackendSource(pub Arc<dyn Backend>);

#[async_trait::async_trait]
impl ObjectSource for BackendSource {
    async fn get(&self, id: &ObjectId) -> Result<Option<Arc<DynamicObject>>, StoreError> {
        Ok(self.0.get_opt(&id.gvk, &id.key).await?.map(Arc::new))
    }
}

type RouteTable = FxHashMap<Gvk, Arc<[Arc<Route>]>>;

pub struct Dispatcher {
    routes: ArcSwap<RouteTable>,
    source: Arc<dyn ObjectSource>,
    backend: Arc<dyn Backend>,
    apply: Apply,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn Backend>, source: Arc<dyn ObjectSource>, apply: Apply) -> Self {
        Self { routes: ArcSwap::from_pointee(RouteTable::default()), source, backend, apply }
    }

    /// Add a route; it runs after every route already registered for its kind.
    pub fn register(&self, route: Route) -> Arc<Route> {
        let route = Arc::new(route);
        self.routes.rcu(|cur| {
            let mut next = (**cur).clone();
            let mut list: Vec<Arc<Route>> = next.get(&route.gvk).map(|l| l.to_vec()).unwrap_or_default();
            list.push(route.clone());
            next.insert(route.gvk.clone(), list.into());
            next
        });
        info!(route = %route.name, gvk = %route.gvk, "route registered");
        route
    }

    pub fn routes_for(&self, gvk: &Gvk) -> Arc<[Arc<Route>]> {
        self.routes.load().get(gvk).cloned().unwrap_or_else(|| Arc::from(Vec::new()))
    }

    /// Kinds with at least one route.
    pub fn kinds(&self) -> Vec<Gvk> {
        let mut kinds: Vec<Gvk> = self.routes.load().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn apply(&self) -> &Apply { &self.apply }

    /// Run one route. Returns the requeue delay it asked for.
    async fn run_route(&self, route: &Route, req: Request) -> anyhow::Result<Option<Duration>> {
        let resp = Response::new();
        let object = req.object.clone();

        if let (Some(finalizer), Some(handler), Some(obj)) = (&route.finalizer, &route.finalize_handler, object.as_deref()) {
            if req.is_finalizing() && obj.has_finalizer(finalizer) {
                let reached = Arc::new(AtomicBool::new(false));
                let terminal = Terminal::wrap(handler.clone(), reached.clone());
                Next::new(route.finalize_chain.clone(), terminal).run(req.clone(), resp.clone()).await?;
                if !reached.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                if route.outputs.is_some() {
                    self.apply_outputs(route, obj, &resp).await?;
                }
                self.edit_finalizer(&req.id, finalizer, false).await?;
                info!(route = %route.name, key = %req.id, finalizer = %finalizer, "finalized");
                return Ok(resp.requeue());
            }
        }

        let reached = Arc::new(AtomicBool::new(false));
        let terminal = Terminal::wrap(route.handler.clone(), reached.clone());
        Next::new(route.chain.clone(), terminal).run(req.clone(), resp.clone()).await?;
        if !reached.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let Some(obj) = object.as_deref() else { return Ok(resp.requeue()) };
        if req.removed || obj.is_deleting() {
            if !resp.is_empty() {
                warn!(route = %route.name, key = %req.id, objects = resp.len(), "dropping outputs declared for a deleted object");
            }
            return Ok(resp.requeue());
        }
        if route.outputs.is_some() || !resp.is_empty() {
            self.apply_outputs(route, obj, &resp).await?;
        }
        if let Some(finalizer) = &route.finalizer {
            if !obj.has_finalizer(finalizer) {
                self.edit_finalizer(&req.id, finalizer, true).await?;
            }
        }
        Ok(resp.requeue())
    }

    async fn apply_outputs(&self, route: &Route, owner: &DynamicObject, resp: &Response) -> anyhow::Result<()> {
        let policy = route.outputs.clone().unwrap_or_default();
        let mut apply = self
            .apply
            .clone()
            .with_owner(owner)?
            .with_set_id(route.set_id())
            .with_no_prune(policy.no_prune);
        if let Some(kinds) = policy.prune_kinds {
            apply = apply.with_prune_kinds(kinds);
        }
        let report = apply.apply(resp.take_objects()).await.context("applying outputs")?;
        if !report.is_noop() {
            debug!(
                route = %route.name,
                created = report.created.len(),
                updated = report.updated.len(),
                deleted = report.deleted.len(),
                "outputs applied"
            );
        }
        Ok(())
    }

    /// Add or remove `finalizer` on the stored object, re-reading it on conflict.
    async fn edit_finalizer(&self, id: &ObjectId, finalizer: &str, add: bool) -> anyhow::Result<()> {
        let op = if add { "add" } else { "remove" };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(mut obj) = self.backend.get_opt(&id.gvk, &id.key).await.with_context(|| format!("get {}", id))? else {
                return Ok(());
            };
            if obj.has_finalizer(finalizer) == add || (add && obj.is_deleting()) {
                return Ok(());
            }
            let list = obj.metadata.finalizers.get_or_insert_with(Vec::new);
            if add {
                list.push(finalizer.to_string());
            } else {
                list.retain(|f| f != finalizer);
            }
            match self.backend.update(&obj).await {
                Ok(_) => {
                    debug!(key = %id, finalizer = %finalizer, op, "finalizer updated");
                    return Ok(());
                }
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) if e.is_conflict() && attempt < FINALIZER_ATTEMPTS => {
                    debug!(key = %id, attempt, "finalizer update conflicted; retrying");
                }
                Err(e) => return Err(anyhow::Error::new(e).context(format!("{} finalizer {} on {}", op, finalizer, id))),
            }
        }
    }
}

#[async_trait::async_trait]
impl Dispatch for Dispatcher {
    async fn dispatch(&self, item: WorkItem, ctx: CancellationToken) -> anyhow::Result<Outcome> {
        let routes = self.routes_for(&item.id.gvk);
        if routes.is_empty() {
            debug!(key = %item.id, "no routes for kind");
            return Ok(Outcome::done());
        }
        let fetched = tokio::select! {
            r = self.source.get(&item.id) => r.with_context(|| format!("get {}", item.id))?,
            _ = ctx.cancelled() => anyhow::bail!("cancelled"),
        };
        let (object, removed) = match fetched {
            Some(o) => (Some(o), false),
            None => (self.source.tombstone(&item.id), true),
        };

        let mut failures: Vec<String> = Vec::new();
        let mut requeue: Option<Duration> = None;
        for route in routes.iter() {
            if !route.matches(&item.id, object.as_deref()) {
                continue;
            }
            let req = Request {
                id: item.id.clone(),
                object: object.clone(),
                removed,
                origin: item.origin,
                route: route.name.clone(),
                ctx: ctx.clone(),
                backend: self.backend.clone(),
            };
            let res = tokio::select! {
                r = self.run_route(route, req) => r,
                _ = ctx.cancelled() => anyhow::bail!("cancelled"),
            };
            match res {
                Ok(Some(after)) => requeue = Some(requeue.map_or(after, |cur| cur.min(after))),
                Ok(None) => {}
                Err(e) => {
                    warn!(route = %route.name, key = %item.id, error = %format!("{:#}", e), "route failed");
                    failures.push(format!("route {}: {:#}", route.name, e));
                }
            }
        }
        if !failures.is_empty() {
            anyhow::bail!(failures.join("; "));
        }
        if removed {
            self.source.forget_tombstone(&item.id);
        }
        Ok(Outcome { requeue_after: requeue })
    }
}

/// Marks whether a chain reached its handler.
struct Terminal {
    inner: Arc<dyn Handler>,
    reached: Arc<AtomicBool>,
}

impl Terminal {
    fn wrap(inner: Arc<dyn Handler>, reached: Arc<AtomicBool>) -> Arc<dyn Handler> { Arc::new(Self { inner, reached }) }
}

#[async_trait::async_trait]
impl Handler for Terminal {
    async fn handle(&self, req: Request, resp: Response) -> anyhow::Result<()> {
        self.inner.handle(req, resp).await?;
        self.reached.store(true, Ordering::SeqCst);
        Ok(())
    }
}
