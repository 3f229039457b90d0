use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use kube::core::DynamicObject;
use rustc_hash::{FxHashMap, FxHashSet};
use tether_core::{Backend, Gvk, ListQuery, ObjectId, StoreError};
use tether_dispatch::ObjectSource;
use tether_store::Informer;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One informer per kind, created on first use and scoped to the configured namespace.
pub struct InformerSet {
    backend: Arc<dyn Backend>,
    query: ListQuery,
    informers: ArcSwap<FxHashMap<Gvk, Arc<Informer>>>,
    create_lock: Mutex<()>,
    started: Mutex<FxHashSet<Gvk>>,
}

impl InformerSet {
    pub fn new(backend: Arc<dyn Backend>, namespace: Option<&str>) -> Self {
        Self {
            backend,
            query: ListQuery::all().in_namespace(namespace),
            informers: ArcSwap::from_pointee(FxHashMap::default()),
            create_lock: Mutex::new(()),
            started: Mutex::new(FxHashSet::default()),
        }
    }

    pub fn informer(&self, gvk: &Gvk) -> Option<Arc<Informer>> { self.informers.load().get(gvk).cloned() }

    pub fn ensure(&self, gvk: &Gvk) -> Arc<Informer> {
        if let Some(i) = self.informer(gvk) {
            return i;
        }
        let _guard = self.create_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(i) = self.informer(gvk) {
            return i;
        }
        let informer = Informer::new(self.backend.clone(), gvk.clone(), self.query.clone());
        self.informers.rcu(|cur| {
            let mut next = (**cur).clone();
            next.insert(gvk.clone(), informer.clone());
            next
        });
        debug!(gvk = %gvk, "informer created");
        informer
    }

    /// Mark `gvk` as dispatched: its informer keeps tombstones for the dispatcher to consume.
    pub fn dispatched(&self, gvk: &Gvk) -> Arc<Informer> {
        let informer = self.ensure(gvk);
        informer.keep_tombstones(true);
        informer
    }

    /// Start the informer for `gvk` unless already running.
    pub fn start(&self, gvk: &Gvk, token: &CancellationToken) -> Option<JoinHandle<()>> {
        let informer = self.ensure(gvk);
        if !self.started.lock().unwrap_or_else(|e| e.into_inner()).insert(gvk.clone()) {
            return None;
        }
        Some(informer.start(token.child_token()))
    }

    pub fn all(&self) -> Vec<Arc<Informer>> { self.informers.load().values().cloned().collect() }

    pub fn kinds(&self) -> Vec<Gvk> {
        let mut kinds: Vec<Gvk> = self.informers.load().keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

#[async_trait::async_trait]
impl ObjectSource for InformerSet {
    /// Served from the cache once it has synced; from the backend otherwise.
    async fn get(&self, id: &ObjectId) -> Result<Option<Arc<DynamicObject>>, StoreError> {
        match self.informer(&id.gvk) {
            Some(inf) if inf.is_synced() => Ok(inf.get(&id.key)),
            _ => Ok(self.backend.get_opt(&id.gvk, &id.key).await?.map(Arc::new)),
        }
    }

    fn tombstone(&self, id: &ObjectId) -> Option<Arc<DynamicObject>> {
        self.informer(&id.gvk).and_then(|inf| inf.tombstone(&id.key))
    }

    fn forget_tombstone(&self, id: &ObjectId) {
        if let Some(inf) = self.informer(&id.gvk) {
            inf.forget_tombstone(&id.key);
        }
    }
}
