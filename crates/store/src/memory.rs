//! In-memory `Backend` with resource versions, finalizer-aware deletion and watch fan-out.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::DynamicObject;
use rustc_hash::FxHashMap;
use tether_core::{Backend, Delta, DeltaStream, Gvk, ListQuery, ObjectExt, ObjectId, ObjectKey, StoreError};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

type Kinds = FxHashMap<Gvk, BTreeMap<ObjectKey, DynamicObject>>;

pub struct MemoryStore {
    state: RwLock<Kinds>,
    events: broadcast::Sender<Delta>,
    rv: AtomicU64,
    mutations: AtomicU64,
    injected_conflicts: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(4096);
        Self {
            state: RwLock::new(FxHashMap::default()),
            events,
            rv: AtomicU64::new(0),
            mutations: AtomicU64::new(0),
            injected_conflicts: AtomicUsize::new(0),
        }
    }

    /// Number of successful create/update/delete calls so far.
    pub fn mutations(&self) -> u64 { self.mutations.load(Ordering::SeqCst) }

    /// Make the next `n` updates fail with a conflict regardless of resource version.
    pub fn inject_conflicts(&self, n: usize) { self.injected_conflicts.store(n, Ordering::SeqCst); }

    /// Current object count for a kind.
    pub fn count(&self, gvk: &Gvk) -> usize {
        self.read().get(gvk).map(|m| m.len()).unwrap_or(0)
    }

    fn read(&self) -> RwLockReadGuard<'_, Kinds> { self.state.read().unwrap_or_else(|e| e.into_inner()) }
    fn write(&self) -> RwLockWriteGuard<'_, Kinds> { self.state.write().unwrap_or_else(|e| e.into_inner()) }

    fn next_rv(&self) -> String { (self.rv.fetch_add(1, Ordering::SeqCst) + 1).to_string() }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn emit(&self, d: Delta) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(d);
    }
}

fn no_finalizers(obj: &DynamicObject) -> bool {
    obj.metadata.finalizers.as_ref().map(|f| f.is_empty()).unwrap_or(true)
}

#[async_trait::async_trait]
impl Backend for MemoryStore {
    async fn get(&self, gvk: &Gvk, key: &ObjectKey) -> Result<DynamicObject, StoreError> {
        self.read()
            .get(gvk)
            .and_then(|m| m.get(key))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(ObjectId::new(gvk.clone(), key.clone())))
    }

    async fn list(&self, gvk: &Gvk, query: &ListQuery) -> Result<Vec<DynamicObject>, StoreError> {
        Ok(self
            .read()
            .get(gvk)
            .map(|m| m.values().filter(|o| query.matches(o)).cloned().collect())
            .unwrap_or_default())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let id = obj.object_id()?;
        let mut st = self.write();
        let items = st.entry(id.gvk.clone()).or_default();
        if items.contains_key(&id.key) {
            return Err(StoreError::AlreadyExists(id));
        }
        let mut next = obj.clone();
        next.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        next.metadata.resource_version = Some(self.next_rv());
        next.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        next.metadata.deletion_timestamp = None;
        items.insert(id.key.clone(), next.clone());
        debug!(id = %id, "memory store: created");
        self.emit(Delta::applied(next.clone()));
        Ok(next)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let id = obj.object_id()?;
        let mut st = self.write();
        let items = st.get_mut(&id.gvk).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let stored = items.get(&id.key).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if self.take_injected_conflict() {
            return Err(StoreError::Conflict { id, message: "injected conflict".into() });
        }
        if let Some(rv) = obj.metadata.resource_version.as_deref() {
            if stored.metadata.resource_version.as_deref() != Some(rv) {
                return Err(StoreError::Conflict {
                    id,
                    message: format!(
                        "resourceVersion {} is stale (current {})",
                        rv,
                        stored.metadata.resource_version.as_deref().unwrap_or("")
                    ),
                });
            }
        }
        if stored.is_deleting() {
            let added = obj
                .metadata
                .finalizers
                .iter()
                .flatten()
                .any(|f| !stored.has_finalizer(f));
            if added {
                return Err(StoreError::Invalid(format!(
                    "{}: no new finalizers can be added while the object is being deleted",
                    id
                )));
            }
        }
        let mut next = obj.clone();
        next.metadata.uid = stored.metadata.uid.clone();
        next.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
        next.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        next.metadata.resource_version = Some(self.next_rv());
        if next.is_deleting() && no_finalizers(&next) {
            items.remove(&id.key);
            debug!(id = %id, "memory store: last finalizer removed; deleted");
            self.emit(Delta::deleted(next.clone()));
        } else {
            items.insert(id.key.clone(), next.clone());
            self.emit(Delta::applied(next.clone()));
        }
        Ok(next)
    }

    async fn delete(&self, gvk: &Gvk, key: &ObjectKey) -> Result<(), StoreError> {
        let id = ObjectId::new(gvk.clone(), key.clone());
        let mut st = self.write();
        let items = st.get_mut(gvk).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let stored = items.get_mut(key).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if no_finalizers(stored) {
            if let Some(gone) = items.remove(key) {
                debug!(id = %id, "memory store: deleted");
                self.emit(Delta::deleted(gone));
            }
            return Ok(());
        }
        if stored.metadata.deletion_timestamp.is_none() {
            stored.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            stored.metadata.resource_version = Some(self.next_rv());
            let marked = stored.clone();
            debug!(id = %id, "memory store: marked for deletion");
            self.emit(Delta::applied(marked));
        }
        Ok(())
    }

    fn watch(&self, gvk: &Gvk, query: &ListQuery) -> DeltaStream {
        let rx = self.events.subscribe();
        let gvk = gvk.clone();
        let query = query.clone();
        futures::stream::unfold(rx, move |mut rx| {
            let gvk = gvk.clone();
            let query = query.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(d) => {
                            if d.object.gvk().as_ref() == Some(&gvk) && query.matches(&d.object) {
                                return Some((Ok(d), rx));
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            return Some((Err(StoreError::Transient(format!("watch lagged by {} events", n))), rx));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed()
    }
}
