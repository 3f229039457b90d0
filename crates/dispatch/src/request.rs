use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use kube::core::DynamicObject;
use tether_core::{Backend, ObjectExt, ObjectId, ObjectSet, StoreError};
use tether_trigger::Origin;
use tokio_util::sync::CancellationToken;

/// One handler invocation's input. Cheap to clone.
#[derive(Clone)]
pub struct Request {
    pub id: ObjectId,
    /// Current object; for removed objects the last known state, if still remembered.
    pub object: Option<Arc<DynamicObject>>,
    /// The object no longer exists in the store.
    pub removed: bool,
    pub origin: Origin,
    /// Name of the route being run.
    pub route: Arc<str>,
    pub ctx: CancellationToken,
    pub backend: Arc<dyn Backend>,
}

impl Request {
    pub fn object(&self) -> Option<&DynamicObject> { self.object.as_deref() }

    /// Marked for deletion but still present in the store.
    pub fn is_finalizing(&self) -> bool { !self.removed && self.object().map(|o| o.is_deleting()).unwrap_or(false) }

    /// Raised by a trigger or resync rather than a store change.
    pub fn is_synthetic(&self) -> bool { self.origin.is_synthetic() }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("removed", &self.removed)
            .field("has_object", &self.object.is_some())
            .field("origin", &self.origin)
            .finish()
    }
}

#[derive(Default)]
struct ResponseState {
    objects: ObjectSet,
    requeue_after: Option<Duration>,
}

/// Accumulator for what a handler declares during one invocation.
#[derive(Clone, Default)]
pub struct Response {
    state: Arc<Mutex<ResponseState>>,
}

impl Response {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, ResponseState> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Declare a desired child object. Declaring the same identity twice keeps the last one.
    pub fn add(&self, obj: DynamicObject) -> Result<ObjectId, StoreError> { self.lock().objects.add(obj) }

    pub fn extend(&self, objs: impl IntoIterator<Item = DynamicObject>) -> Result<(), StoreError> {
        let mut st = self.lock();
        for o in objs {
            st.objects.add(o)?;
        }
        Ok(())
    }

    /// Ask for another pass after `after`; the shortest request wins.
    pub fn requeue_after(&self, after: Duration) {
        let mut st = self.lock();
        st.requeue_after = Some(st.requeue_after.map_or(after, |cur| cur.min(after)));
    }

    pub fn requeue(&self) -> Option<Duration> { self.lock().requeue_after }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn take_objects(&self) -> ObjectSet { std::mem::take(&mut self.lock().objects) }
}
