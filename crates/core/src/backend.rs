use futures::stream::BoxStream;
use kube::core::DynamicObject;

use crate::{Delta, Gvk, LabelSelector, ObjectKey, StoreError};

/// Stream of change notifications for one kind.
pub type DeltaStream = BoxStream<'static, Result<Delta, StoreError>>;

/// Scope of a list or watch call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub namespace: Option<String>,
    pub labels: Option<LabelSelector>,
}

impl ListQuery {
    pub fn all() -> Self { Self::default() }

    pub fn in_namespace(mut self, namespace: Option<&str>) -> Self {
        self.namespace = namespace.map(|s| s.to_string());
        self
    }

    pub fn with_labels(mut self, labels: LabelSelector) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn matches(&self, obj: &DynamicObject) -> bool {
        if let Some(ns) = &self.namespace {
            if obj.metadata.namespace.as_deref() != Some(ns.as_str()) { return false; }
        }
        match &self.labels {
            Some(sel) => sel.matches_opt(obj.metadata.labels.as_ref()),
            None => true,
        }
    }
}

/// The declarative resource store consumed by the reconciliation engine.
///
/// Writes are optimistic: `update` must fail with [`StoreError::Conflict`] when the
/// object's `resourceVersion` is stale. Deleting an object that still carries
/// finalizers only marks it for deletion.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, gvk: &Gvk, key: &ObjectKey) -> Result<DynamicObject, StoreError>;

    async fn list(&self, gvk: &Gvk, query: &ListQuery) -> Result<Vec<DynamicObject>, StoreError>;

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    async fn delete(&self, gvk: &Gvk, key: &ObjectKey) -> Result<(), StoreError>;

    /// Subscribe to changes. The subscription is established before this returns,
    /// so a list issued afterwards cannot miss intervening changes.
    fn watch(&self, gvk: &Gvk, query: &ListQuery) -> DeltaStream;

    /// `get` that maps `NotFound` to `None`.
    async fn get_opt(&self, gvk: &Gvk, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
        match self.get(gvk, key).await {
            Ok(o) => Ok(Some(o)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
