use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{DynamicObject, TypeMeta};

use crate::{Gvk, ObjectId, ObjectKey, StoreError};

/// Identity and lifecycle accessors on dynamic objects.
pub trait ObjectExt {
    fn gvk(&self) -> Option<Gvk>;
    fn object_key(&self) -> ObjectKey;
    /// Full identity; fails for objects without `apiVersion`/`kind` or name.
    fn object_id(&self) -> Result<ObjectId, StoreError>;
    fn is_deleting(&self) -> bool;
    fn has_finalizer(&self, finalizer: &str) -> bool;
    fn annotation(&self, key: &str) -> Option<&str>;
    fn label(&self, key: &str) -> Option<&str>;
}

impl ObjectExt for DynamicObject {
    fn gvk(&self) -> Option<Gvk> {
        self.types.as_ref().map(|t| Gvk::from_api_version(&t.api_version, &t.kind))
    }

    fn object_key(&self) -> ObjectKey {
        ObjectKey::new(self.metadata.namespace.as_deref(), self.metadata.name.as_deref().unwrap_or(""))
    }

    fn object_id(&self) -> Result<ObjectId, StoreError> {
        let key = self.object_key();
        if key.name.is_empty() {
            return Err(StoreError::Invalid("object missing metadata.name".into()));
        }
        let gvk = self
            .gvk()
            .filter(|g| !g.kind.is_empty() && !g.version.is_empty())
            .ok_or_else(|| StoreError::Invalid(format!("object {} missing apiVersion/kind", key)))?;
        Ok(ObjectId::new(gvk, key))
    }

    fn is_deleting(&self) -> bool { self.metadata.deletion_timestamp.is_some() }

    fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata.finalizers.as_ref().map(|f| f.iter().any(|x| x == finalizer)).unwrap_or(false)
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.as_ref().and_then(|a| a.get(key)).map(|s| s.as_str())
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.as_ref().and_then(|l| l.get(key)).map(|s| s.as_str())
    }
}

/// Build a dynamic object of `gvk` with the given body fields (everything besides metadata).
pub fn new_object(gvk: &Gvk, namespace: Option<&str>, name: &str, data: serde_json::Value) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta { api_version: gvk.api_version(), kind: gvk.kind.clone() }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(|s| s.to_string()),
            ..Default::default()
        },
        data,
    }
}
