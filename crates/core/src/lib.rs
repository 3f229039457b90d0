//! Tether core types: object identity, change deltas, object sets and the store contract.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use kube::core::DynamicObject;

mod backend;
mod backoff;
mod error;
mod object;
mod selector;
mod set;

pub use backend::{Backend, DeltaStream, ListQuery};
pub use backoff::BackoffPolicy;
pub use error::{InvalidGvk, StoreError};
pub use object::{new_object, ObjectExt};
pub use selector::{FieldSelector, LabelSelector, SelectorError};
pub use set::ObjectSet;

/// Group/Version/Kind of a class of store objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// Split an `apiVersion` (`v1` or `apps/v1`) and pair it with `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// Key form: `v1/Kind` for the core group, `group/v1/Kind` otherwise.
    pub fn key(&self) -> String {
        format!("{}/{}", self.api_version(), self.kind)
    }

    pub fn to_kube(&self) -> kube::core::GroupVersionKind {
        kube::core::GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

impl FromStr for Gvk {
    type Err = InvalidGvk;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Gvk::new("", version, kind)),
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
                Ok(Gvk::new(group, version, kind))
            }
            _ => Err(InvalidGvk(key.to_string())),
        }
    }
}

/// Namespace/name of an object within its kind. Cluster-scoped objects have no namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.filter(|s| !s.is_empty()).map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self { Self::new(Some(namespace), name) }

    pub fn cluster(name: &str) -> Self { Self::new(None, name) }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Identity of one unit of reconcilable work: kind plus namespace/name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    pub gvk: Gvk,
    pub key: ObjectKey,
}

impl ObjectId {
    pub fn new(gvk: Gvk, key: ObjectKey) -> Self { Self { gvk, key } }

    pub fn namespace(&self) -> Option<&str> { self.key.namespace.as_deref() }
    pub fn name(&self) -> &str { &self.key.name }

    /// Stable 64-bit FNV-1a hash over kind, namespace and name.
    pub fn fnv(&self) -> u64 {
        let mut h = Fnv1a::default();
        h.write(self.gvk.group.as_bytes());
        h.write(b"/");
        h.write(self.gvk.version.as_bytes());
        h.write(b"/");
        h.write(self.gvk.kind.as_bytes());
        h.write(b"\0");
        h.write(self.key.namespace.as_deref().unwrap_or("").as_bytes());
        h.write(b"\0");
        h.write(self.key.name.as_bytes());
        h.finish()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.gvk, self.key)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// A change notification from a watch: the object as of the change.
#[derive(Debug, Clone)]
pub struct Delta {
    pub kind: DeltaKind,
    pub object: DynamicObject,
}

impl Delta {
    pub fn applied(object: DynamicObject) -> Self { Self { kind: DeltaKind::Applied, object } }
    pub fn deleted(object: DynamicObject) -> Self { Self { kind: DeltaKind::Deleted, object } }
}

// ---- sharding primitives ----

/// 64-bit FNV-1a hasher.
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a(u64);

impl Default for Fnv1a {
    fn default() -> Self { Self(0xcbf29ce484222325) } // 64-bit FNV-1a offset
}

impl Fnv1a {
    pub fn write(&mut self, bytes: &[u8]) {
        for b in bytes { self.0 ^= *b as u64; self.0 = self.0.wrapping_mul(0x100000001b3); }
    }

    pub fn finish(&self) -> u64 { self.0 }
}

/// Planner responsible for mapping a trigger key onto one of N queue shards.
pub trait ShardPlanner: Send + Sync {
    fn plan(&self, id: &ObjectId) -> usize;
}

/// Default planner: modulo bucketing over the FNV-1a hash of the whole key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModuloKeyPlanner { buckets: usize }

impl ModuloKeyPlanner {
    pub fn new(buckets: usize) -> Self {
        Self { buckets: buckets.max(1) }
    }
}

impl ShardPlanner for ModuloKeyPlanner {
    fn plan(&self, id: &ObjectId) -> usize {
        if self.buckets <= 1 { 0 } else { (id.fnv() % self.buckets as u64) as usize }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_keys_round_trip_through_display() {
        let core: Gvk = "v1/ConfigMap".parse().unwrap();
        assert_eq!(core, Gvk::new("", "v1", "ConfigMap"));
        assert_eq!(core.api_version(), "v1");
        assert_eq!(core.to_string(), "v1/ConfigMap");

        let apps: Gvk = "apps/v1/Deployment".parse().unwrap();
        assert_eq!(apps.api_version(), "apps/v1");
        assert_eq!(apps.key(), "apps/v1/Deployment");
        assert_eq!(Gvk::from_api_version("apps/v1", "Deployment"), apps);
    }

    #[test]
    fn gvk_parse_rejects_malformed_keys() {
        for bad in ["", "ConfigMap", "a/b/c/d", "/v1/Kind", "v1/"] {
            let e = bad.parse::<Gvk>().unwrap_err();
            assert!(e.to_string().contains("invalid gvk key"), "{bad}: {e}");
        }
    }

    #[test]
    fn object_key_treats_empty_namespace_as_cluster_scoped() {
        assert_eq!(ObjectKey::new(Some(""), "n"), ObjectKey::cluster("n"));
        assert_eq!(ObjectKey::namespaced("ns", "n").to_string(), "ns/n");
        assert_eq!(ObjectKey::cluster("n").to_string(), "n");
    }

    #[test]
    fn planner_is_stable_and_in_range() {
        let planner = ModuloKeyPlanner::new(4);
        let gvk = Gvk::new("", "v1", "ConfigMap");
        for i in 0..64 {
            let id = ObjectId::new(gvk.clone(), ObjectKey::namespaced("ns", &format!("cm-{i}")));
            let a = planner.plan(&id);
            assert!(a < 4);
            assert_eq!(a, planner.plan(&id.clone()));
        }
        assert_eq!(ModuloKeyPlanner::new(0).plan(&ObjectId::new(gvk, ObjectKey::cluster("x"))), 0);
    }

    #[test]
    fn fnv_distinguishes_namespace_from_name() {
        let gvk = Gvk::new("", "v1", "ConfigMap");
        let a = ObjectId::new(gvk.clone(), ObjectKey::namespaced("ab", "c"));
        let b = ObjectId::new(gvk, ObjectKey::namespaced("a", "bc"));
        assert_ne!(a.fnv(), b.fnv());
    }
}
