//! Ownership metadata stamped on applied objects and the last-applied record.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{Read, Write};

use base64::Engine;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use serde_json::Value as Json;
use tether_core::{Fnv1a, Gvk, ObjectExt, ObjectId, ObjectKey};

use crate::ApplyError;

pub const ANN_SET_ID: &str = "tether.dev/id";
pub const ANN_OWNER_GVK: &str = "tether.dev/owner-gvk";
pub const ANN_OWNER_NAME: &str = "tether.dev/owner-name";
pub const ANN_OWNER_NAMESPACE: &str = "tether.dev/owner-namespace";
pub const ANN_APPLIED: &str = "tether.dev/applied";
pub const LABEL_HASH: &str = "tether.dev/hash";
/// On the owner: subcontext -> kinds applied under it, so a later engine knows what to prune.
pub const ANN_APPLIED_KINDS: &str = "tether.dev/applied-kinds";

/// Applied records larger than this are stored gzip-compressed and base64-encoded.
const COMPRESS_ABOVE: usize = 2048;

/// Identity of the object that owns a desired set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub gvk: Gvk,
    pub namespace: Option<String>,
    pub name: String,
    pub uid: Option<String>,
}

impl Owner {
    pub fn of(obj: &DynamicObject) -> Result<Self, ApplyError> {
        let id = obj.object_id().map_err(|e| ApplyError::Invalid(format!("owner: {}", e)))?;
        Ok(Self { gvk: id.gvk, namespace: id.key.namespace, name: id.key.name, uid: obj.metadata.uid.clone() })
    }

    pub fn id(&self) -> ObjectId {
        ObjectId::new(self.gvk.clone(), ObjectKey::new(self.namespace.as_deref(), &self.name))
    }

    /// Native owner reference; only usable when the owner's uid is known.
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        let uid = self.uid.clone()?;
        Some(OwnerReference {
            api_version: self.gvk.api_version(),
            kind: self.gvk.kind.clone(),
            name: self.name.clone(),
            uid,
            block_owner_deletion: Some(true),
            controller: None,
        })
    }

    /// A native reference is only valid for same-namespace or cluster-scoped owners.
    pub fn can_reference(&self, child_namespace: Option<&str>) -> bool {
        match &self.namespace {
            None => true,
            Some(ns) => child_namespace == Some(ns.as_str()),
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.id()) }
}

/// Owner plus subcontext: the unit that owns a slice of children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub owner: Option<Owner>,
    pub set_id: String,
}

impl Identity {
    /// Stable short hash used as the list selector label. The owner uid is left out so a
    /// recreated owner adopts the children of its predecessor.
    pub fn hash(&self) -> String {
        let mut h = Fnv1a::default();
        if let Some(o) = &self.owner {
            h.write(o.gvk.key().as_bytes());
            h.write(b"\0");
            h.write(o.namespace.as_deref().unwrap_or("").as_bytes());
            h.write(b"\0");
            h.write(o.name.as_bytes());
        }
        h.write(b"\0");
        h.write(self.set_id.as_bytes());
        format!("{:016x}", h.finish())
    }

    pub fn with_set_id(&self, set_id: &str) -> Identity {
        Identity { owner: self.owner.clone(), set_id: set_id.to_string() }
    }

    /// Write the identity annotations and hash label onto `obj`.
    pub fn stamp(&self, obj: &mut DynamicObject) {
        let ann = obj.metadata.annotations.get_or_insert_with(BTreeMap::new);
        ann.insert(ANN_SET_ID.into(), self.set_id.clone());
        match &self.owner {
            Some(o) => {
                ann.insert(ANN_OWNER_GVK.into(), o.gvk.key());
                ann.insert(ANN_OWNER_NAME.into(), o.name.clone());
                match &o.namespace {
                    Some(ns) => { ann.insert(ANN_OWNER_NAMESPACE.into(), ns.clone()); }
                    None => { ann.remove(ANN_OWNER_NAMESPACE); }
                }
            }
            None => {
                ann.remove(ANN_OWNER_GVK);
                ann.remove(ANN_OWNER_NAME);
                ann.remove(ANN_OWNER_NAMESPACE);
            }
        }
        obj.metadata.labels.get_or_insert_with(BTreeMap::new).insert(LABEL_HASH.into(), self.hash());
    }
}

/// Ownership as recorded on an existing object, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub owner: Option<ObjectId>,
    pub set_id: String,
    pub hash: Option<String>,
}

impl Recorded {
    pub fn read(obj: &DynamicObject) -> Option<Self> {
        let set_id = obj.annotation(ANN_SET_ID);
        let owner_gvk = obj.annotation(ANN_OWNER_GVK);
        if set_id.is_none() && owner_gvk.is_none() {
            return None;
        }
        let owner = owner_gvk.and_then(|g| g.parse::<Gvk>().ok()).and_then(|gvk| {
            let name = obj.annotation(ANN_OWNER_NAME)?;
            Some(ObjectId::new(gvk, ObjectKey::new(obj.annotation(ANN_OWNER_NAMESPACE), name)))
        });
        Some(Self {
            owner,
            set_id: set_id.unwrap_or("").to_string(),
            hash: obj.label(LABEL_HASH).map(|s| s.to_string()),
        })
    }

    pub fn describe(&self) -> String {
        match &self.owner {
            Some(o) => o.to_string(),
            None => "<no owner>".to_string(),
        }
    }

    pub fn same_owner(&self, identity: &Identity) -> bool {
        self.owner.as_ref() == identity.owner.as_ref().map(|o| o.id()).as_ref()
    }
}

/// Serialize the last-applied record, compressing large payloads.
pub fn encode_applied(id: &ObjectId, v: &Json) -> Result<String, ApplyError> {
    let raw = serde_json::to_string(v).map_err(|e| ApplyError::Encode { id: id.clone(), message: e.to_string() })?;
    if raw.len() <= COMPRESS_ABOVE {
        return Ok(raw);
    }
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(raw.as_bytes())
        .and_then(|_| enc.finish())
        .map(|buf| base64::engine::general_purpose::STANDARD.encode(buf))
        .map_err(|e| ApplyError::Encode { id: id.clone(), message: e.to_string() })
}

/// Inverse of [`encode_applied`]. Unreadable records decode to `None` and are treated as absent.
pub fn decode_applied(s: &str) -> Option<Json> {
    let s = s.trim();
    if s.starts_with('{') {
        return serde_json::from_str(s).ok();
    }
    let bytes = base64::engine::general_purpose::STANDARD.decode(s).ok()?;
    let mut out = String::new();
    GzDecoder::new(bytes.as_slice()).read_to_string(&mut out).ok()?;
    serde_json::from_str(&out).ok()
}

/// Kinds recorded on an owner per subcontext. Unparsable entries are skipped.
pub fn read_applied_kinds(owner: &DynamicObject) -> BTreeMap<String, BTreeSet<Gvk>> {
    let Some(raw) = owner.annotation(ANN_APPLIED_KINDS) else { return BTreeMap::new() };
    let parsed: BTreeMap<String, Vec<String>> = serde_json::from_str(raw).unwrap_or_default();
    parsed
        .into_iter()
        .map(|(set_id, kinds)| (set_id, kinds.iter().filter_map(|k| k.parse::<Gvk>().ok()).collect::<BTreeSet<_>>()))
        .filter(|(_, kinds)| !kinds.is_empty())
        .collect()
}

/// Store `kinds` on `owner`; an empty record removes the annotation.
pub fn write_applied_kinds(owner: &mut DynamicObject, kinds: &BTreeMap<String, BTreeSet<Gvk>>) {
    let kinds: BTreeMap<&str, Vec<String>> = kinds
        .iter()
        .filter(|(_, k)| !k.is_empty())
        .map(|(set_id, k)| (set_id.as_str(), k.iter().map(|g| g.key()).collect()))
        .collect();
    if kinds.is_empty() {
        if let Some(ann) = owner.metadata.annotations.as_mut() {
            ann.remove(ANN_APPLIED_KINDS);
        }
        return;
    }
    let raw = Json::Object(kinds.into_iter().map(|(k, v)| (k.to_string(), v.into())).collect()).to_string();
    owner.metadata.annotations.get_or_insert_with(BTreeMap::new).insert(ANN_APPLIED_KINDS.into(), raw);
}
