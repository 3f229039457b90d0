//! Tether apply: reconcile a declared set of objects against the store.
//!
//! An [`Apply`] is bound to an identity (optional owner plus subcontext). Applying a
//! desired [`ObjectSet`] creates missing objects, patches existing ones with a
//! three-way merge against their last-applied record, and prunes objects carrying the
//! same identity that are no longer desired. Identities with different subcontexts
//! never touch each other's objects.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use kube::core::DynamicObject;
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value as Json;
use tether_core::{Backend, Gvk, LabelSelector, ListQuery, ObjectExt, ObjectId, ObjectSet};
use tracing::{debug, info};

mod error;
mod merge;
mod owner;

pub use error::ApplyError;
pub use merge::{diff_summary, merge_patch, strip_noisy, three_way_patch, DiffSummary};
pub use owner::{
    decode_applied, encode_applied, read_applied_kinds, write_applied_kinds, Identity, Owner, Recorded, ANN_APPLIED,
    ANN_APPLIED_KINDS, ANN_OWNER_GVK, ANN_OWNER_NAME, ANN_OWNER_NAMESPACE, ANN_SET_ID, LABEL_HASH,
};

const MAX_ATTEMPTS: u32 = 3;

/// What happened to each object during one apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub created: Vec<ObjectId>,
    pub updated: Vec<ObjectId>,
    pub unchanged: Vec<ObjectId>,
    pub deleted: Vec<ObjectId>,
}

impl ApplyReport {
    /// Number of store writes issued.
    pub fn mutations(&self) -> usize { self.created.len() + self.updated.len() + self.deleted.len() }

    pub fn is_noop(&self) -> bool { self.mutations() == 0 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Created,
    Updated,
    Unchanged,
}

/// State shared by every clone of one engine.
#[derive(Default)]
struct Shared {
    /// target subcontext -> subcontexts it may take objects over from
    migrations: RwLock<FxHashMap<String, BTreeSet<String>>>,
    /// identity hash -> kinds applied under it, for owner-less identities (owners carry their own record)
    applied_kinds: RwLock<FxHashMap<String, BTreeSet<Gvk>>>,
    known_kinds: RwLock<BTreeSet<Gvk>>,
}

/// Apply engine handle. Cloning is cheap; builder methods return a re-scoped copy.
#[derive(Clone)]
pub struct Apply {
    backend: Arc<dyn Backend>,
    shared: Arc<Shared>,
    identity: Identity,
    prune_kinds: Option<Vec<Gvk>>,
    no_prune: bool,
    owner_reference: bool,
}

impl Apply {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            shared: Arc::new(Shared::default()),
            identity: Identity { owner: None, set_id: String::new() },
            prune_kinds: None,
            no_prune: false,
            owner_reference: true,
        }
    }

    pub fn identity(&self) -> &Identity { &self.identity }

    pub fn with_owner(mut self, owner: &DynamicObject) -> Result<Self, ApplyError> {
        self.identity.owner = Some(Owner::of(owner)?);
        Ok(self)
    }

    pub fn with_set_id(mut self, set_id: &str) -> Self {
        self.identity.set_id = set_id.to_string();
        self
    }

    /// Restrict pruning to these kinds.
    pub fn with_prune_kinds(mut self, kinds: impl IntoIterator<Item = Gvk>) -> Self {
        self.prune_kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn with_no_prune(mut self, no_prune: bool) -> Self {
        self.no_prune = no_prune;
        self
    }

    /// Whether to add a native owner reference when the owner allows it (default on).
    pub fn with_owner_reference(mut self, enabled: bool) -> Self {
        self.owner_reference = enabled;
        self
    }

    /// Kinds always considered for pruning by every identity of this engine.
    pub fn with_known_kinds(self, kinds: impl IntoIterator<Item = Gvk>) -> Self {
        self.register_known_kinds(kinds);
        self
    }

    pub fn register_known_kinds(&self, kinds: impl IntoIterator<Item = Gvk>) {
        self.shared.known_kinds.write().unwrap_or_else(|e| e.into_inner()).extend(kinds);
    }

    /// Allow objects recorded under subcontext `from` to be taken over by subcontext `to`
    /// of the same owner.
    pub fn register_migration(&self, from: &str, to: &str) {
        self.shared
            .migrations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(to.to_string())
            .or_default()
            .insert(from.to_string());
    }

    fn migrations_into(&self, set_id: &str) -> Vec<String> {
        self.shared
            .migrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(set_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn prune_scope(&self, desired: &ObjectSet, hashes: &[String], recorded: &BTreeSet<Gvk>) -> Vec<Gvk> {
        let mut scope: Vec<Gvk> = Vec::new();
        let mut push = |g: &Gvk| {
            if !scope.contains(g) {
                scope.push(g.clone());
            }
        };
        if let Some(kinds) = &self.prune_kinds {
            kinds.iter().for_each(&mut push);
            return scope;
        }
        desired.kinds().iter().for_each(&mut push);
        recorded.iter().for_each(&mut push);
        {
            let applied = self.shared.applied_kinds.read().unwrap_or_else(|e| e.into_inner());
            for h in hashes {
                applied.get(h).into_iter().flatten().for_each(&mut push);
            }
        }
        self.shared.known_kinds.read().unwrap_or_else(|e| e.into_inner()).iter().for_each(&mut push);
        scope
    }

    /// Objects of `scope` currently carrying one of `hashes`, keyed by identity.
    async fn list_owned(&self, scope: &[Gvk], hashes: &[String]) -> Result<Vec<(ObjectId, DynamicObject)>, ApplyError> {
        let mut out = Vec::new();
        for gvk in scope {
            let mut per_kind: BTreeMap<ObjectId, DynamicObject> = BTreeMap::new();
            for h in hashes {
                let query = ListQuery::all().with_labels(LabelSelector::from_pairs([(LABEL_HASH, h.as_str())]));
                let items = self.backend.list(gvk, &query).await.map_err(|e| ApplyError::store("list", gvk, e))?;
                for o in items {
                    let Some(rec) = Recorded::read(&o) else { continue };
                    if !rec.same_owner(&self.identity) {
                        continue;
                    }
                    if let Ok(id) = o.object_id() {
                        per_kind.insert(id, o);
                    }
                }
            }
            out.extend(per_kind);
        }
        Ok(out)
    }

    /// Reconcile the store so that the objects owned by this identity are exactly `desired`
    /// (within the prune scope).
    pub async fn apply(&self, desired: ObjectSet) -> Result<ApplyReport, ApplyError> {
        let hash = self.identity.hash();
        let migrated = self.migrations_into(&self.identity.set_id);
        let mut hashes = vec![hash.clone()];
        hashes.extend(migrated.iter().map(|from| self.identity.with_set_id(from).hash()));

        let owner = self.load_owner().await?;
        let owned = if self.no_prune {
            Vec::new()
        } else {
            let recorded = owner.as_ref().map(read_applied_kinds).unwrap_or_default();
            let recorded: BTreeSet<Gvk> = std::iter::once(&self.identity.set_id)
                .chain(migrated.iter())
                .filter_map(|set_id| recorded.get(set_id))
                .flatten()
                .cloned()
                .collect();
            let scope = self.prune_scope(&desired, &hashes, &recorded);
            self.list_owned(&scope, &hashes).await?
        };

        let mut report = ApplyReport::default();
        for (_, obj) in desired.iter() {
            let (id, change) = self.reconcile_one(obj, true).await?;
            match change {
                Change::Created => report.created.push(id),
                Change::Updated => report.updated.push(id),
                Change::Unchanged => report.unchanged.push(id),
            }
        }
        if self.identity.owner.is_none() {
            self.shared
                .applied_kinds
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .entry(hash)
                .or_default()
                .extend(desired.kinds().iter().cloned());
        }

        for (id, _) in owned.iter().rev() {
            if desired.contains(id) {
                continue;
            }
            match self.backend.delete(&id.gvk, &id.key).await {
                Ok(()) => {
                    counter!("apply_deleted_total", 1u64);
                    info!(key = %id, set_id = %self.identity.set_id, "pruned");
                    report.deleted.push(id.clone());
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(ApplyError::store("delete", id, e)),
            }
        }
        if let Some(owner) = owner {
            self.record_kinds(owner, desired.kinds().iter().cloned().collect(), &migrated).await?;
        }
        debug!(
            set_id = %self.identity.set_id,
            owner = ?self.identity.owner.as_ref().map(|o| o.to_string()),
            created = report.created.len(),
            updated = report.updated.len(),
            unchanged = report.unchanged.len(),
            deleted = report.deleted.len(),
            "apply finished"
        );
        Ok(report)
    }

    /// Create-or-update each object without ownership bookkeeping. Never deletes.
    pub async fn ensure(&self, objects: Vec<DynamicObject>) -> Result<ApplyReport, ApplyError> {
        let mut report = ApplyReport::default();
        for obj in objects.iter() {
            let (id, change) = self.reconcile_one(obj, false).await?;
            match change {
                Change::Created => report.created.push(id),
                Change::Updated => report.updated.push(id),
                Change::Unchanged => report.unchanged.push(id),
            }
        }
        Ok(report)
    }

    /// Fetch the owner recorded on `obj`.
    pub async fn find_owner(&self, obj: &DynamicObject) -> Result<DynamicObject, ApplyError> {
        let id = obj.object_id().map_err(|e| ApplyError::Invalid(e.to_string()))?;
        let owner = Recorded::read(obj).and_then(|r| r.owner).ok_or_else(|| ApplyError::NotOwned(id.clone()))?;
        match self.backend.get(&owner.gvk, &owner.key).await {
            Ok(o) => Ok(o),
            Err(e) if e.is_not_found() => Err(ApplyError::OwnerNotFound { id, owner }),
            Err(e) => Err(ApplyError::store("get owner", &owner, e)),
        }
    }

    /// Delete `obj` if its recorded owner no longer exists. Returns whether it was deleted.
    pub async fn purge_orphan(&self, obj: &DynamicObject) -> Result<bool, ApplyError> {
        match self.find_owner(obj).await {
            Ok(_) | Err(ApplyError::NotOwned(_)) => Ok(false),
            Err(ApplyError::OwnerNotFound { id, owner }) => match self.backend.delete(&id.gvk, &id.key).await {
                Ok(()) => {
                    counter!("apply_deleted_total", 1u64);
                    info!(key = %id, owner = %owner, "purged orphan");
                    Ok(true)
                }
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(ApplyError::store("delete", &id, e)),
            },
            Err(e) => Err(e),
        }
    }

    async fn load_owner(&self) -> Result<Option<DynamicObject>, ApplyError> {
        let Some(owner) = &self.identity.owner else { return Ok(None) };
        self.backend.get_opt(&owner.gvk, &owner.id().key).await.map_err(|e| ApplyError::store("get owner", owner, e))
    }

    /// Persist on the owner which kinds this subcontext now has children of. A full prune
    /// replaces the entry (and those of migrated-from subcontexts); a narrowed one only adds.
    async fn record_kinds(&self, mut owner: DynamicObject, kinds: BTreeSet<Gvk>, migrated: &[String]) -> Result<(), ApplyError> {
        let replace = self.prune_kinds.is_none() && !self.no_prune;
        let who = self.identity.owner.as_ref().map(|o| o.to_string()).unwrap_or_default();
        for attempt in 1..=MAX_ATTEMPTS {
            let before = read_applied_kinds(&owner);
            let mut next = before.clone();
            if replace {
                for from in migrated {
                    next.remove(from);
                }
                next.insert(self.identity.set_id.clone(), kinds.clone());
            } else {
                next.entry(self.identity.set_id.clone()).or_default().extend(kinds.iter().cloned());
            }
            next.retain(|_, k| !k.is_empty());
            if next == before {
                return Ok(());
            }
            write_applied_kinds(&mut owner, &next);
            match self.backend.update(&owner).await {
                Ok(_) => {
                    debug!(owner = %who, set_id = %self.identity.set_id, "applied kinds recorded");
                    return Ok(());
                }
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) if e.is_conflict() && attempt < MAX_ATTEMPTS => {
                    counter!("apply_conflict_retries_total", 1u64);
                    match self.load_owner().await? {
                        Some(fresh) => owner = fresh,
                        None => return Ok(()),
                    }
                }
                Err(e) => return Err(ApplyError::store("record kinds on", &who, e)),
            }
        }
        Ok(())
    }

    fn check_ownership(&self, id: &ObjectId, current: &DynamicObject) -> Result<(), ApplyError> {
        let Some(rec) = Recorded::read(current) else {
            debug!(key = %id, "adopting unowned object");
            return Ok(());
        };
        if rec.same_owner(&self.identity) {
            if rec.set_id == self.identity.set_id {
                return Ok(());
            }
            if self.migrations_into(&self.identity.set_id).contains(&rec.set_id) {
                info!(key = %id, from = %rec.set_id, to = %self.identity.set_id, "migrating ownership");
                return Ok(());
            }
        }
        Err(ApplyError::OwnedByOther { id: id.clone(), owner: rec.describe(), set_id: rec.set_id })
    }

    async fn reconcile_one(&self, desired: &DynamicObject, owned: bool) -> Result<(ObjectId, Change), ApplyError> {
        let id = desired.object_id().map_err(|e| ApplyError::Invalid(e.to_string()))?;
        let mut want = desired.clone();
        if owned {
            self.identity.stamp(&mut want);
        }
        let want_json = strip_noisy(to_json(&id, &want)?, &[ANN_APPLIED]);
        let applied = encode_applied(&id, &want_json)?;
        let owner_ref = if owned && self.owner_reference {
            self.identity
                .owner
                .as_ref()
                .filter(|o| o.can_reference(id.namespace()))
                .and_then(|o| o.owner_reference())
        } else {
            None
        };

        for attempt in 1..=MAX_ATTEMPTS {
            let current = self.backend.get_opt(&id.gvk, &id.key).await.map_err(|e| ApplyError::store("get", &id, e))?;
            match current {
                None => {
                    let mut obj = want.clone();
                    obj.metadata.resource_version = None;
                    obj.metadata.annotations.get_or_insert_with(BTreeMap::new).insert(ANN_APPLIED.into(), applied.clone());
                    if let Some(r) = &owner_ref {
                        obj.metadata.owner_references.get_or_insert_with(Vec::new).push(r.clone());
                    }
                    match self.backend.create(&obj).await {
                        Ok(_) => {
                            counter!("apply_created_total", 1u64);
                            info!(key = %id, set_id = %self.identity.set_id, "created");
                            return Ok((id, Change::Created));
                        }
                        Err(e) if e.is_already_exists() => {
                            counter!("apply_conflict_retries_total", 1u64);
                            debug!(key = %id, attempt, "create raced with another writer; retrying");
                        }
                        Err(e) => return Err(ApplyError::store("create", &id, e)),
                    }
                }
                Some(cur) => {
                    if owned {
                        self.check_ownership(&id, &cur)?;
                    }
                    let stored = cur.annotation(ANN_APPLIED).and_then(decode_applied);
                    let original = stored.clone().unwrap_or_else(|| Json::Object(Default::default()));
                    let cur_full = to_json(&id, &cur)?;
                    let cur_json = strip_noisy(cur_full.clone(), &[ANN_APPLIED]);
                    let patch = three_way_patch(&original, &want_json, &cur_json);
                    let needs_ref = owner_ref
                        .as_ref()
                        .map(|r| !cur.metadata.owner_references.iter().flatten().any(|x| x.uid == r.uid))
                        .unwrap_or(false);
                    let record_stale = stored.as_ref() != Some(&want_json);
                    if merge::is_empty_patch(&patch) && !needs_ref && !record_stale {
                        debug!(key = %id, "unchanged");
                        return Ok((id, Change::Unchanged));
                    }
                    debug!(key = %id, diff = ?diff_summary(&want_json, &cur_json), "patching");

                    let mut merged = cur_full;
                    merge_patch(&mut merged, &patch);
                    let mut next: DynamicObject = serde_json::from_value(merged)
                        .map_err(|e| ApplyError::Invalid(format!("{}: patched object: {}", id, e)))?;
                    next.metadata.annotations.get_or_insert_with(BTreeMap::new).insert(ANN_APPLIED.into(), applied.clone());
                    if needs_ref {
                        if let Some(r) = &owner_ref {
                            next.metadata.owner_references.get_or_insert_with(Vec::new).push(r.clone());
                        }
                    }
                    match self.backend.update(&next).await {
                        Ok(_) => {
                            counter!("apply_updated_total", 1u64);
                            info!(key = %id, set_id = %self.identity.set_id, "updated");
                            return Ok((id, Change::Updated));
                        }
                        Err(e) if e.is_conflict() => {
                            counter!("apply_conflict_retries_total", 1u64);
                            debug!(key = %id, attempt, error = %e, "update conflicted; retrying");
                        }
                        Err(e) => return Err(ApplyError::store("update", &id, e)),
                    }
                }
            }
        }
        Err(ApplyError::ConflictRetriesExhausted { id, attempts: MAX_ATTEMPTS })
    }
}

fn to_json(id: &ObjectId, obj: &DynamicObject) -> Result<Json, ApplyError> {
    serde_json::to_value(obj).map_err(|e| ApplyError::Encode { id: id.clone(), message: e.to_string() })
}
