//! JSON merge patch (RFC 7386) helpers and the three-way patch used for updates.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

/// Server-populated metadata that never takes part in a comparison.
const NOISY_METADATA: &[&str] = &[
    "managedFields",
    "resourceVersion",
    "uid",
    "generation",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "ownerReferences",
    "selfLink",
];

/// Drop fields owned by the server (and `status`) so that they are neither diffed nor patched.
pub fn strip_noisy(mut v: Json, skip_annotations: &[&str]) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for k in NOISY_METADATA {
            meta.remove(*k);
        }
        if let Some(ann) = meta.get_mut("annotations").and_then(|a| a.as_object_mut()) {
            for k in skip_annotations {
                ann.remove(*k);
            }
        }
        if meta.get("annotations").and_then(|a| a.as_object()).map(|a| a.is_empty()).unwrap_or(false) {
            meta.remove("annotations");
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Three-way JSON merge patch.
///
/// `modified` fields that differ from `current` are set; objects present on both sides
/// are patched recursively; fields present in `original` but gone from `modified` are
/// removed when `current` still has them. Everything else in `current`, including manual
/// edits to unmanaged fields, is left untouched. Arrays are replaced whole.
pub fn three_way_patch(original: &Json, modified: &Json, current: &Json) -> Json {
    let empty = Map::new();
    let orig = original.as_object().unwrap_or(&empty);
    let cur = current.as_object().unwrap_or(&empty);
    let mut patch = Map::new();
    if let Some(modi) = modified.as_object() {
        for (k, mv) in modi.iter() {
            match (mv, cur.get(k)) {
                (Json::Object(_), Some(cv @ Json::Object(_))) => {
                    let ov = orig.get(k).filter(|v| v.is_object()).cloned().unwrap_or(Json::Object(Map::new()));
                    let sub = three_way_patch(&ov, mv, cv);
                    if !is_empty_patch(&sub) {
                        patch.insert(k.clone(), sub);
                    }
                }
                (mv, Some(cv)) if mv == cv => {}
                (mv, _) => {
                    patch.insert(k.clone(), mv.clone());
                }
            }
        }
        for k in orig.keys() {
            if !modi.contains_key(k) && cur.contains_key(k) {
                patch.insert(k.clone(), Json::Null);
            }
        }
    }
    Json::Object(patch)
}

pub fn is_empty_patch(patch: &Json) -> bool {
    match patch {
        Json::Object(m) => m.is_empty(),
        Json::Null => true,
        _ => false,
    }
}

/// Apply an RFC 7386 merge patch in place.
pub fn merge_patch(target: &mut Json, patch: &Json) {
    let Json::Object(pm) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(Map::new());
    }
    if let Json::Object(tm) = target {
        for (k, pv) in pm.iter() {
            if pv.is_null() {
                tm.remove(k);
            } else {
                merge_patch(tm.entry(k.clone()).or_insert(Json::Null), pv);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// Count leaf-level differences between `target` and `base`, for logging.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                s.updates += (0..min_len).filter(|i| aa[*i] != bb[*i]).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}
