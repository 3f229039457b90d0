use std::collections::BTreeMap;

use kube::core::DynamicObject;
use rustc_hash::FxHashMap;

use crate::{Gvk, ObjectExt, ObjectId, ObjectKey, StoreError};

/// Objects keyed by identity, grouped by kind in first-insertion order.
#[derive(Debug, Clone, Default)]
pub struct ObjectSet {
    order: Vec<Gvk>,
    objects: FxHashMap<Gvk, BTreeMap<ObjectKey, DynamicObject>>,
}

impl ObjectSet {
    pub fn new() -> Self { Self::default() }

    /// Insert (or replace) an object. The object must carry `apiVersion`, `kind` and a name.
    pub fn add(&mut self, obj: DynamicObject) -> Result<ObjectId, StoreError> {
        let id = obj.object_id()?;
        if !self.objects.contains_key(&id.gvk) {
            self.order.push(id.gvk.clone());
        }
        self.objects.entry(id.gvk.clone()).or_default().insert(id.key.clone(), obj);
        Ok(id)
    }

    pub fn get(&self, id: &ObjectId) -> Option<&DynamicObject> {
        self.objects.get(&id.gvk).and_then(|m| m.get(&id.key))
    }

    pub fn contains(&self, id: &ObjectId) -> bool { self.get(id).is_some() }

    pub fn len(&self) -> usize { self.objects.values().map(|m| m.len()).sum() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Kinds in the order they were first added.
    pub fn kinds(&self) -> &[Gvk] { &self.order }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &DynamicObject)> + '_ {
        self.order.iter().flat_map(move |gvk| {
            self.objects
                .get(gvk)
                .into_iter()
                .flat_map(move |m| m.iter().map(move |(k, o)| (ObjectId::new(gvk.clone(), k.clone()), o)))
        })
    }

    pub fn merge(&mut self, other: ObjectSet) {
        let ObjectSet { order, mut objects } = other;
        for gvk in order {
            if let Some(items) = objects.remove(&gvk) {
                if !self.objects.contains_key(&gvk) {
                    self.order.push(gvk.clone());
                }
                self.objects.entry(gvk).or_default().extend(items);
            }
        }
    }
}
