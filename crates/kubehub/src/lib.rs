//! Tether kubehub: the `Backend` contract over a live Kubernetes API server.

#![forbid(unsafe_code)]

use std::sync::{Arc, RwLock};

use anyhow::Result;
use futures::{stream, StreamExt};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject, TypeMeta},
    discovery::{self, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use rustc_hash::FxHashMap;
use tether_core::{Backend, Delta, DeltaStream, Gvk, ListQuery, ObjectExt, ObjectId, ObjectKey, StoreError};
use tokio::sync::OnceCell;
use tracing::{debug, info};

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Shared kube client built from the ambient kubeconfig or in-cluster config.
pub async fn get_kube_client() -> Result<Client> {
    let client = CLIENT.get_or_try_init(|| async { Client::try_default().await }).await?;
    Ok(client.clone())
}

type Resources = FxHashMap<Gvk, (ApiResource, bool)>;

/// `Backend` implementation talking to the API server. Kind resolution goes through
/// discovery once per kind and is cached for the lifetime of the backend.
#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
    resources: Arc<RwLock<Resources>>,
}

impl KubeBackend {
    pub fn new(client: Client) -> Self {
        Self { client, resources: Arc::new(RwLock::new(FxHashMap::default())) }
    }

    pub async fn try_default() -> Result<Self> { Ok(Self::new(get_kube_client().await?)) }

    async fn resource(&self, gvk: &Gvk) -> Result<(ApiResource, bool), StoreError> {
        if let Some(hit) = self.resources.read().unwrap_or_else(|e| e.into_inner()).get(gvk).cloned() {
            return Ok(hit);
        }
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk.to_kube()).await.map_err(|e| match e {
            kube::Error::Api(ae) if ae.code == 404 => {
                StoreError::Invalid(format!("kind {} is not served by the cluster", gvk))
            }
            other => StoreError::Transient(other.to_string()),
        })?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(gvk = %gvk, plural = %ar.plural, namespaced, "resolved api resource");
        self.resources
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(gvk.clone(), (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }

    async fn api(&self, gvk: &Gvk, namespace: Option<&str>) -> Result<Api<DynamicObject>, StoreError> {
        let (ar, namespaced) = self.resource(gvk).await?;
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }

    /// Api scoped to exactly one object; namespaced kinds require a namespace.
    async fn object_api(&self, id: &ObjectId) -> Result<Api<DynamicObject>, StoreError> {
        let (_, namespaced) = self.resource(&id.gvk).await?;
        if namespaced && id.namespace().is_none() {
            return Err(StoreError::Invalid(format!("{}: namespace required for namespaced kind", id)));
        }
        self.api(&id.gvk, id.namespace()).await
    }
}

/// List responses omit per-item apiVersion/kind; restore them so every object is self-describing.
fn with_types(mut obj: DynamicObject, gvk: &Gvk) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta { api_version: gvk.api_version(), kind: gvk.kind.clone() });
    }
    obj
}

fn map_kube_err(id: ObjectId, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) => match ae.code {
            404 => StoreError::NotFound(id),
            409 if ae.reason == "AlreadyExists" => StoreError::AlreadyExists(id),
            409 => StoreError::Conflict { id, message: ae.message },
            400 | 422 => StoreError::Invalid(format!("{}: {}", id, ae.message)),
            _ => StoreError::Transient(format!("{}: {} ({})", id, ae.message, ae.code)),
        },
        other => StoreError::Transient(format!("{}: {}", id, other)),
    }
}

/// Turn one watcher event into deltas. A restart reports the full current list, so any
/// object known before the restart and absent from the list is emitted as deleted.
fn event_deltas(known: &mut FxHashMap<ObjectKey, DynamicObject>, gvk: &Gvk, ev: Event<DynamicObject>) -> Vec<Delta> {
    match ev {
        Event::Applied(o) => {
            let o = with_types(o, gvk);
            known.insert(o.object_key(), o.clone());
            vec![Delta::applied(o)]
        }
        Event::Deleted(o) => {
            let o = with_types(o, gvk);
            known.remove(&o.object_key());
            vec![Delta::deleted(o)]
        }
        Event::Restarted(list) => {
            let mut next: FxHashMap<ObjectKey, DynamicObject> = FxHashMap::default();
            let mut out = Vec::with_capacity(list.len());
            for o in list {
                let o = with_types(o, gvk);
                next.insert(o.object_key(), o.clone());
                out.push(Delta::applied(o));
            }
            for (key, gone) in known.drain() {
                if !next.contains_key(&key) {
                    out.push(Delta::deleted(gone));
                }
            }
            *known = next;
            out
        }
    }
}

#[async_trait::async_trait]
impl Backend for KubeBackend {
    async fn get(&self, gvk: &Gvk, key: &ObjectKey) -> Result<DynamicObject, StoreError> {
        let id = ObjectId::new(gvk.clone(), key.clone());
        let api = self.object_api(&id).await?;
        let obj = api.get(&key.name).await.map_err(|e| map_kube_err(id, e))?;
        Ok(with_types(obj, gvk))
    }

    async fn list(&self, gvk: &Gvk, query: &ListQuery) -> Result<Vec<DynamicObject>, StoreError> {
        let api = self.api(gvk, query.namespace.as_deref()).await?;
        let mut lp = ListParams::default();
        if let Some(sel) = &query.labels {
            lp = lp.labels(&sel.to_string());
        }
        let list = api
            .list(&lp)
            .await
            .map_err(|e| StoreError::Transient(format!("list {}: {}", gvk, e)))?;
        Ok(list.items.into_iter().map(|o| with_types(o, gvk)).collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let id = obj.object_id()?;
        let api = self.object_api(&id).await?;
        let created = api.create(&PostParams::default(), obj).await.map_err(|e| map_kube_err(id.clone(), e))?;
        debug!(id = %id, "kube: created");
        Ok(with_types(created, &id.gvk))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let id = obj.object_id()?;
        let api = self.object_api(&id).await?;
        let updated = api
            .replace(id.name(), &PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_err(id.clone(), e))?;
        debug!(id = %id, rv = ?updated.metadata.resource_version, "kube: replaced");
        Ok(with_types(updated, &id.gvk))
    }

    async fn delete(&self, gvk: &Gvk, key: &ObjectKey) -> Result<(), StoreError> {
        let id = ObjectId::new(gvk.clone(), key.clone());
        let api = self.object_api(&id).await?;
        api.delete(&key.name, &DeleteParams::default()).await.map_err(|e| map_kube_err(id.clone(), e))?;
        debug!(id = %id, "kube: delete requested");
        Ok(())
    }

    fn watch(&self, gvk: &Gvk, query: &ListQuery) -> DeltaStream {
        let this = self.clone();
        let gvk = gvk.clone();
        let query = query.clone();
        stream::once(async move {
            let api = match this.api(&gvk, query.namespace.as_deref()).await {
                Ok(api) => api,
                Err(e) => return stream::once(async move { Err(e) }).boxed(),
            };
            let mut cfg = watcher::Config::default();
            if let Some(sel) = &query.labels {
                cfg = cfg.labels(&sel.to_string());
            }
            info!(gvk = %gvk, ns = ?query.namespace, "kube watcher started");
            watcher::watcher(api, cfg)
                .scan(FxHashMap::default(), move |known, ev| {
                    let out: Vec<Result<Delta, StoreError>> = match ev {
                        Ok(ev) => event_deltas(known, &gvk, ev).into_iter().map(Ok).collect(),
                        Err(e) => vec![Err(StoreError::Transient(format!("watch {}: {}", gvk, e)))],
                    };
                    futures::future::ready(Some(stream::iter(out)))
                })
                .flatten()
                .boxed()
        })
        .flatten()
        .boxed()
    }
}
