use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tether_apply::{Apply, Recorded};
use tether_core::{new_object, Backend, DynamicObject, Gvk, ObjectExt, ObjectId, ObjectKey, StoreError};
use tether_dispatch::{
    middleware_fn, BackendSource, Dispatcher, ObjectSource, OutputPolicy, Route,
};
use tether_store::MemoryStore;
use tether_trigger::{Dispatch, Origin, WorkItem};
use tokio_util::sync::CancellationToken;

const FINALIZER: &str = "tether.dev/test";

fn deploy_gvk() -> Gvk { Gvk::new("apps", "v1", "Deployment") }
fn cm_gvk() -> Gvk { Gvk::new("", "v1", "ConfigMap") }

fn deploy_id(name: &str) -> ObjectId { ObjectId::new(deploy_gvk(), ObjectKey::namespaced("default", name)) }

fn item(name: &str) -> WorkItem { WorkItem { id: deploy_id(name), origin: Origin::WATCH } }

fn dispatcher(store: &Arc<MemoryStore>) -> Dispatcher {
    Dispatcher::new(store.clone(), Arc::new(BackendSource(store.clone())), Apply::new(store.clone()))
}

async fn create_deploy(store: &MemoryStore, name: &str, labels: &[(&str, &str)]) -> DynamicObject {
    let mut obj = new_object(&deploy_gvk(), Some("default"), name, json!({"spec": {"replicas": 1}}));
    if !labels.is_empty() {
        obj.metadata.labels = Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
    }
    store.create(&obj).await.unwrap()
}

async fn get(store: &MemoryStore, id: &ObjectId) -> Option<DynamicObject> { store.get_opt(&id.gvk, &id.key).await.unwrap() }

#[tokio::test(flavor = "multi_thread")]
async fn middleware_runs_in_order_and_can_short_circuit() {
    let store = Arc::new(MemoryStore::new());
    create_deploy(&store, "app", &[]).await;
    let d = dispatcher(&store);
    let log = Arc::new(Mutex::new(Vec::<String>::new()));

    let (l1, l2, l3) = (log.clone(), log.clone(), log.clone());
    d.register(
        Route::builder("ordered", deploy_gvk())
            .middleware(middleware_fn(move |req, resp, next| {
                let l = l1.clone();
                async move {
                    l.lock().unwrap().push("first".into());
                    next.run(req, resp).await
                }
            }))
            .middleware(middleware_fn(move |req, resp, next| {
                let l = l2.clone();
                async move {
                    l.lock().unwrap().push("second".into());
                    next.run(req, resp).await
                }
            }))
            .handle(move |req, _| {
                let l = l3.clone();
                async move {
                    l.lock().unwrap().push(format!("handler {}", req.id.name()));
                    Ok(())
                }
            })
            .build()
            .unwrap(),
    );
    let reached = Arc::new(AtomicUsize::new(0));
    let r = reached.clone();
    d.register(
        Route::builder("blocked", deploy_gvk())
            .middleware(middleware_fn(|_, _, _| async { Ok(()) }))
            .handle(move |_, _| {
                let r = r.clone();
                async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build()
            .unwrap(),
    );

    d.dispatch(item("app"), CancellationToken::new()).await.unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["first", "second", "handler app"]);
    assert_eq!(reached.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn filters_skip_non_matching_objects_and_missing_ones() {
    let store = Arc::new(MemoryStore::new());
    create_deploy(&store, "web", &[("tier", "web")]).await;
    create_deploy(&store, "db", &[("tier", "db")]).await;
    let d = dispatcher(&store);
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let s = seen.clone();
    d.register(
        Route::builder("web-only", deploy_gvk())
            .labels("tier=web")
            .handle(move |req, _| {
                let s = s.clone();
                async move {
                    s.lock().unwrap().push(req.id.name().to_string());
                    Ok(())
                }
            })
            .build()
            .unwrap(),
    );
    for name in ["web", "db", "gone"] {
        d.dispatch(item(name), CancellationToken::new()).await.unwrap();
    }
    assert_eq!(*seen.lock().unwrap(), vec!["web"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn finalizer_added_then_finalize_handler_runs_before_removal() {
    let store = Arc::new(MemoryStore::new());
    create_deploy(&store, "app", &[]).await;
    let d = dispatcher(&store);
    let handled = Arc::new(AtomicUsize::new(0));
    let finalized = Arc::new(AtomicUsize::new(0));
    let (h, f) = (handled.clone(), finalized.clone());
    d.register(
        Route::builder("lifecycle", deploy_gvk())
            .handle(move |_, _| {
                let h = h.clone();
                async move {
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .finalize(FINALIZER, move |req, _| {
                let f = f.clone();
                async move {
                    assert!(req.is_finalizing());
                    f.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build()
            .unwrap(),
    );

    d.dispatch(item("app"), CancellationToken::new()).await.unwrap();
    let obj = get(&store, &deploy_id("app")).await.unwrap();
    assert!(obj.has_finalizer(FINALIZER));
    assert_eq!(handled.load(Ordering::SeqCst), 1);

    store.delete(&deploy_gvk(), &deploy_id("app").key).await.unwrap();
    let marked = get(&store, &deploy_id("app")).await.unwrap();
    assert!(marked.is_deleting());

    d.dispatch(item("app"), CancellationToken::new()).await.unwrap();
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert!(get(&store, &deploy_id("app")).await.is_none());

    // Removed objects are skipped by default.
    d.dispatch(item("app"), CancellationToken::new()).await.unwrap();
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_finalize_handler_blocks_deletion() {
    let store = Arc::new(MemoryStore::new());
    create_deploy(&store, "app", &[]).await;
    let d = dispatcher(&store);
    let attempts = Arc::new(AtomicUsize::new(0));
    let a = attempts.clone();
    d.register(
        Route::builder("stubborn", deploy_gvk())
            .handle(|_, _| async { Ok(()) })
            .finalize(FINALIZER, move |_, _| {
                let a = a.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("cleanup failed")
                }
            })
            .build()
            .unwrap(),
    );
    d.dispatch(item("app"), CancellationToken::new()).await.unwrap();
    store.delete(&deploy_gvk(), &deploy_id("app").key).await.unwrap();

    for _ in 0..3 {
        let err = d.dispatch(item("app"), CancellationToken::new()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("cleanup failed"));
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let obj = get(&store, &deploy_id("app")).await.unwrap();
    assert!(obj.is_deleting());
    assert!(obj.has_finalizer(FINALIZER));
}

#[tokio::test(flavor = "multi_thread")]
async fn declared_outputs_are_applied_and_pruned_on_finalize() {
    let store = Arc::new(MemoryStore::new());
    create_deploy(&store, "app", &[]).await;
    let d = dispatcher(&store);
    d.register(
        Route::builder("meta", deploy_gvk())
            .outputs(OutputPolicy::set_id("deployment-meta"))
            .handle(|req, resp| async move {
                let name = format!("{}-meta", req.id.name());
                resp.add(new_object(&cm_gvk(), req.id.namespace(), &name, json!({"data": {"owner": req.id.name()}})))?;
                Ok(())
            })
            .finalize(FINALIZER, |_, _| async { Ok(()) })
            .build()
            .unwrap(),
    );

    d.dispatch(item("app"), CancellationToken::new()).await.unwrap();
    let child_id = ObjectId::new(cm_gvk(), ObjectKey::namespaced("default", "app-meta"));
    let child = get(&store, &child_id).await.unwrap();
    let rec = Recorded::read(&child).unwrap();
    assert_eq!(rec.set_id, "deployment-meta");
    assert_eq!(rec.owner, Some(deploy_id("app")));

    let before = store.mutations();
    d.dispatch(item("app"), CancellationToken::new()).await.unwrap();
    assert_eq!(store.mutations(), before);

    store.delete(&deploy_gvk(), &deploy_id("app").key).await.unwrap();
    d.dispatch(item("app"), CancellationToken::new()).await.unwrap();
    assert!(get(&store, &child_id).await.is_none());
    assert!(get(&store, &deploy_id("app")).await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn route_failures_are_aggregated_without_stopping_others() {
    let store = Arc::new(MemoryStore::new());
    create_deploy(&store, "app", &[]).await;
    let d = dispatcher(&store);
    let ran = Arc::new(AtomicUsize::new(0));
    d.register(
        Route::builder("broken", deploy_gvk())
            .error_prefix("syncing app")
            .handle(|_, _| async { anyhow::bail!("boom") })
            .build()
            .unwrap(),
    );
    let r = ran.clone();
    d.register(
        Route::builder("healthy", deploy_gvk())
            .handle(move |_, resp| {
                let r = r.clone();
                async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    resp.requeue_after(Duration::from_secs(30));
                    Ok(())
                }
            })
            .build()
            .unwrap(),
    );
    d.register(
        Route::builder("also-broken", deploy_gvk()).handle(|_, _| async { anyhow::bail!("bang") }).build().unwrap(),
    );

    let err = format!("{:#}", d.dispatch(item("app"), CancellationToken::new()).await.unwrap_err());
    assert!(err.contains("route broken: syncing app: boom"), "{}", err);
    assert!(err.contains("route also-broken: bang"), "{}", err);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn shortest_requeue_across_routes_wins() {
    let store = Arc::new(MemoryStore::new());
    create_deploy(&store, "app", &[]).await;
    let d = dispatcher(&store);
    for (name, secs) in [("slow", 60u64), ("fast", 5)] {
        d.register(
            Route::builder(name, deploy_gvk())
                .handle(move |_, resp| async move {
                    resp.requeue_after(Duration::from_secs(secs));
                    Ok(())
                })
                .build()
                .unwrap(),
        );
    }
    let out = d.dispatch(item("app"), CancellationToken::new()).await.unwrap();
    assert_eq!(out.requeue_after, Some(Duration::from_secs(5)));
    assert_eq!(d.kinds(), vec![deploy_gvk()]);
}

struct Tombstones {
    backend: Arc<MemoryStore>,
    last: Mutex<Option<Arc<DynamicObject>>>,
    forgotten: AtomicUsize,
}

#[async_trait::async_trait]
impl ObjectSource for Tombstones {
    async fn get(&self, id: &ObjectId) -> Result<Option<Arc<DynamicObject>>, StoreError> {
        Ok(self.backend.get_opt(&id.gvk, &id.key).await?.map(Arc::new))
    }

    fn tombstone(&self, _id: &ObjectId) -> Option<Arc<DynamicObject>> { self.last.lock().unwrap().clone() }

    fn forget_tombstone(&self, _id: &ObjectId) {
        self.forgotten.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn include_removed_routes_see_the_last_known_state() {
    let store = Arc::new(MemoryStore::new());
    let obj = create_deploy(&store, "app", &[("tier", "web")]).await;
    store.delete(&deploy_gvk(), &deploy_id("app").key).await.unwrap();
    let source = Arc::new(Tombstones { backend: store.clone(), last: Mutex::new(Some(Arc::new(obj))), forgotten: AtomicUsize::new(0) });
    let d = Dispatcher::new(store.clone(), source.clone(), Apply::new(store.clone()));

    let removed_seen = Arc::new(Mutex::new(Vec::<(bool, Option<String>)>::new()));
    let s = removed_seen.clone();
    d.register(
        Route::builder("cleanup", deploy_gvk())
            .labels("tier=web")
            .include_removed()
            .handle(move |req, _| {
                let s = s.clone();
                async move {
                    let tier = req.object().and_then(|o| o.label("tier")).map(|t| t.to_string());
                    s.lock().unwrap().push((req.removed, tier));
                    Ok(())
                }
            })
            .build()
            .unwrap(),
    );
    let skipped = Arc::new(AtomicUsize::new(0));
    let k = skipped.clone();
    d.register(
        Route::builder("default", deploy_gvk())
            .handle(move |_, _| {
                let k = k.clone();
                async move {
                    k.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build()
            .unwrap(),
    );

    d.dispatch(WorkItem { id: deploy_id("app"), origin: Origin::TRIGGER }, CancellationToken::new()).await.unwrap();
    assert_eq!(*removed_seen.lock().unwrap(), vec![(true, Some("web".to_string()))]);
    assert_eq!(skipped.load(Ordering::SeqCst), 0);
    assert_eq!(source.forgotten.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn finalizer_add_retries_conflicts() {
    let store = Arc::new(MemoryStore::new());
    create_deploy(&store, "app", &[]).await;
    let d = dispatcher(&store);
    d.register(
        Route::builder("retry", deploy_gvk())
            .handle(|_, _| async { Ok(()) })
            .finalize(FINALIZER, |_, _| async { Ok(()) })
            .build()
            .unwrap(),
    );
    store.inject_conflicts(2);
    d.dispatch(item("app"), CancellationToken::new()).await.unwrap();
    assert!(get(&store, &deploy_id("app")).await.unwrap().has_finalizer(FINALIZER));

    store.delete(&deploy_gvk(), &deploy_id("app").key).await.unwrap();
    store.inject_conflicts(3);
    assert!(d.dispatch(item("app"), CancellationToken::new()).await.is_err());
    assert!(get(&store, &deploy_id("app")).await.is_some());
    d.dispatch(item("app"), CancellationToken::new()).await.unwrap();
    assert!(get(&store, &deploy_id("app")).await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_dispatch_returns_without_running_handlers() {
    let store = Arc::new(MemoryStore::new());
    create_deploy(&store, "app", &[]).await;
    let d = dispatcher(&store);
    let ran = Arc::new(AtomicUsize::new(0));
    let r = ran.clone();
    d.register(
        Route::builder("never", deploy_gvk())
            .handle(move |_, _| {
                let r = r.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build()
            .unwrap(),
    );
    let ctx = CancellationToken::new();
    let c = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        c.cancel();
    });
    let err = d.dispatch(item("app"), ctx).await.unwrap_err();
    assert!(err.to_string().contains("cancelled"));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn finalizing_objects_reach_only_opted_in_routes() {
    let store = Arc::new(MemoryStore::new());
    let mut obj = new_object(&deploy_gvk(), Some("default"), "app", json!({"spec": {"replicas": 1}}));
    obj.metadata.finalizers = Some(vec!["example.com/hold".to_string()]);
    store.create(&obj).await.unwrap();
    let d = dispatcher(&store);

    let plain = Arc::new(AtomicUsize::new(0));
    let opted = Arc::new(AtomicUsize::new(0));
    let saw_finalizing = Arc::new(AtomicUsize::new(0));
    let p = plain.clone();
    d.register(
        Route::builder("plain", deploy_gvk())
            .handle(move |_, _| {
                let p = p.clone();
                async move {
                    p.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build()
            .unwrap(),
    );
    let (o, f) = (opted.clone(), saw_finalizing.clone());
    d.register(
        Route::builder("opted-in", deploy_gvk())
            .include_finalizing()
            .handle(move |req, _| {
                let (o, f) = (o.clone(), f.clone());
                async move {
                    o.fetch_add(1, Ordering::SeqCst);
                    if req.is_finalizing() {
                        f.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                }
            })
            .build()
            .unwrap(),
    );

    d.dispatch(item("app"), CancellationToken::new()).await.unwrap();
    assert_eq!(plain.load(Ordering::SeqCst), 1);
    assert_eq!(opted.load(Ordering::SeqCst), 1);
    assert_eq!(saw_finalizing.load(Ordering::SeqCst), 0);

    // A foreign finalizer keeps the object around in the deleting state.
    store.delete(&deploy_gvk(), &deploy_id("app").key).await.unwrap();
    assert!(get(&store, &deploy_id("app")).await.unwrap().is_deleting());
    d.dispatch(item("app"), CancellationToken::new()).await.unwrap();
    assert_eq!(plain.load(Ordering::SeqCst), 1);
    assert_eq!(opted.load(Ordering::SeqCst), 2);
    assert_eq!(saw_finalizing.load(Ordering::SeqCst), 1);
    assert!(get(&store, &deploy_id("app")).await.is_some());
}
