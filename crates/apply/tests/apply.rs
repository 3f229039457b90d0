use std::sync::Arc;

use serde_json::json;
use tether_apply::{read_applied_kinds, Apply, ApplyError, Recorded, ANN_APPLIED, ANN_APPLIED_KINDS, LABEL_HASH};
use tether_core::{new_object, Backend, DynamicObject, Gvk, ObjectExt, ObjectKey, ObjectSet};
use tether_store::MemoryStore;

fn deploy_gvk() -> Gvk { Gvk::new("apps", "v1", "Deployment") }
fn cm_gvk() -> Gvk { Gvk::new("", "v1", "ConfigMap") }
fn secret_gvk() -> Gvk { Gvk::new("", "v1", "Secret") }

fn cm(ns: &str, name: &str, data: serde_json::Value) -> DynamicObject {
    new_object(&cm_gvk(), Some(ns), name, json!({ "data": data }))
}

fn set(objs: impl IntoIterator<Item = DynamicObject>) -> ObjectSet {
    let mut s = ObjectSet::new();
    for o in objs {
        s.add(o).unwrap();
    }
    s
}

async fn setup() -> (Arc<MemoryStore>, DynamicObject) {
    let store = Arc::new(MemoryStore::new());
    let owner = store
        .create(&new_object(&deploy_gvk(), Some("default"), "app", json!({"spec": {"replicas": 1}})))
        .await
        .unwrap();
    (store, owner)
}

async fn get_cm(store: &MemoryStore, ns: &str, name: &str) -> Option<DynamicObject> {
    store.get_opt(&cm_gvk(), &ObjectKey::namespaced(ns, name)).await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn create_then_prune_with_empty_desired_set() {
    let (store, owner) = setup().await;
    let engine = Apply::new(store.clone()).with_owner(&owner).unwrap().with_set_id("net");

    let report = engine.apply(set([cm("default", "app-cfg", json!({"k": "v"}))])).await.unwrap();
    assert_eq!(report.created.len(), 1);
    let child = get_cm(&store, "default", "app-cfg").await.unwrap();
    let rec = Recorded::read(&child).unwrap();
    assert_eq!(rec.set_id, "net");
    assert_eq!(rec.owner.unwrap().to_string(), "apps/v1/Deployment default/app");
    assert!(child.label(LABEL_HASH).is_some());
    assert!(child.annotation(ANN_APPLIED).is_some());
    let refs = child.metadata.owner_references.clone().unwrap();
    assert_eq!(refs[0].uid, owner.metadata.uid.clone().unwrap());

    // An unrelated manual edit does not block pruning.
    let mut edited = child.clone();
    edited.data["data"]["manual"] = json!("x");
    store.update(&edited).await.unwrap();

    let report = engine.apply(ObjectSet::new()).await.unwrap();
    assert_eq!(report.deleted.len(), 1);
    assert!(get_cm(&store, "default", "app-cfg").await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn second_apply_issues_no_writes() {
    let (store, owner) = setup().await;
    let engine = Apply::new(store.clone()).with_owner(&owner).unwrap().with_set_id("net");
    let desired = set([cm("default", "a", json!({"k": "v"})), cm("default", "b", json!({"k": "w"}))]);
    engine.apply(desired.clone()).await.unwrap();
    let before = store.mutations();
    let report = engine.apply(desired).await.unwrap();
    assert!(report.is_noop());
    assert_eq!(report.unchanged.len(), 2);
    assert_eq!(store.mutations(), before);
}

#[tokio::test(flavor = "multi_thread")]
async fn manual_edits_to_unmanaged_fields_survive_updates() {
    let (store, owner) = setup().await;
    let engine = Apply::new(store.clone()).with_owner(&owner).unwrap().with_set_id("net");
    engine.apply(set([cm("default", "a", json!({"k": "v1", "gone": "soon"}))])).await.unwrap();

    let mut edited = get_cm(&store, "default", "a").await.unwrap();
    edited.data["data"]["manual"] = json!("keep");
    edited.metadata.labels.get_or_insert_with(Default::default).insert("team".into(), "ops".into());
    store.update(&edited).await.unwrap();

    let report = engine.apply(set([cm("default", "a", json!({"k": "v2"}))])).await.unwrap();
    assert_eq!(report.updated.len(), 1);
    let got = get_cm(&store, "default", "a").await.unwrap();
    assert_eq!(got.data["data"], json!({"k": "v2", "manual": "keep"}));
    assert_eq!(got.label("team"), Some("ops"));
}

#[tokio::test(flavor = "multi_thread")]
async fn subcontexts_do_not_prune_each_other() {
    let (store, owner) = setup().await;
    let base = Apply::new(store.clone()).with_owner(&owner).unwrap();
    let net = base.clone().with_set_id("net");
    let storage = base.with_set_id("storage");
    net.apply(set([cm("default", "net-cfg", json!({}))])).await.unwrap();
    storage.apply(set([cm("default", "storage-cfg", json!({}))])).await.unwrap();

    net.apply(ObjectSet::new()).await.unwrap();
    assert!(get_cm(&store, "default", "net-cfg").await.is_none());
    assert!(get_cm(&store, "default", "storage-cfg").await.is_some());

    let err = net.apply(set([cm("default", "storage-cfg", json!({}))])).await.unwrap_err();
    assert!(matches!(err, ApplyError::OwnedByOther { .. }), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn registered_migration_moves_objects_between_subcontexts() {
    let (store, owner) = setup().await;
    let old = Apply::new(store.clone()).with_owner(&owner).unwrap().with_set_id("v1-controller");
    old.apply(set([cm("default", "keep", json!({})), cm("default", "drop", json!({}))])).await.unwrap();

    let new = old.clone().with_set_id("v2-controller");
    new.register_migration("v1-controller", "v2-controller");
    let report = new.apply(set([cm("default", "keep", json!({"k": "v"}))])).await.unwrap();
    assert_eq!(report.updated.len(), 1);
    assert_eq!(report.deleted.len(), 1);
    let kept = get_cm(&store, "default", "keep").await.unwrap();
    assert_eq!(Recorded::read(&kept).unwrap().set_id, "v2-controller");
    assert!(get_cm(&store, "default", "drop").await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn no_prune_and_prune_kinds_limit_deletions() {
    let (store, owner) = setup().await;
    let engine = Apply::new(store.clone()).with_owner(&owner).unwrap().with_set_id("mixed");
    let secret = new_object(&secret_gvk(), Some("default"), "s", json!({"stringData": {"p": "w"}}));
    engine.apply(set([cm("default", "c", json!({})), secret])).await.unwrap();

    let report = engine.clone().with_no_prune(true).apply(ObjectSet::new()).await.unwrap();
    assert!(report.deleted.is_empty());

    let report = engine.clone().with_prune_kinds([secret_gvk()]).apply(ObjectSet::new()).await.unwrap();
    assert_eq!(report.deleted.len(), 1);
    assert_eq!(report.deleted[0].gvk, secret_gvk());
    assert!(get_cm(&store, "default", "c").await.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn unowned_objects_are_adopted() {
    let (store, owner) = setup().await;
    store.create(&cm("default", "pre", json!({"k": "old", "extra": "x"}))).await.unwrap();
    let engine = Apply::new(store.clone()).with_owner(&owner).unwrap().with_set_id("net");
    let report = engine.apply(set([cm("default", "pre", json!({"k": "new"}))])).await.unwrap();
    assert_eq!(report.updated.len(), 1);
    let got = get_cm(&store, "default", "pre").await.unwrap();
    // Without a prior record nothing is removed.
    assert_eq!(got.data["data"], json!({"k": "new", "extra": "x"}));
    assert_eq!(Recorded::read(&got).unwrap().set_id, "net");
}

#[tokio::test(flavor = "multi_thread")]
async fn cross_namespace_children_get_no_native_reference() {
    let (store, owner) = setup().await;
    let engine = Apply::new(store.clone()).with_owner(&owner).unwrap().with_set_id("net");
    engine.apply(set([cm("other", "remote", json!({}))])).await.unwrap();
    let got = get_cm(&store, "other", "remote").await.unwrap();
    assert!(got.metadata.owner_references.is_none());
    assert!(Recorded::read(&got).unwrap().owner.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn ensure_never_stamps_or_deletes() {
    let store = Arc::new(MemoryStore::new());
    let engine = Apply::new(store.clone());
    let report = engine.ensure(vec![cm("ns", "shared", json!({"k": "v"}))]).await.unwrap();
    assert_eq!(report.created.len(), 1);
    let got = get_cm(&store, "ns", "shared").await.unwrap();
    assert!(Recorded::read(&got).is_none());

    let report = engine.ensure(vec![cm("ns", "shared", json!({"k": "v"}))]).await.unwrap();
    assert!(report.is_noop());
    let report = engine.ensure(vec![cm("ns", "shared", json!({"k": "w"}))]).await.unwrap();
    assert_eq!(report.updated.len(), 1);
    assert_eq!(store.count(&cm_gvk()), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn find_owner_and_purge_orphan() {
    let (store, owner) = setup().await;
    let engine = Apply::new(store.clone()).with_owner(&owner).unwrap().with_set_id("net");
    engine.apply(set([cm("other", "remote", json!({}))])).await.unwrap();
    let child = get_cm(&store, "other", "remote").await.unwrap();

    let found = engine.find_owner(&child).await.unwrap();
    assert_eq!(found.metadata.name.as_deref(), Some("app"));
    assert!(!engine.purge_orphan(&child).await.unwrap());

    store.delete(&deploy_gvk(), &ObjectKey::namespaced("default", "app")).await.unwrap();
    assert!(matches!(engine.find_owner(&child).await, Err(ApplyError::OwnerNotFound { .. })));
    assert!(engine.purge_orphan(&child).await.unwrap());
    assert!(get_cm(&store, "other", "remote").await.is_none());

    let plain = store.create(&cm("ns", "plain", json!({}))).await.unwrap();
    assert!(matches!(engine.find_owner(&plain).await, Err(ApplyError::NotOwned(_))));
    assert!(!engine.purge_orphan(&plain).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn conflicts_are_retried_then_surfaced() {
    let (store, owner) = setup().await;
    let engine = Apply::new(store.clone()).with_owner(&owner).unwrap().with_set_id("net");
    engine.apply(set([cm("default", "a", json!({"k": "1"}))])).await.unwrap();

    store.inject_conflicts(1);
    let report = engine.apply(set([cm("default", "a", json!({"k": "2"}))])).await.unwrap();
    assert_eq!(report.updated.len(), 1);

    store.inject_conflicts(10);
    let err = engine.apply(set([cm("default", "a", json!({"k": "3"}))])).await.unwrap_err();
    assert!(matches!(err, ApplyError::ConflictRetriesExhausted { attempts: 3, .. }), "{err}");
    store.inject_conflicts(0);
}

#[tokio::test(flavor = "multi_thread")]
async fn recreated_owner_adopts_previous_children() {
    let (store, owner) = setup().await;
    Apply::new(store.clone()).with_owner(&owner).unwrap().with_set_id("net")
        .apply(set([cm("default", "a", json!({}))]))
        .await
        .unwrap();
    store.delete(&deploy_gvk(), &ObjectKey::namespaced("default", "app")).await.unwrap();
    let again = store
        .create(&new_object(&deploy_gvk(), Some("default"), "app", json!({"spec": {"replicas": 1}})))
        .await
        .unwrap();
    assert_ne!(again.metadata.uid, owner.metadata.uid);
    let report = Apply::new(store.clone()).with_owner(&again).unwrap().with_set_id("net")
        .apply(set([cm("default", "a", json!({}))]))
        .await
        .unwrap();
    assert_eq!(report.updated.len(), 1);
    let got = get_cm(&store, "default", "a").await.unwrap();
    assert!(got.metadata.owner_references.unwrap().iter().any(|r| Some(&r.uid) == again.metadata.uid.as_ref()));
}

#[tokio::test(flavor = "multi_thread")]
async fn a_fresh_engine_prunes_kinds_an_earlier_one_applied() {
    let (store, owner) = setup().await;
    let secret = new_object(&secret_gvk(), Some("default"), "s", json!({"stringData": {"p": "w"}}));
    Apply::new(store.clone())
        .with_owner(&owner)
        .unwrap()
        .with_set_id("net")
        .apply(set([cm("default", "app-cfg", json!({})), secret]))
        .await
        .unwrap();
    let stored_owner = store.get(&deploy_gvk(), &ObjectKey::namespaced("default", "app")).await.unwrap();
    let kinds = read_applied_kinds(&stored_owner);
    assert_eq!(kinds["net"].len(), 2);

    // A new engine (restart, failover) only knows what the owner carries.
    let restarted = Apply::new(store.clone()).with_owner(&owner).unwrap().with_set_id("net");
    let report = restarted.apply(set([cm("default", "app-cfg", json!({}))])).await.unwrap();
    assert_eq!(report.deleted.len(), 1);
    assert_eq!(report.deleted[0].gvk, secret_gvk());

    let report = Apply::new(store.clone())
        .with_owner(&owner)
        .unwrap()
        .with_set_id("net")
        .apply(ObjectSet::new())
        .await
        .unwrap();
    assert_eq!(report.deleted.len(), 1);
    assert!(get_cm(&store, "default", "app-cfg").await.is_none());
    let stored_owner = store.get(&deploy_gvk(), &ObjectKey::namespaced("default", "app")).await.unwrap();
    assert!(stored_owner.annotation(ANN_APPLIED_KINDS).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn narrowed_prunes_keep_the_recorded_kinds() {
    let (store, owner) = setup().await;
    let engine = Apply::new(store.clone()).with_owner(&owner).unwrap().with_set_id("net");
    engine.apply(set([cm("default", "c", json!({}))])).await.unwrap();
    engine.clone().with_no_prune(true).apply(ObjectSet::new()).await.unwrap();
    engine.clone().with_prune_kinds([secret_gvk()]).apply(ObjectSet::new()).await.unwrap();

    let stored_owner = store.get(&deploy_gvk(), &ObjectKey::namespaced("default", "app")).await.unwrap();
    assert!(read_applied_kinds(&stored_owner)["net"].contains(&cm_gvk()));
    let report = Apply::new(store.clone()).with_owner(&owner).unwrap().with_set_id("net").apply(ObjectSet::new()).await.unwrap();
    assert_eq!(report.deleted.len(), 1);
}
