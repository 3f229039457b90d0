#![forbid(unsafe_code)]

use tether_core::{new_object, Delta, DeltaKind, DynamicObject, Gvk, ObjectKey};
use tether_store::{Coalescer, SnapshotBuilder};

fn obj(name: &str, ns: Option<&str>, v: &str) -> DynamicObject {
    new_object(&Gvk::new("", "v1", "ConfigMap"), ns, name, serde_json::json!({"data": {"v": v}}))
}

#[test]
fn replay_basic_sequence() {
    let mut wb = SnapshotBuilder::new();

    let deltas = vec![
        Delta::applied(obj("a", Some("ns"), "1")),
        // duplicate add; the builder just replaces
        Delta::applied(obj("a", Some("ns"), "1")),
        Delta::applied(obj("b", None, "1")),
        Delta::applied(obj("a", Some("ns"), "2")),
        Delta::deleted(obj("b", None, "1")),
    ];

    // Apply in two batches like the informer would
    wb.apply(&deltas[..2]);
    let snap1 = wb.freeze();
    assert_eq!(snap1.epoch, 1);
    assert_eq!(snap1.items.len(), 1);

    wb.apply(&deltas[2..]);
    let snap2 = wb.freeze();
    assert_eq!(snap2.epoch, 2);
    assert_eq!(snap2.items.len(), 1);
    let a = &snap2.items[&ObjectKey::namespaced("ns", "a")];
    assert_eq!(a.data["data"]["v"], "2");
    // earlier snapshots are unaffected
    assert_eq!(snap1.items[&ObjectKey::namespaced("ns", "a")].data["data"]["v"], "1");
}

#[test]
fn coalesced_replay_matches_direct_replay() {
    let seq = vec![
        Delta::applied(obj("a", Some("ns1"), "1")),
        Delta::applied(obj("b", Some("ns2"), "1")),
        Delta::applied(obj("a", Some("ns1"), "2")),
        Delta::deleted(obj("b", Some("ns2"), "1")),
        Delta::applied(obj("b", Some("ns2"), "3")),
    ];
    let mut direct = SnapshotBuilder::new();
    direct.apply(&seq);

    let mut c = Coalescer::default();
    for d in seq.iter().cloned() {
        c.push(d);
    }
    let batch = c.drain_ready();
    assert_eq!(batch.len(), 2);
    assert!(batch.iter().all(|d| d.kind == DeltaKind::Applied));
    let mut coalesced = SnapshotBuilder::new();
    coalesced.apply(&batch);

    let view = |b: &SnapshotBuilder| {
        let mut v: Vec<(ObjectKey, String)> =
            b.freeze().items.iter().map(|(k, o)| (k.clone(), o.data["data"]["v"].to_string())).collect();
        v.sort();
        v
    };
    assert_eq!(view(&direct), view(&coalesced));
}
