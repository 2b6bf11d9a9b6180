//! Version checks across sessions sharing one store.

mod common;

use common::{contract_row, open, registry, MemoryStore, Mapping};
use std::sync::Arc;
use tessera::{Error, LifecycleErrorKind, Session, Value};

fn two_sessions() -> (MemoryStore, Session<MemoryStore>, Session<MemoryStore>) {
    let registry = Arc::new(registry(Mapping::default()));
    let store = MemoryStore::new(&registry);
    store.seed("contract", contract_row(1, "Acme", 1));
    let first = Session::new(store.clone(), Arc::clone(&registry));
    let second = Session::new(store.clone(), registry);
    (store, first, second)
}

#[test]
fn concurrent_update_fails_with_stale_state() {
    let (store, mut first, mut second) = two_sessions();
    let mine = first.find("Contract", 1_i64).unwrap().unwrap();
    let theirs = second.find("Contract", 1_i64).unwrap().unwrap();

    theirs.set("customer_name", "Globex");
    second.flush().unwrap();
    assert_eq!(store.row("contract", 1_i64).unwrap()["version"], Value::BigInt(2));

    mine.set("customer_name", "Initech");
    let err = first.flush().unwrap_err();
    match &err {
        Error::StaleState(stale) => {
            assert_eq!(stale.entity, "Contract");
            assert_eq!(stale.id, Some(Value::BigInt(1)));
            assert_eq!(stale.expected_rows, 1);
            assert_eq!(stale.actual_rows, 0);
        }
        other => panic!("expected stale state, got {other:?}"),
    }
    assert!(err.is_concurrency_conflict());
    assert!(first.is_tainted());
    assert_eq!(first.statistics().optimistic_failures, 1);
    assert_eq!(
        store.row("contract", 1_i64).unwrap()["customer_name"],
        Value::Text("Globex".into())
    );
}

#[test]
fn tainted_session_refuses_to_flush_or_commit() {
    let (store, mut first, _) = two_sessions();
    let contract = first.find("Contract", 1_i64).unwrap().unwrap();
    store.set_column("contract", 1_i64, "version", 7_i64);

    contract.set("customer_name", "Initech");
    assert!(matches!(first.flush(), Err(Error::StaleState(_))));
    let statements = store.log().len();

    match first.flush() {
        Err(Error::Lifecycle(e)) => assert_eq!(e.kind, LifecycleErrorKind::Tainted),
        other => panic!("expected tainted session, got {other:?}"),
    }
    assert!(matches!(first.commit(), Err(Error::Lifecycle(_))));
    assert_eq!(store.log().len(), statements);
    assert_eq!(store.commits(), 0);

    first.rollback().unwrap();
    assert!(!first.is_tainted());
    assert_eq!(store.rollbacks(), 1);
    assert!(first.flush().unwrap().is_empty());
}

#[test]
fn stale_delete_is_detected() {
    let (store, mut session, _) = two_sessions();
    let contract = session.find("Contract", 1_i64).unwrap().unwrap();
    store.set_column("contract", 1_i64, "version", 2_i64);

    session.remove(&contract).unwrap();
    assert!(matches!(session.flush(), Err(Error::StaleState(_))));
    assert_eq!(store.count("contract"), 1);
}

#[test]
fn vanished_row_is_stale_for_unversioned_entities() {
    let (store, mut session) = open(registry(Mapping::default()));
    store.seed("node", vec![("id", Value::BigInt(1)), ("label", Value::Text("a".into()))]);
    let node = session.find("Node", 1_i64).unwrap().unwrap();
    store.purge("node", 1_i64);

    node.set("label", "b");
    match session.flush() {
        Err(Error::StaleState(stale)) => assert_eq!(stale.table, "node"),
        other => panic!("expected stale state, got {other:?}"),
    }
}

#[test]
fn merge_of_stale_detached_instance_is_rejected() {
    let (store, mut session, _) = two_sessions();
    let detached = session.find("Contract", 1_i64).unwrap().unwrap();
    session.clear();
    store.set_column("contract", 1_i64, "version", 2_i64);

    detached.set("customer_name", "Initech");
    assert!(matches!(session.merge(&detached), Err(Error::StaleState(_))));
    assert!(!session.is_tainted());
    assert_eq!(store.row("contract", 1_i64).unwrap()["customer_name"], Value::Text("Acme".into()));
}

#[test]
fn merge_of_current_detached_instance_updates_managed_copy() {
    let (store, mut session, _) = two_sessions();
    let detached = session.find("Contract", 1_i64).unwrap().unwrap();
    session.clear();

    detached.set("customer_name", "Initech");
    let managed = session.merge(&detached).unwrap();
    assert!(!managed.ptr_eq(&detached));
    assert!(!session.contains(&detached));
    assert_eq!(managed.get("customer_name"), Value::Text("Initech".into()));

    let result = session.flush().unwrap();
    assert_eq!(result.updated, 1);
    let row = store.row("contract", 1_i64).unwrap();
    assert_eq!(row["customer_name"], Value::Text("Initech".into()));
    assert_eq!(row["version"], Value::BigInt(2));
}
