//! Transaction Tests
//!
//! Tests for the all-or-nothing outcome of a transaction:
//! - Commit publishes writes, abort discards them
//! - A failed request aborts with its own error as the cause
//! - Mode, durability and scope metadata

use crate::common::*;
use idbind::{
    DomException, Durability, Error, KeyRange, Scope, TransactionMode, TransactionOptions, Value,
};

// ============================================================================
// Outcomes
// ============================================================================

#[test]
fn test_abort_discards_queued_write() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("abort")).unwrap();

    let txn = db.transaction(TransactionMode::ReadWrite, &["mystore"]).unwrap();
    let store = txn.object_store("mystore").unwrap();
    store.put_key("overwritten", "id1").unwrap();
    store.put_key("new", "id9").unwrap();
    txn.abort().unwrap();

    assert!(matches!(txn.wait(&scope), Err(Error::Aborted)));
    assert_eq!(read(&db, "mystore", "id1").unwrap(), Value::from("value1"));
    assert_eq!(read(&db, "mystore", "id9").unwrap(), Value::Undefined);
}

#[test]
fn test_commit_publishes_writes() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("commit")).unwrap();

    let txn = db.transaction(TransactionMode::ReadWrite, &["mystore"]).unwrap();
    let store = txn.object_store("mystore").unwrap();
    store.put_key("value6", "id6").unwrap();
    store.delete("id2").unwrap();
    txn.commit().unwrap();
    txn.wait(&scope).unwrap();

    assert_eq!(read(&db, "mystore", "id6").unwrap(), Value::from("value6"));
    assert_eq!(read(&db, "mystore", "id2").unwrap(), Value::Undefined);
    assert_eq!(count(&db, "mystore").unwrap(), 5);
}

#[test]
fn test_wait_after_completion_still_reports_outcome() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("late")).unwrap();

    let txn = db.transaction(TransactionMode::ReadWrite, &["mystore"]).unwrap();
    txn.object_store("mystore")
        .unwrap()
        .put_key("value7", "id7")
        .unwrap();
    txn.wait(&scope).unwrap();
    // Finished before these listeners attach
    txn.wait(&scope).unwrap();
}

#[test]
fn test_failed_request_is_the_abort_cause() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("cause")).unwrap();

    let txn = db.transaction(TransactionMode::ReadWrite, &["mystore"]).unwrap();
    let store = txn.object_store("mystore").unwrap();
    store.put_key("kept?", "id8").unwrap();
    store.add_key("duplicate", "id3").unwrap();

    let err = txn.wait(&scope).unwrap_err();
    assert!(err.is_exception(DomException::CONSTRAINT_ERROR), "{err}");
    assert_eq!(read(&db, "mystore", "id8").unwrap(), Value::Undefined);
}

#[test]
fn test_requests_after_abort_are_refused() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("inactive")).unwrap();

    let txn = db.transaction(TransactionMode::ReadWrite, &["mystore"]).unwrap();
    let store = txn.object_store("mystore").unwrap();
    txn.abort().unwrap();
    let err = store.get("id1").unwrap_err();
    assert!(err.is_exception(DomException::TRANSACTION_INACTIVE_ERROR));
    assert!(txn.wait(&scope).is_err());
    assert!(txn
        .abort()
        .unwrap_err()
        .is_exception(DomException::INVALID_STATE_ERROR));
}

#[test]
fn test_readonly_transaction_rejects_writes() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("readonly")).unwrap();

    let txn = db.transaction(TransactionMode::ReadOnly, &["mystore"]).unwrap();
    let store = txn.object_store("mystore").unwrap();
    for err in [
        store.put_key("x", "id1").unwrap_err(),
        store.delete("id1").map(drop).unwrap_err(),
        store.clear().map(drop).unwrap_err(),
    ] {
        assert!(err.is_exception(DomException::READ_ONLY_ERROR), "{err}");
    }
    txn.wait(&scope).unwrap();
}

#[test]
fn test_engine_without_explicit_commit() {
    let engine = idbind::MemoryFactory::new(idbind::EngineConfig {
        supports_commit: false,
        ..idbind::EngineConfig::default()
    })
    .unwrap();
    let factory = idbind::Factory::new(std::sync::Arc::new(engine));
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("no-commit")).unwrap();

    let txn = db.transaction(TransactionMode::ReadWrite, &["mystore"]).unwrap();
    txn.object_store("mystore")
        .unwrap()
        .put_key("value6", "id6")
        .unwrap();
    // Falls back to auto-commit
    txn.commit().unwrap();
    txn.wait(&scope).unwrap();
    assert_eq!(read(&db, "mystore", "id6").unwrap(), Value::from("value6"));
}

// ============================================================================
// Store operations
// ============================================================================

#[test]
fn test_reads_within_a_transaction() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("reads")).unwrap();

    let txn = db.transaction(TransactionMode::ReadOnly, &["mystore"]).unwrap();
    let store = txn.object_store("mystore").unwrap();
    let range = KeyRange::bound("id2", "id4", false, false).unwrap();

    assert_eq!(
        store.get_all(None).unwrap().wait(&scope).unwrap(),
        seed_values()
    );
    assert_eq!(
        store.get_all_range(range.clone(), Some(2)).unwrap().wait(&scope).unwrap(),
        vec![Value::from("value2"), Value::from("value3")]
    );
    assert_eq!(
        store.get_all_keys_range(range.clone(), None).unwrap().wait(&scope).unwrap(),
        vec![Value::from("id2"), Value::from("id3"), Value::from("id4")]
    );
    assert_eq!(store.count_range(range.clone()).unwrap().wait(&scope).unwrap(), 3);
    assert_eq!(store.count_key("id5").unwrap().wait(&scope).unwrap(), 1);
    assert_eq!(
        store.get_range(range.clone()).unwrap().wait(&scope).unwrap(),
        Value::from("value2")
    );
    assert_eq!(
        store.get_key(range).unwrap().wait(&scope).unwrap(),
        Value::from("id2")
    );
    assert_eq!(
        store.get_all_keys(Some(1)).unwrap().wait(&scope).unwrap(),
        vec![Value::from("id1")]
    );
    txn.wait(&scope).unwrap();
}

#[test]
fn test_delete_range_and_clear() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("delete-range")).unwrap();

    let txn = db.transaction(TransactionMode::ReadWrite, &["mystore"]).unwrap();
    let store = txn.object_store("mystore").unwrap();
    store
        .delete_range(KeyRange::upper_bound("id3", false))
        .unwrap()
        .wait(&scope)
        .unwrap();
    assert_eq!(store.count().unwrap().wait(&scope).unwrap(), 2);
    txn.wait(&scope).unwrap();
    assert_eq!(count(&db, "mystore").unwrap(), 2);

    let txn = db.transaction(TransactionMode::ReadWrite, &["mystore"]).unwrap();
    txn.object_store("mystore").unwrap().clear().unwrap();
    txn.wait(&scope).unwrap();
    assert_eq!(count(&db, "mystore").unwrap(), 0);
}

#[test]
fn test_key_generator_and_key_path() {
    let factory = factory();
    let scope = Scope::background();
    let db = factory
        .open(&scope, &unique_name("generator"), 1, |db, _, _| {
            db.create_object_store(
                "notes",
                idbind::ObjectStoreOptions {
                    key_path: Some("meta.id".to_string()),
                    auto_increment: true,
                },
            )?;
            Ok(())
        })
        .unwrap()
        .wait(&scope)
        .unwrap();

    let txn = db.transaction(TransactionMode::ReadWrite, &["notes"]).unwrap();
    let store = txn.object_store("notes").unwrap();
    assert!(store.auto_increment());
    assert_eq!(store.key_path().as_deref(), Some("meta.id"));

    let first = store
        .add(object([("text", Value::from("a"))]))
        .unwrap()
        .wait(&scope)
        .unwrap();
    assert_eq!(first, Value::Int(1));
    let stored = store.get(1).unwrap().wait(&scope).unwrap();
    assert_eq!(stored.get_path("meta.id"), Some(&Value::Int(1)));

    // An explicit key bumps the generator
    let explicit = object([("meta", object([("id", Value::Int(10))]))]);
    store.put(explicit).unwrap().wait(&scope).unwrap();
    let next = store
        .add(object([("text", Value::from("b"))]))
        .unwrap()
        .wait(&scope)
        .unwrap();
    assert_eq!(next, Value::Int(11));

    // Inline keys cannot also be passed explicitly
    let err = store.put_key(object([]), 5).unwrap_err();
    assert!(err.is_exception(DomException::DATA_ERROR));
    txn.wait(&scope).unwrap();
}

// ============================================================================
// Metadata
// ============================================================================

#[test]
fn test_transaction_metadata() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("txn-meta")).unwrap();

    let txn = db
        .transaction_with_options(
            TransactionOptions::new(TransactionMode::ReadWrite).with_durability(Durability::Strict),
            &["mystore", "mystore"],
        )
        .unwrap();
    assert_eq!(txn.mode(), TransactionMode::ReadWrite);
    assert_eq!(txn.durability(), Durability::Strict);
    assert_eq!(txn.object_store_names(), vec!["mystore".to_string()]);
    assert!(txn.error().is_none());
    assert_eq!(txn.database().map(|db| db.name()), Some(db.name()));

    let store = txn.object_store("mystore").unwrap();
    assert!(store.is_same(&txn.object_store("mystore").unwrap()));
    assert!(store.transaction().handle_id() == txn.handle_id());
    assert!(txn
        .object_store("other")
        .unwrap_err()
        .is_exception(DomException::NOT_FOUND_ERROR));
    txn.wait(&scope).unwrap();
}

#[test]
fn test_transaction_validation() {
    let factory = factory();
    let db = seeded_db(&factory, &unique_name("txn-validation")).unwrap();

    let missing = db.transaction(TransactionMode::ReadOnly, &["nope"]).unwrap_err();
    assert!(missing.is_exception(DomException::NOT_FOUND_ERROR));
    let empty = db.transaction(TransactionMode::ReadOnly, &[]).unwrap_err();
    assert!(empty.is_exception(DomException::INVALID_ACCESS_ERROR));

    db.close();
    let closed = db.transaction(TransactionMode::ReadOnly, &["mystore"]).unwrap_err();
    assert!(closed.is_exception(DomException::INVALID_STATE_ERROR));
}
