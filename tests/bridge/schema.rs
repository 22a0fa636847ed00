//! Schema Tests
//!
//! Object stores and indexes created inside upgraders, and the constraints
//! they enforce afterwards.

use crate::common::*;
use idbind::{
    DomException, IndexOptions, ObjectStoreOptions, Scope, Source, TransactionMode, Value,
};

fn indexed_db(factory: &idbind::Factory, name: &str) -> idbind::Database {
    let scope = Scope::background();
    factory
        .open(&scope, name, 1, |db, _, _| {
            let store = db.create_object_store(
                "people",
                ObjectStoreOptions {
                    key_path: Some("id".to_string()),
                    ..ObjectStoreOptions::default()
                },
            )?;
            store.create_index(
                "by_email",
                "email",
                IndexOptions {
                    unique: true,
                    ..IndexOptions::default()
                },
            )?;
            store.create_index(
                "by_tag",
                "tags",
                IndexOptions {
                    multi_entry: true,
                    ..IndexOptions::default()
                },
            )?;
            Ok(())
        })
        .unwrap()
        .wait(&scope)
        .unwrap()
}

fn person(id: i64, email: &str, tags: &[&str]) -> Value {
    object([
        ("id", Value::Int(id)),
        ("email", Value::from(email)),
        (
            "tags",
            Value::from(tags.iter().map(|t| Value::from(*t)).collect::<Vec<_>>()),
        ),
    ])
}

#[test]
fn test_index_metadata() {
    let factory = factory();
    let scope = Scope::background();
    let db = indexed_db(&factory, &unique_name("index-meta"));

    let txn = db.transaction(TransactionMode::ReadOnly, &["people"]).unwrap();
    let store = txn.object_store("people").unwrap();
    assert_eq!(
        store.index_names(),
        vec!["by_email".to_string(), "by_tag".to_string()]
    );
    let email = store.index("by_email").unwrap();
    assert!(email.unique());
    assert!(!email.multi_entry());
    assert_eq!(email.key_path().as_deref(), Some("email"));
    assert_eq!(email.object_store().name(), "people");
    assert!(store
        .index("missing")
        .unwrap_err()
        .is_exception(DomException::NOT_FOUND_ERROR));

    let request = email.get("nobody@example.com").unwrap();
    assert!(matches!(request.source(), Some(Source::Index(_))));
    assert_eq!(request.wait(&scope).unwrap(), Value::Undefined);
    txn.wait(&scope).unwrap();
}

#[test]
fn test_unique_index_rejects_duplicates() {
    let factory = factory();
    let scope = Scope::background();
    let db = indexed_db(&factory, &unique_name("unique"));

    let txn = db.transaction(TransactionMode::ReadWrite, &["people"]).unwrap();
    let store = txn.object_store("people").unwrap();
    store.put(person(1, "ada@example.com", &[])).unwrap();
    let err = store
        .put(person(2, "ada@example.com", &[]))
        .unwrap()
        .wait(&scope)
        .unwrap_err();
    assert!(err.is_exception(DomException::CONSTRAINT_ERROR));
    assert!(txn.wait(&scope).is_err());
    assert_eq!(count(&db, "people").unwrap(), 0);
}

#[test]
fn test_multi_entry_index_indexes_each_element() {
    let factory = factory();
    let scope = Scope::background();
    let db = indexed_db(&factory, &unique_name("multi-entry"));

    let txn = db.transaction(TransactionMode::ReadWrite, &["people"]).unwrap();
    let store = txn.object_store("people").unwrap();
    store.put(person(1, "ada@example.com", &["math", "poetry"])).unwrap();
    store.put(person(2, "alan@example.com", &["math"])).unwrap();
    store.put(person(3, "grace@example.com", &[])).unwrap();
    txn.wait(&scope).unwrap();

    let txn = db.transaction(TransactionMode::ReadOnly, &["people"]).unwrap();
    let tags = txn.object_store("people").unwrap().index("by_tag").unwrap();
    assert_eq!(tags.count_key("math").unwrap().wait(&scope).unwrap(), 2);
    assert_eq!(tags.count().unwrap().wait(&scope).unwrap(), 3);
    assert_eq!(
        tags.get_all_keys_range(idbind::KeyRange::only("math"), None)
            .unwrap()
            .wait(&scope)
            .unwrap(),
        vec![Value::Int(1), Value::Int(2)]
    );
    assert_eq!(
        tags.get_key(idbind::Key::from("poetry")).unwrap().wait(&scope).unwrap(),
        Value::Int(1)
    );
    txn.wait(&scope).unwrap();
}

#[test]
fn test_unique_index_over_duplicate_records_fails_the_upgrade() {
    let factory = factory();
    let scope = Scope::background();
    let name = unique_name("late-unique");
    let db = items_db(&factory, &name).unwrap();
    let txn = db.transaction(TransactionMode::ReadWrite, &["items"]).unwrap();
    let store = txn.object_store("items").unwrap();
    store.put(record(1, "same")).unwrap();
    store.put(record(2, "same")).unwrap();
    txn.wait(&scope).unwrap();
    db.close();

    let err = factory
        .open(&scope, &name, 2, |db, _, _| {
            let txn = db.upgrade_transaction().expect("inside upgrade");
            txn.object_store("items")?.create_index(
                "by_tag",
                "tag",
                IndexOptions {
                    unique: true,
                    ..IndexOptions::default()
                },
            )?;
            Ok(())
        })
        .unwrap()
        .wait(&scope)
        .unwrap_err();
    assert!(err.is_exception(DomException::CONSTRAINT_ERROR), "{err}");

    let db = factory.open_existing(&scope, &name, 0).unwrap().wait(&scope).unwrap();
    assert_eq!(db.version(), 1);
    let txn = db.transaction(TransactionMode::ReadOnly, &["items"]).unwrap();
    assert!(txn.object_store("items").unwrap().index_names().is_empty());
    txn.wait(&scope).unwrap();
}

#[test]
fn test_indexes_and_stores_can_be_dropped_in_a_later_version() {
    let factory = factory();
    let scope = Scope::background();
    let name = unique_name("drop");
    indexed_db(&factory, &name).close();

    let db = factory
        .open(&scope, &name, 2, |db, _, _| {
            let txn = db.upgrade_transaction().expect("inside upgrade");
            let people = txn.object_store("people")?;
            people.delete_index("by_tag")?;
            assert!(people
                .delete_index("by_tag")
                .unwrap_err()
                .is_exception(DomException::NOT_FOUND_ERROR));
            db.create_object_store("archive", ObjectStoreOptions::default())?;
            db.delete_object_store("archive")?;
            Ok(())
        })
        .unwrap()
        .wait(&scope)
        .unwrap();

    assert_eq!(db.object_store_names(), vec!["people".to_string()]);
    let txn = db.transaction(TransactionMode::ReadOnly, &["people"]).unwrap();
    assert_eq!(
        txn.object_store("people").unwrap().index_names(),
        vec!["by_email".to_string()]
    );
    txn.wait(&scope).unwrap();
}

#[test]
fn test_duplicate_store_name_is_a_constraint_error() {
    let factory = factory();
    let scope = Scope::background();

    let err = factory
        .open(&scope, &unique_name("dup-store"), 1, |db, _, _| {
            db.create_object_store("kv", ObjectStoreOptions::default())?;
            db.create_object_store("kv", ObjectStoreOptions::default())?;
            Ok(())
        })
        .unwrap()
        .wait(&scope)
        .unwrap_err();
    assert!(err.is_exception(DomException::CONSTRAINT_ERROR));
}
