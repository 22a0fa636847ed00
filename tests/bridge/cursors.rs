//! Cursor Iteration Tests
//!
//! Tests for the visitor loop:
//! - Ordered, exactly-once traversal in every direction
//! - Explicit advances (continue_key, advance) suppressing the implicit one
//! - Early stop, visitor errors and visitor panics
//! - Writes through the cursor during iteration

use crate::common::*;
use idbind::{
    CursorDirection, DomException, Error, IndexOptions, Key, KeyRange, ObjectStoreOptions, Scope,
    TransactionMode, Value,
};

fn collect_values(db: &idbind::Database, direction: CursorDirection) -> Vec<Value> {
    let scope = Scope::background();
    let txn = db.transaction(TransactionMode::ReadOnly, &["mystore"]).unwrap();
    let mut values = Vec::new();
    txn.object_store("mystore")
        .unwrap()
        .open_cursor(direction)
        .unwrap()
        .iter(&scope, |cursor| {
            values.push(cursor.value()?);
            Ok(())
        })
        .unwrap();
    txn.wait(&scope).unwrap();
    values
}

// ============================================================================
// Traversal
// ============================================================================

#[test]
fn test_forward_iteration_yields_values_in_key_order() {
    let factory = factory();
    let db = seeded_db(&factory, &unique_name("forward")).unwrap();
    assert_eq!(collect_values(&db, CursorDirection::Next), seed_values());
}

#[test]
fn test_reverse_iteration_yields_values_in_reverse_order() {
    let factory = factory();
    let db = seeded_db(&factory, &unique_name("reverse")).unwrap();
    let mut expected = seed_values();
    expected.reverse();
    assert_eq!(collect_values(&db, CursorDirection::Prev), expected);
}

#[test]
fn test_iteration_visits_every_row_exactly_once() {
    let factory = factory();
    let scope = Scope::background();
    let db = items_db(&factory, &unique_name("exactly-once")).unwrap();

    let txn = db.transaction(TransactionMode::ReadWrite, &["items"]).unwrap();
    let store = txn.object_store("items").unwrap();
    // Inserted out of order
    for id in [7, 3, 9, 1, 5, 8, 2, 6, 4, 10] {
        store.put(record(id, "x")).unwrap();
    }
    let mut keys = Vec::new();
    store
        .open_key_cursor(CursorDirection::Next)
        .unwrap()
        .iter(&scope, |cursor| {
            keys.push(cursor.key().expect("positioned cursor"));
            Ok(())
        })
        .unwrap();
    txn.wait(&scope).unwrap();

    let expected: Vec<Key> = (1..=10).map(Key::from).collect();
    assert_eq!(keys, expected);
}

#[test]
fn test_empty_range_ends_immediately() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("empty")).unwrap();

    let txn = db.transaction(TransactionMode::ReadOnly, &["mystore"]).unwrap();
    let store = txn.object_store("mystore").unwrap();
    let request = store
        .open_cursor_range(KeyRange::lower_bound("zzz", false), CursorDirection::Next)
        .unwrap();
    assert!(request.wait(&scope).unwrap().is_none());

    let mut visits = 0;
    store
        .open_cursor_key("missing", CursorDirection::Next)
        .unwrap()
        .iter(&scope, |_| {
            visits += 1;
            Ok(())
        })
        .unwrap();
    assert_eq!(visits, 0);
    txn.wait(&scope).unwrap();
}

#[test]
fn test_cursor_over_a_key_range() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("range")).unwrap();

    let txn = db.transaction(TransactionMode::ReadOnly, &["mystore"]).unwrap();
    let range = KeyRange::bound("id2", "id4", false, true).unwrap();
    let mut keys = Vec::new();
    txn.object_store("mystore")
        .unwrap()
        .open_key_cursor_range(range, CursorDirection::Next)
        .unwrap()
        .iter(&scope, |cursor| {
            keys.push(cursor.primary_key().expect("positioned cursor"));
            Ok(())
        })
        .unwrap();
    txn.wait(&scope).unwrap();
    assert_eq!(keys, vec![Key::from("id2"), Key::from("id3")]);
}

// ============================================================================
// Explicit advances
// ============================================================================

#[test]
fn test_continue_key_skips_intermediate_rows() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("continue-key")).unwrap();

    let txn = db.transaction(TransactionMode::ReadOnly, &["mystore"]).unwrap();
    let mut visited = Vec::new();
    txn.object_store("mystore")
        .unwrap()
        .open_cursor(CursorDirection::Next)
        .unwrap()
        .iter(&scope, |cursor| {
            let key = cursor.key().expect("positioned cursor");
            visited.push(key.clone());
            if key == Key::from("id1") {
                cursor.continue_key("id4")?;
            }
            Ok(())
        })
        .unwrap();
    txn.wait(&scope).unwrap();

    // id2 and id3 are skipped, and the explicit advance is not doubled
    assert_eq!(
        visited,
        vec![Key::from("id1"), Key::from("id4"), Key::from("id5")]
    );
}

#[test]
fn test_advance_skips_rows() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("advance")).unwrap();

    let txn = db.transaction(TransactionMode::ReadOnly, &["mystore"]).unwrap();
    let mut visited = Vec::new();
    txn.object_store("mystore")
        .unwrap()
        .open_cursor(CursorDirection::Next)
        .unwrap()
        .iter(&scope, |cursor| {
            visited.push(cursor.value()?);
            cursor.advance(2)
        })
        .unwrap();
    txn.wait(&scope).unwrap();

    assert_eq!(
        visited,
        vec![
            Value::from("value1"),
            Value::from("value3"),
            Value::from("value5")
        ]
    );
}

#[test]
fn test_rejected_advance_counts_as_iterated() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("rejected")).unwrap();

    let txn = db.transaction(TransactionMode::ReadOnly, &["mystore"]).unwrap();
    let mut visits = 0;
    let err = txn
        .object_store("mystore")
        .unwrap()
        .open_cursor(CursorDirection::Next)
        .unwrap()
        .iter(&scope, |cursor| {
            visits += 1;
            // Behind the current position: the engine refuses it
            let _ = cursor.continue_key("id0");
            Ok(())
        })
        .unwrap_err();

    // The loop does not paper over the failed advance with its own
    assert!(matches!(err, Error::Protocol(_)), "{err}");
    assert_eq!(visits, 1);
    txn.abort().unwrap();
}

#[test]
fn test_second_advance_in_one_row_is_rejected() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("double")).unwrap();

    let txn = db.transaction(TransactionMode::ReadOnly, &["mystore"]).unwrap();
    let mut second = None;
    txn.object_store("mystore")
        .unwrap()
        .open_cursor(CursorDirection::Next)
        .unwrap()
        .iter(&scope, |cursor| {
            cursor.continue_()?;
            if second.is_none() {
                second = Some(cursor.continue_());
            }
            Ok(())
        })
        .unwrap();
    txn.wait(&scope).unwrap();

    let err = second.expect("first row visited").unwrap_err();
    assert!(err.is_exception(DomException::INVALID_STATE_ERROR));
}

// ============================================================================
// Ending early
// ============================================================================

#[test]
fn test_stop_iteration_ends_without_error() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("stop")).unwrap();

    for stop_after in 1..5 {
        let txn = db.transaction(TransactionMode::ReadOnly, &["mystore"]).unwrap();
        let mut visits = 0;
        txn.object_store("mystore")
            .unwrap()
            .open_cursor(CursorDirection::Next)
            .unwrap()
            .iter(&scope, |_| {
                visits += 1;
                if visits == stop_after {
                    return Err(Error::StopIteration);
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(visits, stop_after);
        txn.wait(&scope).unwrap();
    }
}

#[test]
fn test_visitor_error_is_returned_and_transaction_survives() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("visitor-error")).unwrap();

    let txn = db.transaction(TransactionMode::ReadWrite, &["mystore"]).unwrap();
    let store = txn.object_store("mystore").unwrap();
    let err = store
        .open_cursor(CursorDirection::Next)
        .unwrap()
        .iter(&scope, |cursor| {
            if cursor.key() == Some(Key::from("id2")) {
                return Err(anyhow::anyhow!("bad row").into());
            }
            Ok(())
        })
        .unwrap_err();
    assert_eq!(err.to_string(), "bad row");

    // The transaction is still usable and commits
    store.put_key("after", "id6").unwrap();
    txn.wait(&scope).unwrap();
    assert_eq!(read(&db, "mystore", "id6").unwrap(), Value::from("after"));
}

#[test]
fn test_visitor_panic_aborts_transaction() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("visitor-panic")).unwrap();

    let txn = db.transaction(TransactionMode::ReadWrite, &["mystore"]).unwrap();
    let store = txn.object_store("mystore").unwrap();
    store.put_key("lost", "id1").unwrap();
    let err = store
        .open_cursor(CursorDirection::Next)
        .unwrap()
        .iter(&scope, |_| panic!("visitor bug"))
        .unwrap_err();
    match err {
        Error::Panicked(message) => assert!(message.contains("visitor bug")),
        other => panic!("expected a recovered panic, got {other:?}"),
    }

    assert!(matches!(txn.wait(&scope), Err(Error::Aborted)));
    assert_eq!(read(&db, "mystore", "id1").unwrap(), Value::from("value1"));
}

#[test]
fn test_cancelled_scope_ends_iteration() {
    let factory = factory();
    let db = seeded_db(&factory, &unique_name("iter-cancel")).unwrap();

    let txn = db.transaction(TransactionMode::ReadOnly, &["mystore"]).unwrap();
    let (scope, guard) = Scope::background().with_cancel();
    guard.cancel();
    let mut visits = 0;
    let err = txn
        .object_store("mystore")
        .unwrap()
        .open_cursor(CursorDirection::Next)
        .unwrap()
        .iter(&scope, |_| {
            visits += 1;
            Ok(())
        })
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(visits, 0);
    txn.wait(&Scope::background()).unwrap();
}

// ============================================================================
// Writes through the cursor
// ============================================================================

#[test]
fn test_deleting_every_row_empties_the_store() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("delete-all")).unwrap();

    let txn = db.transaction(TransactionMode::ReadWrite, &["mystore"]).unwrap();
    let mut deleted = 0;
    txn.object_store("mystore")
        .unwrap()
        .open_cursor(CursorDirection::Next)
        .unwrap()
        .iter(&scope, |cursor| {
            cursor.delete()?;
            deleted += 1;
            Ok(())
        })
        .unwrap();
    txn.wait(&scope).unwrap();

    assert_eq!(deleted, 5);
    assert_eq!(count(&db, "mystore").unwrap(), 0);
}

#[test]
fn test_update_through_cursor() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("update")).unwrap();

    let txn = db.transaction(TransactionMode::ReadWrite, &["mystore"]).unwrap();
    txn.object_store("mystore")
        .unwrap()
        .open_cursor(CursorDirection::Next)
        .unwrap()
        .iter(&scope, |cursor| {
            let value = cursor.value()?;
            let upper = value.as_str().unwrap_or_default().to_uppercase();
            cursor.update(upper)?;
            Ok(())
        })
        .unwrap();
    txn.wait(&scope).unwrap();

    assert_eq!(read(&db, "mystore", "id4").unwrap(), Value::from("VALUE4"));
}

#[test]
fn test_readonly_cursor_cannot_write() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("readonly-cursor")).unwrap();

    let txn = db.transaction(TransactionMode::ReadOnly, &["mystore"]).unwrap();
    let cursor = txn
        .object_store("mystore")
        .unwrap()
        .open_cursor(CursorDirection::Next)
        .unwrap()
        .wait(&scope)
        .unwrap()
        .expect("first row");
    let err = cursor.delete().unwrap_err();
    assert!(err.is_exception(DomException::READ_ONLY_ERROR));
    txn.wait(&scope).unwrap();
}

// ============================================================================
// Index cursors
// ============================================================================

fn tagged_db(factory: &idbind::Factory, name: &str) -> idbind::Database {
    let scope = Scope::background();
    factory
        .open(&scope, name, 1, |db, _, _| {
            let store = db.create_object_store(
                "items",
                ObjectStoreOptions {
                    key_path: Some("id".to_string()),
                    ..ObjectStoreOptions::default()
                },
            )?;
            store.create_index("by_tag", "tag", IndexOptions::default())?;
            for (id, tag) in [(1, "b"), (2, "a"), (3, "b"), (4, "c"), (5, "a")] {
                store.put(record(id, tag))?;
            }
            Ok(())
        })
        .unwrap()
        .wait(&scope)
        .unwrap()
}

fn index_walk(db: &idbind::Database, direction: CursorDirection) -> Vec<(Key, Key)> {
    let scope = Scope::background();
    let txn = db.transaction(TransactionMode::ReadOnly, &["items"]).unwrap();
    let mut rows = Vec::new();
    let index = txn.object_store("items").unwrap().index("by_tag").unwrap();
    index
        .open_key_cursor(direction)
        .unwrap()
        .iter(&scope, |cursor| {
            rows.push((
                cursor.key().expect("index key"),
                cursor.primary_key().expect("primary key"),
            ));
            Ok(())
        })
        .unwrap();
    txn.wait(&scope).unwrap();
    rows
}

fn pairs(rows: &[(&str, i64)]) -> Vec<(Key, Key)> {
    rows.iter()
        .map(|(tag, id)| (Key::from(*tag), Key::from(*id)))
        .collect()
}

#[test]
fn test_index_cursor_directions() {
    let factory = factory();
    let db = tagged_db(&factory, &unique_name("index-dirs"));

    assert_eq!(
        index_walk(&db, CursorDirection::Next),
        pairs(&[("a", 2), ("a", 5), ("b", 1), ("b", 3), ("c", 4)])
    );
    assert_eq!(
        index_walk(&db, CursorDirection::NextUnique),
        pairs(&[("a", 2), ("b", 1), ("c", 4)])
    );
    assert_eq!(
        index_walk(&db, CursorDirection::Prev),
        pairs(&[("c", 4), ("b", 3), ("b", 1), ("a", 5), ("a", 2)])
    );
    assert_eq!(
        index_walk(&db, CursorDirection::PrevUnique),
        pairs(&[("c", 4), ("b", 1), ("a", 2)])
    );
}

#[test]
fn test_continue_primary_key_on_index_cursor() {
    let factory = factory();
    let scope = Scope::background();
    let db = tagged_db(&factory, &unique_name("primary"));

    let txn = db.transaction(TransactionMode::ReadOnly, &["items"]).unwrap();
    let index = txn.object_store("items").unwrap().index("by_tag").unwrap();
    let mut visited = Vec::new();
    index
        .open_cursor(CursorDirection::Next)
        .unwrap()
        .iter(&scope, |cursor| {
            let primary = cursor.primary_key().expect("primary key");
            visited.push(primary.clone());
            if primary == Key::from(2) {
                cursor.continue_primary_key("b", 3)?;
            }
            Ok(())
        })
        .unwrap();
    txn.wait(&scope).unwrap();
    assert_eq!(visited, vec![Key::from(2), Key::from(3), Key::from(4)]);
}

#[test]
fn test_cursor_reports_its_source_and_direction() {
    let factory = factory();
    let scope = Scope::background();
    let db = tagged_db(&factory, &unique_name("cursor-meta"));

    let txn = db.transaction(TransactionMode::ReadOnly, &["items"]).unwrap();
    let index = txn.object_store("items").unwrap().index("by_tag").unwrap();
    let cursor = index
        .open_cursor_key("c", CursorDirection::Prev)
        .unwrap()
        .wait(&scope)
        .unwrap()
        .expect("one row");
    assert_eq!(cursor.direction(), CursorDirection::Prev);
    assert_eq!(cursor.source().name(), "by_tag");
    assert_eq!(cursor.value().unwrap(), record(4, "c"));
    assert_eq!(cursor.request().ready_state(), idbind::ReadyState::Done);
    txn.wait(&scope).unwrap();
}
