//! Request Tests
//!
//! Terminal events, result/error consistency and request metadata.

use crate::common::*;
use idbind::{
    DomException, Error, ObjectStoreOptions, ReadyState, Request, Scope, Source, TransactionMode,
    Value,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Counters {
    successes: AtomicUsize,
    failures: AtomicUsize,
}

/// Attach counting callbacks. Called from inside the upgrader, which runs on
/// the dispatcher, so no terminal event can fire before the callbacks attach.
fn count_events(request: &Request, counters: &Arc<Counters>) -> idbind::Result<()> {
    let on_success = Arc::clone(counters);
    let on_failure = Arc::clone(counters);
    request.listen(
        &Scope::background(),
        move || {
            on_success.successes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        move |_| {
            on_failure.failures.fetch_add(1, Ordering::SeqCst);
        },
    )?;
    Ok(())
}

// ============================================================================
// Terminal events
// ============================================================================

#[test]
fn test_successful_requests_fire_success_once() {
    let factory = factory();
    let scope = Scope::background();
    let put_counters = Arc::new(Counters::default());
    let get_counters = Arc::new(Counters::default());
    let issued: Arc<Mutex<Vec<Request>>> = Arc::default();

    let (p, g, keep) = (
        Arc::clone(&put_counters),
        Arc::clone(&get_counters),
        Arc::clone(&issued),
    );
    let db = factory
        .open(&scope, &unique_name("success"), 1, move |db, _, _| {
            let store = db.create_object_store("kv", ObjectStoreOptions::default())?;
            let put = store.put_key("alpha", "a")?;
            count_events(&put, &p)?;
            let get = store.get("a")?;
            count_events(&get, &g)?;
            keep.lock().extend([put, get]);
            Ok(())
        })
        .unwrap()
        .wait(&scope)
        .unwrap();

    for counters in [&put_counters, &get_counters] {
        assert_eq!(counters.successes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.failures.load(Ordering::SeqCst), 0);
    }
    let issued = issued.lock();
    assert_eq!(issued[0].result().unwrap(), Value::from("a"));
    assert_eq!(issued[1].result().unwrap(), Value::from("alpha"));
    assert!(issued[1].error().unwrap().is_none());
    assert_eq!(issued[1].ready_state(), ReadyState::Done);
    db.close();
}

#[test]
fn test_failed_request_fires_error_once_and_aborts_the_upgrade() {
    let factory = factory();
    let scope = Scope::background();
    let add_counters = Arc::new(Counters::default());
    let issued: Arc<Mutex<Vec<Request>>> = Arc::default();

    let (c, keep) = (Arc::clone(&add_counters), Arc::clone(&issued));
    let err = factory
        .open(&scope, &unique_name("failure"), 1, move |db, _, _| {
            let store = db.create_object_store("kv", ObjectStoreOptions::default())?;
            store.add_key("first", "k")?;
            let duplicate = store.add_key("second", "k")?;
            count_events(&duplicate, &c)?;
            keep.lock().push(duplicate);
            Ok(())
        })
        .unwrap()
        .wait(&scope)
        .unwrap_err();

    assert!(err.is_exception(DomException::ABORT_ERROR), "{err}");
    assert_eq!(add_counters.successes.load(Ordering::SeqCst), 0);
    assert_eq!(add_counters.failures.load(Ordering::SeqCst), 1);
    let duplicate = &issued.lock()[0];
    assert!(duplicate
        .result()
        .unwrap_err()
        .is_exception(DomException::CONSTRAINT_ERROR));
    assert!(duplicate
        .error()
        .unwrap()
        .is_some_and(|e| e.is(DomException::CONSTRAINT_ERROR)));
}

#[test]
fn test_wait_returns_engine_error() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("engine-error")).unwrap();

    let txn = db.transaction(TransactionMode::ReadWrite, &["mystore"]).unwrap();
    let store = txn.object_store("mystore").unwrap();
    let err = store.add_key("again", "id1").unwrap().wait(&scope).unwrap_err();
    assert!(err.is_exception(DomException::CONSTRAINT_ERROR));

    // The failure aborts the transaction with the same cause
    let err = txn.wait(&scope).unwrap_err();
    assert!(err.is_exception(DomException::CONSTRAINT_ERROR));
    assert!(txn
        .error()
        .is_some_and(|e| e.is(DomException::CONSTRAINT_ERROR)));
}

#[test]
fn test_wait_catches_up_with_settled_request() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("catch-up")).unwrap();

    let txn = db.transaction(TransactionMode::ReadOnly, &["mystore"]).unwrap();
    let request = txn.object_store("mystore").unwrap().get("id2").unwrap();
    assert_eq!(request.wait(&scope).unwrap(), Value::from("value2"));
    // Settled before this second wait attached anything
    assert_eq!(request.wait(&scope).unwrap(), Value::from("value2"));
    txn.wait(&scope).unwrap();
}

#[test]
fn test_listen_error_receives_failure() {
    let factory = factory();
    let scope = Scope::background();
    let seen: Arc<Mutex<Option<Error>>> = Arc::default();

    let slot = Arc::clone(&seen);
    let _ = factory
        .open(&scope, &unique_name("listen-error"), 1, move |db, _, _| {
            let store = db.create_object_store("kv", ObjectStoreOptions::default())?;
            store.add_key("first", 1)?;
            store.add_key("second", 1)?.listen_error(&Scope::background(), move |err| {
                *slot.lock() = Some(err);
            })?;
            Ok(())
        })
        .unwrap()
        .wait(&scope);

    let err = seen.lock().take().expect("failure callback ran");
    assert!(err.is_exception(DomException::CONSTRAINT_ERROR));
}

#[test]
fn test_failing_success_callback_aborts_transaction() {
    let factory = factory();
    let scope = Scope::background();
    let name = unique_name("callback-error");
    let handed: Arc<Mutex<Option<Error>>> = Arc::default();

    let slot = Arc::clone(&handed);
    let err = factory
        .open(&scope, &name, 1, move |db, _, _| {
            let store = db.create_object_store("kv", ObjectStoreOptions::default())?;
            store.put_key("value", "k")?.listen(
                &Scope::background(),
                || Err(anyhow::anyhow!("rejected by the application").into()),
                move |err| {
                    *slot.lock() = Some(err);
                },
            )?;
            Ok(())
        })
        .unwrap()
        .wait(&scope)
        .unwrap_err();

    assert!(err.is_exception(DomException::ABORT_ERROR));
    let handed = handed.lock().take().expect("failure callback ran");
    assert_eq!(handed.to_string(), "rejected by the application");
    // The aborted upgrade never created the database
    assert!(factory.databases().unwrap().iter().all(|info| info.name != name));
}

// ============================================================================
// Metadata
// ============================================================================

#[test]
fn test_request_metadata() {
    let factory = factory();
    let scope = Scope::background();
    let db = seeded_db(&factory, &unique_name("metadata")).unwrap();

    let txn = db.transaction(TransactionMode::ReadOnly, &["mystore"]).unwrap();
    let request = txn.object_store("mystore").unwrap().get("id1").unwrap();
    match request.source() {
        Some(Source::ObjectStore(store)) => assert_eq!(store.name(), "mystore"),
        other => panic!("unexpected source: {other:?}"),
    }
    assert_eq!(request.transaction().unwrap().handle_id(), txn.handle_id());
    request.wait(&scope).unwrap();
    txn.wait(&scope).unwrap();

    let delete = factory.delete_database("nothing-here").unwrap();
    assert!(matches!(delete.transaction(), Err(Error::NotInTransaction)));
    assert!(delete.source().is_none());
    delete.wait(&scope).unwrap();
}

#[test]
fn test_pending_request_is_not_ready() {
    let factory = factory();
    let scope = Scope::background();
    let name = unique_name("pending");
    let observed: Arc<Mutex<Vec<bool>>> = Arc::default();

    let seen = Arc::clone(&observed);
    factory
        .open(&scope, &name, 1, move |db, _, _| {
            let store = db.create_object_store("kv", ObjectStoreOptions::default())?;
            let put = store.put_key(1, 1)?;
            // Still queued behind this callback on the dispatcher
            seen.lock().push(put.ready_state() == ReadyState::Pending);
            seen.lock().push(matches!(put.result(), Err(Error::NotReady)));
            seen.lock().push(matches!(put.error(), Err(Error::NotReady)));
            Ok(())
        })
        .unwrap()
        .wait(&scope)
        .unwrap();

    assert_eq!(*observed.lock(), vec![true, true, true]);
}
