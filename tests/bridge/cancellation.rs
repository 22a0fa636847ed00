//! Cancellation Tests
//!
//! Waits abandoned through their scope: already-cancelled scopes, expired
//! deadlines, and cancellation while parked.

use crate::common::*;
use idbind::{
    BridgeConfig, CancelReason, Error, Factory, Scope, TransactionMode, Value, VersionChangePolicy,
};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_cancelled_scope_returns_without_waiting() {
    let factory = factory();
    let db = seeded_db(&factory, &unique_name("cancelled")).unwrap();
    let txn = db.transaction(TransactionMode::ReadOnly, &["mystore"]).unwrap();
    let request = txn.object_store("mystore").unwrap().get("id3").unwrap();

    let (scope, guard) = Scope::background().with_cancel();
    guard.cancel();
    match request.wait(&scope) {
        Err(Error::Cancelled(CancelReason::Cancelled)) => {}
        other => panic!("expected a cancelled wait, got {other:?}"),
    }

    // The engine still resolves the request
    assert_eq!(
        request.wait(&Scope::background()).unwrap(),
        Value::from("value3")
    );
    txn.wait(&Scope::background()).unwrap();
}

#[test]
fn test_expired_deadline_returns_cancellation() {
    let factory = factory();
    let db = seeded_db(&factory, &unique_name("expired")).unwrap();
    let txn = db.transaction(TransactionMode::ReadOnly, &["mystore"]).unwrap();
    let request = txn.object_store("mystore").unwrap().count().unwrap();

    let (scope, _guard) = Scope::background().with_deadline(Instant::now());
    let started = Instant::now();
    let err = request.wait(&scope).unwrap_err();
    assert!(err.is_cancelled(), "{err}");
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(request.wait(&Scope::background()).unwrap(), 5);
    txn.wait(&Scope::background()).unwrap();
}

#[test]
fn test_cancelling_a_parked_wait() {
    let engine = std::sync::Arc::new(idbind::MemoryFactory::start().unwrap());
    let config = BridgeConfig {
        on_version_change: VersionChangePolicy::Flag,
        ..BridgeConfig::default()
    };
    let factory = Factory::with_config(engine, config);
    let name = unique_name("parked");
    let first = seeded_db(&factory, &name).unwrap();

    // `first` keeps its connection open, so the upgrade stays blocked
    let open = factory.open(&Scope::background(), &name, 2, |_, _, _| Ok(())).unwrap();
    let (scope, guard) = Scope::background().with_cancel();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        guard.cancel();
    });
    let err = open.wait(&scope).unwrap_err();
    canceller.join().unwrap();
    assert!(err.is_cancelled(), "{err}");
    assert!(first.is_outdated());

    // Closing the old connection lets the abandoned open finish
    first.close();
    let second = open.wait(&Scope::background()).unwrap();
    assert_eq!(second.version(), 2);
}

#[test]
fn test_configured_timeout_bounds_the_wait() {
    let engine = std::sync::Arc::new(idbind::MemoryFactory::start().unwrap());
    let config = BridgeConfig {
        on_version_change: VersionChangePolicy::Flag,
        default_timeout_ms: Some(50),
    };
    let factory = Factory::with_config(engine, config);
    let name = unique_name("timeout");
    let first = seeded_db(&factory, &name).unwrap();

    let open = factory.open_existing(&Scope::background(), &name, 3).unwrap();
    let (scope, _guard) = first.config().scope();
    match open.wait(&scope) {
        Err(Error::Cancelled(CancelReason::DeadlineExceeded)) => {}
        other => panic!("expected an expired wait, got {other:?}"),
    }
    first.close();
}
