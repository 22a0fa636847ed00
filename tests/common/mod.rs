//! Shared test utilities for the workspace integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]

use idbind::{
    Database, Factory, MemoryFactory, ObjectStoreOptions, Result, Scope, TransactionMode, Value,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Route `tracing` output through the test harness writer
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// A database name no other test uses
pub fn unique_name(prefix: &str) -> String {
    format!("{}-{}", prefix, COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// A factory over a fresh in-memory engine
pub fn factory() -> Factory {
    init_tracing();
    let engine = MemoryFactory::start().expect("dispatcher thread");
    Factory::new(Arc::new(engine))
}

// ============================================================================
// Values
// ============================================================================

/// Build an object value from field pairs
pub fn object<const N: usize>(fields: [(&str, Value); N]) -> Value {
    Value::from(
        fields
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect::<BTreeMap<_, _>>(),
    )
}

/// A record `{ id, tag }`
pub fn record(id: i64, tag: &str) -> Value {
    object([("id", Value::Int(id)), ("tag", Value::from(tag))])
}

// ============================================================================
// Databases
// ============================================================================

/// Keys of the seeded "mystore" store
pub const SEED_KEYS: [&str; 5] = ["id1", "id2", "id3", "id4", "id5"];

/// Values of the seeded "mystore" store, in key order
pub fn seed_values() -> Vec<Value> {
    (1..=5).map(|i| Value::from(format!("value{i}"))).collect()
}

/// Open `name` at version 1 with an out-of-line store "mystore" holding
/// `id1..id5` -> `value1..value5`
pub fn seeded_db(factory: &Factory, name: &str) -> Result<Database> {
    let scope = Scope::background();
    factory
        .open(&scope, name, 1, |db, _, _| {
            let store = db.create_object_store("mystore", ObjectStoreOptions::default())?;
            for (key, value) in SEED_KEYS.iter().zip(seed_values()) {
                store.put_key(value, *key)?;
            }
            Ok(())
        })?
        .wait(&scope)
}

/// Open `name` at version 1 with a store "items" keyed by `id`
pub fn items_db(factory: &Factory, name: &str) -> Result<Database> {
    let scope = Scope::background();
    factory
        .open(&scope, name, 1, |db, _, _| {
            db.create_object_store(
                "items",
                ObjectStoreOptions {
                    key_path: Some("id".to_string()),
                    ..ObjectStoreOptions::default()
                },
            )?;
            Ok(())
        })?
        .wait(&scope)
}

/// Number of records in `store`, read in a fresh transaction
pub fn count(db: &Database, store: &str) -> Result<u64> {
    let scope = Scope::background();
    let txn = db.transaction(TransactionMode::ReadOnly, &[store])?;
    let count = txn.object_store(store)?.count()?.wait(&scope)?;
    txn.wait(&scope)?;
    Ok(count)
}

/// Value stored under `key`, read in a fresh transaction
pub fn read(db: &Database, store: &str, key: &str) -> Result<Value> {
    let scope = Scope::background();
    let txn = db.transaction(TransactionMode::ReadOnly, &[store])?;
    let value = txn.object_store(store)?.get(key)?.wait(&scope)?;
    txn.wait(&scope)?;
    Ok(value)
}
