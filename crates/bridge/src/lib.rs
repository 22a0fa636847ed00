//! Blocking, cancellable primitives over an event-driven engine
//!
//! The engine reports every outcome through events; this crate turns them
//! into calls that block the caller until the outcome is known, or until a
//! [`Scope`] is cancelled or its deadline passes:
//! - Request: await one operation, or observe it with callbacks
//! - CursorRequest / CursorWithValueRequest: iterate a record stream with a visitor
//! - Transaction: await the all-or-nothing outcome of a batch
//! - OpenDbRequest: open a database, running a schema upgrader if needed
//! - Factory, Database, ObjectStore, Index: the entity wrappers
//!
//! Every listener attached on the caller's behalf is detached on every exit
//! path, including cancellation and panics inside callbacks.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cursor;
pub mod database;
pub mod factory;
pub mod index;
pub mod listener;
pub mod open;
mod rendezvous;
pub mod request;
pub mod store;
pub mod transaction;
pub mod views;


pub use cursor::{Cursor, CursorRequest, CursorWithValue, CursorWithValueRequest};
pub use database::Database;
pub use factory::Factory;
pub use index::Index;
pub use listener::{listen, Registration};
pub use open::{OpenDbRequest, Upgrader};
pub use request::{FailureCallback, Request, Subscription, SuccessCallback};
pub use store::{BaseStore, ObjectStore, Source};
pub use transaction::{Transaction, TransactionOptions};
pub use views::{AckRequest, ArrayRequest, CountRequest};

pub use idbind_core::{
    BridgeConfig, CancelGuard, CancelHandle, CancelReason, CursorDirection, DomException,
    Durability, Error, IndexOptions, Key, KeyRange, ObjectStoreOptions, Result, Scope,
    TransactionMode, Value, VersionChangePolicy,
};
