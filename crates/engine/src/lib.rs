//! In-memory reference engine for idbind
//!
//! This crate implements the engine traits of `idbind-core` with:
//! - Dispatcher: one FIFO worker thread that runs every engine task and
//!   fires every event
//! - Transactions: per-transaction write deltas, auto-commit once idle,
//!   rollback on failure
//! - Object stores and indexes: key paths, key generators, unique and
//!   multi-entry indexes
//! - Cursors: all four directions, continue to a key or primary key, updates
//!   and deletes through the cursor
//! - Open: version checks, `versionchange`/`blocked`/`upgradeneeded`, and
//!   schema rollback when an upgrade aborts
//!
//! Events never fire on the thread that issued the operation, so callers
//! observe the same cross-thread delivery a real event-driven engine gives.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dispatcher;
pub mod factory;

mod connection;
mod cursor;
mod data;
mod listeners;
mod request;
mod store;
mod transaction;

pub use config::{ConfigError, EngineConfig, DEFAULT_DISPATCHER_THREAD_NAME};
pub use dispatcher::{is_dispatch_thread, Dispatcher, DispatcherStats};
pub use factory::MemoryFactory;
