//! Core types and traits for idbind
//!
//! This crate defines the foundational types shared by the bridge and by
//! engine implementations:
//! - Value: structured values stored in and returned by the engine
//! - Key / KeyRange: engine keys with their total ordering, and key ranges
//! - DomException / Error: the error hierarchy
//! - Scope: cancellation and deadline context for blocking calls
//! - BridgeConfig: configuration loaded from TOML
//! - engine: the collaborator contract an event-driven engine implements

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod error;
pub mod key;
pub mod scope;
pub mod value;

pub use config::{BridgeConfig, VersionChangePolicy};
pub use engine::{
    CursorDirection, DatabaseInfo, Durability, Event, EventKind, EventTarget, IndexOptions,
    Listener, ListenerId, ObjectStoreOptions, Query, RawCursor, RawDatabase, RawFactory, RawIndex,
    RawObjectStore, RawRequest, RawResult, RawSource, RawSourceHandle, RawTransaction, ReadyState,
    TransactionMode, TransactionOutcome,
};
pub use error::{DomException, EngineResult, Error, Result};
pub use key::{Key, KeyRange};
pub use scope::{CancelGuard, CancelHandle, CancelReason, HookId, Scope};
pub use value::Value;
