//! idbind - blocking, cancellable primitives over event-driven IndexedDB-style engines
//!
//! Engines of this family report every outcome through events. idbind turns
//! those events into calls that block the caller until the outcome is known,
//! or until a [`Scope`] is cancelled or its deadline passes.
//!
//! # Quick Start
//!
//! ```ignore
//! use idbind::{Scope, ObjectStoreOptions, TransactionMode, Value};
//!
//! let factory = idbind::global()?;
//! let scope = Scope::background();
//! let db = factory
//!     .open(&scope, "notes", 1, |db, _old, _new| {
//!         db.create_object_store("notes", ObjectStoreOptions::default())?;
//!         Ok(())
//!     })?
//!     .wait(&scope)?;
//!
//! let txn = db.transaction(TransactionMode::ReadWrite, &["notes"])?;
//! txn.object_store("notes")?.put_key("remember the milk", "n1")?;
//! txn.wait(&scope)?;
//! ```
//!
//! # Architecture
//!
//! - `idbind-core`: values, keys, errors, scopes, configuration and the
//!   engine collaborator traits
//! - `idbind-bridge`: the blocking wrappers ([`Factory`], [`Database`],
//!   [`Transaction`], [`Request`], cursors)
//! - `idbind-engine`: [`MemoryFactory`], an in-process reference engine
//!
//! Library code should take a [`Factory`] explicitly. The process-wide
//! factory below exists for applications that want one ready-made handle.

pub use idbind_bridge::*;
pub use idbind_core::{
    DatabaseInfo, EngineResult, Event, EventKind, HookId, Query, RawFactory, ReadyState,
    TransactionOutcome,
};
pub use idbind_engine::{EngineConfig, MemoryFactory};

use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::debug;

static GLOBAL: OnceCell<Factory> = OnceCell::new();

/// The process-wide factory.
///
/// Unless [`install_global`] ran first, the first call starts a
/// [`MemoryFactory`] with the default configuration.
///
/// # Errors
///
/// Returns `Error::Io` if the engine's dispatcher thread cannot be spawned.
pub fn global() -> Result<&'static Factory> {
    GLOBAL.get_or_try_init(|| {
        let engine = MemoryFactory::start()?;
        debug!(target: "idbind::factory", "Started the default in-memory engine");
        Ok(Factory::new(Arc::new(engine)))
    })
}

/// Make `factory` the process-wide factory.
///
/// # Errors
///
/// Hands `factory` back if a global factory is already in place, including
/// one started implicitly by [`global`].
pub fn install_global(factory: Factory) -> std::result::Result<(), Factory> {
    GLOBAL.set(factory)
}
