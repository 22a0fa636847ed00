//! Transaction wrapper
//!
//! A [`Transaction`] groups requests with one all-or-nothing outcome. Its
//! outcome is awaited separately from the outcomes of the requests it
//! contains:
//!
//! - `complete` resolves [`Transaction::wait`] with `Ok(())`;
//! - `error` (always followed by `abort`) resolves it with the engine error of
//!   the request that caused the abort;
//! - `abort` without a preceding `error` resolves it with `Error::Aborted`.
//!
//! Object store handles are cached per name, so repeated lookups return the
//! same handle for the lifetime of the transaction.

use crate::database::Database;
use crate::listener::listen;
use crate::rendezvous::Rendezvous;
use crate::request::ensure_may_block;
use crate::store::ObjectStore;
use idbind_core::{
    DomException, Durability, Error, Event, EventKind, RawObjectStore, RawTransaction, Result,
    Scope, TransactionMode, TransactionOutcome,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Mode and durability for a new transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Read-only or read-write
    pub mode: TransactionMode,
    /// Durability hint
    pub durability: Durability,
}

impl TransactionOptions {
    /// Options with the given mode and default durability
    pub fn new(mode: TransactionMode) -> Self {
        Self {
            mode,
            durability: Durability::Default,
        }
    }

    /// Set the durability hint
    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }
}

struct TransactionInner {
    raw: Arc<dyn RawTransaction>,
    /// `None` for the upgrade transaction, which the database itself owns
    database: Option<Database>,
    stores: Mutex<HashMap<String, Arc<dyn RawObjectStore>>>,
}

/// A batch of requests with one outcome
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    pub(crate) fn new(raw: Arc<dyn RawTransaction>, database: Option<Database>) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                raw,
                database,
                stores: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn raw(&self) -> &Arc<dyn RawTransaction> {
        &self.inner.raw
    }

    /// Stable identity of the underlying transaction
    pub fn handle_id(&self) -> u64 {
        self.inner.raw.handle_id()
    }

    /// The object store `name`.
    ///
    /// # Errors
    ///
    /// `NotFoundError` if `name` was not in scope when the transaction was
    /// opened; `InvalidStateError` once the transaction has finished.
    pub fn object_store(&self, name: &str) -> Result<ObjectStore> {
        let raw = {
            let mut stores = self.inner.stores.lock();
            match stores.get(name) {
                Some(raw) => Arc::clone(raw),
                None => {
                    let raw = self.inner.raw.object_store(name)?;
                    stores.insert(name.to_string(), Arc::clone(&raw));
                    raw
                }
            }
        };
        Ok(ObjectStore::new(raw, self.clone()))
    }

    pub(crate) fn cache_store(&self, name: &str, raw: Arc<dyn RawObjectStore>) {
        self.inner.stores.lock().insert(name.to_string(), raw);
    }

    pub(crate) fn forget_store(&self, name: &str) {
        self.inner.stores.lock().remove(name);
    }

    /// The connection this transaction belongs to; `None` for the upgrade
    /// transaction, whose database is the one passed to the upgrader
    pub fn database(&self) -> Option<&Database> {
        self.inner.database.as_ref()
    }

    /// Transaction mode
    pub fn mode(&self) -> TransactionMode {
        self.inner.raw.mode()
    }

    /// Durability hint
    pub fn durability(&self) -> Durability {
        self.inner.raw.durability()
    }

    /// The failure that aborted the transaction, if any
    pub fn error(&self) -> Option<DomException> {
        self.inner.raw.error()
    }

    /// Names of the stores in scope, sorted
    pub fn object_store_names(&self) -> Vec<String> {
        self.inner.raw.object_store_names()
    }

    /// Commit once the queued requests finish.
    ///
    /// Engines without explicit commit auto-commit when their queue drains;
    /// for them this is a no-op.
    pub fn commit(&self) -> Result<()> {
        if !self.inner.raw.supports_commit() {
            debug!(target: "idbind::txn", id = self.handle_id(), "Engine has no explicit commit; relying on auto-commit");
            return Ok(());
        }
        self.inner.raw.commit()?;
        debug!(target: "idbind::txn", id = self.handle_id(), "Commit requested");
        Ok(())
    }

    /// Roll back.
    ///
    /// # Errors
    ///
    /// The engine's error (normally `InvalidStateError`) when the transaction
    /// already finished.
    pub fn abort(&self) -> Result<()> {
        self.inner.raw.abort()?;
        debug!(target: "idbind::txn", id = self.handle_id(), "Abort requested");
        Ok(())
    }

    /// Block until the transaction completes or aborts, or `scope` ends
    pub fn wait(&self, scope: &Scope) -> Result<()> {
        ensure_may_block()?;
        let slot = Rendezvous::new();
        let (listening, _guard) = scope.with_cancel();
        let raw = &self.inner.raw;

        let done = slot.clone();
        listen(&listening, raw, EventKind::Complete, move |_| {
            done.resolve(Ok(()));
        })?;
        let failed = slot.clone();
        let weak = Arc::downgrade(raw);
        listen(&listening, raw, EventKind::Error, move |event: &Event| {
            let txn_error = weak.upgrade().and_then(|txn| txn.error());
            failed.resolve(Err(cause(event, txn_error)));
        })?;
        let aborted = slot.clone();
        listen(&listening, raw, EventKind::Abort, move |_| {
            aborted.resolve(Err(Error::Aborted));
        })?;

        // The transaction may have finished before the listeners attached
        match raw.outcome() {
            Some(TransactionOutcome::Committed) => {
                slot.resolve(Ok(()));
            }
            Some(TransactionOutcome::Aborted(Some(e))) => {
                slot.resolve(Err(Error::Engine(e)));
            }
            Some(TransactionOutcome::Aborted(None)) => {
                slot.resolve(Err(Error::Aborted));
            }
            None => {}
        }

        let outcome = slot.wait(scope)?;
        match &outcome {
            Ok(()) => debug!(target: "idbind::txn", id = self.handle_id(), "Transaction completed"),
            Err(e) => debug!(target: "idbind::txn", id = self.handle_id(), error = %e, "Transaction aborted"),
        }
        outcome
    }
}

/// The error behind a transaction-level `error` event
fn cause(event: &Event, txn_error: Option<DomException>) -> Error {
    let from_origin = event
        .origin
        .as_ref()
        .and_then(|origin| origin.error().ok().flatten());
    match from_origin.or(txn_error) {
        Some(e) => Error::Engine(e),
        None => Error::Aborted,
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.handle_id())
            .field("mode", &self.mode())
            .finish()
    }
}
