//! Database connections

use crate::listener::Registration;
use crate::store::ObjectStore;
use crate::transaction::{Transaction, TransactionOptions};
use idbind_core::{
    BridgeConfig, DomException, Error, ObjectStoreOptions, RawDatabase, Result, TransactionMode,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// State shared by every handle to one connection
pub(crate) struct Connection {
    pub(crate) config: Arc<BridgeConfig>,
    outdated: AtomicBool,
    watch: Mutex<Option<Arc<Registration>>>,
}

impl Connection {
    pub(crate) fn new(config: Arc<BridgeConfig>) -> Self {
        Self {
            config,
            outdated: AtomicBool::new(false),
            watch: Mutex::new(None),
        }
    }

    pub(crate) fn mark_outdated(&self) {
        self.outdated.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_watched(&self) -> bool {
        self.watch.lock().is_some()
    }

    pub(crate) fn set_watch(&self, registration: Arc<Registration>) {
        if let Some(previous) = self.watch.lock().replace(registration) {
            previous.release();
        }
    }

    pub(crate) fn release_watch(&self) {
        let watch = self.watch.lock().take();
        if let Some(registration) = watch {
            registration.release();
        }
    }
}

/// An open connection to a database
#[derive(Clone)]
pub struct Database {
    raw: Arc<dyn RawDatabase>,
    connection: Arc<Connection>,
    /// Set only for the handle passed to an upgrader
    upgrade: Option<Transaction>,
}

impl Database {
    pub(crate) fn new(
        raw: Arc<dyn RawDatabase>,
        connection: Arc<Connection>,
        upgrade: Option<Transaction>,
    ) -> Self {
        Self {
            raw,
            connection,
            upgrade,
        }
    }

    /// Database name
    pub fn name(&self) -> String {
        self.raw.name()
    }

    /// Schema version of this connection
    pub fn version(&self) -> u64 {
        self.raw.version()
    }

    /// Object store names, sorted
    pub fn object_store_names(&self) -> Vec<String> {
        self.raw.object_store_names()
    }

    /// The upgrade transaction, when called from inside an upgrader
    pub fn upgrade_transaction(&self) -> Option<&Transaction> {
        self.upgrade.as_ref()
    }

    fn require_upgrade(&self, operation: &str) -> Result<&Transaction> {
        self.upgrade.as_ref().ok_or_else(|| {
            Error::Engine(DomException::invalid_state(format!(
                "{operation} is only allowed inside an upgrade"
            )))
        })
    }

    /// Create an object store. Only valid inside an upgrader.
    pub fn create_object_store(
        &self,
        name: &str,
        options: ObjectStoreOptions,
    ) -> Result<ObjectStore> {
        let txn = self.require_upgrade("create_object_store")?;
        let raw = self.raw.create_object_store(name, options)?;
        txn.cache_store(name, Arc::clone(&raw));
        Ok(ObjectStore::new(raw, txn.clone()))
    }

    /// Delete an object store. Only valid inside an upgrader.
    pub fn delete_object_store(&self, name: &str) -> Result<()> {
        let txn = self.require_upgrade("delete_object_store")?;
        self.raw.delete_object_store(name)?;
        txn.forget_store(name);
        Ok(())
    }

    /// Start a transaction over `store_names` with default durability
    pub fn transaction(&self, mode: TransactionMode, store_names: &[&str]) -> Result<Transaction> {
        self.transaction_with_options(TransactionOptions::new(mode), store_names)
    }

    /// Start a transaction over `store_names`
    pub fn transaction_with_options(
        &self,
        options: TransactionOptions,
        store_names: &[&str],
    ) -> Result<Transaction> {
        if options.mode == TransactionMode::VersionChange {
            return Err(Error::Engine(DomException::new(
                DomException::TYPE_ERROR,
                "versionchange transactions are created by the engine",
            )));
        }
        let names: Vec<String> = store_names.iter().map(|s| s.to_string()).collect();
        let raw = self.raw.transaction(&names, options.mode, options.durability)?;
        Ok(Transaction::new(raw, Some(self.without_upgrade())))
    }

    fn without_upgrade(&self) -> Database {
        Database {
            raw: Arc::clone(&self.raw),
            connection: Arc::clone(&self.connection),
            upgrade: None,
        }
    }

    /// Close the connection once its transactions finish
    pub fn close(&self) {
        self.connection.release_watch();
        self.raw.close();
    }

    /// Whether another connection requested a version change while this one
    /// was configured to stay open
    pub fn is_outdated(&self) -> bool {
        self.connection.outdated.load(Ordering::SeqCst)
    }

    /// Configuration this connection was opened with
    pub fn config(&self) -> &BridgeConfig {
        &self.connection.config
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.raw.name())
            .field("version", &self.raw.version())
            .field("upgrading", &self.upgrade.is_some())
            .finish()
    }
}
