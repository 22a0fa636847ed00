//! Factory: the entry point wrapping an engine

use crate::database::{Connection, Database};
use crate::open::{OpenDbRequest, Upgrader};
use crate::request::Request;
use crate::views::AckRequest;
use idbind_core::{BridgeConfig, DatabaseInfo, RawFactory, Result, Scope, Value};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Opens and deletes databases on one engine
#[derive(Clone)]
pub struct Factory {
    raw: Arc<dyn RawFactory>,
    config: Arc<BridgeConfig>,
}

impl Factory {
    /// Wrap an engine with the default configuration
    pub fn new(raw: Arc<dyn RawFactory>) -> Self {
        Self::with_config(raw, BridgeConfig::default())
    }

    /// Wrap an engine; every database opened through it uses `config`
    pub fn with_config(raw: Arc<dyn RawFactory>, config: BridgeConfig) -> Self {
        Self {
            raw,
            config: Arc::new(config),
        }
    }

    /// Configuration handed to opened databases
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Open `name` at `version`, running `upgrader` if the stored version is
    /// lower. Version 0 opens the current version (1 for a new database).
    ///
    /// `scope` bounds the lifetime of the upgrade listener; the open itself is
    /// awaited with [`OpenDbRequest::wait`].
    pub fn open<F>(&self, scope: &Scope, name: &str, version: u64, upgrader: F) -> Result<OpenDbRequest>
    where
        F: FnOnce(&Database, u64, u64) -> Result<()> + Send + 'static,
    {
        self.start_open(scope, name, version, Some(Box::new(upgrader)))
    }

    /// Open `name` without a schema upgrade callback
    pub fn open_existing(&self, scope: &Scope, name: &str, version: u64) -> Result<OpenDbRequest> {
        self.start_open(scope, name, version, None)
    }

    fn start_open(
        &self,
        scope: &Scope,
        name: &str,
        version: u64,
        upgrader: Option<Upgrader>,
    ) -> Result<OpenDbRequest> {
        let requested = (version != 0).then_some(version);
        debug!(target: "idbind::open", db = %name, version = ?requested, "Opening database");
        let raw = self.raw.open(name, requested)?;
        let connection = Arc::new(Connection::new(Arc::clone(&self.config)));
        OpenDbRequest::start(scope, raw, connection, upgrader)
    }

    /// Delete `name`; succeeds whether or not it exists
    pub fn delete_database(&self, name: &str) -> Result<AckRequest> {
        debug!(target: "idbind::open", db = %name, "Deleting database");
        let raw = self.raw.delete_database(name)?;
        Ok(AckRequest::new(Request::new(raw, None)))
    }

    /// Order two values as keys.
    ///
    /// # Errors
    ///
    /// `DataError` if either value is not a valid key.
    pub fn compare_keys(&self, a: &Value, b: &Value) -> Result<Ordering> {
        Ok(self.raw.cmp(a, b)?)
    }

    /// Names and versions of existing databases
    pub fn databases(&self) -> Result<Vec<DatabaseInfo>> {
        Ok(self.raw.databases()?)
    }
}

impl std::fmt::Debug for Factory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
