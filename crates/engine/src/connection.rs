//! Databases and connections

use crate::data::{DatabaseState, StoreData};
use crate::factory::Engine;
use crate::listeners::ListenerSet;
use crate::store::StoreHandle;
use crate::transaction::{TxnCore, TxnHandle};
use idbind_core::{
    DomException, Durability, EngineResult, Event, EventKind, EventTarget, Listener, ListenerId,
    ObjectStoreOptions, RawDatabase, RawObjectStore, RawTransaction, TransactionMode,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Work deferred until the database is free to upgrade
pub(crate) type Deferred = Box<dyn FnOnce() + Send>;

/// One named database
pub(crate) struct DbEntry {
    pub(crate) name: String,
    pub(crate) state: Mutex<DatabaseState>,
    connections: Mutex<Vec<Weak<Connection>>>,
    /// An upgrade transaction is running
    pub(crate) upgrading: AtomicBool,
    /// Opens waiting for an upgrade to finish or for connections to close
    deferred: Mutex<VecDeque<Deferred>>,
}

impl DbEntry {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(DatabaseState::default()),
            connections: Mutex::new(Vec::new()),
            upgrading: AtomicBool::new(false),
            deferred: Mutex::new(VecDeque::new()),
        })
    }

    pub(crate) fn version(&self) -> u64 {
        self.state.lock().version
    }

    fn register(&self, connection: &Arc<Connection>) {
        let mut connections = self.connections.lock();
        connections.retain(|c| c.strong_count() > 0);
        connections.push(Arc::downgrade(connection));
    }

    /// Connections still open, other than `except`
    pub(crate) fn open_connections(&self, except: Option<&Arc<Connection>>) -> Vec<Arc<Connection>> {
        self.connections
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.is_closed())
            .filter(|c| except.map_or(true, |e| !Arc::ptr_eq(c, e)))
            .collect()
    }

    pub(crate) fn defer(&self, work: Deferred) {
        self.deferred.lock().push_back(work);
    }

    pub(crate) fn has_deferred(&self) -> bool {
        !self.deferred.lock().is_empty()
    }

    pub(crate) fn take_deferred(&self) -> Vec<Deferred> {
        self.deferred.lock().drain(..).collect()
    }
}

/// An open connection to a database
pub(crate) struct Connection {
    id: u64,
    engine: Arc<Engine>,
    pub(crate) db: Arc<DbEntry>,
    version: u64,
    closed: AtomicBool,
    listeners: ListenerSet,
    /// The running version change transaction, while the open that created
    /// this connection upgrades
    upgrade: Mutex<Weak<TxnHandle>>,
    me: Weak<Connection>,
}

impl Connection {
    pub(crate) fn new(engine: Arc<Engine>, db: Arc<DbEntry>, version: u64) -> Arc<Self> {
        let connection = Arc::new_cyclic(|me| Self {
            id: engine.next_id(),
            engine,
            db,
            version,
            closed: AtomicBool::new(false),
            listeners: ListenerSet::default(),
            upgrade: Mutex::new(Weak::new()),
            me: me.clone(),
        });
        connection.db.register(&connection);
        connection
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn fire(&self, event: &Event) {
        self.listeners.fire(event);
    }

    pub(crate) fn set_upgrade(&self, txn: &Arc<TxnHandle>) {
        *self.upgrade.lock() = Arc::downgrade(txn);
    }

    fn upgrade_txn(&self) -> Option<Arc<TxnHandle>> {
        self.upgrade
            .lock()
            .upgrade()
            .filter(|txn| !txn.core().is_finished())
    }

    fn require_upgrade(&self, operation: &str) -> EngineResult<Arc<TxnHandle>> {
        let txn = self.upgrade_txn().ok_or_else(|| {
            DomException::invalid_state(format!(
                "{operation} is only allowed in a version change transaction"
            ))
        })?;
        txn.core().ensure_upgrade(operation)?;
        Ok(txn)
    }

    fn this(&self) -> EngineResult<Arc<Connection>> {
        self.me
            .upgrade()
            .ok_or_else(|| DomException::invalid_state("the connection is gone"))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // A dropped connection no longer blocks upgrades
        if !self.is_closed() {
            self.engine.resume_deferred(&self.db);
        }
    }
}

impl EventTarget for Connection {
    fn handle_id(&self) -> u64 {
        self.id
    }

    fn add_event_listener(&self, kind: EventKind, listener: Listener) -> EngineResult<ListenerId> {
        self.listeners.add(kind, listener)
    }

    fn remove_event_listener(&self, kind: EventKind, id: ListenerId) -> EngineResult<()> {
        self.listeners.remove(kind, id);
        Ok(())
    }
}

impl RawDatabase for Connection {
    fn name(&self) -> String {
        self.db.name.clone()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn object_store_names(&self) -> Vec<String> {
        self.db.state.lock().store_names()
    }

    fn create_object_store(
        &self,
        name: &str,
        options: ObjectStoreOptions,
    ) -> EngineResult<Arc<dyn RawObjectStore>> {
        let txn = self.require_upgrade("create_object_store")?;
        if options.auto_increment && options.key_path.as_deref() == Some("") {
            return Err(DomException::new(
                DomException::INVALID_ACCESS_ERROR,
                "an auto-increment store cannot use the empty key path",
            ));
        }
        {
            let mut state = self.db.state.lock();
            if state.stores.contains_key(name) {
                return Err(DomException::new(
                    DomException::CONSTRAINT_ERROR,
                    format!("object store '{name}' already exists"),
                ));
            }
            state.stores.insert(
                name.to_string(),
                StoreData::new(options.key_path, options.auto_increment),
            );
        }
        debug!(target: "idbind::engine", db = %self.db.name, store = name, "Object store created");
        Ok(StoreHandle::new(txn, name))
    }

    fn delete_object_store(&self, name: &str) -> EngineResult<()> {
        let txn = self.require_upgrade("delete_object_store")?;
        if self.db.state.lock().stores.remove(name).is_none() {
            return Err(DomException::not_found(format!(
                "object store '{name}' does not exist"
            )));
        }
        txn.core().forget_store(name);
        debug!(target: "idbind::engine", db = %self.db.name, store = name, "Object store deleted");
        Ok(())
    }

    fn transaction(
        &self,
        store_names: &[String],
        mode: TransactionMode,
        durability: Durability,
    ) -> EngineResult<Arc<dyn RawTransaction>> {
        if self.is_closed() {
            return Err(DomException::invalid_state("the connection is closed"));
        }
        if self.upgrade_txn().is_some() {
            return Err(DomException::invalid_state(
                "a version change transaction is running",
            ));
        }
        if mode == TransactionMode::VersionChange {
            return Err(DomException::new(
                DomException::TYPE_ERROR,
                "version change transactions are started by open",
            ));
        }
        if store_names.is_empty() {
            return Err(DomException::new(
                DomException::INVALID_ACCESS_ERROR,
                "a transaction needs at least one object store",
            ));
        }
        let mut scope = store_names.to_vec();
        scope.sort();
        scope.dedup();
        {
            let state = self.db.state.lock();
            if let Some(missing) = scope.iter().find(|name| !state.stores.contains_key(*name)) {
                return Err(DomException::not_found(format!(
                    "object store '{missing}' does not exist"
                )));
            }
        }
        let core = TxnCore::new(
            Arc::clone(&self.engine),
            self.this()?,
            mode,
            durability,
            Some(scope),
            None,
        );
        Ok(TxnHandle::new(core))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.listeners.seal();
        debug!(target: "idbind::engine", db = %self.db.name, connection = self.id, "Connection closed");
        // Opens blocked on this connection may proceed
        self.engine.resume_deferred(&self.db);
    }
}
