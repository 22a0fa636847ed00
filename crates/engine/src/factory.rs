//! The engine entry point: opening, upgrading and deleting databases

use crate::config::EngineConfig;
use crate::connection::{Connection, DbEntry};
use crate::dispatcher::{is_dispatch_thread, Dispatcher, DispatcherStats};
use crate::request::{RequestCore, RequestHandle, Resolved};
use crate::transaction::{TxnCore, TxnHandle};
use idbind_core::{
    DatabaseInfo, DomException, Durability, EngineResult, Event, EventKind, Key, RawDatabase,
    RawFactory, RawRequest, TransactionMode, TransactionOutcome, Value,
};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State shared by every handle of one engine
pub(crate) struct Engine {
    pub(crate) config: EngineConfig,
    dispatcher: Dispatcher,
    databases: Mutex<BTreeMap<String, Arc<DbEntry>>>,
    ids: AtomicU64,
}

impl Engine {
    pub(crate) fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, AtomicOrdering::Relaxed) + 1
    }

    /// Queue `work` on the dispatcher
    pub(crate) fn submit(&self, work: impl FnOnce() + Send + 'static) {
        if !self.dispatcher.submit(work) {
            warn!(target: "idbind::engine", "Task dropped: the dispatcher has shut down");
        }
    }

    fn entry(&self, name: &str) -> Arc<DbEntry> {
        Arc::clone(
            self.databases
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| DbEntry::new(name)),
        )
    }

    /// Remove `entry` unless another database has taken its name since
    fn forget(&self, entry: &Arc<DbEntry>) {
        let mut databases = self.databases.lock();
        if databases
            .get(&entry.name)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            databases.remove(&entry.name);
        }
    }

    /// Retry opens parked on `entry`
    pub(crate) fn resume_deferred(&self, entry: &Arc<DbEntry>) {
        if !entry.has_deferred() {
            return;
        }
        let entry = Arc::clone(entry);
        self.submit(move || {
            for work in entry.take_deferred() {
                work();
            }
        });
    }
}

fn upgrade_event(kind: EventKind, old: u64, new: Option<u64>) -> Event {
    Event::version(kind, old as i64, new.map(|v| v as i64))
}

/// Run an open request. Runs on the dispatcher, possibly several times
/// while the open waits for other connections to close.
fn run_open(
    engine: Arc<Engine>,
    name: String,
    version: Option<u64>,
    request: Arc<RequestCore>,
    blocked: bool,
) {
    let entry = engine.entry(&name);
    let old = entry.version();
    let new = version.unwrap_or(old.max(1));

    if entry.upgrading.load(AtomicOrdering::Acquire) {
        let retry_entry = Arc::clone(&entry);
        retry_entry.defer(Box::new(move || run_open(engine, name, version, request, blocked)));
        return;
    }
    if new < old {
        debug!(target: "idbind::engine", db = %name, old, new, "Open refused: version is lower");
        request.fail(DomException::new(
            DomException::VERSION_ERROR,
            format!("requested version {new} is lower than the stored version {old}"),
        ));
        return;
    }
    if new == old {
        let connection = Connection::new(Arc::clone(&engine), entry, old);
        request.succeed(Resolved::Database(connection));
        return;
    }

    if !blocked {
        for other in entry.open_connections(None) {
            other.fire(&upgrade_event(EventKind::VersionChange, old, Some(new)));
        }
        if !entry.open_connections(None).is_empty() {
            info!(target: "idbind::engine", db = %name, old, new, "Upgrade blocked by open connections");
            request.fire(&upgrade_event(EventKind::Blocked, old, Some(new)));
        }
    }
    if !entry.open_connections(None).is_empty() {
        let retry_entry = Arc::clone(&entry);
        retry_entry.defer(Box::new(move || run_open(engine, name, version, request, true)));
        return;
    }
    start_upgrade(engine, entry, request, old, new);
}

fn start_upgrade(
    engine: Arc<Engine>,
    entry: Arc<DbEntry>,
    request: Arc<RequestCore>,
    old: u64,
    new: u64,
) {
    entry.upgrading.store(true, AtomicOrdering::Release);
    let snapshot = {
        let mut state = entry.state.lock();
        let snapshot = state.clone();
        state.version = new;
        snapshot
    };
    let connection = Connection::new(Arc::clone(&engine), Arc::clone(&entry), new);
    let core = TxnCore::new(
        Arc::clone(&engine),
        Arc::clone(&connection),
        TransactionMode::VersionChange,
        Durability::Default,
        None,
        Some(snapshot),
    );
    let txn = TxnHandle::new(Arc::clone(&core));
    connection.set_upgrade(&txn);
    request.expose(Resolved::Database(Arc::clone(&connection)), txn);
    info!(target: "idbind::engine", db = %entry.name, old, new, "Upgrade started");

    let finished = Arc::clone(&request);
    core.on_finish(Box::new(move |outcome| {
        finished.end_upgrade();
        entry.upgrading.store(false, AtomicOrdering::Release);
        match outcome {
            TransactionOutcome::Committed => {
                debug!(target: "idbind::engine", db = %entry.name, version = new, "Upgrade committed");
                finished.succeed(Resolved::Database(connection));
            }
            TransactionOutcome::Aborted(_) => {
                debug!(target: "idbind::engine", db = %entry.name, "Upgrade aborted");
                if old == 0 {
                    engine.forget(&entry);
                }
                connection.close();
                finished.fail(DomException::abort("the version change transaction was aborted"));
            }
        }
        engine.resume_deferred(&entry);
    }));
    request.fire(&upgrade_event(EventKind::UpgradeNeeded, old, Some(new)));
}

fn run_delete(engine: Arc<Engine>, name: String, request: Arc<RequestCore>) {
    let entry = engine.databases.lock().get(&name).cloned();
    if let Some(entry) = entry {
        let old = entry.version();
        for connection in entry.open_connections(None) {
            connection.fire(&upgrade_event(EventKind::VersionChange, old, None));
        }
        engine.forget(&entry);
        debug!(target: "idbind::engine", db = %name, "Database deleted");
    }
    request.succeed(Resolved::Value(Value::Undefined));
}

/// In-memory, event-driven engine.
///
/// Every event fires on the engine's dispatcher thread, never on the thread
/// that issued the operation.
pub struct MemoryFactory {
    engine: Arc<Engine>,
}

impl MemoryFactory {
    /// Start an engine with `config`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the dispatcher thread cannot be spawned.
    pub fn new(config: EngineConfig) -> io::Result<Self> {
        let dispatcher = Dispatcher::new(&config.dispatcher_thread_name)?;
        Ok(Self {
            engine: Arc::new(Engine {
                config,
                dispatcher,
                databases: Mutex::new(BTreeMap::new()),
                ids: AtomicU64::new(0),
            }),
        })
    }

    /// Start an engine with the default configuration
    pub fn start() -> io::Result<Self> {
        Self::new(EngineConfig::default())
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.engine.config
    }

    /// Block until every queued engine task has run
    pub fn drain(&self) {
        self.engine.dispatcher.drain();
    }

    /// Dispatcher metrics
    pub fn stats(&self) -> DispatcherStats {
        self.engine.dispatcher.stats()
    }

    fn new_request(&self) -> (Arc<RequestCore>, Arc<RequestHandle>) {
        let core = RequestCore::new(self.engine.next_id());
        let handle = RequestHandle::new(Arc::clone(&core), None, None);
        (core, handle)
    }
}

impl RawFactory for MemoryFactory {
    fn open(&self, name: &str, version: Option<u64>) -> EngineResult<Arc<dyn RawRequest>> {
        if version == Some(0) {
            return Err(DomException::new(
                DomException::TYPE_ERROR,
                "the version must be at least 1",
            ));
        }
        let (core, handle) = self.new_request();
        let engine = Arc::clone(&self.engine);
        let name = name.to_string();
        let task_core = Arc::clone(&core);
        let start = move || {
            let task_engine = Arc::clone(&engine);
            engine.submit(move || run_open(task_engine, name, version, task_core, false));
        };
        if is_dispatch_thread() {
            start();
        } else {
            // Off the dispatcher, `upgradeneeded` could otherwise fire before
            // the caller attaches its listener
            core.start_on_listen(Box::new(start));
        }
        Ok(handle)
    }

    fn delete_database(&self, name: &str) -> EngineResult<Arc<dyn RawRequest>> {
        let (core, handle) = self.new_request();
        let engine = Arc::clone(&self.engine);
        let name = name.to_string();
        self.engine.submit(move || run_delete(engine, name, core));
        Ok(handle)
    }

    fn cmp(&self, a: &Value, b: &Value) -> EngineResult<Ordering> {
        Ok(Key::try_from(a)?.cmp(&Key::try_from(b)?))
    }

    fn databases(&self) -> EngineResult<Vec<DatabaseInfo>> {
        Ok(self
            .engine
            .databases
            .lock()
            .values()
            .filter_map(|entry| {
                let version = entry.version();
                (version > 0).then(|| DatabaseInfo {
                    name: entry.name.clone(),
                    version,
                })
            })
            .collect())
    }
}

impl std::fmt::Debug for MemoryFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryFactory")
            .field("config", &self.engine.config)
            .field("databases", &self.engine.databases.lock().len())
            .finish()
    }
}
