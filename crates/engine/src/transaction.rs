//! Transactions
//!
//! Lifecycle: `Active` accepts requests; `Committing` (after an explicit
//! commit) and `Aborting` (after an explicit abort) accept none and wait for
//! the dispatcher to finish them; `Finished` is terminal.
//!
//! A transaction commits on the dispatcher once it has no queued requests
//! and is not held. Transactions created off the dispatcher start held,
//! because the creating thread may still be issuing requests between
//! outcomes. The hold is released by attaching a listener to the
//! transaction, by `commit`, by `abort`, or by dropping the last handle.

use crate::connection::Connection;
use crate::data::{DatabaseState, Delta, StoreData, StoreDelta, StoreView};
use crate::dispatcher::is_dispatch_thread;
use crate::factory::Engine;
use crate::listeners::ListenerSet;
use crate::request::{RequestCore, Resolved};
use crate::store::StoreHandle;
use idbind_core::{
    DomException, Durability, EngineResult, Event, EventKind, EventTarget, Listener, ListenerId,
    RawDatabase, RawObjectStore, RawTransaction, TransactionMode, TransactionOutcome,
};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Committing,
    Aborting,
    Finished,
}

/// Run on the dispatcher after `complete` or `abort` has fired
pub(crate) type FinishHook = Box<dyn FnOnce(&TransactionOutcome) + Send>;

/// Work a request performs on the dispatcher
pub(crate) type Operation = Box<dyn FnOnce(&Arc<TxnCore>) -> EngineResult<Resolved> + Send>;

struct TxnState {
    phase: Phase,
    outcome: Option<TransactionOutcome>,
    pending: usize,
    held: bool,
    delta: Delta,
    error: Option<DomException>,
    queued: Vec<Weak<RequestCore>>,
    /// Schema and records before a version change, restored on abort
    snapshot: Option<DatabaseState>,
    on_finish: Option<FinishHook>,
}

impl TxnState {
    fn can_commit(&self) -> bool {
        self.pending == 0
            && !self.held
            && matches!(self.phase, Phase::Active | Phase::Committing)
    }
}

fn inactive() -> DomException {
    DomException::new(
        DomException::TRANSACTION_INACTIVE_ERROR,
        "the transaction is not active",
    )
}

pub(crate) struct TxnCore {
    pub(crate) id: u64,
    pub(crate) engine: Arc<Engine>,
    pub(crate) connection: Arc<Connection>,
    pub(crate) mode: TransactionMode,
    durability: Durability,
    /// Stores in scope, sorted; `None` for version change transactions,
    /// which see every store
    scope: Option<Vec<String>>,
    state: Mutex<TxnState>,
    listeners: ListenerSet,
}

impl TxnCore {
    pub(crate) fn new(
        engine: Arc<Engine>,
        connection: Arc<Connection>,
        mode: TransactionMode,
        durability: Durability,
        scope: Option<Vec<String>>,
        snapshot: Option<DatabaseState>,
    ) -> Arc<Self> {
        let held = !is_dispatch_thread();
        let core = Arc::new(Self {
            id: engine.next_id(),
            engine,
            connection,
            mode,
            durability,
            scope,
            state: Mutex::new(TxnState {
                phase: Phase::Active,
                outcome: None,
                pending: 0,
                held,
                delta: Delta::default(),
                error: None,
                queued: Vec::new(),
                snapshot,
                on_finish: None,
            }),
            listeners: ListenerSet::default(),
        });
        trace!(target: "idbind::engine", txn = core.id, mode = %mode, held, "Transaction created");
        if !held {
            // Commits after the task that created it, unless that task queues requests
            core.schedule_commit_check();
        }
        core
    }

    fn schedule_commit_check(self: &Arc<Self>) {
        let txn = Arc::clone(self);
        self.engine.submit(move || txn.maybe_commit());
    }

    pub(crate) fn on_finish(&self, hook: FinishHook) {
        self.state.lock().on_finish = Some(hook);
    }

    pub(crate) fn is_upgrade(&self) -> bool {
        self.mode == TransactionMode::VersionChange
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.lock().phase == Phase::Finished
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.lock().phase == Phase::Active
    }

    pub(crate) fn ensure_active(&self) -> EngineResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(inactive())
        }
    }

    pub(crate) fn ensure_writable(&self) -> EngineResult<()> {
        self.ensure_active()?;
        if !self.mode.is_writable() {
            return Err(DomException::new(
                DomException::READ_ONLY_ERROR,
                "the transaction is read-only",
            ));
        }
        Ok(())
    }

    pub(crate) fn ensure_upgrade(&self, operation: &str) -> EngineResult<()> {
        if !self.is_upgrade() {
            return Err(DomException::invalid_state(format!(
                "{operation} is only allowed in a version change transaction"
            )));
        }
        self.ensure_active()
    }

    pub(crate) fn in_scope(&self, name: &str) -> bool {
        match &self.scope {
            Some(names) => names.binary_search_by(|n| n.as_str().cmp(name)).is_ok(),
            None => true,
        }
    }

    pub(crate) fn store_names(&self) -> Vec<String> {
        match &self.scope {
            Some(names) => names.clone(),
            None => self.connection.db.state.lock().store_names(),
        }
    }

    /// Queue `op` for `request` behind the transaction's earlier requests
    pub(crate) fn enqueue(self: &Arc<Self>, request: &Arc<RequestCore>, op: Operation) -> EngineResult<()> {
        {
            let mut state = self.state.lock();
            if state.phase != Phase::Active {
                return Err(inactive());
            }
            state.pending += 1;
            state.queued.push(Arc::downgrade(request));
        }
        let txn = Arc::clone(self);
        let request = Arc::clone(request);
        self.engine.submit(move || txn.run(&request, op));
        Ok(())
    }

    fn run(self: &Arc<Self>, request: &Arc<RequestCore>, op: Operation) {
        {
            let mut state = self.state.lock();
            // An abort in progress fails every queued request itself
            if matches!(state.phase, Phase::Aborting | Phase::Finished) {
                return;
            }
            let target = Arc::as_ptr(request);
            state.queued.retain(|queued| queued.as_ptr() != target);
        }
        match op(self) {
            Ok(result) => request.succeed(result),
            Err(error) => self.fail_request(request, error),
        }
        let ready = {
            let mut state = self.state.lock();
            state.pending = state.pending.saturating_sub(1);
            state.can_commit()
        };
        if ready {
            self.commit_now();
        }
    }

    fn fail_request(self: &Arc<Self>, request: &Arc<RequestCore>, error: DomException) {
        debug!(target: "idbind::engine", txn = self.id, request = request.id, error = %error, "Request failed");
        request.fail(error.clone());
        self.state.lock().error = Some(error.clone());
        let event = match request.handle() {
            Some(origin) => Event::failure(origin),
            None => Event::new(EventKind::Error),
        };
        self.listeners.fire(&event);
        self.abort_now(Some(error));
    }

    fn maybe_commit(self: &Arc<Self>) {
        let ready = self.state.lock().can_commit();
        if ready {
            self.commit_now();
        }
    }

    fn commit_now(self: &Arc<Self>) {
        let (delta, hook) = {
            let mut state = self.state.lock();
            if !matches!(state.phase, Phase::Active | Phase::Committing) {
                return;
            }
            state.phase = Phase::Finished;
            state.outcome = Some(TransactionOutcome::Committed);
            state.snapshot = None;
            (std::mem::take(&mut state.delta), state.on_finish.take())
        };
        self.connection.db.state.lock().apply(delta);
        debug!(target: "idbind::engine", txn = self.id, "Transaction committed");
        self.listeners.fire(&Event::new(EventKind::Complete));
        if let Some(hook) = hook {
            hook(&TransactionOutcome::Committed);
        }
    }

    /// Roll back now: fail queued requests with `AbortError`, then fire `abort`
    pub(crate) fn abort_now(self: &Arc<Self>, error: Option<DomException>) {
        let (queued, snapshot, hook) = {
            let mut state = self.state.lock();
            if state.phase == Phase::Finished {
                return;
            }
            state.phase = Phase::Finished;
            state.held = false;
            state.outcome = Some(TransactionOutcome::Aborted(error.clone()));
            if error.is_some() {
                state.error = error.clone();
            }
            state.delta = Delta::default();
            (
                std::mem::take(&mut state.queued),
                state.snapshot.take(),
                state.on_finish.take(),
            )
        };
        if let Some(snapshot) = snapshot {
            *self.connection.db.state.lock() = snapshot;
        }
        debug!(target: "idbind::engine", txn = self.id, error = ?error, "Transaction aborted");
        for request in queued.iter().filter_map(Weak::upgrade) {
            if request.is_pending() {
                request.fail(DomException::abort("the transaction was aborted"));
            }
        }
        self.listeners.fire(&Event::new(EventKind::Abort));
        if let Some(hook) = hook {
            hook(&TransactionOutcome::Aborted(error));
        }
    }

    fn request_abort(self: &Arc<Self>) -> EngineResult<()> {
        {
            let mut state = self.state.lock();
            if state.phase != Phase::Active {
                return Err(DomException::invalid_state(
                    "the transaction is committing or finished",
                ));
            }
            state.phase = Phase::Aborting;
            state.held = false;
        }
        let txn = Arc::clone(self);
        self.engine.submit(move || txn.abort_now(None));
        Ok(())
    }

    fn request_commit(self: &Arc<Self>) -> EngineResult<()> {
        if !self.engine.config.supports_commit {
            return Err(DomException::new(
                DomException::INVALID_ACCESS_ERROR,
                "this engine only commits automatically",
            ));
        }
        let ready = {
            let mut state = self.state.lock();
            if state.phase != Phase::Active {
                return Err(inactive());
            }
            state.phase = Phase::Committing;
            state.held = false;
            state.can_commit()
        };
        if ready {
            self.schedule_commit_check();
        }
        Ok(())
    }

    pub(crate) fn release_hold(self: &Arc<Self>) {
        let ready = {
            let mut state = self.state.lock();
            if !state.held {
                return;
            }
            state.held = false;
            state.can_commit()
        };
        trace!(target: "idbind::engine", txn = self.id, "Transaction hold released");
        if ready {
            self.schedule_commit_check();
        }
    }

    /// Read `store` as this transaction sees it
    pub(crate) fn read<R>(
        &self,
        store: &str,
        f: impl FnOnce(&StoreView<'_>) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let state = self.state.lock();
        let db = self.connection.db.state.lock();
        let data = db.stores.get(store).ok_or_else(|| store_gone(store))?;
        f(&StoreView {
            data,
            delta: state.delta.store(store),
        })
    }

    /// Record writes to `store`; nothing is recorded if `f` fails
    pub(crate) fn write<R>(
        &self,
        store: &str,
        f: impl FnOnce(&StoreData, &mut StoreDelta) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let mut state = self.state.lock();
        let db = self.connection.db.state.lock();
        let data = db.stores.get(store).ok_or_else(|| store_gone(store))?;
        let mut delta = state.delta.store(store).cloned().unwrap_or_default();
        let out = f(data, &mut delta)?;
        *state.delta.store_mut(store) = delta;
        Ok(out)
    }

    /// Drop buffered writes to a store the upgrade deleted
    pub(crate) fn forget_store(&self, store: &str) {
        self.state.lock().delta.forget(store);
    }
}

fn store_gone(store: &str) -> DomException {
    DomException::invalid_state(format!("object store '{store}' has been deleted"))
}

/// Caller-facing transaction handle. Dropping the last one releases the hold.
pub(crate) struct TxnHandle {
    core: Arc<TxnCore>,
    me: Weak<TxnHandle>,
}

impl TxnHandle {
    pub(crate) fn new(core: Arc<TxnCore>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            core,
            me: me.clone(),
        })
    }

    pub(crate) fn core(&self) -> &Arc<TxnCore> {
        &self.core
    }
}

impl Drop for TxnHandle {
    fn drop(&mut self) {
        self.core.release_hold();
    }
}

impl EventTarget for TxnHandle {
    fn handle_id(&self) -> u64 {
        self.core.id
    }

    fn add_event_listener(&self, kind: EventKind, listener: Listener) -> EngineResult<ListenerId> {
        self.core.release_hold();
        self.core.listeners.add(kind, listener)
    }

    fn remove_event_listener(&self, kind: EventKind, id: ListenerId) -> EngineResult<()> {
        self.core.listeners.remove(kind, id);
        Ok(())
    }
}

impl RawTransaction for TxnHandle {
    fn mode(&self) -> TransactionMode {
        self.core.mode
    }

    fn durability(&self) -> Durability {
        self.core.durability
    }

    fn error(&self) -> Option<DomException> {
        self.core.state.lock().error.clone()
    }

    fn object_store_names(&self) -> Vec<String> {
        self.core.store_names()
    }

    fn object_store(&self, name: &str) -> EngineResult<Arc<dyn RawObjectStore>> {
        if self.core.is_finished() {
            return Err(DomException::invalid_state("the transaction has finished"));
        }
        let exists = self.core.connection.db.state.lock().stores.contains_key(name);
        if !self.core.in_scope(name) || !exists {
            return Err(DomException::not_found(format!(
                "object store '{name}' is not in the transaction's scope"
            )));
        }
        let this = self
            .me
            .upgrade()
            .ok_or_else(|| DomException::invalid_state("the transaction handle is gone"))?;
        Ok(StoreHandle::new(this, name))
    }

    fn database(&self) -> Arc<dyn RawDatabase> {
        Arc::clone(&self.core.connection) as Arc<dyn RawDatabase>
    }

    fn abort(&self) -> EngineResult<()> {
        self.core.request_abort()
    }

    fn supports_commit(&self) -> bool {
        self.core.engine.config.supports_commit
    }

    fn commit(&self) -> EngineResult<()> {
        self.core.request_commit()
    }

    fn outcome(&self) -> Option<TransactionOutcome> {
        self.core.state.lock().outcome.clone()
    }
}
