//! Requests
//!
//! A [`RequestCore`] holds a request's state and listeners. Callers get a
//! [`RequestHandle`], which also pins the owning transaction handle so the
//! transaction stays held while any of its requests is reachable.

use crate::connection::Connection;
use crate::cursor::{CursorCore, CursorHandle};
use crate::listeners::ListenerSet;
use crate::transaction::TxnHandle;
use idbind_core::{
    DomException, EngineResult, Event, EventKind, EventTarget, Listener, ListenerId, RawRequest,
    RawResult, RawSourceHandle, RawTransaction, ReadyState, Value,
};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// A request outcome, stored without any handle so no reference cycle forms
#[derive(Clone)]
pub(crate) enum Resolved {
    Value(Value),
    Cursor(Option<Arc<CursorCore>>),
    Database(Arc<Connection>),
}

struct RequestState {
    ready: ReadyState,
    result: Option<Resolved>,
    error: Option<DomException>,
}

pub(crate) struct RequestCore {
    pub(crate) id: u64,
    state: Mutex<RequestState>,
    listeners: ListenerSet,
    handle: Mutex<Weak<RequestHandle>>,
    /// An open request's version change transaction, while it runs
    upgrade: Mutex<Option<Arc<TxnHandle>>>,
    /// Work started by the first listener, or by dropping the handle
    deferred_start: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl RequestCore {
    pub(crate) fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(RequestState {
                ready: ReadyState::Pending,
                result: None,
                error: None,
            }),
            listeners: ListenerSet::default(),
            handle: Mutex::new(Weak::new()),
            upgrade: Mutex::new(None),
            deferred_start: Mutex::new(None),
        })
    }

    /// Run `start` once the caller has had a chance to attach listeners
    pub(crate) fn start_on_listen(&self, start: Box<dyn FnOnce() + Send>) {
        *self.deferred_start.lock() = Some(start);
    }

    fn start(&self) {
        let start = self.deferred_start.lock().take();
        if let Some(start) = start {
            start();
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.state.lock().ready == ReadyState::Pending
    }

    /// The caller-facing handle, if one is still alive
    pub(crate) fn handle(&self) -> Option<Arc<RequestHandle>> {
        self.handle.lock().upgrade()
    }

    pub(crate) fn fire(&self, event: &Event) {
        self.listeners.fire(event);
    }

    pub(crate) fn succeed(&self, result: Resolved) {
        {
            let mut state = self.state.lock();
            state.ready = ReadyState::Done;
            state.result = Some(result);
            state.error = None;
        }
        self.fire(&Event::new(EventKind::Success));
    }

    pub(crate) fn fail(&self, error: DomException) {
        {
            let mut state = self.state.lock();
            state.ready = ReadyState::Done;
            state.result = Some(Resolved::Value(Value::Undefined));
            state.error = Some(error);
        }
        self.fire(&Event::new(EventKind::Error));
    }

    /// Back to pending while a cursor moves to its next row
    pub(crate) fn reset(&self) {
        let mut state = self.state.lock();
        state.ready = ReadyState::Pending;
        state.result = None;
        state.error = None;
    }

    /// Publish the connection while `upgradeneeded` is dispatched
    pub(crate) fn expose(&self, result: Resolved, upgrade: Arc<TxnHandle>) {
        self.state.lock().result = Some(result);
        *self.upgrade.lock() = Some(upgrade);
    }

    pub(crate) fn end_upgrade(&self) {
        self.upgrade.lock().take();
    }
}

/// Caller-facing request handle
pub(crate) struct RequestHandle {
    core: Arc<RequestCore>,
    txn: Option<Arc<TxnHandle>>,
    source: Option<RawSourceHandle>,
    me: Weak<RequestHandle>,
}

impl RequestHandle {
    pub(crate) fn new(
        core: Arc<RequestCore>,
        txn: Option<Arc<TxnHandle>>,
        source: Option<RawSourceHandle>,
    ) -> Arc<Self> {
        let handle = Arc::new_cyclic(|me| Self {
            core,
            txn,
            source,
            me: me.clone(),
        });
        *handle.core.handle.lock() = Arc::downgrade(&handle);
        handle
    }

    pub(crate) fn core(&self) -> &Arc<RequestCore> {
        &self.core
    }

    pub(crate) fn txn(&self) -> Option<&Arc<TxnHandle>> {
        self.txn.as_ref()
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        self.core.start();
    }
}

impl EventTarget for RequestHandle {
    fn handle_id(&self) -> u64 {
        self.core.id
    }

    fn add_event_listener(&self, kind: EventKind, listener: Listener) -> EngineResult<ListenerId> {
        let id = self.core.listeners.add(kind, listener)?;
        self.core.start();
        Ok(id)
    }

    fn remove_event_listener(&self, kind: EventKind, id: ListenerId) -> EngineResult<()> {
        self.core.listeners.remove(kind, id);
        Ok(())
    }
}

impl RawRequest for RequestHandle {
    fn ready_state(&self) -> ReadyState {
        self.core.state.lock().ready
    }

    fn result(&self) -> EngineResult<RawResult> {
        let resolved = self
            .core
            .state
            .lock()
            .result
            .clone()
            .ok_or_else(|| DomException::invalid_state("the request has not finished"))?;
        Ok(match resolved {
            Resolved::Value(value) => RawResult::Value(value),
            Resolved::Database(connection) => RawResult::Database(connection),
            Resolved::Cursor(None) => RawResult::Cursor(None),
            Resolved::Cursor(Some(cursor)) => match self.me.upgrade() {
                Some(request) => RawResult::Cursor(Some(Arc::new(CursorHandle::new(cursor, request)))),
                None => RawResult::Cursor(None),
            },
        })
    }

    fn error(&self) -> EngineResult<Option<DomException>> {
        let state = self.core.state.lock();
        match state.ready {
            ReadyState::Pending => Err(DomException::invalid_state(
                "the request has not finished",
            )),
            ReadyState::Done => Ok(state.error.clone()),
        }
    }

    fn source(&self) -> Option<RawSourceHandle> {
        self.source.clone()
    }

    fn transaction(&self) -> Option<Arc<dyn RawTransaction>> {
        if let Some(txn) = &self.txn {
            return Some(Arc::clone(txn) as Arc<dyn RawTransaction>);
        }
        self.core
            .upgrade
            .lock()
            .as_ref()
            .map(|txn| Arc::clone(txn) as Arc<dyn RawTransaction>)
    }
}
