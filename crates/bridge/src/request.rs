//! Request: one pending engine operation
//!
//! A [`Request`] wraps the handle an engine returns for every operation. It
//! can be awaited ([`Request::wait`]) or observed with callbacks
//! ([`Request::listen`] and friends). Both paths attach listeners through the
//! listener adapter under a scope derived from the caller's, so every exit
//! (success, failure, cancellation, callback panic) detaches them.
//!
//! Callbacks run on the engine's event context. A callback that fails or
//! panics is recovered at that boundary: the owning transaction is aborted
//! and the failure is handed to the failure callback instead.

use crate::listener::listen;
use crate::rendezvous::Rendezvous;
use crate::store::Source;
use crate::transaction::Transaction;
use idbind_core::{
    CancelHandle, DomException, Error, EventKind, RawRequest, RawResult, ReadyState, Result, Scope,
    Value,
};
use parking_lot::Mutex;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

/// Callback run when a request succeeds (once per row for cursor requests)
pub type SuccessCallback = Box<dyn FnMut() -> Result<()> + Send>;

/// Callback run with the terminal failure of a request
pub type FailureCallback = Box<dyn FnMut(Error) + Send>;

thread_local! {
    static IN_CALLBACK: Cell<bool> = Cell::new(false);
}

/// Run a caller-supplied callback from an event trampoline, catching panics.
pub(crate) fn run_callback<R>(f: impl FnOnce() -> R) -> std::thread::Result<R> {
    let outer = IN_CALLBACK.with(|flag| flag.replace(true));
    let outcome = panic::catch_unwind(AssertUnwindSafe(f));
    IN_CALLBACK.with(|flag| flag.set(outer));
    outcome
}

/// Blocking inside an event callback would park the engine's event context
/// on an event only that context can deliver.
pub(crate) fn ensure_may_block() -> Result<()> {
    if IN_CALLBACK.with(Cell::get) {
        return Err(Error::Protocol(
            "blocking wait inside an event callback".to_string(),
        ));
    }
    Ok(())
}

/// Whether a success callback stays attached after it first runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Once,
    Each,
}

/// Handle to callbacks attached with one of the `listen` methods.
///
/// Dropping it leaves the callbacks attached; they are detached when the
/// request settles, when the scope passed to `listen` ends, or on `cancel`.
pub struct Subscription {
    handle: CancelHandle,
}

impl Subscription {
    /// Detach the callbacks now
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Whether the callbacks are still attached
    pub fn is_active(&self) -> bool {
        !self.handle.scope().is_cancelled()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Decode the failure of a settled request
pub(crate) fn failure_of(raw: &dyn RawRequest) -> Error {
    match raw.error() {
        Ok(Some(e)) => Error::Engine(e),
        Ok(None) => Error::Protocol("error event fired without an error".to_string()),
        Err(e) => Error::Engine(e),
    }
}

/// The outcome of a settled request
pub(crate) fn settled(raw: &dyn RawRequest) -> Result<RawResult> {
    match raw.error()? {
        Some(e) => Err(Error::Engine(e)),
        None => Ok(raw.result()?),
    }
}

pub(crate) fn decode_value(result: RawResult) -> Result<Value> {
    match result {
        RawResult::Value(value) => Ok(value),
        other => Err(Error::Protocol(format!(
            "expected a value result, got {other:?}"
        ))),
    }
}

struct Recovery {
    txn: Option<Transaction>,
    cancel: CancelHandle,
    on_failure: Arc<Mutex<Option<FailureCallback>>>,
}

impl Recovery {
    fn recover(&self, err: Error) {
        error!(target: "idbind::request", error = %err, "Request callback failed");
        if let Some(txn) = &self.txn {
            if let Err(e) = txn.raw().abort() {
                warn!(target: "idbind::request", error = %e, "Failed to abort transaction after callback failure");
            }
        }
        self.cancel.cancel();
        deliver_failure(&self.on_failure, err);
    }
}

fn deliver_failure(slot: &Mutex<Option<FailureCallback>>, err: Error) {
    let mut slot = slot.lock();
    if let Some(callback) = slot.as_mut() {
        if let Err(payload) = run_callback(|| callback(err)) {
            let err = Error::from_panic(payload.as_ref());
            error!(target: "idbind::request", error = %err, "Failure callback panicked");
        }
    }
}

/// One asynchronous engine operation
#[derive(Clone)]
pub struct Request {
    raw: Arc<dyn RawRequest>,
    txn: Option<Transaction>,
}

impl Request {
    pub(crate) fn new(raw: Arc<dyn RawRequest>, txn: Option<Transaction>) -> Self {
        Self { raw, txn }
    }

    pub(crate) fn raw(&self) -> &Arc<dyn RawRequest> {
        &self.raw
    }

    /// `Pending` until the terminal event fires, then `Done`
    pub fn ready_state(&self) -> ReadyState {
        self.raw.ready_state()
    }

    /// The success value.
    ///
    /// # Errors
    ///
    /// `NotReady` while pending; the engine's error if the request failed.
    pub fn result(&self) -> Result<Value> {
        decode_value(self.raw_result()?)
    }

    pub(crate) fn raw_result(&self) -> Result<RawResult> {
        if self.raw.ready_state() == ReadyState::Pending {
            return Err(Error::NotReady);
        }
        settled(self.raw.as_ref())
    }

    /// The engine-reported failure, or `None` if the request succeeded.
    ///
    /// # Errors
    ///
    /// `NotReady` while pending.
    pub fn error(&self) -> Result<Option<DomException>> {
        if self.raw.ready_state() == ReadyState::Pending {
            return Err(Error::NotReady);
        }
        Ok(self.raw.error()?)
    }

    /// The store or index the request was issued against
    pub fn source(&self) -> Option<Source> {
        let txn = self.txn.as_ref()?;
        self.raw
            .source()
            .map(|handle| Source::from_raw(handle, txn.clone()))
    }

    /// The owning transaction.
    ///
    /// # Errors
    ///
    /// `NotInTransaction` for factory operations such as opening a database.
    pub fn transaction(&self) -> Result<Transaction> {
        self.txn.clone().ok_or(Error::NotInTransaction)
    }

    /// Block until the request settles or `scope` ends.
    ///
    /// Cancellation detaches this wait's listeners and returns
    /// `Error::Cancelled`; the engine-side operation keeps running.
    pub fn wait(&self, scope: &Scope) -> Result<Value> {
        decode_value(self.wait_raw(scope)?)
    }

    pub(crate) fn wait_raw(&self, scope: &Scope) -> Result<RawResult> {
        ensure_may_block()?;
        let slot = Rendezvous::new();

        let resolved = slot.clone();
        let raw = Arc::downgrade(&self.raw);
        let on_success: SuccessCallback = Box::new(move || {
            if let Some(raw) = raw.upgrade() {
                resolved.resolve(settled(raw.as_ref()));
            }
            Ok(())
        });
        let failed = slot.clone();
        let on_failure: FailureCallback = Box::new(move |err| {
            failed.resolve(Err(err));
        });
        let subscription =
            self.attach(scope, Delivery::Once, Some(on_success), Some(on_failure))?;

        // The terminal event may have fired before the listeners attached
        if self.raw.ready_state() == ReadyState::Done {
            slot.resolve(settled(self.raw.as_ref()));
        }

        let outcome = slot.wait(scope);
        subscription.cancel();
        outcome?
    }

    /// Run `on_success` the first time the request succeeds, or `on_failure`
    /// with its error. Both are detached after either fires.
    ///
    /// An error or panic from `on_success` aborts the owning transaction and
    /// is passed to `on_failure`.
    pub fn listen<S, F>(&self, scope: &Scope, on_success: S, on_failure: F) -> Result<Subscription>
    where
        S: FnMut() -> Result<()> + Send + 'static,
        F: FnMut(Error) + Send + 'static,
    {
        self.attach(
            scope,
            Delivery::Once,
            Some(Box::new(on_success)),
            Some(Box::new(on_failure)),
        )
    }

    /// Single-shot success callback without a failure callback
    pub fn listen_success<S>(&self, scope: &Scope, on_success: S) -> Result<Subscription>
    where
        S: FnMut() -> Result<()> + Send + 'static,
    {
        self.attach(scope, Delivery::Once, Some(Box::new(on_success)), None)
    }

    /// Failure callback only
    pub fn listen_error<F>(&self, scope: &Scope, on_failure: F) -> Result<Subscription>
    where
        F: FnMut(Error) + Send + 'static,
    {
        self.attach(scope, Delivery::Once, None, Some(Box::new(on_failure)))
    }

    /// Run `on_success` on every success event until the request fails, the
    /// scope ends, or the callback returns `Error::StopIteration`.
    pub fn listen_each<S, F>(
        &self,
        scope: &Scope,
        on_success: S,
        on_failure: F,
    ) -> Result<Subscription>
    where
        S: FnMut() -> Result<()> + Send + 'static,
        F: FnMut(Error) + Send + 'static,
    {
        self.attach(
            scope,
            Delivery::Each,
            Some(Box::new(on_success)),
            Some(Box::new(on_failure)),
        )
    }

    pub(crate) fn attach(
        &self,
        scope: &Scope,
        delivery: Delivery,
        on_success: Option<SuccessCallback>,
        on_failure: Option<FailureCallback>,
    ) -> Result<Subscription> {
        let (scope, guard) = scope.with_cancel();
        let handle = guard.handle();
        let on_failure = Arc::new(Mutex::new(on_failure));

        // A single-shot listen always watches success so it is released
        // whichever terminal event fires
        if on_success.is_some() || delivery == Delivery::Once {
            let on_success = Mutex::new(on_success);
            let recovery = Recovery {
                txn: self.txn.clone(),
                cancel: handle.clone(),
                on_failure: Arc::clone(&on_failure),
            };
            listen(&scope, &self.raw, EventKind::Success, move |_| {
                let outcome = run_callback(|| match on_success.lock().as_mut() {
                    Some(callback) => callback(),
                    None => Ok(()),
                });
                match outcome {
                    Ok(Ok(())) => {
                        if delivery == Delivery::Once {
                            recovery.cancel.cancel();
                        }
                    }
                    Ok(Err(Error::StopIteration)) => recovery.cancel.cancel(),
                    Ok(Err(err)) => recovery.recover(err),
                    Err(payload) => recovery.recover(Error::from_panic(payload.as_ref())),
                }
            })?;
        }

        let raw = Arc::downgrade(&self.raw);
        let cancel = handle;
        listen(&scope, &self.raw, EventKind::Error, move |_| {
            // Read before cancelling: the registration may hold the last
            // strong handle to the request
            let err = match raw.upgrade() {
                Some(raw) => failure_of(raw.as_ref()),
                None => Error::Protocol("request dropped before its error was read".to_string()),
            };
            cancel.cancel();
            deliver_failure(&on_failure, err);
        })?;

        Ok(Subscription {
            handle: guard.into_handle(),
        })
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("ready_state", &self.raw.ready_state())
            .field("in_transaction", &self.txn.is_some())
            .finish()
    }
}
