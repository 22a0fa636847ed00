//! Cursors and the cursor iteration protocol
//!
//! A cursor-opening request fires `success` once per row and once more with
//! an empty result at the end of the stream. [`CursorRequest::iter`] and
//! [`CursorWithValueRequest::iter`] turn that stream into a loop on the
//! calling thread:
//!
//! 1. a persistent listener posts a wake-up to a mailbox on every event;
//! 2. the loop reads the request's current state: pending means wait for the
//!    next wake-up, an empty result ends the loop, an error is returned;
//! 3. for a row, the visitor runs with a [`Cursor`]. If it did not call any
//!    of the four advance methods, the loop continues the cursor itself.
//!
//! Reading state instead of trusting event payloads makes duplicate or
//! early wake-ups harmless, and lets a row that was delivered before the
//! listener attached be picked up.
//!
//! Every wrapper produced for one stream shares one progress flag. It is
//! cleared for each delivered row and set by `advance`, `continue_`,
//! `continue_key` and `continue_primary_key`, even when the engine rejects
//! the call. Once it is set, further advances for that row fail with
//! `InvalidStateError` without reaching the engine, which may already have
//! delivered the next row.

use crate::rendezvous::Mailbox;
use crate::request::{
    ensure_may_block, settled, Delivery, FailureCallback, Request, SuccessCallback, Subscription,
};
use crate::store::Source;
use crate::transaction::Transaction;
use crate::views::AckRequest;
use idbind_core::{
    CursorDirection, DomException, Error, Key, RawCursor, RawRequest, RawResult, ReadyState, Result,
    Scope, Value,
};
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Default)]
struct Progress {
    /// Number of the row currently delivered
    row: AtomicU64,
    /// An advance method was called for the current row
    iterated: AtomicBool,
    /// One of those calls was accepted by the engine
    advanced: AtomicBool,
}

impl Progress {
    fn begin_row(&self) -> u64 {
        self.iterated.store(false, Ordering::SeqCst);
        self.advanced.store(false, Ordering::SeqCst);
        self.row.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The row a settled request is showing: a new one once the previous
    /// row was advanced past
    fn settled_row(&self) -> u64 {
        if self.advanced.load(Ordering::SeqCst) {
            self.begin_row()
        } else {
            self.row.load(Ordering::SeqCst)
        }
    }

    fn record<T>(
        &self,
        row: u64,
        call: impl FnOnce() -> idbind_core::EngineResult<T>,
    ) -> Result<T> {
        if row != self.row.load(Ordering::SeqCst) || self.iterated.swap(true, Ordering::SeqCst) {
            return Err(Error::Engine(DomException::invalid_state(
                "the cursor was already advanced for this row",
            )));
        }
        let value = call()?;
        self.advanced.store(true, Ordering::SeqCst);
        Ok(value)
    }
}

/// A position in a stream of records
#[derive(Clone)]
pub struct Cursor {
    raw: Arc<dyn RawCursor>,
    txn: Transaction,
    progress: Arc<Progress>,
    row: u64,
}

impl Cursor {
    /// The store or index being traversed
    pub fn source(&self) -> Source {
        Source::from_raw(self.raw.source(), self.txn.clone())
    }

    /// Traversal direction
    pub fn direction(&self) -> CursorDirection {
        self.raw.direction()
    }

    /// Key at the current position; the index key for index cursors
    pub fn key(&self) -> Option<Key> {
        self.raw.key()
    }

    /// Primary key at the current position
    pub fn primary_key(&self) -> Option<Key> {
        self.raw.primary_key()
    }

    /// The request delivering this cursor's rows
    pub fn request(&self) -> Request {
        Request::new(self.raw.request(), Some(self.txn.clone()))
    }

    /// Skip `count` records
    pub fn advance(&self, count: u32) -> Result<()> {
        self.progress.record(self.row, || self.raw.advance(count))
    }

    /// Move to the next record
    pub fn continue_(&self) -> Result<()> {
        self.progress.record(self.row, || self.raw.continue_(None))
    }

    /// Move to the first record whose key is at or beyond `key`
    pub fn continue_key(&self, key: impl Into<Key>) -> Result<()> {
        let key = key.into();
        self.progress.record(self.row, || self.raw.continue_(Some(key)))
    }

    /// Move to the first record at or beyond (`key`, `primary_key`); index
    /// cursors only
    pub fn continue_primary_key(
        &self,
        key: impl Into<Key>,
        primary_key: impl Into<Key>,
    ) -> Result<()> {
        let (key, primary_key) = (key.into(), primary_key.into());
        self.progress
            .record(self.row, || self.raw.continue_primary_key(key, primary_key))
    }

    /// Replace the value of the current record
    pub fn update(&self, value: impl Into<Value>) -> Result<Request> {
        let raw = self.raw.update(value.into())?;
        Ok(Request::new(raw, Some(self.txn.clone())))
    }

    /// Delete the current record
    pub fn delete(&self) -> Result<AckRequest> {
        let raw = self.raw.delete()?;
        Ok(AckRequest::new(Request::new(raw, Some(self.txn.clone()))))
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("direction", &self.raw.direction())
            .field("key", &self.raw.key())
            .field("primary_key", &self.raw.primary_key())
            .finish()
    }
}

/// A cursor that also exposes the current record's value
#[derive(Clone, Debug)]
pub struct CursorWithValue(Cursor);

impl CursorWithValue {
    /// Value of the current record
    pub fn value(&self) -> Result<Value> {
        self.0
            .raw
            .value()
            .ok_or_else(|| Error::Protocol("value cursor row carries no value".to_string()))
    }

    /// The key-only view of this cursor
    pub fn into_cursor(self) -> Cursor {
        self.0
    }
}

impl Deref for CursorWithValue {
    type Target = Cursor;

    fn deref(&self) -> &Cursor {
        &self.0
    }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Clone)]
struct Stream {
    request: Request,
    txn: Transaction,
    progress: Arc<Progress>,
}

enum Row {
    Pending,
    End,
    Cursor(Arc<dyn RawCursor>),
    Failed(Error),
}

fn poll_row(raw: &dyn RawRequest) -> Row {
    if raw.ready_state() == ReadyState::Pending {
        return Row::Pending;
    }
    match settled(raw) {
        Ok(result) => match decode_row(result) {
            Ok(Some(cursor)) => Row::Cursor(cursor),
            Ok(None) => Row::End,
            Err(e) => Row::Failed(e),
        },
        Err(e) => Row::Failed(e),
    }
}

fn decode_row(result: RawResult) -> Result<Option<Arc<dyn RawCursor>>> {
    match result {
        RawResult::Cursor(cursor) => Ok(cursor),
        RawResult::Value(Value::Null | Value::Undefined) => Ok(None),
        other => Err(Error::Protocol(format!(
            "expected a cursor result, got {other:?}"
        ))),
    }
}

/// Releases the stream's listener and mailbox on every exit path
struct Session {
    subscription: Subscription,
    wakes: Mailbox<()>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.subscription.cancel();
        self.wakes.close();
    }
}

impl Stream {
    fn wrap(&self, raw: Arc<dyn RawCursor>, row: u64) -> Cursor {
        Cursor {
            raw,
            txn: self.txn.clone(),
            progress: Arc::clone(&self.progress),
            row,
        }
    }

    fn result(&self) -> Result<Option<Cursor>> {
        let row = decode_row(self.request.raw_result()?)?;
        Ok(row.map(|raw| self.wrap(raw, self.progress.settled_row())))
    }

    fn wait(&self, scope: &Scope) -> Result<Option<Cursor>> {
        let row = decode_row(self.request.wait_raw(scope)?)?;
        Ok(row.map(|raw| self.wrap(raw, self.progress.settled_row())))
    }

    fn iter(&self, scope: &Scope, mut visit: impl FnMut(Cursor) -> Result<()>) -> Result<()> {
        ensure_may_block()?;
        let wakes = Mailbox::new();
        let on_row = wakes.clone();
        let on_success: SuccessCallback = Box::new(move || {
            // Closed means the loop has already returned
            let _ = on_row.push(());
            Ok(())
        });
        let on_error = wakes.clone();
        let on_failure: FailureCallback = Box::new(move |_| {
            let _ = on_error.push(());
        });
        let subscription =
            self.request
                .attach(scope, Delivery::Each, Some(on_success), Some(on_failure))?;
        let _session = Session {
            subscription,
            wakes: wakes.clone(),
        };

        loop {
            let raw = match poll_row(self.request.raw().as_ref()) {
                Row::Pending => {
                    wakes.recv(scope)?;
                    continue;
                }
                Row::End => return Ok(()),
                Row::Failed(err) => return Err(err),
                Row::Cursor(raw) => raw,
            };

            let cursor = self.wrap(raw, self.progress.begin_row());
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| visit(cursor.clone())));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(Error::StopIteration)) => return Ok(()),
                Ok(Err(err)) => return Err(err),
                Err(payload) => {
                    let err = Error::from_panic(payload.as_ref());
                    error!(target: "idbind::cursor", error = %err, "Cursor visitor panicked");
                    if let Err(e) = self.txn.raw().abort() {
                        warn!(target: "idbind::cursor", error = %e, "Failed to abort transaction after visitor panic");
                    }
                    return Err(err);
                }
            }

            if !self.progress.iterated.load(Ordering::SeqCst) {
                cursor.continue_()?;
            } else if !self.progress.advanced.load(Ordering::SeqCst) {
                return Err(Error::Protocol(
                    "cursor was not advanced: the engine rejected every advance call for this row"
                        .to_string(),
                ));
            }
        }
    }
}

/// A request streaming key-only cursor rows
#[derive(Clone)]
pub struct CursorRequest(Stream);

/// A request streaming cursor rows with values
#[derive(Clone)]
pub struct CursorWithValueRequest(Stream);

impl CursorRequest {
    pub(crate) fn new(request: Request, txn: Transaction) -> Self {
        Self(Stream {
            request,
            txn,
            progress: Arc::default(),
        })
    }

    /// The current row, or `None` at the end of the stream
    pub fn result(&self) -> Result<Option<Cursor>> {
        self.0.result()
    }

    /// Block until the next row arrives; `None` for an empty range
    pub fn wait(&self, scope: &Scope) -> Result<Option<Cursor>> {
        self.0.wait(scope)
    }

    /// Run `visit` for every row until the stream ends, `visit` returns
    /// `Error::StopIteration` (not an error), `visit` fails, or `scope` ends.
    ///
    /// A visitor that panics aborts the owning transaction.
    pub fn iter<V>(&self, scope: &Scope, mut visit: V) -> Result<()>
    where
        V: FnMut(&Cursor) -> Result<()>,
    {
        self.0.iter(scope, |cursor| visit(&cursor))
    }
}

impl CursorWithValueRequest {
    pub(crate) fn new(request: Request, txn: Transaction) -> Self {
        Self(Stream {
            request,
            txn,
            progress: Arc::default(),
        })
    }

    /// The current row, or `None` at the end of the stream
    pub fn result(&self) -> Result<Option<CursorWithValue>> {
        Ok(self.0.result()?.map(CursorWithValue))
    }

    /// Block until the next row arrives; `None` for an empty range
    pub fn wait(&self, scope: &Scope) -> Result<Option<CursorWithValue>> {
        Ok(self.0.wait(scope)?.map(CursorWithValue))
    }

    /// Like [`CursorRequest::iter`], with values
    pub fn iter<V>(&self, scope: &Scope, mut visit: V) -> Result<()>
    where
        V: FnMut(&CursorWithValue) -> Result<()>,
    {
        self.0
            .iter(scope, |cursor| visit(&CursorWithValue(cursor)))
    }
}

impl Deref for CursorRequest {
    type Target = Request;

    fn deref(&self) -> &Request {
        &self.0.request
    }
}

impl Deref for CursorWithValueRequest {
    type Target = Request;

    fn deref(&self) -> &Request {
        &self.0.request
    }
}
