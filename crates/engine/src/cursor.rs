//! Cursors
//!
//! A cursor's position is a (key, primary key) pair. Each movement re-reads
//! the source as the transaction currently sees it and picks the next row
//! relative to that position, so rows written or deleted behind the cursor
//! never disturb it.

use crate::data::{key_at_path, Entry};
use crate::request::{RequestHandle, Resolved};
use crate::store::{delete_records, issue, store_record, StoreHandle, Target};
use crate::transaction::{TxnCore, TxnHandle};
use idbind_core::{
    CursorDirection, DomException, EngineResult, Key, Query, RawCursor, RawRequest,
    RawSourceHandle, Value,
};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;

/// How a cursor moves to its next row
#[derive(Debug, Clone)]
pub(crate) enum Movement {
    Next,
    Advance(u32),
    ToKey(Key),
    ToPrimary(Key, Key),
}

struct CursorState {
    position: Option<Entry>,
    /// A row is loaded and no movement has been requested for it
    got_value: bool,
}

pub(crate) struct CursorCore {
    txn: Arc<TxnCore>,
    source: RawSourceHandle,
    target: Target,
    query: Query,
    direction: CursorDirection,
    with_value: bool,
    state: Mutex<CursorState>,
}

fn position_cmp(entry: &Entry, key: &Key, primary: &Key) -> Ordering {
    entry.position().cmp(&(key, primary))
}

/// The row after `current` in `direction`, honoring `movement`'s target
fn step(
    entries: &[Entry],
    current: Option<&Entry>,
    direction: CursorDirection,
    movement: &Movement,
) -> Option<usize> {
    let forward = direction.is_forward();
    let unique = direction.is_unique();
    let admits = |entry: &Entry| -> bool {
        let past_current = match current {
            None => true,
            Some(cur) => {
                let ord = if unique {
                    entry.key.cmp(&cur.key)
                } else {
                    position_cmp(entry, &cur.key, &cur.primary)
                };
                if forward {
                    ord == Ordering::Greater
                } else {
                    ord == Ordering::Less
                }
            }
        };
        let reaches_target = match movement {
            Movement::ToKey(key) if forward => entry.key >= *key,
            Movement::ToKey(key) => entry.key <= *key,
            Movement::ToPrimary(key, primary) if forward => {
                position_cmp(entry, key, primary) != Ordering::Less
            }
            Movement::ToPrimary(key, primary) => {
                position_cmp(entry, key, primary) != Ordering::Greater
            }
            _ => true,
        };
        past_current && reaches_target
    };
    if forward {
        entries.iter().position(admits)
    } else {
        let last = entries.iter().rposition(admits)?;
        if unique {
            // The lowest primary key among rows sharing the key
            let key = &entries[last].key;
            entries.iter().position(|entry| entry.key == *key)
        } else {
            Some(last)
        }
    }
}

impl CursorCore {
    pub(crate) fn new(
        txn: Arc<TxnCore>,
        source: RawSourceHandle,
        target: Target,
        query: Query,
        direction: CursorDirection,
        with_value: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            txn,
            source,
            target,
            query,
            direction,
            with_value,
            state: Mutex::new(CursorState {
                position: None,
                got_value: false,
            }),
        })
    }

    /// Load the first row. Runs on the dispatcher.
    pub(crate) fn first(self: &Arc<Self>) -> EngineResult<Resolved> {
        self.move_to(Movement::Next)
    }

    /// Move and report the row reached, or the end of the stream
    fn move_to(self: &Arc<Self>, movement: Movement) -> EngineResult<Resolved> {
        let entries = self.target.entries(&self.txn, &self.query)?;
        let steps = match movement {
            Movement::Advance(n) => n.max(1),
            _ => 1,
        };
        let mut state = self.state.lock();
        let mut current = state.position.clone();
        let mut found = None;
        for _ in 0..steps {
            found = step(&entries, current.as_ref(), self.direction, &movement);
            match found {
                Some(index) => current = Some(entries[index].clone()),
                None => break,
            }
        }
        match found {
            Some(index) => {
                state.position = Some(entries[index].clone());
                state.got_value = true;
                Ok(Resolved::Cursor(Some(Arc::clone(self))))
            }
            None => {
                state.position = None;
                state.got_value = false;
                Ok(Resolved::Cursor(None))
            }
        }
    }

    fn is_index(&self) -> bool {
        self.target.index.is_some()
    }

    /// Check a requested movement and mark the current row consumed
    fn accept(&self, movement: &Movement) -> EngineResult<()> {
        if let Movement::Advance(0) = movement {
            return Err(DomException::new(
                DomException::TYPE_ERROR,
                "advance count must be greater than zero",
            ));
        }
        if let Movement::ToPrimary(..) = movement {
            if !self.is_index() {
                return Err(DomException::new(
                    DomException::INVALID_ACCESS_ERROR,
                    "continue_primary_key needs an index cursor",
                ));
            }
            if self.direction.is_unique() {
                return Err(DomException::new(
                    DomException::INVALID_ACCESS_ERROR,
                    "continue_primary_key is not allowed on unique cursors",
                ));
            }
        }
        self.txn.ensure_active()?;
        let mut state = self.state.lock();
        let current = match (&state.position, state.got_value) {
            (Some(entry), true) => entry,
            _ => {
                return Err(DomException::invalid_state(
                    "the cursor is moving or has reached the end",
                ))
            }
        };
        let forward = self.direction.is_forward();
        let behind = |ord: Ordering| {
            if forward {
                ord != Ordering::Greater
            } else {
                ord != Ordering::Less
            }
        };
        match movement {
            Movement::ToKey(key) if behind(key.cmp(&current.key)) => {
                return Err(DomException::data(
                    "the key does not lie ahead of the cursor",
                ));
            }
            Movement::ToPrimary(key, primary)
                if behind((key, primary).cmp(&(&current.key, &current.primary))) =>
            {
                return Err(DomException::data(
                    "the position does not lie ahead of the cursor",
                ));
            }
            _ => {}
        }
        state.got_value = false;
        Ok(())
    }

    /// Primary key of the current row, for writes through the cursor
    fn writable_row(&self) -> EngineResult<Key> {
        self.txn.ensure_writable()?;
        let state = self.state.lock();
        match (&state.position, state.got_value) {
            (Some(entry), true) if self.with_value => Ok(entry.primary.clone()),
            (Some(_), true) => Err(DomException::invalid_state(
                "a key cursor cannot modify records",
            )),
            _ => Err(DomException::invalid_state(
                "the cursor is not positioned on a record",
            )),
        }
    }
}

/// Caller-facing cursor, tied to the request that delivers its rows
pub(crate) struct CursorHandle {
    core: Arc<CursorCore>,
    request: Arc<RequestHandle>,
}

impl CursorHandle {
    pub(crate) fn new(core: Arc<CursorCore>, request: Arc<RequestHandle>) -> Self {
        Self { core, request }
    }

    fn txn_handle(&self) -> EngineResult<Arc<TxnHandle>> {
        self.request
            .txn()
            .cloned()
            .ok_or_else(|| DomException::invalid_state("the cursor has no transaction"))
    }

    fn schedule(&self, movement: Movement) -> EngineResult<()> {
        self.core.accept(&movement)?;
        let request = self.request.core();
        request.reset();
        let cursor = Arc::clone(&self.core);
        self.core
            .txn
            .enqueue(request, Box::new(move |_| cursor.move_to(movement)))
    }

    /// Write requests go to the object store, even for index cursors
    fn store_source(&self) -> EngineResult<(Arc<TxnHandle>, RawSourceHandle)> {
        let txn = self.txn_handle()?;
        let store = StoreHandle::new(Arc::clone(&txn), &self.core.target.store);
        Ok((txn, RawSourceHandle::ObjectStore(store)))
    }
}

impl RawCursor for CursorHandle {
    fn source(&self) -> RawSourceHandle {
        self.core.source.clone()
    }

    fn direction(&self) -> CursorDirection {
        self.core.direction
    }

    fn key(&self) -> Option<Key> {
        self.core.state.lock().position.as_ref().map(|e| e.key.clone())
    }

    fn primary_key(&self) -> Option<Key> {
        self.core
            .state
            .lock()
            .position
            .as_ref()
            .map(|e| e.primary.clone())
    }

    fn value(&self) -> Option<Value> {
        if !self.core.with_value {
            return None;
        }
        self.core
            .state
            .lock()
            .position
            .as_ref()
            .map(|e| e.value.clone())
    }

    fn request(&self) -> Arc<dyn RawRequest> {
        Arc::clone(&self.request) as Arc<dyn RawRequest>
    }

    fn advance(&self, count: u32) -> EngineResult<()> {
        self.schedule(Movement::Advance(count))
    }

    fn continue_(&self, key: Option<Key>) -> EngineResult<()> {
        self.schedule(key.map_or(Movement::Next, Movement::ToKey))
    }

    fn continue_primary_key(&self, key: Key, primary_key: Key) -> EngineResult<()> {
        self.schedule(Movement::ToPrimary(key, primary_key))
    }

    fn update(&self, value: Value) -> EngineResult<Arc<dyn RawRequest>> {
        let primary = self.core.writable_row()?;
        let key_path = self
            .core
            .txn
            .connection
            .db
            .state
            .lock()
            .stores
            .get(&self.core.target.store)
            .and_then(|data| data.key_path.clone());
        if let Some(path) = key_path {
            let inline = key_at_path(&value, &path).transpose()?;
            if inline.as_ref() != Some(&primary) {
                return Err(DomException::data(
                    "the new value's key differs from the cursor's primary key",
                ));
            }
        }
        let (txn, source) = self.store_source()?;
        let store = self.core.target.store.clone();
        issue(
            &txn,
            source,
            Box::new(move |txn| {
                let key = store_record(txn, &store, value, Some(primary), true)?;
                Ok(Resolved::Value(key.to_value()))
            }),
        )
    }

    fn delete(&self) -> EngineResult<Arc<dyn RawRequest>> {
        let primary = self.core.writable_row()?;
        let (txn, source) = self.store_source()?;
        let store = self.core.target.store.clone();
        issue(
            &txn,
            source,
            Box::new(move |txn| {
                delete_records(txn, &store, &Query::Key(primary))?;
                Ok(Resolved::Value(Value::Undefined))
            }),
        )
    }
}
