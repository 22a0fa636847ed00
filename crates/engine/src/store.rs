//! Object store and index handles
//!
//! Each operation validates its arguments on the calling thread, then queues
//! the work on the owning transaction. Key generation and constraint checks
//! happen when the work runs, since they depend on every write queued before.

use crate::cursor::CursorCore;
use crate::data::{inject_key, key_at_path, Entry, IndexMeta, StoreView, MAX_GENERATED_KEY};
use crate::request::{RequestCore, RequestHandle, Resolved};
use crate::transaction::{Operation, TxnCore, TxnHandle};
use idbind_core::{
    CursorDirection, DomException, EngineResult, IndexOptions, Key, Query, RawIndex,
    RawObjectStore, RawRequest, RawSource, RawSourceHandle, RawTransaction, Value,
};
use std::sync::{Arc, Weak};

/// What a request reads from: a store, or one of its indexes
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub(crate) store: String,
    pub(crate) index: Option<String>,
}

impl Target {
    /// Rows matching `query` in traversal order
    pub(crate) fn entries(&self, txn: &TxnCore, query: &Query) -> EngineResult<Vec<Entry>> {
        txn.read(&self.store, |view| match &self.index {
            None => Ok(view.store_entries(query)),
            Some(name) => {
                let meta = view
                    .data
                    .indexes
                    .get(name)
                    .ok_or_else(|| DomException::invalid_state(format!("index '{name}' has been deleted")))?;
                Ok(view.index_entries(meta, query))
            }
        })
    }
}

fn count_limit(count: Option<u32>) -> usize {
    match count {
        Some(0) | None => usize::MAX,
        Some(n) => n as usize,
    }
}

/// Issue a request against `txn` whose work is `op`
pub(crate) fn issue(
    txn: &Arc<TxnHandle>,
    source: RawSourceHandle,
    op: Operation,
) -> EngineResult<Arc<dyn RawRequest>> {
    let core = txn.core();
    let request = RequestCore::new(core.engine.next_id());
    let handle = RequestHandle::new(Arc::clone(&request), Some(Arc::clone(txn)), Some(source));
    core.enqueue(&request, op)?;
    Ok(handle)
}

/// Shared read surface of stores and indexes
fn read_request(
    txn: &Arc<TxnHandle>,
    source: RawSourceHandle,
    target: Target,
    query: Query,
    read: impl FnOnce(Vec<Entry>) -> Value + Send + 'static,
) -> EngineResult<Arc<dyn RawRequest>> {
    txn.core().ensure_active()?;
    issue(
        txn,
        source,
        Box::new(move |core| Ok(Resolved::Value(read(target.entries(core, &query)?)))),
    )
}

fn open_cursor(
    txn: &Arc<TxnHandle>,
    source: RawSourceHandle,
    target: Target,
    query: Query,
    direction: CursorDirection,
    with_value: bool,
) -> EngineResult<Arc<dyn RawRequest>> {
    txn.core().ensure_active()?;
    let cursor_source = source.clone();
    issue(
        txn,
        source,
        Box::new(move |txn| {
            let cursor = CursorCore::new(
                Arc::clone(txn),
                cursor_source,
                target,
                query,
                direction,
                with_value,
            );
            cursor.first()
        }),
    )
}

fn first_value(entries: Vec<Entry>) -> Value {
    entries
        .into_iter()
        .next()
        .map_or(Value::Undefined, |e| e.value)
}

fn first_primary_key(entries: Vec<Entry>) -> Value {
    entries
        .into_iter()
        .next()
        .map_or(Value::Undefined, |e| e.primary.to_value())
}

/// Key a new record will be stored under, checked on the calling thread
fn check_key(
    key_path: Option<&str>,
    auto_increment: bool,
    value: &Value,
    key: Option<&Key>,
) -> EngineResult<()> {
    match (key_path, key) {
        (Some(_), Some(_)) => Err(DomException::data(
            "the store uses in-line keys and a key was provided",
        )),
        (Some(path), None) => match key_at_path(value, path) {
            Some(Ok(_)) => Ok(()),
            Some(Err(e)) => Err(e),
            None if auto_increment && value.as_object().is_some() => Ok(()),
            None => Err(DomException::data(format!(
                "the value has no key at '{path}'"
            ))),
        },
        (None, Some(_)) => Ok(()),
        (None, None) if auto_increment => Ok(()),
        (None, None) => Err(DomException::data(
            "the store uses out-of-line keys and no key was provided",
        )),
    }
}

/// Store `value`, generating its key if needed. Runs on the dispatcher.
pub(crate) fn store_record(
    txn: &TxnCore,
    store: &str,
    mut value: Value,
    key: Option<Key>,
    overwrite: bool,
) -> EngineResult<Key> {
    txn.write(store, |data, delta| {
        let view = StoreView {
            data,
            delta: Some(&*delta),
        };
        let mut next_key = None;
        let key = match (key, data.key_path.as_deref()) {
            (Some(key), _) => key,
            (None, Some(path)) => match key_at_path(&value, path) {
                Some(found) => found?,
                None => {
                    let generated = view.next_key();
                    if generated > MAX_GENERATED_KEY {
                        return Err(DomException::new(
                            DomException::CONSTRAINT_ERROR,
                            "the key generator is exhausted",
                        ));
                    }
                    let key = Key::Number(generated as f64);
                    inject_key(&mut value, path, &key)?;
                    next_key = Some(generated + 1);
                    key
                }
            },
            (None, None) => {
                let generated = view.next_key();
                if generated > MAX_GENERATED_KEY {
                    return Err(DomException::new(
                        DomException::CONSTRAINT_ERROR,
                        "the key generator is exhausted",
                    ));
                }
                next_key = Some(generated + 1);
                Key::Number(generated as f64)
            }
        };
        if data.auto_increment && next_key.is_none() {
            // Explicit numeric keys move the generator past them
            if let Some(n) = key.as_number() {
                if n >= view.next_key() as f64 {
                    next_key = Some((n.floor().min(MAX_GENERATED_KEY as f64) as u64) + 1);
                }
            }
        }
        if !overwrite && view.contains(&key) {
            return Err(DomException::new(
                DomException::CONSTRAINT_ERROR,
                format!("a record with key {key} already exists"),
            ));
        }
        view.check_unique(&key, &value)?;
        if let Some(next_key) = next_key {
            delta.set_next_key(next_key);
        }
        delta.put(key.clone(), value);
        Ok(key)
    })
}

pub(crate) fn delete_records(txn: &TxnCore, store: &str, query: &Query) -> EngineResult<()> {
    txn.write(store, |data, delta| {
        let doomed: Vec<Key> = StoreView {
            data,
            delta: Some(&*delta),
        }
        .records()
        .into_keys()
        .filter(|key| query.matches(key))
        .collect();
        for key in doomed {
            delta.delete(key);
        }
        Ok(())
    })
}

/// An object store within one transaction
pub(crate) struct StoreHandle {
    txn: Arc<TxnHandle>,
    name: String,
    me: Weak<StoreHandle>,
}

impl StoreHandle {
    pub(crate) fn new(txn: Arc<TxnHandle>, name: &str) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            txn,
            name: name.to_string(),
            me: me.clone(),
        })
    }

    fn core(&self) -> &Arc<TxnCore> {
        self.txn.core()
    }

    fn this(&self) -> EngineResult<Arc<StoreHandle>> {
        self.me
            .upgrade()
            .ok_or_else(|| DomException::invalid_state("the object store handle is gone"))
    }

    fn source(&self) -> EngineResult<RawSourceHandle> {
        Ok(RawSourceHandle::ObjectStore(self.this()?))
    }

    fn target(&self) -> Target {
        Target {
            store: self.name.clone(),
            index: None,
        }
    }

    fn meta<R>(&self, f: impl FnOnce(&crate::data::StoreData) -> R) -> Option<R> {
        self.core()
            .connection
            .db
            .state
            .lock()
            .stores
            .get(&self.name)
            .map(f)
    }

    fn ensure_exists(&self) -> EngineResult<()> {
        self.meta(|_| ())
            .ok_or_else(|| DomException::invalid_state(format!("object store '{}' has been deleted", self.name)))
    }

    fn write_record(&self, value: Value, key: Option<Key>, overwrite: bool) -> EngineResult<Arc<dyn RawRequest>> {
        self.core().ensure_writable()?;
        let (key_path, auto_increment) = self
            .meta(|data| (data.key_path.clone(), data.auto_increment))
            .ok_or_else(|| DomException::invalid_state(format!("object store '{}' has been deleted", self.name)))?;
        check_key(key_path.as_deref(), auto_increment, &value, key.as_ref())?;
        let store = self.name.clone();
        issue(
            &self.txn,
            self.source()?,
            Box::new(move |txn| {
                let key = store_record(txn, &store, value, key, overwrite)?;
                Ok(Resolved::Value(key.to_value()))
            }),
        )
    }
}

impl RawSource for StoreHandle {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn key_path(&self) -> Option<String> {
        self.meta(|data| data.key_path.clone()).flatten()
    }

    fn get(&self, query: Query) -> EngineResult<Arc<dyn RawRequest>> {
        self.ensure_exists()?;
        read_request(&self.txn, self.source()?, self.target(), query, first_value)
    }

    fn get_key(&self, query: Query) -> EngineResult<Arc<dyn RawRequest>> {
        self.ensure_exists()?;
        read_request(&self.txn, self.source()?, self.target(), query, first_primary_key)
    }

    fn get_all(&self, query: Query, count: Option<u32>) -> EngineResult<Arc<dyn RawRequest>> {
        self.ensure_exists()?;
        let limit = count_limit(count);
        read_request(&self.txn, self.source()?, self.target(), query, move |entries| {
            Value::Array(entries.into_iter().take(limit).map(|e| e.value).collect())
        })
    }

    fn get_all_keys(&self, query: Query, count: Option<u32>) -> EngineResult<Arc<dyn RawRequest>> {
        self.ensure_exists()?;
        let limit = count_limit(count);
        read_request(&self.txn, self.source()?, self.target(), query, move |entries| {
            Value::Array(
                entries
                    .into_iter()
                    .take(limit)
                    .map(|e| e.primary.to_value())
                    .collect(),
            )
        })
    }

    fn count(&self, query: Query) -> EngineResult<Arc<dyn RawRequest>> {
        self.ensure_exists()?;
        read_request(&self.txn, self.source()?, self.target(), query, |entries| {
            Value::Int(entries.len() as i64)
        })
    }

    fn open_cursor(&self, query: Query, direction: CursorDirection) -> EngineResult<Arc<dyn RawRequest>> {
        self.ensure_exists()?;
        open_cursor(&self.txn, self.source()?, self.target(), query, direction, true)
    }

    fn open_key_cursor(&self, query: Query, direction: CursorDirection) -> EngineResult<Arc<dyn RawRequest>> {
        self.ensure_exists()?;
        open_cursor(&self.txn, self.source()?, self.target(), query, direction, false)
    }

    fn transaction(&self) -> Arc<dyn RawTransaction> {
        Arc::clone(&self.txn) as Arc<dyn RawTransaction>
    }
}

impl RawObjectStore for StoreHandle {
    fn auto_increment(&self) -> bool {
        self.meta(|data| data.auto_increment).unwrap_or(false)
    }

    fn index_names(&self) -> Vec<String> {
        self.meta(|data| data.indexes.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn add(&self, value: Value, key: Option<Key>) -> EngineResult<Arc<dyn RawRequest>> {
        self.write_record(value, key, false)
    }

    fn put(&self, value: Value, key: Option<Key>) -> EngineResult<Arc<dyn RawRequest>> {
        self.write_record(value, key, true)
    }

    fn delete(&self, query: Query) -> EngineResult<Arc<dyn RawRequest>> {
        self.core().ensure_writable()?;
        self.ensure_exists()?;
        let store = self.name.clone();
        issue(
            &self.txn,
            self.source()?,
            Box::new(move |txn| {
                delete_records(txn, &store, &query)?;
                Ok(Resolved::Value(Value::Undefined))
            }),
        )
    }

    fn clear(&self) -> EngineResult<Arc<dyn RawRequest>> {
        self.core().ensure_writable()?;
        self.ensure_exists()?;
        let store = self.name.clone();
        issue(
            &self.txn,
            self.source()?,
            Box::new(move |txn| {
                txn.write(&store, |_, delta| {
                    delta.clear();
                    Ok(())
                })?;
                Ok(Resolved::Value(Value::Undefined))
            }),
        )
    }

    fn index(&self, name: &str) -> EngineResult<Arc<dyn RawIndex>> {
        if self.core().is_finished() {
            return Err(DomException::invalid_state("the transaction has finished"));
        }
        self.ensure_exists()?;
        if self.meta(|data| data.indexes.contains_key(name)) != Some(true) {
            return Err(DomException::not_found(format!("index '{name}' does not exist")));
        }
        Ok(IndexHandle::new(self.this()?, name))
    }

    fn create_index(
        &self,
        name: &str,
        key_path: &str,
        options: IndexOptions,
    ) -> EngineResult<Arc<dyn RawIndex>> {
        let txn = self.core();
        txn.ensure_upgrade("create_index")?;
        self.ensure_exists()?;
        if self.meta(|data| data.indexes.contains_key(name)) == Some(true) {
            return Err(DomException::new(
                DomException::CONSTRAINT_ERROR,
                format!("index '{name}' already exists"),
            ));
        }
        let meta = IndexMeta {
            key_path: key_path.to_string(),
            unique: options.unique,
            multi_entry: options.multi_entry,
        };
        if meta.unique {
            // Existing records, including this upgrade's writes, must already be unique
            let entries = txn.read(&self.name, |view| Ok(view.index_entries(&meta, &Query::All)))?;
            if entries.windows(2).any(|pair| pair[0].key == pair[1].key) {
                return Err(DomException::new(
                    DomException::CONSTRAINT_ERROR,
                    format!("existing records violate unique index '{name}'"),
                ));
            }
        }
        if let Some(store) = txn.connection.db.state.lock().stores.get_mut(&self.name) {
            store.indexes.insert(name.to_string(), meta);
        }
        Ok(IndexHandle::new(self.this()?, name))
    }

    fn delete_index(&self, name: &str) -> EngineResult<()> {
        self.core().ensure_upgrade("delete_index")?;
        let removed = self
            .core()
            .connection
            .db
            .state
            .lock()
            .stores
            .get_mut(&self.name)
            .and_then(|store| store.indexes.remove(name));
        match removed {
            Some(_) => Ok(()),
            None => Err(DomException::not_found(format!("index '{name}' does not exist"))),
        }
    }
}

/// An index within one transaction
pub(crate) struct IndexHandle {
    store: Arc<StoreHandle>,
    name: String,
    me: Weak<IndexHandle>,
}

impl IndexHandle {
    fn new(store: Arc<StoreHandle>, name: &str) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            store,
            name: name.to_string(),
            me: me.clone(),
        })
    }

    fn meta<R>(&self, f: impl FnOnce(&IndexMeta) -> R) -> Option<R> {
        self.store
            .meta(|data| data.indexes.get(&self.name).map(f))
            .flatten()
    }

    fn ensure_exists(&self) -> EngineResult<()> {
        self.meta(|_| ())
            .ok_or_else(|| DomException::invalid_state(format!("index '{}' has been deleted", self.name)))
    }

    fn source(&self) -> EngineResult<RawSourceHandle> {
        self.me
            .upgrade()
            .map(|me| RawSourceHandle::Index(me))
            .ok_or_else(|| DomException::invalid_state("the index handle is gone"))
    }

    fn target(&self) -> Target {
        Target {
            store: self.store.name.clone(),
            index: Some(self.name.clone()),
        }
    }

    fn read(
        &self,
        query: Query,
        read: impl FnOnce(Vec<Entry>) -> Value + Send + 'static,
    ) -> EngineResult<Arc<dyn RawRequest>> {
        self.ensure_exists()?;
        read_request(&self.store.txn, self.source()?, self.target(), query, read)
    }
}

impl RawSource for IndexHandle {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn key_path(&self) -> Option<String> {
        self.meta(|meta| meta.key_path.clone())
    }

    fn get(&self, query: Query) -> EngineResult<Arc<dyn RawRequest>> {
        self.read(query, first_value)
    }

    fn get_key(&self, query: Query) -> EngineResult<Arc<dyn RawRequest>> {
        self.read(query, first_primary_key)
    }

    fn get_all(&self, query: Query, count: Option<u32>) -> EngineResult<Arc<dyn RawRequest>> {
        let limit = count_limit(count);
        self.read(query, move |entries| {
            Value::Array(entries.into_iter().take(limit).map(|e| e.value).collect())
        })
    }

    fn get_all_keys(&self, query: Query, count: Option<u32>) -> EngineResult<Arc<dyn RawRequest>> {
        let limit = count_limit(count);
        self.read(query, move |entries| {
            Value::Array(
                entries
                    .into_iter()
                    .take(limit)
                    .map(|e| e.primary.to_value())
                    .collect(),
            )
        })
    }

    fn count(&self, query: Query) -> EngineResult<Arc<dyn RawRequest>> {
        self.read(query, |entries| Value::Int(entries.len() as i64))
    }

    fn open_cursor(&self, query: Query, direction: CursorDirection) -> EngineResult<Arc<dyn RawRequest>> {
        self.ensure_exists()?;
        open_cursor(&self.store.txn, self.source()?, self.target(), query, direction, true)
    }

    fn open_key_cursor(&self, query: Query, direction: CursorDirection) -> EngineResult<Arc<dyn RawRequest>> {
        self.ensure_exists()?;
        open_cursor(&self.store.txn, self.source()?, self.target(), query, direction, false)
    }

    fn transaction(&self) -> Arc<dyn RawTransaction> {
        Arc::clone(&self.store.txn) as Arc<dyn RawTransaction>
    }
}

impl RawIndex for IndexHandle {
    fn unique(&self) -> bool {
        self.meta(|meta| meta.unique).unwrap_or(false)
    }

    fn multi_entry(&self) -> bool {
        self.meta(|meta| meta.multi_entry).unwrap_or(false)
    }

    fn object_store(&self) -> Arc<dyn RawObjectStore> {
        Arc::clone(&self.store) as Arc<dyn RawObjectStore>
    }
}
