//! Object stores and the read surface they share with indexes

use crate::cursor::{CursorRequest, CursorWithValueRequest};
use crate::index::Index;
use crate::request::Request;
use crate::transaction::Transaction;
use crate::views::{AckRequest, ArrayRequest, CountRequest};
use idbind_core::{
    CursorDirection, IndexOptions, Key, KeyRange, Query, RawObjectStore, RawRequest, RawSource,
    RawSourceHandle, Result, Value,
};
use std::ops::Deref;
use std::sync::Arc;

/// Reads, counts and cursors over an object store or an index
pub struct BaseStore<S: RawSource + ?Sized> {
    pub(crate) raw: Arc<S>,
    pub(crate) txn: Transaction,
}

impl<S: RawSource + ?Sized> Clone for BaseStore<S> {
    fn clone(&self) -> Self {
        Self {
            raw: Arc::clone(&self.raw),
            txn: self.txn.clone(),
        }
    }
}

impl<S: RawSource + ?Sized> BaseStore<S> {
    fn request(&self, raw: Arc<dyn RawRequest>) -> Request {
        Request::new(raw, Some(self.txn.clone()))
    }

    /// Name of the store or index
    pub fn name(&self) -> String {
        self.raw.name()
    }

    /// Key path, if keys are read from values
    pub fn key_path(&self) -> Option<String> {
        self.raw.key_path()
    }

    /// The owning transaction
    pub fn transaction(&self) -> &Transaction {
        &self.txn
    }

    /// Value of the record at `key` (`Undefined` if absent)
    pub fn get(&self, key: impl Into<Key>) -> Result<Request> {
        Ok(self.request(self.raw.get(Query::Key(key.into()))?))
    }

    /// Value of the first record in `range`
    pub fn get_range(&self, range: KeyRange) -> Result<Request> {
        Ok(self.request(self.raw.get(Query::Range(range))?))
    }

    /// Primary key of the first matching record
    pub fn get_key(&self, query: impl Into<Query>) -> Result<Request> {
        Ok(self.request(self.raw.get_key(query.into())?))
    }

    /// Values of all records, up to `count` if given
    pub fn get_all(&self, count: Option<u32>) -> Result<ArrayRequest> {
        self.get_all_query(Query::All, count)
    }

    /// Values of the records in `range`, up to `count` if given
    pub fn get_all_range(&self, range: KeyRange, count: Option<u32>) -> Result<ArrayRequest> {
        self.get_all_query(Query::Range(range), count)
    }

    fn get_all_query(&self, query: Query, count: Option<u32>) -> Result<ArrayRequest> {
        Ok(ArrayRequest::new(
            self.request(self.raw.get_all(query, count)?),
        ))
    }

    /// Primary keys of all records, up to `count` if given
    pub fn get_all_keys(&self, count: Option<u32>) -> Result<ArrayRequest> {
        self.get_all_keys_range_query(Query::All, count)
    }

    /// Primary keys of the records in `range`, up to `count` if given
    pub fn get_all_keys_range(&self, range: KeyRange, count: Option<u32>) -> Result<ArrayRequest> {
        self.get_all_keys_range_query(Query::Range(range), count)
    }

    fn get_all_keys_range_query(&self, query: Query, count: Option<u32>) -> Result<ArrayRequest> {
        Ok(ArrayRequest::new(
            self.request(self.raw.get_all_keys(query, count)?),
        ))
    }

    /// Number of records
    pub fn count(&self) -> Result<CountRequest> {
        Ok(CountRequest::new(self.request(self.raw.count(Query::All)?)))
    }

    /// Number of records at `key`
    pub fn count_key(&self, key: impl Into<Key>) -> Result<CountRequest> {
        Ok(CountRequest::new(
            self.request(self.raw.count(Query::Key(key.into()))?),
        ))
    }

    /// Number of records in `range`
    pub fn count_range(&self, range: KeyRange) -> Result<CountRequest> {
        Ok(CountRequest::new(
            self.request(self.raw.count(Query::Range(range))?),
        ))
    }

    /// Cursor over every record, with values
    pub fn open_cursor(&self, direction: CursorDirection) -> Result<CursorWithValueRequest> {
        self.value_cursor(Query::All, direction)
    }

    /// Cursor over the records at `key`, with values
    pub fn open_cursor_key(
        &self,
        key: impl Into<Key>,
        direction: CursorDirection,
    ) -> Result<CursorWithValueRequest> {
        self.value_cursor(Query::Key(key.into()), direction)
    }

    /// Cursor over the records in `range`, with values
    pub fn open_cursor_range(
        &self,
        range: KeyRange,
        direction: CursorDirection,
    ) -> Result<CursorWithValueRequest> {
        self.value_cursor(Query::Range(range), direction)
    }

    fn value_cursor(
        &self,
        query: Query,
        direction: CursorDirection,
    ) -> Result<CursorWithValueRequest> {
        let raw = self.raw.open_cursor(query, direction)?;
        Ok(CursorWithValueRequest::new(
            self.request(raw),
            self.txn.clone(),
        ))
    }

    /// Cursor over every record's keys
    pub fn open_key_cursor(&self, direction: CursorDirection) -> Result<CursorRequest> {
        self.key_cursor(Query::All, direction)
    }

    /// Cursor over the keys of the records at `key`
    pub fn open_key_cursor_key(
        &self,
        key: impl Into<Key>,
        direction: CursorDirection,
    ) -> Result<CursorRequest> {
        self.key_cursor(Query::Key(key.into()), direction)
    }

    /// Cursor over the keys of the records in `range`
    pub fn open_key_cursor_range(
        &self,
        range: KeyRange,
        direction: CursorDirection,
    ) -> Result<CursorRequest> {
        self.key_cursor(Query::Range(range), direction)
    }

    fn key_cursor(&self, query: Query, direction: CursorDirection) -> Result<CursorRequest> {
        let raw = self.raw.open_key_cursor(query, direction)?;
        Ok(CursorRequest::new(self.request(raw), self.txn.clone()))
    }

    /// Whether both wrappers hold the same engine handle
    pub fn is_same(&self, other: &Self) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.raw) as *const (),
            Arc::as_ptr(&other.raw) as *const (),
        )
    }
}

/// An object store within one transaction
#[derive(Clone)]
pub struct ObjectStore {
    base: BaseStore<dyn RawObjectStore>,
}

impl ObjectStore {
    pub(crate) fn new(raw: Arc<dyn RawObjectStore>, txn: Transaction) -> Self {
        Self {
            base: BaseStore { raw, txn },
        }
    }

    fn write(&self, raw: Arc<dyn RawRequest>) -> Request {
        Request::new(raw, Some(self.base.txn.clone()))
    }

    /// Whether keys are generated
    pub fn auto_increment(&self) -> bool {
        self.base.raw.auto_increment()
    }

    /// Index names, sorted
    pub fn index_names(&self) -> Vec<String> {
        self.base.raw.index_names()
    }

    /// Insert a record keyed by the store's key path or generator; the
    /// result is the record's key. Fails with `ConstraintError` if the key
    /// exists.
    pub fn add(&self, value: impl Into<Value>) -> Result<Request> {
        Ok(self.write(self.base.raw.add(value.into(), None)?))
    }

    /// Insert a record at an explicit key
    pub fn add_key(&self, value: impl Into<Value>, key: impl Into<Key>) -> Result<Request> {
        Ok(self.write(self.base.raw.add(value.into(), Some(key.into()))?))
    }

    /// Insert or replace a record keyed by the key path or generator
    pub fn put(&self, value: impl Into<Value>) -> Result<Request> {
        Ok(self.write(self.base.raw.put(value.into(), None)?))
    }

    /// Insert or replace the record at an explicit key
    pub fn put_key(&self, value: impl Into<Value>, key: impl Into<Key>) -> Result<Request> {
        Ok(self.write(self.base.raw.put(value.into(), Some(key.into()))?))
    }

    /// Delete the record at `key`
    pub fn delete(&self, key: impl Into<Key>) -> Result<AckRequest> {
        Ok(AckRequest::new(
            self.write(self.base.raw.delete(Query::Key(key.into()))?),
        ))
    }

    /// Delete the records in `range`
    pub fn delete_range(&self, range: KeyRange) -> Result<AckRequest> {
        Ok(AckRequest::new(
            self.write(self.base.raw.delete(Query::Range(range))?),
        ))
    }

    /// Delete every record
    pub fn clear(&self) -> Result<AckRequest> {
        Ok(AckRequest::new(self.write(self.base.raw.clear()?)))
    }

    /// An existing index
    pub fn index(&self, name: &str) -> Result<Index> {
        let raw = self.base.raw.index(name)?;
        Ok(Index::new(raw, self.base.txn.clone()))
    }

    /// Create an index. Only valid inside an upgrader.
    pub fn create_index(&self, name: &str, key_path: &str, options: IndexOptions) -> Result<Index> {
        let raw = self.base.raw.create_index(name, key_path, options)?;
        Ok(Index::new(raw, self.base.txn.clone()))
    }

    /// Delete an index. Only valid inside an upgrader.
    pub fn delete_index(&self, name: &str) -> Result<()> {
        Ok(self.base.raw.delete_index(name)?)
    }
}

impl Deref for ObjectStore {
    type Target = BaseStore<dyn RawObjectStore>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("name", &self.base.raw.name())
            .field("key_path", &self.base.raw.key_path())
            .finish()
    }
}

/// The object store or index a request or cursor reads from
#[derive(Clone, Debug)]
pub enum Source {
    /// An object store
    ObjectStore(ObjectStore),
    /// An index
    Index(Index),
}

impl Source {
    pub(crate) fn from_raw(handle: RawSourceHandle, txn: Transaction) -> Self {
        match handle {
            RawSourceHandle::ObjectStore(raw) => Source::ObjectStore(ObjectStore::new(raw, txn)),
            RawSourceHandle::Index(raw) => Source::Index(Index::new(raw, txn)),
        }
    }

    /// Name of the store or index
    pub fn name(&self) -> String {
        match self {
            Source::ObjectStore(store) => store.name(),
            Source::Index(index) => index.name(),
        }
    }
}
