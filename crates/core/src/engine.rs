//! Engine collaborator contract
//!
//! The bridge never talks to storage directly. It drives an event-driven
//! engine through the traits in this module:
//!
//! - every operation returns a [`RawRequest`] that later fires exactly one
//!   terminal `success` or `error` event;
//! - cursor-opening requests fire `success` once per row, then once more with
//!   an empty cursor to mark the end of the stream;
//! - a [`RawTransaction`] fires `complete`, `abort` or `error` for the batch
//!   as a whole;
//! - an open request may fire `upgradeneeded` before its terminal event.
//!
//! Events may be delivered on any thread, including one other than the
//! thread that issued the operation. Implementations must not hold internal
//! locks while invoking listeners, since listeners call back into the engine.
//!
//! Thread safety: all handles must be safe to use from multiple threads
//! (requires Send + Sync).

use crate::error::{DomException, EngineResult};
use crate::key::{Key, KeyRange};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Events
// ============================================================================

/// Names of the events an engine handle can fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A request completed successfully (or delivered a cursor row)
    Success,
    /// A request failed; on a transaction, a contained request failed
    Error,
    /// An open request needs a schema upgrade
    UpgradeNeeded,
    /// An open request is waiting for other connections to close
    Blocked,
    /// A transaction committed
    Complete,
    /// A transaction rolled back
    Abort,
    /// Another connection wants to change the database version
    VersionChange,
    /// A connection was closed by the engine
    Close,
}

impl EventKind {
    /// Event name as the engine spells it
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Success => "success",
            EventKind::Error => "error",
            EventKind::UpgradeNeeded => "upgradeneeded",
            EventKind::Blocked => "blocked",
            EventKind::Complete => "complete",
            EventKind::Abort => "abort",
            EventKind::VersionChange => "versionchange",
            EventKind::Close => "close",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event delivered to a listener
#[derive(Clone)]
pub struct Event {
    /// Which event fired
    pub kind: EventKind,
    /// For transaction-level `error` events: the request that failed
    pub origin: Option<Arc<dyn RawRequest>>,
    /// For version events: the stored version before the change
    pub old_version: Option<i64>,
    /// For version events: the requested version (absent for deletion)
    pub new_version: Option<i64>,
}

impl Event {
    /// An event with no payload
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            origin: None,
            old_version: None,
            new_version: None,
        }
    }

    /// A transaction `error` event caused by `origin`
    pub fn failure(origin: Arc<dyn RawRequest>) -> Self {
        Self {
            origin: Some(origin),
            ..Self::new(EventKind::Error)
        }
    }

    /// A version event (`upgradeneeded`, `versionchange`, `blocked`)
    pub fn version(kind: EventKind, old_version: i64, new_version: Option<i64>) -> Self {
        Self {
            old_version: Some(old_version),
            new_version,
            ..Self::new(kind)
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("has_origin", &self.origin.is_some())
            .field("old_version", &self.old_version)
            .field("new_version", &self.new_version)
            .finish()
    }
}

/// Identifies an attached listener on one handle
pub type ListenerId = u64;

/// Callback invoked by the engine when an event fires
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// A handle that fires events
pub trait EventTarget: Send + Sync {
    /// Stable identity of the underlying engine object.
    ///
    /// Two handles with the same id refer to the same object.
    fn handle_id(&self) -> u64;

    /// Attach `listener` for events of `kind`.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle no longer accepts listeners
    /// (e.g. a closed connection).
    fn add_event_listener(&self, kind: EventKind, listener: Listener) -> EngineResult<ListenerId>;

    /// Detach a listener. Detaching an unknown id is not an error.
    fn remove_event_listener(&self, kind: EventKind, id: ListenerId) -> EngineResult<()>;
}

// ============================================================================
// Enumerations
// ============================================================================

/// Readiness of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// The terminal event has not fired
    Pending,
    /// The request has a result or an error
    Done,
}

impl ReadyState {
    /// Readiness as the engine spells it
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadyState::Pending => "pending",
            ReadyState::Done => "done",
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionMode {
    /// Reads only
    #[default]
    ReadOnly,
    /// Reads and writes
    ReadWrite,
    /// Schema upgrade; only created by the engine while opening
    VersionChange,
}

impl TransactionMode {
    /// Mode as the engine spells it
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionMode::ReadOnly => "readonly",
            TransactionMode::ReadWrite => "readwrite",
            TransactionMode::VersionChange => "versionchange",
        }
    }

    /// Parse an engine mode string
    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "readonly" => Ok(TransactionMode::ReadOnly),
            "readwrite" => Ok(TransactionMode::ReadWrite),
            "versionchange" => Ok(TransactionMode::VersionChange),
            other => Err(DomException::new(
                DomException::TYPE_ERROR,
                format!("invalid transaction mode '{other}'"),
            )),
        }
    }

    /// Whether the mode permits writes
    pub fn is_writable(&self) -> bool {
        !matches!(self, TransactionMode::ReadOnly)
    }
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durability hint for a transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// Engine default
    #[default]
    Default,
    /// Faster, may lose the last commits on a crash
    Relaxed,
    /// Flushed before `complete` fires
    Strict,
}

impl Durability {
    /// Durability as the engine spells it
    pub fn as_str(&self) -> &'static str {
        match self {
            Durability::Default => "default",
            Durability::Relaxed => "relaxed",
            Durability::Strict => "strict",
        }
    }

    /// Parse an engine durability string
    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "default" => Ok(Durability::Default),
            "relaxed" => Ok(Durability::Relaxed),
            "strict" => Ok(Durability::Strict),
            other => Err(DomException::new(
                DomException::TYPE_ERROR,
                format!("invalid durability '{other}'"),
            )),
        }
    }
}

impl fmt::Display for Durability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cursor traversal direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorDirection {
    /// Ascending, every record
    #[default]
    #[serde(rename = "next")]
    Next,
    /// Ascending, first record of each distinct key
    #[serde(rename = "nextunique")]
    NextUnique,
    /// Descending, every record
    #[serde(rename = "prev")]
    Prev,
    /// Descending, first record of each distinct key
    #[serde(rename = "prevunique")]
    PrevUnique,
}

impl CursorDirection {
    /// Direction as the engine spells it
    pub fn as_str(&self) -> &'static str {
        match self {
            CursorDirection::Next => "next",
            CursorDirection::NextUnique => "nextunique",
            CursorDirection::Prev => "prev",
            CursorDirection::PrevUnique => "prevunique",
        }
    }

    /// Parse an engine direction string
    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "next" => Ok(CursorDirection::Next),
            "nextunique" => Ok(CursorDirection::NextUnique),
            "prev" => Ok(CursorDirection::Prev),
            "prevunique" => Ok(CursorDirection::PrevUnique),
            other => Err(DomException::new(
                DomException::TYPE_ERROR,
                format!("invalid cursor direction '{other}'"),
            )),
        }
    }

    /// Whether traversal is ascending
    pub fn is_forward(&self) -> bool {
        matches!(self, CursorDirection::Next | CursorDirection::NextUnique)
    }

    /// Whether duplicate keys are skipped
    pub fn is_unique(&self) -> bool {
        matches!(self, CursorDirection::NextUnique | CursorDirection::PrevUnique)
    }
}

impl fmt::Display for CursorDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which records an operation applies to
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Query {
    /// Every record
    #[default]
    All,
    /// Records with exactly this key
    Key(Key),
    /// Records whose key falls in the range
    Range(KeyRange),
}

impl Query {
    /// Whether `key` matches the query
    pub fn matches(&self, key: &Key) -> bool {
        match self {
            Query::All => true,
            Query::Key(k) => k == key,
            Query::Range(range) => range.includes(key),
        }
    }
}

impl From<Key> for Query {
    fn from(key: Key) -> Self {
        Query::Key(key)
    }
}

impl From<KeyRange> for Query {
    fn from(range: KeyRange) -> Self {
        Query::Range(range)
    }
}

/// Options for creating an object store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStoreOptions {
    /// Dotted path to the key inside stored values; out-of-line keys when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    /// Generate keys from a per-store counter
    #[serde(default)]
    pub auto_increment: bool,
}

/// Options for creating an index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOptions {
    /// Reject two records with the same index key
    #[serde(default)]
    pub unique: bool,
    /// Index each element of an array-valued key separately
    #[serde(default)]
    pub multi_entry: bool,
}

/// Name and version of an existing database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    /// Database name
    pub name: String,
    /// Stored schema version
    pub version: u64,
}

/// How a transaction ended
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    /// All operations were applied
    Committed,
    /// Rolled back; carries the failure that caused it, if any
    Aborted(Option<DomException>),
}

// ============================================================================
// Handles
// ============================================================================

/// The result slot of a resolved request
#[derive(Clone)]
pub enum RawResult {
    /// A plain value (record, key, count, list, or `Undefined`)
    Value(Value),
    /// A cursor row; `None` marks the end of the stream
    Cursor(Option<Arc<dyn RawCursor>>),
    /// The connection produced by an open request
    Database(Arc<dyn RawDatabase>),
}

impl fmt::Debug for RawResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawResult::Value(v) => f.debug_tuple("Value").field(v).finish(),
            RawResult::Cursor(c) => f.debug_tuple("Cursor").field(&c.is_some()).finish(),
            RawResult::Database(db) => f.debug_tuple("Database").field(&db.name()).finish(),
        }
    }
}

/// The object a request was issued against
#[derive(Clone)]
pub enum RawSourceHandle {
    /// An object store
    ObjectStore(Arc<dyn RawObjectStore>),
    /// An index
    Index(Arc<dyn RawIndex>),
}

/// One pending asynchronous operation
pub trait RawRequest: EventTarget {
    /// Whether the terminal event has fired
    fn ready_state(&self) -> ReadyState;

    /// The success value.
    ///
    /// # Errors
    ///
    /// `InvalidStateError` while pending. A failed request yields
    /// `RawResult::Value(Value::Undefined)`. An open request exposes its
    /// connection here while `upgradeneeded` is dispatched, but stays
    /// `Pending` until its terminal event.
    fn result(&self) -> EngineResult<RawResult>;

    /// The failure, or `None` if the request succeeded.
    ///
    /// # Errors
    ///
    /// `InvalidStateError` while pending.
    fn error(&self) -> EngineResult<Option<DomException>>;

    /// The store or index the request was issued against
    fn source(&self) -> Option<RawSourceHandle>;

    /// The owning transaction; `None` for factory operations
    fn transaction(&self) -> Option<Arc<dyn RawTransaction>>;
}

/// A batch of operations with one outcome
pub trait RawTransaction: EventTarget {
    /// Transaction mode
    fn mode(&self) -> TransactionMode;

    /// Durability hint
    fn durability(&self) -> Durability;

    /// The failure that aborted the transaction, if any
    fn error(&self) -> Option<DomException>;

    /// Names of the stores in scope, sorted
    fn object_store_names(&self) -> Vec<String>;

    /// A store in scope.
    ///
    /// # Errors
    ///
    /// `NotFoundError` if `name` is not in scope, `InvalidStateError` if the
    /// transaction has finished.
    fn object_store(&self, name: &str) -> EngineResult<Arc<dyn RawObjectStore>>;

    /// The connection the transaction belongs to
    fn database(&self) -> Arc<dyn RawDatabase>;

    /// Roll back.
    ///
    /// # Errors
    ///
    /// `InvalidStateError` if the transaction already committed or aborted.
    fn abort(&self) -> EngineResult<()>;

    /// Whether explicit commit is available
    fn supports_commit(&self) -> bool {
        true
    }

    /// Commit once queued operations finish; no new operations are accepted.
    ///
    /// # Errors
    ///
    /// `InvalidStateError` if the transaction is no longer active.
    fn commit(&self) -> EngineResult<()>;

    /// How the transaction ended, or `None` while it is live
    fn outcome(&self) -> Option<TransactionOutcome>;
}

/// Read operations shared by object stores and indexes
pub trait RawSource: Send + Sync {
    /// Store or index name
    fn name(&self) -> String;

    /// Key path, if keys are derived from values
    fn key_path(&self) -> Option<String>;

    /// First matching record's value (`Undefined` if none)
    fn get(&self, query: Query) -> EngineResult<Arc<dyn RawRequest>>;

    /// First matching record's primary key (`Undefined` if none)
    fn get_key(&self, query: Query) -> EngineResult<Arc<dyn RawRequest>>;

    /// Matching values as an array; `count` limits the number returned
    fn get_all(&self, query: Query, count: Option<u32>) -> EngineResult<Arc<dyn RawRequest>>;

    /// Matching primary keys as an array; `count` limits the number returned
    fn get_all_keys(&self, query: Query, count: Option<u32>) -> EngineResult<Arc<dyn RawRequest>>;

    /// Number of matching records
    fn count(&self, query: Query) -> EngineResult<Arc<dyn RawRequest>>;

    /// Cursor over matching records with their values
    fn open_cursor(
        &self,
        query: Query,
        direction: CursorDirection,
    ) -> EngineResult<Arc<dyn RawRequest>>;

    /// Cursor over matching records' keys only
    fn open_key_cursor(
        &self,
        query: Query,
        direction: CursorDirection,
    ) -> EngineResult<Arc<dyn RawRequest>>;

    /// Owning transaction
    fn transaction(&self) -> Arc<dyn RawTransaction>;
}

/// An object store within one transaction
pub trait RawObjectStore: RawSource {
    /// Whether keys are generated
    fn auto_increment(&self) -> bool;

    /// Index names, sorted
    fn index_names(&self) -> Vec<String>;

    /// Insert; fails with `ConstraintError` if the key exists
    fn add(&self, value: Value, key: Option<Key>) -> EngineResult<Arc<dyn RawRequest>>;

    /// Insert or replace
    fn put(&self, value: Value, key: Option<Key>) -> EngineResult<Arc<dyn RawRequest>>;

    /// Delete matching records
    fn delete(&self, query: Query) -> EngineResult<Arc<dyn RawRequest>>;

    /// Delete every record
    fn clear(&self) -> EngineResult<Arc<dyn RawRequest>>;

    /// An existing index
    fn index(&self, name: &str) -> EngineResult<Arc<dyn RawIndex>>;

    /// Create an index; only during an upgrade
    fn create_index(
        &self,
        name: &str,
        key_path: &str,
        options: IndexOptions,
    ) -> EngineResult<Arc<dyn RawIndex>>;

    /// Delete an index; only during an upgrade
    fn delete_index(&self, name: &str) -> EngineResult<()>;
}

/// An index within one transaction
pub trait RawIndex: RawSource {
    /// Whether index keys are unique
    fn unique(&self) -> bool;

    /// Whether array keys are indexed per element
    fn multi_entry(&self) -> bool;

    /// The indexed object store
    fn object_store(&self) -> Arc<dyn RawObjectStore>;
}

/// A position in a stream of records.
///
/// `advance`, `continue_` and `continue_primary_key` put the cursor's request
/// back to `Pending` before returning `Ok`; the next row (or the end of the
/// stream) arrives as another `success` event.
pub trait RawCursor: Send + Sync {
    /// The store or index being traversed
    fn source(&self) -> RawSourceHandle;

    /// Traversal direction
    fn direction(&self) -> CursorDirection;

    /// Current key (the index key for index cursors)
    fn key(&self) -> Option<Key>;

    /// Current primary key
    fn primary_key(&self) -> Option<Key>;

    /// Current value; `None` for key cursors
    fn value(&self) -> Option<Value>;

    /// The request that delivers this cursor's rows
    fn request(&self) -> Arc<dyn RawRequest>;

    /// Skip `count` records.
    ///
    /// # Errors
    ///
    /// `TypeError` for zero, `InvalidStateError` if the cursor already
    /// advanced for this row or is exhausted.
    fn advance(&self, count: u32) -> EngineResult<()>;

    /// Move to the next record, or to the first record at or beyond `key`
    fn continue_(&self, key: Option<Key>) -> EngineResult<()>;

    /// Move to the first record at or beyond (`key`, `primary_key`)
    fn continue_primary_key(&self, key: Key, primary_key: Key) -> EngineResult<()>;

    /// Replace the current record's value
    fn update(&self, value: Value) -> EngineResult<Arc<dyn RawRequest>>;

    /// Delete the current record
    fn delete(&self) -> EngineResult<Arc<dyn RawRequest>>;
}

/// An open connection to a database
pub trait RawDatabase: EventTarget {
    /// Database name
    fn name(&self) -> String;

    /// Schema version of this connection
    fn version(&self) -> u64;

    /// Object store names, sorted
    fn object_store_names(&self) -> Vec<String>;

    /// Create a store; only during an upgrade
    fn create_object_store(
        &self,
        name: &str,
        options: ObjectStoreOptions,
    ) -> EngineResult<Arc<dyn RawObjectStore>>;

    /// Delete a store; only during an upgrade
    fn delete_object_store(&self, name: &str) -> EngineResult<()>;

    /// Start a transaction over `store_names`
    fn transaction(
        &self,
        store_names: &[String],
        mode: TransactionMode,
        durability: Durability,
    ) -> EngineResult<Arc<dyn RawTransaction>>;

    /// Close the connection once its transactions finish
    fn close(&self);
}

/// Entry point of an engine
pub trait RawFactory: Send + Sync {
    /// Open a database; `None` opens the stored version (or 1 if new)
    fn open(&self, name: &str, version: Option<u64>) -> EngineResult<Arc<dyn RawRequest>>;

    /// Delete a database
    fn delete_database(&self, name: &str) -> EngineResult<Arc<dyn RawRequest>>;

    /// Compare two values as keys.
    ///
    /// # Errors
    ///
    /// `DataError` if either value is not a valid key.
    fn cmp(&self, a: &Value, b: &Value) -> EngineResult<Ordering>;

    /// Existing databases
    fn databases(&self) -> EngineResult<Vec<DatabaseInfo>>;
}
