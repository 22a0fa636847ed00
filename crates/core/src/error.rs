//! Error types for idbind
//!
//! Two layers of errors exist:
//! - [`DomException`]: the structured error an engine reports for a failed
//!   operation (symbolic name + human message). Engine trait methods return
//!   [`EngineResult`].
//! - [`Error`]: everything a caller of the bridge can observe, including
//!   engine failures, protocol violations, cancellation and recovered panics.
//!
//! We use `thiserror` for the `Display` and `Error` implementations.

use crate::scope::CancelReason;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for engine trait methods
pub type EngineResult<T> = std::result::Result<T, DomException>;

/// Engine-reported failure with a symbolic name and a message.
///
/// Two exceptions are equal when their names are equal; the message is for
/// humans and is ignored by comparisons.
#[derive(Debug, Clone, Eq)]
pub struct DomException {
    name: String,
    message: String,
}

impl DomException {
    /// A request was aborted, e.g. via `abort()`
    pub const ABORT_ERROR: &'static str = "AbortError";
    /// A mutation violated a constraint (duplicate key, unique index)
    pub const CONSTRAINT_ERROR: &'static str = "ConstraintError";
    /// Provided data or key is not acceptable
    pub const DATA_ERROR: &'static str = "DataError";
    /// An invalid operation was performed on an object
    pub const INVALID_ACCESS_ERROR: &'static str = "InvalidAccessError";
    /// The object is in an invalid state for the operation
    pub const INVALID_STATE_ERROR: &'static str = "InvalidStateError";
    /// The named object could not be found
    pub const NOT_FOUND_ERROR: &'static str = "NotFoundError";
    /// A mutation was attempted in a read-only transaction
    pub const READ_ONLY_ERROR: &'static str = "ReadOnlyError";
    /// A request was placed against an inactive transaction
    pub const TRANSACTION_INACTIVE_ERROR: &'static str = "TransactionInactiveError";
    /// A lower version than the stored one was requested
    pub const VERSION_ERROR: &'static str = "VersionError";
    /// An argument had the wrong type or range
    pub const TYPE_ERROR: &'static str = "TypeError";
    /// Unknown transient failure
    pub const UNKNOWN_ERROR: &'static str = "UnknownError";

    /// Create an exception with the given name and message
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Symbolic name, e.g. `"ConstraintError"`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this exception has the given symbolic name
    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    /// Shorthand for an `AbortError`
    pub fn abort(message: impl Into<String>) -> Self {
        Self::new(Self::ABORT_ERROR, message)
    }

    /// Shorthand for a `DataError`
    pub fn data(message: impl Into<String>) -> Self {
        Self::new(Self::DATA_ERROR, message)
    }

    /// Shorthand for an `InvalidStateError`
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_STATE_ERROR, message)
    }

    /// Shorthand for a `NotFoundError`
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Self::NOT_FOUND_ERROR, message)
    }
}

impl PartialEq for DomException {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl fmt::Display for DomException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for DomException {}

/// Error types observable by callers of the bridge
#[derive(Debug, Error)]
pub enum Error {
    /// The engine reported a failure
    #[error("{0}")]
    Engine(#[from] DomException),

    /// The request has not resolved yet
    #[error("request is not done")]
    NotReady,

    /// The request was not issued inside a transaction
    #[error("request is not part of a transaction")]
    NotInTransaction,

    /// The transaction aborted without a distinguishing cause
    #[error("transaction aborted")]
    Aborted,

    /// Returned by a cursor visitor to end iteration early
    #[error("stop cursor iteration")]
    StopIteration,

    /// A wait was abandoned because its scope was cancelled
    #[error("wait cancelled: {0}")]
    Cancelled(CancelReason),

    /// Contract breach by the engine or misuse by the caller
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A caller-supplied callback panicked and was recovered
    #[error("callback panicked: {0}")]
    Panicked(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error (config files, thread spawning)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Application error raised from a visitor or upgrader
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether this error is a cancelled wait
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Whether this error is an engine exception with the given name
    pub fn is_exception(&self, name: &str) -> bool {
        matches!(self, Error::Engine(e) if e.is(name))
    }

    /// The engine exception, if this error carries one
    pub fn exception(&self) -> Option<&DomException> {
        match self {
            Error::Engine(e) => Some(e),
            _ => None,
        }
    }

    /// Build an error from a recovered panic payload
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Error::Panicked(message)
    }
}
