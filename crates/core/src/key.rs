//! Keys and key ranges
//!
//! Keys are the subset of values an engine can order. The ordering is total:
//!
//! ```text
//! Number < String < Binary < Array
//! ```
//!
//! Numbers compare numerically, strings by code point, binaries
//! lexicographically by byte, and arrays element-wise with the shorter array
//! first when one is a prefix of the other. NaN is not a valid key.

use crate::error::{DomException, EngineResult};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// An engine key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Key {
    /// Finite or infinite number (never NaN)
    Number(f64),
    /// String key
    String(String),
    /// Binary key
    Binary(Vec<u8>),
    /// Array of keys
    Array(Vec<Key>),
}

impl Key {
    fn rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::String(_) => 1,
            Key::Binary(_) => 2,
            Key::Array(_) => 3,
        }
    }

    /// Convert back into a value.
    ///
    /// Integral numbers in the i64 range come back as `Value::Int`.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
                    Value::Int(*n as i64)
                } else {
                    Value::Float(*n)
                }
            }
            Key::String(s) => Value::String(s.clone()),
            Key::Binary(b) => Value::Bytes(b.clone()),
            Key::Array(items) => Value::Array(items.iter().map(Key::to_value).collect()),
        }
    }

    /// Get as f64 if this is a Number key
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Key::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as str if this is a String key
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::String(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            // NaN is rejected at construction, and -0.0 == 0.0 for keys
            (Key::Number(a), Key::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Key::String(a), Key::String(b)) => a.cmp(b),
            (Key::Binary(a), Key::Binary(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Number(n) => write!(f, "{n}"),
            Key::String(s) => write!(f, "{s:?}"),
            Key::Binary(b) => write!(f, "<{} bytes>", b.len()),
            Key::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl TryFrom<&Value> for Key {
    type Error = DomException;

    fn try_from(value: &Value) -> EngineResult<Self> {
        match value {
            Value::Int(i) => Ok(Key::Number(*i as f64)),
            Value::Float(f) if f.is_nan() => Err(DomException::data("NaN is not a valid key")),
            Value::Float(f) => Ok(Key::Number(*f)),
            Value::String(s) => Ok(Key::String(s.clone())),
            Value::Bytes(b) => Ok(Key::Binary(b.clone())),
            Value::Array(items) => items
                .iter()
                .map(Key::try_from)
                .collect::<EngineResult<Vec<_>>>()
                .map(Key::Array),
            other => Err(DomException::data(format!(
                "{} is not a valid key",
                other.type_name()
            ))),
        }
    }
}

impl TryFrom<Value> for Key {
    type Error = DomException;

    fn try_from(value: Value) -> EngineResult<Self> {
        Key::try_from(&value)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::String(s)
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Number(i as f64)
    }
}

impl From<i32> for Key {
    fn from(i: i32) -> Self {
        Key::Number(i as f64)
    }
}

impl From<Vec<u8>> for Key {
    fn from(b: Vec<u8>) -> Self {
        Key::Binary(b)
    }
}

impl From<Key> for Value {
    fn from(k: Key) -> Self {
        k.to_value()
    }
}

/// A continuous interval over keys
///
/// Either bound may be absent (unbounded) and each present bound may be open
/// (exclusive) or closed (inclusive).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    lower: Option<Key>,
    upper: Option<Key>,
    lower_open: bool,
    upper_open: bool,
}

impl KeyRange {
    /// Range containing exactly `key`
    pub fn only(key: impl Into<Key>) -> Self {
        let key = key.into();
        Self {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        }
    }

    /// Range with only a lower bound
    pub fn lower_bound(lower: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: Some(lower.into()),
            upper: None,
            lower_open: open,
            upper_open: true,
        }
    }

    /// Range with only an upper bound
    pub fn upper_bound(upper: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: None,
            upper: Some(upper.into()),
            lower_open: true,
            upper_open: open,
        }
    }

    /// Range with both bounds.
    ///
    /// Fails with `DataError` if `lower > upper`, or if they are equal and
    /// either end is open.
    pub fn bound(
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        lower_open: bool,
        upper_open: bool,
    ) -> EngineResult<Self> {
        let lower = lower.into();
        let upper = upper.into();
        match lower.cmp(&upper) {
            Ordering::Greater => Err(DomException::data(format!(
                "lower bound {lower} is greater than upper bound {upper}"
            ))),
            Ordering::Equal if lower_open || upper_open => Err(DomException::data(
                "equal bounds with an open end describe an empty range",
            )),
            _ => Ok(Self {
                lower: Some(lower),
                upper: Some(upper),
                lower_open,
                upper_open,
            }),
        }
    }

    /// Lower bound, if any
    pub fn lower(&self) -> Option<&Key> {
        self.lower.as_ref()
    }

    /// Upper bound, if any
    pub fn upper(&self) -> Option<&Key> {
        self.upper.as_ref()
    }

    /// Whether the lower bound is excluded
    pub fn lower_open(&self) -> bool {
        self.lower_open
    }

    /// Whether the upper bound is excluded
    pub fn upper_open(&self) -> bool {
        self.upper_open
    }

    /// Whether `key` falls within this range
    pub fn includes(&self, key: &Key) -> bool {
        let above_lower = match &self.lower {
            None => true,
            Some(lower) if self.lower_open => key > lower,
            Some(lower) => key >= lower,
        };
        let below_upper = match &self.upper {
            None => true,
            Some(upper) if self.upper_open => key < upper,
            Some(upper) => key <= upper,
        };
        above_lower && below_upper
    }
}
