//! Typed request views
//!
//! Thin decoders over [`Request`]: the listener and wait mechanics are the
//! request's own, only the decoding of the result differs.

use crate::request::Request;
use idbind_core::{Error, Result, Scope, Value};
use std::ops::Deref;

macro_rules! request_view {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug)]
        pub struct $name(Request);

        impl $name {
            pub(crate) fn new(request: Request) -> Self {
                Self(request)
            }

            /// The untyped request
            pub fn into_inner(self) -> Request {
                self.0
            }
        }

        impl Deref for $name {
            type Target = Request;

            fn deref(&self) -> &Request {
                &self.0
            }
        }
    };
}

request_view!(
    /// A request whose result is a record count
    CountRequest
);
request_view!(
    /// A request whose result is a list of values
    ArrayRequest
);
request_view!(
    /// A request where only success or failure matters
    AckRequest
);

pub(crate) fn decode_count(value: Value) -> Result<u64> {
    match value {
        Value::Int(n) if n >= 0 => Ok(n as u64),
        Value::Float(f) if f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => Ok(f as u64),
        other => Err(Error::Protocol(format!(
            "expected a non-negative count, got {}",
            other.type_name()
        ))),
    }
}

pub(crate) fn decode_array(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(Error::Protocol(format!(
            "expected an array, got {}",
            other.type_name()
        ))),
    }
}

impl CountRequest {
    /// The count, once settled
    pub fn result(&self) -> Result<u64> {
        decode_count(self.0.result()?)
    }

    /// Block until the count is available
    pub fn wait(&self, scope: &Scope) -> Result<u64> {
        decode_count(self.0.wait(scope)?)
    }
}

impl ArrayRequest {
    /// The values, once settled
    pub fn result(&self) -> Result<Vec<Value>> {
        decode_array(self.0.result()?)
    }

    /// Block until the values are available
    pub fn wait(&self, scope: &Scope) -> Result<Vec<Value>> {
        decode_array(self.0.wait(scope)?)
    }
}

impl AckRequest {
    /// `Ok` once the request succeeded
    pub fn result(&self) -> Result<()> {
        self.0.raw_result().map(drop)
    }

    /// Block until the request settles, discarding its value
    pub fn wait(&self, scope: &Scope) -> Result<()> {
        self.0.wait_raw(scope).map(drop)
    }
}
