//! Bridge Integration Tests
//!
//! Drives the blocking bridge against the in-memory reference engine, whose
//! events fire on a dispatcher thread distinct from the test thread.

#[path = "../common/mod.rs"]
mod common;

mod cancellation;
mod cursors;
mod requests;
mod schema;
mod transactions;
