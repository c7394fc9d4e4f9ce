//! SQLite storage layer.
//!
//! A split read/write connection pool in WAL mode and the shared circuit
//! breaker store built on it.

pub mod breaker_store;
pub mod pool;
