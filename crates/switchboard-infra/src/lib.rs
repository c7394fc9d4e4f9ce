//! Infrastructure layer for Switchboard.
//!
//! Contains the concrete collaborators the dispatcher in `switchboard-core`
//! is wired with: the TOML configuration loader, the SQLite-backed shared
//! breaker store, and scriptable simulated provider adapters.

pub mod config;
pub mod provider;
pub mod sqlite;
