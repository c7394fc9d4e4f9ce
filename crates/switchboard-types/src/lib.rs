//! Shared domain types for Switchboard.
//!
//! Requests, responses, stream chunks, the error taxonomy, breaker state and
//! configuration. Zero infrastructure dependencies -- only serde, chrono and
//! thiserror.

pub mod breaker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod llm;
