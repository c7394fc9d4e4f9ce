//! Observability for Switchboard: subscriber setup and the names used for
//! dispatch spans and operations.

pub mod attrs;
pub mod tracing_setup;
