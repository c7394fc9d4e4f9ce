//! Provider adapter abstractions.
//!
//! - `ProviderAdapter`: RPITIT trait for concrete backends
//! - `BoxProviderAdapter`: object-safe wrapper for dynamic dispatch

pub mod adapter;
pub mod box_adapter;
