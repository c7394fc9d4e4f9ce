//! Dispatcher logic for Switchboard.
//!
//! Defines the provider adapter port and the resilience layers wrapped around
//! it: error classification, request budgets, per-provider admission, circuit
//! breaking and the provider chain. Depends only on `switchboard-types`;
//! storage backends and concrete adapters live in `switchboard-infra`.

pub mod dispatch;
pub mod provider;
