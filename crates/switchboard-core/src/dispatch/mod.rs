pub mod admission;
pub mod backoff;
pub mod breaker;
pub mod budget;
pub mod chain;
pub mod classifier;
pub mod store;
