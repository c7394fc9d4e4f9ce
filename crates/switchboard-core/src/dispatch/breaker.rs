//! Per-provider circuit breaker.
//!
//! closed --threshold failures--> open --cooldown--> half_open --success--> closed
//!                                                   half_open --failure--> open
//!
//! The open → half-open transition is lazy: it happens inside `can_request`
//! once the cooldown has elapsed, not on a timer. State lives in a
//! [`BoxBreakerStore`]; store errors fail open.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use switchboard_types::breaker::{BreakerState, CircuitState};
use switchboard_types::config::BreakerConfig;
use switchboard_types::error::StoreError;

use super::store::{BoxBreakerStore, InMemoryBreakerStore};

/// Answer to "may I call this provider now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerDecision {
    pub allowed: bool,
    pub state: BreakerState,
    /// Remaining cooldown when the circuit is open.
    pub retry_after: Option<Duration>,
}

impl BreakerDecision {
    fn allow(state: BreakerState) -> Self {
        Self {
            allowed: true,
            state,
            retry_after: None,
        }
    }

    fn deny(state: BreakerState, retry_after: Option<Duration>) -> Self {
        Self {
            allowed: false,
            state,
            retry_after,
        }
    }
}

/// Result of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    /// This failure moved the circuit to open.
    pub opened: bool,
    pub state: BreakerState,
    pub consecutive_failures: u32,
}

/// Circuit breakers for every provider, sharing one store and one policy.
pub struct CircuitBreaker {
    config: BreakerConfig,
    store: BoxBreakerStore,
    /// Serialises read-modify-write cycles per provider within this process.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, store: BoxBreakerStore) -> Self {
        Self {
            config,
            store,
            locks: DashMap::new(),
        }
    }

    pub fn in_memory(config: BreakerConfig) -> Self {
        Self::new(config, BoxBreakerStore::new(InMemoryBreakerStore::new()))
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn key_lock(&self, provider: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(provider.to_string())
            .or_default()
            .value()
            .clone()
    }

    async fn load(&self, provider: &str) -> Result<CircuitState, StoreError> {
        Ok(self.store.get(provider).await?.unwrap_or_default())
    }

    async fn save(&self, provider: &str, state: &CircuitState) {
        if let Err(e) = self.store.set(provider, state).await {
            tracing::warn!(provider, error = %e, "failed to persist breaker state");
        }
    }

    /// Decide whether a request may go to `provider`.
    ///
    /// Takes a half-open probe slot when it allows a request in the
    /// half-open state. Release it with a recorded outcome or
    /// [`release_probe`](Self::release_probe).
    pub async fn can_request(&self, provider: &str) -> BreakerDecision {
        let lock = self.key_lock(provider);
        let _guard = lock.lock().await;

        let mut st = match self.load(provider).await {
            Ok(st) => st,
            Err(e) => {
                tracing::warn!(provider, error = %e, "breaker store unavailable, allowing request");
                return BreakerDecision::allow(BreakerState::Closed);
            }
        };

        let open_duration = self.config.open_duration();
        let max_probes = self.config.half_open_max_attempts.max(1);
        let now = Utc::now();
        let since_opened = st
            .opened_at
            .and_then(|at| (now - at).to_std().ok())
            .unwrap_or(Duration::ZERO);

        match st.state {
            BreakerState::Closed => BreakerDecision::allow(BreakerState::Closed),
            BreakerState::Open => {
                if st.opened_at.is_some() && since_opened < open_duration {
                    return BreakerDecision::deny(
                        BreakerState::Open,
                        Some(open_duration - since_opened),
                    );
                }
                st.state = BreakerState::HalfOpen;
                st.opened_at = Some(now);
                st.half_open_probes_in_flight = 1;
                self.save(provider, &st).await;
                tracing::info!(provider, "circuit half-open, sending probe");
                BreakerDecision::allow(BreakerState::HalfOpen)
            }
            BreakerState::HalfOpen => {
                if st.half_open_probes_in_flight >= max_probes && since_opened >= open_duration {
                    tracing::warn!(
                        provider,
                        probes = st.half_open_probes_in_flight,
                        "half-open probes never reported back, resetting probe slots"
                    );
                    st.half_open_probes_in_flight = 0;
                    st.opened_at = Some(now);
                }
                if st.half_open_probes_in_flight < max_probes {
                    st.half_open_probes_in_flight += 1;
                    self.save(provider, &st).await;
                    BreakerDecision::allow(BreakerState::HalfOpen)
                } else {
                    BreakerDecision::deny(BreakerState::HalfOpen, None)
                }
            }
        }
    }

    /// One success closes the circuit from any state.
    pub async fn record_success(&self, provider: &str) {
        let lock = self.key_lock(provider);
        let _guard = lock.lock().await;

        let prev = match self.load(provider).await {
            Ok(st) => st,
            Err(e) => {
                tracing::warn!(provider, error = %e, "breaker store unavailable, success not recorded");
                return;
            }
        };
        if prev.state == BreakerState::Closed && prev.consecutive_failures == 0 {
            return;
        }
        if prev.state != BreakerState::Closed {
            tracing::info!(provider, from = %prev.state, "circuit closed");
        }
        let st = CircuitState {
            total_failures: prev.total_failures,
            last_error: prev.last_error,
            ..CircuitState::closed()
        };
        self.save(provider, &st).await;
    }

    /// Count an eligible failure. Reports whether it opened the circuit so
    /// the caller can warn once per transition.
    pub async fn record_failure(&self, provider: &str, error: &str) -> FailureOutcome {
        let lock = self.key_lock(provider);
        let _guard = lock.lock().await;

        let mut st = match self.load(provider).await {
            Ok(st) => st,
            Err(e) => {
                tracing::warn!(provider, error = %e, "breaker store unavailable, failure not recorded");
                return FailureOutcome {
                    opened: false,
                    state: BreakerState::Closed,
                    consecutive_failures: 0,
                };
            }
        };

        st.consecutive_failures = st.consecutive_failures.saturating_add(1);
        st.total_failures = st.total_failures.saturating_add(1);
        st.last_error = Some(error.to_string());

        let opened = match st.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => st.consecutive_failures >= self.config.failure_threshold,
            BreakerState::Open => false,
        };
        if opened {
            st.state = BreakerState::Open;
            st.opened_at = Some(Utc::now());
            st.half_open_probes_in_flight = 0;
        }
        self.save(provider, &st).await;

        FailureOutcome {
            opened,
            state: st.state,
            consecutive_failures: st.consecutive_failures,
        }
    }

    /// Give back a half-open probe slot without recording an outcome.
    pub async fn release_probe(&self, provider: &str) {
        let lock = self.key_lock(provider);
        let _guard = lock.lock().await;

        let Ok(mut st) = self.load(provider).await else {
            return;
        };
        if st.state == BreakerState::HalfOpen && st.half_open_probes_in_flight > 0 {
            st.half_open_probes_in_flight -= 1;
            self.save(provider, &st).await;
        }
    }

    pub async fn state(&self, provider: &str) -> Result<CircuitState, StoreError> {
        self.load(provider).await
    }

    /// Every provider with stored state.
    pub async fn states(&self) -> Result<Vec<(String, CircuitState)>, StoreError> {
        self.store.list().await
    }

    pub async fn reset(&self, provider: &str) -> Result<(), StoreError> {
        let lock = self.key_lock(provider);
        let _guard = lock.lock().await;
        self.store.delete(provider).await
    }

    pub async fn reset_all(&self) -> Result<(), StoreError> {
        self.store.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::store::BreakerStore;

    fn config(threshold: u32, open_ms: u64, probes: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            open_duration_ms: open_ms,
            half_open_max_attempts: probes,
        }
    }

    async fn trip(breaker: &CircuitBreaker, provider: &str, times: u32) -> FailureOutcome {
        let mut last = None;
        for _ in 0..times {
            last = Some(breaker.record_failure(provider, "HTTP 503: down").await);
        }
        last.unwrap()
    }

    #[tokio::test]
    async fn test_closed_allows() {
        let breaker = CircuitBreaker::in_memory(config(3, 1000, 1));
        let d = breaker.can_request("a").await;
        assert!(d.allowed);
        assert_eq!(d.state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_opens_at_threshold_once() {
        let breaker = CircuitBreaker::in_memory(config(3, 60_000, 1));

        let outcome = trip(&breaker, "a", 2).await;
        assert!(!outcome.opened);
        assert_eq!(outcome.state, BreakerState::Closed);

        let outcome = breaker.record_failure("a", "boom").await;
        assert!(outcome.opened);
        assert_eq!(outcome.state, BreakerState::Open);

        // Further failures while open do not re-signal the transition.
        let outcome = breaker.record_failure("a", "boom").await;
        assert!(!outcome.opened);

        let d = breaker.can_request("a").await;
        assert!(!d.allowed);
        assert_eq!(d.state, BreakerState::Open);
        assert!(d.retry_after.unwrap() <= Duration::from_secs(60));

        let st = breaker.state("a").await.unwrap();
        assert!(st.opened_at.is_some());
        assert_eq!(st.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_cooldown_moves_to_half_open() {
        let breaker = CircuitBreaker::in_memory(config(2, 50, 1));
        trip(&breaker, "a", 2).await;
        assert!(!breaker.can_request("a").await.allowed);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let d = breaker.can_request("a").await;
        assert!(d.allowed);
        assert_eq!(d.state, BreakerState::HalfOpen);

        // The single probe slot is taken.
        let d = breaker.can_request("a").await;
        assert!(!d.allowed);
        assert_eq!(d.state, BreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let breaker = CircuitBreaker::in_memory(config(2, 20, 1));
        trip(&breaker, "a", 2).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(breaker.can_request("a").await.allowed);

        breaker.record_success("a").await;
        let st = breaker.state("a").await.unwrap();
        assert_eq!(st.state, BreakerState::Closed);
        assert_eq!(st.consecutive_failures, 0);
        assert!(st.opened_at.is_none());
        assert_eq!(st.total_failures, 2);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::in_memory(config(5, 20, 1));
        trip(&breaker, "a", 5).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(breaker.can_request("a").await.allowed);

        let outcome = breaker.record_failure("a", "still down").await;
        assert!(outcome.opened);
        assert!(!breaker.can_request("a").await.allowed);
    }

    #[tokio::test]
    async fn test_multiple_probes_allowed() {
        let breaker = CircuitBreaker::in_memory(config(1, 20, 2));
        trip(&breaker, "a", 1).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(breaker.can_request("a").await.allowed);
        assert!(breaker.can_request("a").await.allowed);
        assert!(!breaker.can_request("a").await.allowed);

        breaker.release_probe("a").await;
        assert!(breaker.can_request("a").await.allowed);
    }

    #[tokio::test]
    async fn test_stale_probe_is_reclaimed() {
        let breaker = CircuitBreaker::in_memory(config(1, 30, 1));
        trip(&breaker, "a", 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(breaker.can_request("a").await.allowed);
        assert!(!breaker.can_request("a").await.allowed);

        // The probe holder vanished; after another window the slot is freed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(breaker.can_request("a").await.allowed);
    }

    #[tokio::test]
    async fn test_success_resets_counter_when_closed() {
        let breaker = CircuitBreaker::in_memory(config(3, 1000, 1));
        trip(&breaker, "a", 2).await;
        breaker.record_success("a").await;
        let outcome = trip(&breaker, "a", 2).await;
        assert!(!outcome.opened);
        assert_eq!(outcome.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_providers_are_independent_and_resettable() {
        let breaker = CircuitBreaker::in_memory(config(1, 60_000, 1));
        trip(&breaker, "a", 1).await;
        assert!(!breaker.can_request("a").await.allowed);
        assert!(breaker.can_request("b").await.allowed);

        breaker.reset("a").await.unwrap();
        assert!(breaker.can_request("a").await.allowed);

        trip(&breaker, "a", 1).await;
        trip(&breaker, "b", 1).await;
        assert_eq!(breaker.states().await.unwrap().len(), 2);
        breaker.reset_all().await.unwrap();
        assert!(breaker.states().await.unwrap().is_empty());
    }

    struct FailingStore;

    impl BreakerStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<CircuitState>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn set(&self, _key: &str, _state: &CircuitState) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn clear(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn list(&self) -> Result<Vec<(String, CircuitState)>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_store_errors_fail_open() {
        let breaker = CircuitBreaker::new(config(1, 60_000, 1), BoxBreakerStore::new(FailingStore));
        let outcome = breaker.record_failure("a", "boom").await;
        assert!(!outcome.opened);

        let d = breaker.can_request("a").await;
        assert!(d.allowed);
        assert_eq!(d.state, BreakerState::Closed);

        breaker.record_success("a").await;
        assert!(breaker.state("a").await.is_err());
    }
}
