//! Breaker state storage.
//!
//! The breaker algorithm is the same for every backend; only where
//! `CircuitState` lives changes. `InMemoryBreakerStore` serves a single
//! process, and a shared store (see `switchboard-infra`) lets several
//! processes agree on which providers are open.

use std::future::Future;
use std::pin::Pin;

use dashmap::DashMap;

use switchboard_types::breaker::CircuitState;
use switchboard_types::error::StoreError;

/// Keyed persistence for circuit state, addressed by provider name.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait BreakerStore: Send + Sync {
    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<CircuitState>, StoreError>> + Send;

    fn set(
        &self,
        key: &str,
        state: &CircuitState,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn clear(&self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Every stored entry, sorted by key.
    fn list(&self) -> impl Future<Output = Result<Vec<(String, CircuitState)>, StoreError>> + Send;
}

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Object-safe version of [`BreakerStore`] with boxed futures.
pub trait BreakerStoreDyn: Send + Sync {
    fn get_boxed<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<CircuitState>>;
    fn set_boxed<'a>(&'a self, key: &'a str, state: &'a CircuitState) -> StoreFuture<'a, ()>;
    fn delete_boxed<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;
    fn clear_boxed(&self) -> StoreFuture<'_, ()>;
    fn list_boxed(&self) -> StoreFuture<'_, Vec<(String, CircuitState)>>;
}

impl<T: BreakerStore> BreakerStoreDyn for T {
    fn get_boxed<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<CircuitState>> {
        Box::pin(self.get(key))
    }

    fn set_boxed<'a>(&'a self, key: &'a str, state: &'a CircuitState) -> StoreFuture<'a, ()> {
        Box::pin(self.set(key, state))
    }

    fn delete_boxed<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(self.delete(key))
    }

    fn clear_boxed(&self) -> StoreFuture<'_, ()> {
        Box::pin(self.clear())
    }

    fn list_boxed(&self) -> StoreFuture<'_, Vec<(String, CircuitState)>> {
        Box::pin(self.list())
    }
}

/// Type-erased breaker store, chosen at startup.
pub struct BoxBreakerStore {
    inner: Box<dyn BreakerStoreDyn>,
}

impl BoxBreakerStore {
    pub fn new<T: BreakerStore + 'static>(store: T) -> Self {
        Self {
            inner: Box::new(store),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<CircuitState>, StoreError> {
        self.inner.get_boxed(key).await
    }

    pub async fn set(&self, key: &str, state: &CircuitState) -> Result<(), StoreError> {
        self.inner.set_boxed(key, state).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete_boxed(key).await
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.inner.clear_boxed().await
    }

    pub async fn list(&self) -> Result<Vec<(String, CircuitState)>, StoreError> {
        self.inner.list_boxed().await
    }
}

/// Process-local store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryBreakerStore {
    states: DashMap<String, CircuitState>,
}

impl InMemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BreakerStore for InMemoryBreakerStore {
    async fn get(&self, key: &str) -> Result<Option<CircuitState>, StoreError> {
        Ok(self.states.get(key).map(|s| s.value().clone()))
    }

    async fn set(&self, key: &str, state: &CircuitState) -> Result<(), StoreError> {
        self.states.insert(key.to_string(), state.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.states.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.states.clear();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(String, CircuitState)>, StoreError> {
        let mut all: Vec<_> = self
            .states
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_types::breaker::BreakerState;

    #[tokio::test]
    async fn test_in_memory_roundtrip_through_box() {
        let store = BoxBreakerStore::new(InMemoryBreakerStore::new());
        assert!(store.get("openai").await.unwrap().is_none());

        let state = CircuitState {
            state: BreakerState::Open,
            consecutive_failures: 5,
            opened_at: Some(chrono::Utc::now()),
            ..CircuitState::default()
        };
        store.set("openai", &state).await.unwrap();
        store.set("anthropic", &CircuitState::closed()).await.unwrap();

        assert_eq!(store.get("openai").await.unwrap(), Some(state));
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, "anthropic");

        store.delete("openai").await.unwrap();
        assert!(store.get("openai").await.unwrap().is_none());

        store.clear().await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }
}
