//! SQLite breaker store.
//!
//! Persists `CircuitState` per provider so every process pointing at the same
//! database sees the same open/closed decisions, and state survives restarts.

use chrono::{DateTime, Utc};
use sqlx::Row;

use switchboard_core::dispatch::store::BreakerStore;
use switchboard_types::breaker::{BreakerState, CircuitState};
use switchboard_types::error::StoreError;

use super::pool::DatabasePool;

/// SQLite-backed [`BreakerStore`].
#[derive(Clone)]
pub struct SqliteBreakerStore {
    pool: DatabasePool,
}

impl SqliteBreakerStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `database_url`.
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let pool = DatabasePool::new(database_url).await.map_err(unavailable)?;
        Ok(Self::new(pool))
    }
}

impl BreakerStore for SqliteBreakerStore {
    async fn get(&self, key: &str) -> Result<Option<CircuitState>, StoreError> {
        let row = sqlx::query("SELECT * FROM breaker_state WHERE provider = ?")
            .bind(key)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(unavailable)?;

        match row {
            Some(row) => {
                let (_, state) = BreakerSqlRow::from_row(&row)
                    .map_err(unavailable)?
                    .into_circuit_state()?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, state: &CircuitState) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO breaker_state (provider, state, consecutive_failures, opened_at, half_open_probes_in_flight, total_failures, last_error, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT (provider) DO UPDATE SET
                   state = excluded.state,
                   consecutive_failures = excluded.consecutive_failures,
                   opened_at = excluded.opened_at,
                   half_open_probes_in_flight = excluded.half_open_probes_in_flight,
                   total_failures = excluded.total_failures,
                   last_error = excluded.last_error,
                   updated_at = excluded.updated_at"#,
        )
        .bind(key)
        .bind(state.state.to_string())
        .bind(state.consecutive_failures as i64)
        .bind(state.opened_at.map(|dt| format_datetime(&dt)))
        .bind(state.half_open_probes_in_flight as i64)
        .bind(state.total_failures as i64)
        .bind(&state.last_error)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(unavailable)?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM breaker_state WHERE provider = ?")
            .bind(key)
            .execute(&self.pool.writer)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM breaker_state")
            .execute(&self.pool.writer)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(String, CircuitState)>, StoreError> {
        let rows = sqlx::query("SELECT * FROM breaker_state ORDER BY provider")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(unavailable)?;

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let entry = BreakerSqlRow::from_row(row)
                .map_err(unavailable)?
                .into_circuit_state()?;
            results.push(entry);
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Private Row types
// ---------------------------------------------------------------------------

struct BreakerSqlRow {
    provider: String,
    state: String,
    consecutive_failures: i64,
    opened_at: Option<String>,
    half_open_probes_in_flight: i64,
    total_failures: i64,
    last_error: Option<String>,
}

impl BreakerSqlRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            provider: row.try_get("provider")?,
            state: row.try_get("state")?,
            consecutive_failures: row.try_get("consecutive_failures")?,
            opened_at: row.try_get("opened_at")?,
            half_open_probes_in_flight: row.try_get("half_open_probes_in_flight")?,
            total_failures: row.try_get("total_failures")?,
            last_error: row.try_get("last_error")?,
        })
    }

    fn into_circuit_state(self) -> Result<(String, CircuitState), StoreError> {
        let state: BreakerState = self.state.parse().map_err(StoreError::Serialization)?;
        let opened_at = self.opened_at.as_deref().map(parse_datetime).transpose()?;

        Ok((
            self.provider,
            CircuitState {
                state,
                consecutive_failures: self.consecutive_failures as u32,
                opened_at,
                half_open_probes_in_flight: self.half_open_probes_in_flight as u32,
                total_failures: self.total_failures as u64,
                last_error: self.last_error,
            },
        ))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::dispatch::breaker::CircuitBreaker;
    use switchboard_core::dispatch::store::BoxBreakerStore;
    use switchboard_types::config::BreakerConfig;

    async fn test_store() -> (SqliteBreakerStore, String) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("breakers.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        (SqliteBreakerStore::open(&url).await.unwrap(), url)
    }

    fn open_state() -> CircuitState {
        CircuitState {
            state: BreakerState::Open,
            consecutive_failures: 5,
            opened_at: Some(Utc::now()),
            half_open_probes_in_flight: 0,
            total_failures: 12,
            last_error: Some("HTTP 503: overloaded".into()),
        }
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let (store, _) = test_store().await;
        assert!(store.get("openai").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_then_get_preserves_fields() {
        let (store, _) = test_store().await;
        let state = open_state();
        store.set("openai", &state).await.unwrap();

        let loaded = store.get("openai").await.unwrap().unwrap();
        assert_eq!(loaded.state, BreakerState::Open);
        assert_eq!(loaded.consecutive_failures, 5);
        assert_eq!(loaded.total_failures, 12);
        assert_eq!(loaded.last_error.as_deref(), Some("HTTP 503: overloaded"));
        let opened = loaded.opened_at.unwrap();
        let expected = state.opened_at.unwrap();
        assert!((opened - expected).num_milliseconds().abs() < 1);
    }

    #[tokio::test]
    async fn test_set_upserts() {
        let (store, _) = test_store().await;
        store.set("openai", &open_state()).await.unwrap();
        store.set("openai", &CircuitState::closed()).await.unwrap();

        let loaded = store.get("openai").await.unwrap().unwrap();
        assert_eq!(loaded.state, BreakerState::Closed);
        assert!(loaded.opened_at.is_none());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_sorted_delete_and_clear() {
        let (store, _) = test_store().await;
        store.set("openai", &open_state()).await.unwrap();
        store.set("anthropic", &CircuitState::closed()).await.unwrap();
        store.set("groq", &CircuitState::closed()).await.unwrap();

        let names: Vec<String> = store.list().await.unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["anthropic", "groq", "openai"]);

        store.delete("groq").await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);

        store.clear().await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_shared_between_stores() {
        let (first, url) = test_store().await;
        let second = SqliteBreakerStore::open(&url).await.unwrap();

        let config = BreakerConfig {
            failure_threshold: 2,
            open_duration_ms: 60_000,
            half_open_max_attempts: 1,
        };
        let a = CircuitBreaker::new(config.clone(), BoxBreakerStore::new(first));
        let b = CircuitBreaker::new(config, BoxBreakerStore::new(second));

        a.record_failure("openai", "HTTP 503").await;
        b.record_failure("openai", "HTTP 503").await;

        let decision = a.can_request("openai").await;
        assert!(!decision.allowed);
        assert_eq!(decision.state, BreakerState::Open);
        assert!(b.state("openai").await.unwrap().is_open());
    }
}
