//! End-to-end dispatch scenarios: the provider chain driven by simulated
//! adapters, with in-memory and SQLite breaker stores.

use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use switchboard_core::dispatch::chain::{DispatchOptions, ProviderChain};
use switchboard_core::dispatch::store::BoxBreakerStore;
use switchboard_core::provider::box_adapter::BoxProviderAdapter;
use switchboard_infra::provider::simulated::{SimulatedAdapter, parse_script};
use switchboard_infra::sqlite::breaker_store::SqliteBreakerStore;
use switchboard_types::breaker::BreakerState;
use switchboard_types::config::{AdmissionProfile, SwitchboardConfig};
use switchboard_types::error::ChainErrorCode;
use switchboard_types::llm::{Message, StreamChunk};

fn config() -> SwitchboardConfig {
    let mut config = SwitchboardConfig::default();
    config.dispatch.min_attempt_ms = 10;
    config.dispatch.backoff.base_delay_ms = 100;
    config.dispatch.backoff.jitter_ratio = 0.0;
    config.admission.default = AdmissionProfile {
        reservoir: 1000,
        refill_amount: 1000,
        refill_interval_ms: 1000,
        max_concurrent: 100,
        min_spacing_ms: 0,
        high_water: 100,
    };
    config
}

fn sim(name: &str, script: &[&str]) -> SimulatedAdapter {
    SimulatedAdapter::new(name, parse_script(script).unwrap())
}

fn boxed(adapters: Vec<SimulatedAdapter>) -> Vec<BoxProviderAdapter> {
    adapters.into_iter().map(BoxProviderAdapter::new).collect()
}

fn msgs() -> Vec<Message> {
    vec![Message::user("summarise the quarterly report")]
}

async fn sqlite_store(url: &str) -> BoxBreakerStore {
    BoxBreakerStore::new(SqliteBreakerStore::open(url).await.unwrap())
}

#[tokio::test(start_paused = true)]
async fn rate_limited_primary_waits_then_falls_back() {
    let primary = sim("primary", &["status:429:retry_after=2"]);
    let secondary = sim("secondary", &["ok"]);
    let (p_calls, s_calls) = (primary.call_counter(), secondary.call_counter());
    let chain = ProviderChain::in_memory(&config(), boxed(vec![primary, secondary]));

    let result = chain.dispatch(msgs(), DispatchOptions::default()).await.unwrap();

    assert_eq!(result.provider, "secondary");
    assert!(result.fallback_used);
    assert_eq!(result.attempted_providers, vec!["primary".to_string()]);
    assert!(result.elapsed >= Duration::from_secs(2));
    assert_eq!(p_calls.load(Ordering::SeqCst), 2);
    assert_eq!(s_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn auth_failure_stops_the_chain() {
    let primary = sim("primary", &["status:401"]);
    let others: Vec<_> = (0..3).map(|i| sim(&format!("backup-{i}"), &["ok"])).collect();
    let counters: Vec<_> = others.iter().map(|s| s.call_counter()).collect();
    let mut adapters = vec![primary];
    adapters.extend(others);
    let chain = ProviderChain::in_memory(&config(), boxed(adapters));

    let err = chain.dispatch(msgs(), DispatchOptions::default()).await.unwrap_err();

    assert_eq!(err.code, ChainErrorCode::AuthError);
    assert_eq!(err.attempts.len(), 1);
    assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 0));
}

#[tokio::test(start_paused = true)]
async fn hanging_provider_is_preempted_by_deadline() {
    let chain = ProviderChain::in_memory(&config(), boxed(vec![sim("stuck", &["hang"])]));

    let opts = DispatchOptions::default().timeout(Duration::from_millis(200));
    let err = chain.dispatch(msgs(), opts).await.unwrap_err();

    assert_eq!(err.code, ChainErrorCode::DeadlineExceeded);
    assert!(err.elapsed < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn caller_cancel_is_not_a_timeout() {
    let chain = ProviderChain::in_memory(
        &config(),
        boxed(vec![sim("stuck", &["hang"]), sim("backup", &["ok"])]),
    );
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = chain
        .dispatch(msgs(), DispatchOptions::default().cancel(token))
        .await
        .unwrap_err();

    assert_eq!(err.code, ChainErrorCode::Cancelled);
    assert_eq!(err.attempted_providers(), vec!["stuck"]);
}

#[tokio::test(start_paused = true)]
async fn mid_stream_failure_ends_with_one_error_chunk() {
    let primary = sim("primary", &["midstream:2"]);
    let backup = sim("backup", &["ok"]);
    let backup_calls = backup.call_counter();
    let chain = ProviderChain::in_memory(&config(), boxed(vec![primary, backup]));

    let chunks: Vec<_> = chain
        .dispatch_stream(msgs(), DispatchOptions::default())
        .collect()
        .await;

    assert!(matches!(&chunks[0], StreamChunk::Meta { provider, .. } if provider == "primary"));
    let deltas = chunks
        .iter()
        .filter(|c| matches!(c, StreamChunk::Delta { .. }))
        .count();
    assert_eq!(deltas, 2);
    assert_eq!(chunks.iter().filter(|c| c.is_terminal()).count(), 1);
    assert!(matches!(
        chunks.last(),
        Some(StreamChunk::Error {
            code: ChainErrorCode::NetworkError,
            ..
        })
    ));
    assert_eq!(backup_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn stream_falls_back_before_first_chunk() {
    let chain = ProviderChain::in_memory(
        &config(),
        boxed(vec![sim("primary", &["status:503"]), sim("backup", &["ok"])]),
    );

    let chunks: Vec<_> = chain
        .dispatch_stream(msgs(), DispatchOptions::default())
        .collect()
        .await;

    assert!(matches!(&chunks[0], StreamChunk::Meta { provider, .. } if provider == "backup"));
    assert!(matches!(chunks.last(), Some(StreamChunk::Final { .. })));
}

#[tokio::test(start_paused = true)]
async fn saturated_provider_sheds_load_to_fallback() {
    let mut config = config();
    config.admission.providers.insert(
        "primary".into(),
        AdmissionProfile {
            max_concurrent: 1,
            high_water: 1,
            ..config.admission.default.clone()
        },
    );
    let primary = sim("primary", &["ok"]).with_latency(Duration::from_secs(1));
    let chain = ProviderChain::in_memory(&config, boxed(vec![primary, sim("backup", &["ok"])]));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let chain = chain.clone();
            tokio::spawn(async move {
                let opts = DispatchOptions {
                    queue_timeout: Some(Duration::from_millis(100)),
                    ..Default::default()
                };
                chain.dispatch(msgs(), opts).await
            })
        })
        .collect();

    let mut served = Vec::new();
    for handle in handles {
        served.push(handle.await.unwrap().unwrap());
    }
    let by_primary = served.iter().filter(|r| r.provider == "primary").count();
    assert_eq!(by_primary, 1);
    assert_eq!(served.len() - by_primary, 2);
    assert!(
        served
            .iter()
            .filter(|r| r.provider == "backup")
            .all(|r| r.attempts[0].admission.is_some())
    );
    assert_eq!(
        chain.breaker().state("primary").await.unwrap().state,
        BreakerState::Closed
    );
}

#[tokio::test]
async fn half_open_probe_recovers_provider() {
    let mut config = config();
    config.dispatch.max_retries = 0;
    config.breaker.failure_threshold = 1;
    config.breaker.open_duration_ms = 100;
    let chain = ProviderChain::in_memory(
        &config,
        boxed(vec![sim("primary", &["status:503", "ok"]), sim("backup", &["ok"])]),
    );

    let first = chain.dispatch(msgs(), DispatchOptions::default()).await.unwrap();
    assert_eq!(first.provider, "backup");
    assert!(chain.breaker().state("primary").await.unwrap().is_open());

    tokio::time::sleep(Duration::from_millis(150)).await;

    let second = chain.dispatch(msgs(), DispatchOptions::default()).await.unwrap();
    assert_eq!(second.provider, "primary");
    let state = chain.breaker().state("primary").await.unwrap();
    assert_eq!(state.state, BreakerState::Closed);
    assert_eq!(state.consecutive_failures, 0);
    assert_eq!(state.total_failures, 1);
}

#[tokio::test]
async fn breaker_state_is_shared_through_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("breakers.db").display());
    let mut config = config();
    config.dispatch.max_retries = 0;
    config.breaker.failure_threshold = 1;
    config.breaker.open_duration_ms = 60_000;

    let first = ProviderChain::new(
        &config,
        boxed(vec![sim("primary", &["status:503"]), sim("backup", &["ok"])]),
        sqlite_store(&url).await,
    );
    let result = first.dispatch(msgs(), DispatchOptions::default()).await.unwrap();
    assert_eq!(result.provider, "backup");

    let primary = sim("primary", &["ok"]);
    let primary_calls = primary.call_counter();
    let second = ProviderChain::new(
        &config,
        boxed(vec![primary, sim("backup", &["ok"])]),
        sqlite_store(&url).await,
    );
    let result = second.dispatch(msgs(), DispatchOptions::default()).await.unwrap();

    assert_eq!(result.provider, "backup");
    assert!(result.attempts[0].circuit_open);
    assert_eq!(primary_calls.load(Ordering::SeqCst), 0);

    second.reset().await.unwrap();
    let result = first.dispatch(msgs(), DispatchOptions::default()).await;
    assert!(result.is_ok());
    assert_eq!(
        first.breaker().state("primary").await.unwrap().consecutive_failures,
        1
    );
}
