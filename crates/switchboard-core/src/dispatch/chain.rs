//! Provider chain: routes one request across providers in priority order.
//!
//! For every dispatch call the chain walks its adapters in order. For each
//! one it checks the budget, asks the circuit breaker, waits for admission,
//! calls the adapter with a share of the remaining time, and classifies any
//! failure. Transient failures are retried with backoff and then fall back
//! to the next provider. Caller-side failures, cancellation and an exhausted
//! budget end the whole dispatch immediately.
//!
//! Streaming uses the same selection loop for the pre-output phase. Once an
//! adapter has produced its first chunk the chain is committed to it, and a
//! later failure becomes a terminal `Error` chunk instead of a fallback.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use switchboard_types::breaker::BreakerState;
use switchboard_types::config::{DispatchConfig, SwitchboardConfig};
use switchboard_types::dispatch::{BudgetTimeout, DispatchAttempt, DispatchResult};
use switchboard_types::error::{
    AdmissionError, ChainError, ChainErrorCode, Classification, ErrorCategory, ProviderError,
    StoreError,
};
use switchboard_types::llm::{
    CompletionRequest, CompletionResponse, GenerationOptions, HealthReport, Message, StreamChunk,
};

use super::admission::{AdmissionController, AdmissionPermit, AdmitOptions, DEFAULT_PRIORITY};
use super::backoff::BackoffPolicy;
use super::breaker::CircuitBreaker;
use super::budget::{CancelReason, RequestBudget};
use super::classifier::{MAX_RETRY_AFTER, classify, counts_against_breaker, parse_retry_after};
use super::store::{BoxBreakerStore, InMemoryBreakerStore};
use crate::provider::adapter::ChunkStream;
use crate::provider::box_adapter::BoxProviderAdapter;

/// Chunks delivered by [`ProviderChain::dispatch_stream`].
pub type DispatchStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send + 'static>>;

/// Per-call dispatch options.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Sampling parameters forwarded to the adapter.
    pub generation: GenerationOptions,
    /// Label for logs and spans.
    pub operation: Option<String>,
    pub timeout: BudgetTimeout,
    /// Replaces the even per-provider share of the budget.
    pub attempt_timeout: Option<Duration>,
    pub queue_timeout: Option<Duration>,
    pub priority: Option<u8>,
    pub cancel: Option<CancellationToken>,
}

impl DispatchOptions {
    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = BudgetTimeout::After(timeout);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Health of one configured provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub model: String,
    pub configured: bool,
    pub report: HealthReport,
    pub breaker: BreakerState,
}

/// Resilient multi-provider dispatcher.
///
/// Cheap to clone; clones share breaker and admission state.
#[derive(Clone)]
pub struct ProviderChain {
    inner: Arc<ChainInner>,
}

struct ChainInner {
    dispatch: DispatchConfig,
    backoff: BackoffPolicy,
    adapters: Vec<BoxProviderAdapter>,
    breaker: CircuitBreaker,
    admission: AdmissionController,
}

impl ProviderChain {
    /// Build a chain. Adapter order is fallback order.
    pub fn new(
        config: &SwitchboardConfig,
        adapters: Vec<BoxProviderAdapter>,
        store: BoxBreakerStore,
    ) -> Self {
        let names: Vec<String> = adapters.iter().map(|a| a.name().to_string()).collect();
        let inner = ChainInner {
            dispatch: config.dispatch.clone(),
            backoff: BackoffPolicy::from_config(&config.dispatch.backoff),
            adapters,
            breaker: CircuitBreaker::new(config.breaker.clone(), store),
            admission: AdmissionController::new(config.admission.clone(), names),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Chain with process-local breaker state.
    pub fn in_memory(config: &SwitchboardConfig, adapters: Vec<BoxProviderAdapter>) -> Self {
        Self::new(
            config,
            adapters,
            BoxBreakerStore::new(InMemoryBreakerStore::new()),
        )
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.inner.admission
    }

    /// Provider names in fallback order.
    pub fn providers(&self) -> Vec<&str> {
        self.inner.adapters.iter().map(|a| a.name()).collect()
    }

    /// Buffered dispatch.
    pub async fn dispatch(
        &self,
        messages: Vec<Message>,
        opts: DispatchOptions,
    ) -> Result<DispatchResult, ChainError> {
        let request = CompletionRequest::new(messages).with_options(opts.generation.clone());
        let span = dispatch_span(&opts, "buffered");
        self.inner.dispatch(request, opts).instrument(span).await
    }

    /// Streaming dispatch.
    ///
    /// Emits `Meta` once a provider is committed, then that provider's
    /// chunks, ending with exactly one `Final` or `Error`.
    pub fn dispatch_stream(&self, messages: Vec<Message>, opts: DispatchOptions) -> DispatchStream {
        let inner = Arc::clone(&self.inner);
        let request = CompletionRequest::new(messages).with_options(opts.generation.clone());
        let span = dispatch_span(&opts, "stream");

        Box::pin(async_stream::stream! {
            let budget = inner.budget(&opts);
            let selected = inner
                .select_provider(&request, &opts, &budget, &Streaming)
                .instrument(span.clone())
                .await;
            let committed = match selected {
                Ok(c) => c,
                Err(e) => {
                    let e = finish(e, &budget);
                    log_chain_error(&e);
                    yield StreamChunk::Error {
                        message: e.message.clone(),
                        code: e.code,
                        retryable: e.is_retryable(),
                    };
                    return;
                }
            };

            let Committed { index, output: (first, mut rest), permit, call_token, probe, attempts } = committed;
            let _permit = permit;
            let _cancel_adapter = call_token.drop_guard();
            let adapter = &inner.adapters[index];
            let provider = adapter.name().to_string();
            let mut probe_guard = ProbeGuard {
                inner: Arc::clone(&inner),
                provider: provider.clone(),
                armed: probe,
            };
            if attempts.len() > 1 {
                tracing::warn!(parent: &span, provider = %provider, tried = attempts.len(), "streaming from fallback provider");
            }

            yield StreamChunk::Meta {
                provider: provider.clone(),
                model: adapter.model().to_string(),
            };

            let mut pending = Some(Ok(first));
            let mut deltas = 0u32;
            loop {
                let next = match pending.take() {
                    Some(item) => Next::Item(Some(item)),
                    None => tokio::select! {
                        biased;
                        _ = budget.token().cancelled() => Next::Interrupted,
                        item = rest.next() => Next::Item(item),
                    },
                };

                match next {
                    Next::Item(Some(Ok(StreamChunk::Delta { text }))) => {
                        deltas += 1;
                        yield StreamChunk::Delta { text };
                    }
                    Next::Item(Some(Ok(StreamChunk::Meta { .. }))) => {}
                    Next::Item(Some(Ok(StreamChunk::Final { content, usage }))) => {
                        probe_guard.armed = false;
                        inner.breaker.record_success(&provider).await;
                        inner.admission.record_usage(&provider, &usage);
                        tracing::debug!(parent: &span, provider = %provider, deltas, "stream completed");
                        yield StreamChunk::Final { content, usage };
                        break;
                    }
                    Next::Item(Some(Ok(StreamChunk::Error { message, code, retryable }))) => {
                        probe_guard.armed = false;
                        let error = provider_error_from_chunk(code, message.clone());
                        inner.settle_stream_failure(&provider, &error, probe).await;
                        tracing::warn!(parent: &span, provider = %provider, deltas, error = %error, "provider failed mid-stream");
                        yield StreamChunk::Error { message, code, retryable };
                        break;
                    }
                    Next::Item(Some(Err(error))) => {
                        probe_guard.armed = false;
                        let c = inner.settle_stream_failure(&provider, &error, probe).await;
                        tracing::warn!(parent: &span, provider = %provider, deltas, error = %error, "provider failed mid-stream");
                        yield StreamChunk::Error {
                            message: error.to_string(),
                            code: c.category.into(),
                            retryable: c.fallback_eligible,
                        };
                        break;
                    }
                    Next::Item(None) => {
                        probe_guard.armed = false;
                        let error = ProviderError::Network("stream ended without a final chunk".into());
                        let c = inner.settle_stream_failure(&provider, &error, probe).await;
                        tracing::warn!(parent: &span, provider = %provider, deltas, "stream ended early");
                        yield StreamChunk::Error {
                            message: error.to_string(),
                            code: c.category.into(),
                            retryable: c.fallback_eligible,
                        };
                        break;
                    }
                    Next::Interrupted => {
                        probe_guard.armed = false;
                        if probe {
                            inner.breaker.release_probe(&provider).await;
                        }
                        let code = interruption_code(&budget);
                        tracing::warn!(parent: &span, provider = %provider, deltas, %code, "stream interrupted");
                        yield StreamChunk::Error {
                            message: format!("stream interrupted after {}ms", budget.elapsed().as_millis()),
                            code,
                            retryable: code.is_retryable(),
                        };
                        break;
                    }
                }
            }
        })
    }

    /// Probe every adapter concurrently and pair each report with its
    /// breaker state.
    pub async fn health_check_all(&self) -> Vec<ProviderHealth> {
        let checks = self.inner.adapters.iter().map(|adapter| async move {
            let report = adapter.health_check().await;
            let breaker = self
                .inner
                .breaker
                .state(adapter.name())
                .await
                .map(|s| s.state)
                .unwrap_or_default();
            ProviderHealth {
                provider: adapter.name().to_string(),
                model: adapter.model().to_string(),
                configured: adapter.is_available(),
                report,
                breaker,
            }
        });
        futures_util::future::join_all(checks).await
    }

    /// Clear breaker and admission state.
    ///
    /// With a shared breaker store this clears every process's view.
    pub async fn reset(&self) -> Result<(), StoreError> {
        self.inner.admission.reset();
        self.inner.breaker.reset_all().await
    }
}

/// How one attempt talks to an adapter.
trait AttemptKind: Send + Sync {
    type Output: Send;

    fn call<'a>(
        &'a self,
        adapter: &'a BoxProviderAdapter,
        request: &'a CompletionRequest,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Self::Output, ProviderError>> + Send + 'a;
}

struct Buffered;

impl AttemptKind for Buffered {
    type Output = CompletionResponse;

    fn call<'a>(
        &'a self,
        adapter: &'a BoxProviderAdapter,
        request: &'a CompletionRequest,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<CompletionResponse, ProviderError>> + Send + 'a {
        adapter.complete(request, cancel)
    }
}

/// Opens the stream and waits for the first content chunk.
struct Streaming;

impl AttemptKind for Streaming {
    type Output = (StreamChunk, ChunkStream);

    fn call<'a>(
        &'a self,
        adapter: &'a BoxProviderAdapter,
        request: &'a CompletionRequest,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(StreamChunk, ChunkStream), ProviderError>> + Send + 'a {
        async move {
            let mut rest = adapter.complete_stream(request.clone(), cancel);
            loop {
                match rest.next().await {
                    Some(Ok(StreamChunk::Meta { .. })) => continue,
                    Some(Ok(StreamChunk::Error { message, code, .. })) => {
                        return Err(provider_error_from_chunk(code, message));
                    }
                    Some(Ok(first)) => return Ok((first, rest)),
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(ProviderError::Network(
                            "stream closed before producing output".into(),
                        ));
                    }
                }
            }
        }
    }
}

/// The provider a dispatch settled on.
struct Committed<T> {
    index: usize,
    output: T,
    permit: AdmissionPermit,
    call_token: CancellationToken,
    /// The breaker allowed this call as a half-open probe.
    probe: bool,
    attempts: Vec<DispatchAttempt>,
}

/// What happened with one provider, retries included.
enum ProviderOutcome<T> {
    Success {
        output: T,
        permit: AdmissionPermit,
        call_token: CancellationToken,
        tries: u32,
    },
    /// Admission said no; try the next provider. `last_error` is the
    /// provider failure that led to the rejected retry, if any.
    Rejected {
        error: AdmissionError,
        last_error: Option<ProviderError>,
        tries: u32,
    },
    /// Terminal for this provider: not eligible, or retries exhausted.
    Failed {
        error: ProviderError,
        classification: Classification,
        tries: u32,
    },
    /// The budget ran out or the caller cancelled; ends the dispatch.
    Stopped {
        code: ChainErrorCode,
        last_error: Option<ProviderError>,
        tries: u32,
    },
}

enum Next {
    Item(Option<Result<StreamChunk, ProviderError>>),
    Interrupted,
}

impl ChainInner {
    fn budget(&self, opts: &DispatchOptions) -> RequestBudget {
        let timeout = match opts.timeout {
            BudgetTimeout::Default if self.dispatch.unbounded => BudgetTimeout::Unbounded,
            BudgetTimeout::Default => BudgetTimeout::After(self.dispatch.default_timeout()),
            other => other,
        };
        RequestBudget::new(timeout, opts.cancel.as_ref())
    }

    async fn dispatch(
        &self,
        request: CompletionRequest,
        opts: DispatchOptions,
    ) -> Result<DispatchResult, ChainError> {
        let budget = self.budget(&opts);
        let committed = match self.select_provider(&request, &opts, &budget, &Buffered).await {
            Ok(c) => c,
            Err(e) => {
                let e = finish(e, &budget);
                log_chain_error(&e);
                return Err(e);
            }
        };

        let Committed {
            index,
            output: response,
            permit,
            attempts,
            ..
        } = committed;
        drop(permit);

        let adapter = &self.adapters[index];
        let provider = adapter.name().to_string();
        self.breaker.record_success(&provider).await;
        self.admission.record_usage(&provider, &response.usage);

        let attempted_providers: Vec<String> = attempts[..attempts.len().saturating_sub(1)]
            .iter()
            .map(|a| a.provider.clone())
            .collect();
        let fallback_used = !attempted_providers.is_empty();
        if fallback_used {
            tracing::warn!(
                provider = %provider,
                attempted = ?attempted_providers,
                "request served by fallback provider"
            );
        }

        Ok(DispatchResult {
            response,
            provider,
            model: adapter.model().to_string(),
            fallback_used,
            attempted_providers,
            attempts,
            elapsed: budget.elapsed(),
        })
    }

    /// Walk the adapters until one produces output or the chain must stop.
    async fn select_provider<K: AttemptKind>(
        &self,
        request: &CompletionRequest,
        opts: &DispatchOptions,
        budget: &RequestBudget,
        kind: &K,
    ) -> Result<Committed<K::Output>, ChainError> {
        let candidates: Vec<usize> = self
            .adapters
            .iter()
            .enumerate()
            .filter(|(_, adapter)| {
                let available = adapter.is_available();
                if !available {
                    tracing::debug!(provider = %adapter.name(), "provider not configured, skipping");
                }
                available
            })
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return Err(ChainError::new(
                ChainErrorCode::ServiceUnavailable,
                "no providers are available",
            ));
        }

        let floor = self.dispatch.min_attempt();
        let mut attempts: Vec<DispatchAttempt> = Vec::new();
        let mut last_rejection: Option<AdmissionError> = None;
        let mut shortest_cooldown: Option<Duration> = None;

        for (position, &index) in candidates.iter().enumerate() {
            let adapter = &self.adapters[index];
            let name = adapter.name();
            let providers_left = candidates.len() - position;

            if let Some(code) = out_of_time(budget, floor) {
                return Err(chain_error(
                    code,
                    format!("no time left to try '{name}'"),
                    attempts,
                ));
            }

            let decision = self.breaker.can_request(name).await;
            if !decision.allowed {
                tracing::debug!(provider = name, state = %decision.state, "circuit open, skipping provider");
                if let Some(cooldown) = decision.retry_after {
                    shortest_cooldown = Some(shortest_cooldown.map_or(cooldown, |s| s.min(cooldown)));
                }
                attempts.push(DispatchAttempt::circuit_open(name, decision.retry_after));
                continue;
            }
            let probe = decision.state == BreakerState::HalfOpen;

            match self
                .try_provider(index, providers_left, probe, request, opts, budget, kind)
                .await
            {
                ProviderOutcome::Success {
                    output,
                    permit,
                    call_token,
                    tries,
                } => {
                    attempts.push(DispatchAttempt::succeeded(name, tries));
                    return Ok(Committed {
                        index,
                        output,
                        permit,
                        call_token,
                        probe,
                        attempts,
                    });
                }
                ProviderOutcome::Rejected {
                    error,
                    last_error,
                    tries,
                } => {
                    tracing::warn!(provider = name, error = %error, "admission rejected, trying next provider");
                    let mut record = match last_error {
                        Some(provider_error) => {
                            let classification = classify(&provider_error);
                            self.settle_failure(name, &provider_error, &classification, probe)
                                .await;
                            DispatchAttempt::failed(
                                name,
                                format!("{provider_error}; retry rejected: {error}"),
                                Some(classification.category),
                                true,
                            )
                        }
                        None => {
                            if probe {
                                self.breaker.release_probe(name).await;
                            }
                            DispatchAttempt::failed(name, error.to_string(), None, true)
                        }
                    }
                    .with_tries(tries);
                    record.admission = Some(error.code());
                    attempts.push(record);
                    last_rejection = Some(error);
                }
                ProviderOutcome::Failed {
                    error,
                    classification,
                    tries,
                } => {
                    self.settle_failure(name, &error, &classification, probe).await;
                    let mut record = DispatchAttempt::failed(
                        name,
                        error.to_string(),
                        Some(classification.category),
                        classification.fallback_eligible,
                    )
                    .with_tries(tries);
                    record.abort_like = classification.abort_like;
                    attempts.push(record);

                    if classification.abort_like {
                        return Err(chain_error(ChainErrorCode::Cancelled, error.to_string(), attempts));
                    }
                    if !classification.fallback_eligible {
                        return Err(chain_error(
                            classification.category.into(),
                            error.to_string(),
                            attempts,
                        ));
                    }
                    tracing::warn!(provider = name, error = %error, "provider failed, trying next in chain");
                }
                ProviderOutcome::Stopped {
                    code,
                    last_error,
                    tries,
                } => {
                    let classification = last_error.as_ref().map(classify);
                    match (&last_error, &classification) {
                        (Some(error), Some(c)) => self.settle_failure(name, error, c, probe).await,
                        _ if probe => self.breaker.release_probe(name).await,
                        _ => {}
                    }
                    let message = match &last_error {
                        Some(error) => format!("{error}; stopped with {code}"),
                        None => code.to_string(),
                    };
                    let mut record = DispatchAttempt::failed(
                        name,
                        message,
                        classification.map(|c| c.category),
                        false,
                    )
                    .with_tries(tries);
                    record.abort_like = true;
                    attempts.push(record);

                    let message = match code {
                        ChainErrorCode::Cancelled => "dispatch cancelled by caller".to_string(),
                        _ => format!(
                            "deadline exceeded after {}ms",
                            budget.elapsed().as_millis()
                        ),
                    };
                    return Err(chain_error(code, message, attempts));
                }
            }
        }

        let all_rejected = attempts
            .iter()
            .all(|a| a.admission.is_some() && a.category.is_none());
        let all_open = attempts.iter().all(|a| a.circuit_open);
        let mut err = match last_rejection {
            Some(rejection) if all_rejected => {
                let mut err = ChainError::new(
                    rejection.code(),
                    format!("every provider rejected the request at admission; last: {rejection}"),
                );
                err.retry_after = rejection.retry_after();
                err
            }
            _ => {
                let mut err = ChainError::new(
                    ChainErrorCode::ServiceUnavailable,
                    format!("all {} providers failed", attempts.len()),
                );
                if all_open {
                    err.retry_after = shortest_cooldown;
                }
                err
            }
        };
        err.attempts = attempts;
        Err(err)
    }

    /// Call one provider, retrying eligible failures with backoff. A
    /// half-open probe gets a single call.
    #[allow(clippy::too_many_arguments)]
    async fn try_provider<K: AttemptKind>(
        &self,
        index: usize,
        providers_left: usize,
        probe: bool,
        request: &CompletionRequest,
        opts: &DispatchOptions,
        budget: &RequestBudget,
        kind: &K,
    ) -> ProviderOutcome<K::Output> {
        let adapter = &self.adapters[index];
        let name = adapter.name();
        let floor = self.dispatch.min_attempt();
        let admit = AdmitOptions {
            priority: opts.priority.unwrap_or(DEFAULT_PRIORITY),
            queue_timeout: opts
                .queue_timeout
                .unwrap_or_else(|| self.dispatch.queue_timeout()),
        };
        let mut tries = 0u32;
        let mut last_error: Option<ProviderError> = None;

        loop {
            let permit = match self.admission.acquire(name, admit, budget.token()).await {
                Ok(permit) => permit,
                Err(AdmissionError::Cancelled { .. }) => {
                    return ProviderOutcome::Stopped {
                        code: interruption_code(budget),
                        last_error,
                        tries,
                    };
                }
                Err(error) => {
                    return ProviderOutcome::Rejected {
                        error,
                        last_error,
                        tries,
                    };
                }
            };

            tries += 1;
            let timeout = budget.attempt_timeout(providers_left, floor, opts.attempt_timeout);
            let call_token = budget.child_token();
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = budget.token().cancelled() => None,
                r = tokio::time::timeout(timeout, kind.call(adapter, request, call_token.clone())) => Some(r),
            };

            let error = match result {
                None => {
                    return ProviderOutcome::Stopped {
                        code: interruption_code(budget),
                        last_error: None,
                        tries,
                    };
                }
                Some(Ok(Ok(output))) => {
                    tracing::debug!(
                        provider = name,
                        tries,
                        latency_ms = started.elapsed().as_millis() as u64,
                        "provider call succeeded"
                    );
                    return ProviderOutcome::Success {
                        output,
                        permit,
                        call_token,
                        tries,
                    };
                }
                Some(Ok(Err(error))) => error,
                Some(Err(_)) => ProviderError::Timeout(format!(
                    "no response within {}ms",
                    timeout.as_millis()
                )),
            };
            call_token.cancel();
            drop(permit);

            if budget.is_expired() {
                return ProviderOutcome::Stopped {
                    code: interruption_code(budget),
                    last_error: Some(error),
                    tries,
                };
            }

            let classification = classify(&error);
            let retry_after = parse_retry_after(&error);
            if classification.category == ErrorCategory::RateLimit
                && let Some(cooldown) = retry_after
            {
                self.admission.pause(name, cooldown.min(MAX_RETRY_AFTER));
            }
            if !classification.fallback_eligible || probe || tries > self.dispatch.max_retries {
                return ProviderOutcome::Failed {
                    error,
                    classification,
                    tries,
                };
            }

            let delay = self.backoff.delay(tries - 1, retry_after);
            let fits = budget
                .remaining()
                .checked_sub(delay)
                .is_some_and(|left| left >= floor);
            if !fits {
                tracing::debug!(
                    provider = name,
                    delay_ms = delay.as_millis() as u64,
                    "retry would overrun the deadline"
                );
                return ProviderOutcome::Stopped {
                    code: ChainErrorCode::DeadlineExceeded,
                    last_error: Some(error),
                    tries,
                };
            }

            tracing::debug!(
                provider = name,
                attempt = tries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying after backoff"
            );
            tokio::select! {
                biased;
                _ = budget.token().cancelled() => {
                    return ProviderOutcome::Stopped {
                        code: interruption_code(budget),
                        last_error: Some(error),
                        tries,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
            last_error = Some(error);
        }
    }

    /// Record a provider failure against the breaker when it counts, or hand
    /// back the probe slot when it does not.
    async fn settle_failure(
        &self,
        provider: &str,
        error: &ProviderError,
        classification: &Classification,
        probe: bool,
    ) {
        if counts_against_breaker(classification) {
            let outcome = self.breaker.record_failure(provider, &error.to_string()).await;
            if outcome.opened {
                tracing::warn!(
                    provider,
                    failures = outcome.consecutive_failures,
                    "circuit opened"
                );
            }
        } else if probe {
            self.breaker.release_probe(provider).await;
        }
    }

    async fn settle_stream_failure(
        &self,
        provider: &str,
        error: &ProviderError,
        probe: bool,
    ) -> Classification {
        let classification = classify(error);
        self.settle_failure(provider, error, &classification, probe).await;
        classification
    }
}

/// Frees a half-open probe slot if a committed stream is dropped before it
/// reports an outcome.
struct ProbeGuard {
    inner: Arc<ChainInner>,
    provider: String,
    armed: bool,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            let provider = std::mem::take(&mut self.provider);
            handle.spawn(async move {
                inner.breaker.release_probe(&provider).await;
            });
        }
    }
}

fn dispatch_span(opts: &DispatchOptions, mode: &'static str) -> tracing::Span {
    tracing::info_span!(
        "dispatch",
        operation = opts.operation.as_deref().unwrap_or("completion"),
        mode,
        dispatch_id = %Uuid::now_v7(),
    )
}

fn out_of_time(budget: &RequestBudget, floor: Duration) -> Option<ChainErrorCode> {
    if budget.is_expired() {
        return Some(interruption_code(budget));
    }
    (budget.remaining() < floor).then_some(ChainErrorCode::DeadlineExceeded)
}

fn interruption_code(budget: &RequestBudget) -> ChainErrorCode {
    match budget.cancel_reason() {
        Some(CancelReason::Cancelled) => ChainErrorCode::Cancelled,
        _ => ChainErrorCode::DeadlineExceeded,
    }
}

fn chain_error(
    code: ChainErrorCode,
    message: impl Into<String>,
    attempts: Vec<DispatchAttempt>,
) -> ChainError {
    let mut err = ChainError::new(code, message);
    err.attempts = attempts;
    err
}

fn finish(mut err: ChainError, budget: &RequestBudget) -> ChainError {
    err.elapsed = budget.elapsed();
    err
}

fn log_chain_error(err: &ChainError) {
    match err.code {
        ChainErrorCode::Cancelled => tracing::debug!(error = %err, "dispatch cancelled"),
        ChainErrorCode::ServiceUnavailable
        | ChainErrorCode::DeadlineExceeded
        | ChainErrorCode::QueueFull
        | ChainErrorCode::QueueTimeout => tracing::warn!(
            error = %err,
            elapsed_ms = err.elapsed.as_millis() as u64,
            attempts = %err.attempt_summary(),
            "dispatch failed"
        ),
        _ => tracing::error!(
            error = %err,
            attempts = %err.attempt_summary(),
            "non-fallback error, dispatch aborted"
        ),
    }
}

/// Recover a typed error from an adapter's `Error` chunk.
fn provider_error_from_chunk(code: ChainErrorCode, message: String) -> ProviderError {
    match code {
        ChainErrorCode::RateLimit => ProviderError::http(429, message),
        ChainErrorCode::ServerError | ChainErrorCode::ServiceUnavailable => {
            ProviderError::http(503, message)
        }
        ChainErrorCode::BadRequest => ProviderError::http(400, message),
        ChainErrorCode::AuthError => ProviderError::http(401, message),
        ChainErrorCode::NetworkError => ProviderError::Network(message),
        ChainErrorCode::Timeout | ChainErrorCode::DeadlineExceeded => ProviderError::Timeout(message),
        ChainErrorCode::Cancelled => ProviderError::Cancelled,
        ChainErrorCode::Unknown | ChainErrorCode::QueueFull | ChainErrorCode::QueueTimeout => {
            ProviderError::Other(message)
        }
    }
}
