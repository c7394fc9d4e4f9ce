//! Scripted provider adapter.
//!
//! Replays a list of outcomes, one per call, cycling back to the start when
//! the script runs out. Used by `swb simulate` and the scenario tests to drive
//! the dispatcher without network access.
//!
//! Script steps:
//! - `ok`: succeed
//! - `status:<code>` / `status:<code>:retry_after=<secs>`: HTTP failure
//! - `network`: connection reset
//! - `timeout`: upstream timeout
//! - `hang`: never answer; only cancellation ends the call
//! - `midstream:<n>`: buffered calls succeed, streams fail after `n` deltas

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use switchboard_core::provider::adapter::{ChunkStream, ProviderAdapter};
use switchboard_types::config::SimulatedProviderConfig;
use switchboard_types::error::ProviderError;
use switchboard_types::llm::{
    CompletionRequest, CompletionResponse, HealthReport, StreamChunk, Usage,
};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid script step '{step}': {reason}")]
pub struct ScriptError {
    pub step: String,
    pub reason: String,
}

/// One scripted outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimStep {
    Ok,
    Status {
        code: u16,
        retry_after: Option<String>,
    },
    Network,
    Timeout,
    Hang,
    MidStream(usize),
}

impl FromStr for SimStep {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason: &str| ScriptError {
            step: s.to_string(),
            reason: reason.to_string(),
        };
        let mut parts = s.trim().split(':');
        match parts.next().map(str::to_ascii_lowercase).as_deref() {
            Some("ok") => Ok(SimStep::Ok),
            Some("network") => Ok(SimStep::Network),
            Some("timeout") => Ok(SimStep::Timeout),
            Some("hang") => Ok(SimStep::Hang),
            Some("midstream") => {
                let n = parts
                    .next()
                    .and_then(|n| n.parse().ok())
                    .ok_or_else(|| err("expected midstream:<deltas>"))?;
                Ok(SimStep::MidStream(n))
            }
            Some("status") => {
                let code: u16 = parts
                    .next()
                    .and_then(|c| c.parse().ok())
                    .filter(|c| (100..=599).contains(c))
                    .ok_or_else(|| err("expected status:<100-599>"))?;
                let retry_after = match parts.next() {
                    None => None,
                    Some(opt) => match opt.split_once('=') {
                        Some(("retry_after", v)) if !v.is_empty() => Some(v.to_string()),
                        _ => return Err(err("expected retry_after=<secs>")),
                    },
                };
                Ok(SimStep::Status { code, retry_after })
            }
            _ => Err(err("unknown outcome")),
        }
    }
}

impl fmt::Display for SimStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimStep::Ok => write!(f, "ok"),
            SimStep::Status {
                code,
                retry_after: None,
            } => write!(f, "status:{code}"),
            SimStep::Status {
                code,
                retry_after: Some(secs),
            } => write!(f, "status:{code}:retry_after={secs}"),
            SimStep::Network => write!(f, "network"),
            SimStep::Timeout => write!(f, "timeout"),
            SimStep::Hang => write!(f, "hang"),
            SimStep::MidStream(n) => write!(f, "midstream:{n}"),
        }
    }
}

/// Parse a whole script.
pub fn parse_script<S: AsRef<str>>(steps: &[S]) -> Result<Vec<SimStep>, ScriptError> {
    steps.iter().map(|s| s.as_ref().parse()).collect()
}

/// A provider whose behaviour is read from a script.
pub struct SimulatedAdapter {
    name: String,
    model: String,
    latency: Duration,
    script: Vec<SimStep>,
    available: bool,
    cursor: AtomicUsize,
    calls: Arc<AtomicUsize>,
}

impl SimulatedAdapter {
    pub fn new(name: impl Into<String>, script: Vec<SimStep>) -> Self {
        Self {
            name: name.into(),
            model: "sim-1".to_string(),
            latency: Duration::ZERO,
            script,
            available: true,
            cursor: AtomicUsize::new(0),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_config(config: &SimulatedProviderConfig) -> Result<Self, ScriptError> {
        Ok(Self {
            model: config.model.clone(),
            latency: Duration::from_millis(config.latency_ms),
            available: config.available,
            ..Self::new(&config.name, parse_script(&config.script)?)
        })
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Shared call counter, readable after the adapter is boxed.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    fn next_step(&self) -> SimStep {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.script.is_empty() {
            return SimStep::Ok;
        }
        let i = self.cursor.fetch_add(1, Ordering::SeqCst);
        self.script[i % self.script.len()].clone()
    }

    fn reply(&self, request: &CompletionRequest) -> (String, Usage) {
        let content = format!(
            "{} acknowledges {} message(s) from the simulated workload",
            self.name,
            request.messages.len()
        );
        let input_tokens = request
            .messages
            .iter()
            .map(|m| m.content.split_whitespace().count() as u32)
            .sum();
        let usage = Usage {
            input_tokens,
            output_tokens: content.split_whitespace().count() as u32,
        };
        (content, usage)
    }
}

/// Failure for a step, or `None` when the step produces output.
fn step_error(step: &SimStep) -> Option<ProviderError> {
    match step {
        SimStep::Ok | SimStep::MidStream(_) | SimStep::Hang => None,
        SimStep::Status { code, retry_after } => {
            let err = ProviderError::http(*code, status_message(*code));
            Some(match retry_after {
                Some(secs) => err.with_retry_after(secs.clone()),
                None => err,
            })
        }
        SimStep::Network => Some(ProviderError::Network("connection reset by peer".into())),
        SimStep::Timeout => Some(ProviderError::Timeout("upstream timed out".into())),
    }
}

fn status_message(code: u16) -> &'static str {
    match code {
        400 => "invalid request",
        401 => "invalid api key",
        403 => "forbidden",
        429 => "rate limit exceeded",
        500 => "internal server error",
        502 => "bad gateway",
        503 => "service unavailable",
        504 => "gateway timeout",
        _ => "simulated failure",
    }
}

/// Sleep for `latency`, or wait forever for `hang`; `false` if cancelled first.
async fn wait(latency: Duration, hang: bool, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(latency), if !hang => true,
    }
}

impl ProviderAdapter for SimulatedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionResponse, ProviderError> {
        let step = self.next_step();
        tracing::trace!(provider = %self.name, step = %step, "simulated call");
        if !wait(self.latency, step == SimStep::Hang, &cancel).await {
            return Err(ProviderError::Cancelled);
        }
        if let Some(err) = step_error(&step) {
            return Err(err);
        }
        let (content, usage) = self.reply(request);
        Ok(CompletionResponse {
            content,
            model: self.model.clone(),
            usage,
        })
    }

    fn complete_stream(&self, request: CompletionRequest, cancel: CancellationToken) -> ChunkStream {
        let step = self.next_step();
        tracing::trace!(provider = %self.name, step = %step, "simulated stream");
        let (content, usage) = self.reply(&request);
        let latency = self.latency;

        Box::pin(async_stream::stream! {
            if !wait(latency, step == SimStep::Hang, &cancel).await {
                yield Err(ProviderError::Cancelled);
                return;
            }
            if let Some(err) = step_error(&step) {
                yield Err(err);
                return;
            }
            let fail_after = match step {
                SimStep::MidStream(n) => Some(n),
                _ => None,
            };
            for (i, word) in content.split_inclusive(' ').enumerate() {
                if fail_after == Some(i) {
                    yield Err(ProviderError::Network("connection reset mid-stream".into()));
                    return;
                }
                if i > 0 && !wait(latency / 4, false, &cancel).await {
                    return;
                }
                yield Ok(StreamChunk::delta(word));
            }
            if fail_after.is_some() {
                yield Err(ProviderError::Network("connection reset mid-stream".into()));
                return;
            }
            yield Ok(StreamChunk::Final { content, usage });
        })
    }

    async fn health_check(&self) -> HealthReport {
        if self.available {
            HealthReport::healthy()
        } else {
            HealthReport::unhealthy("simulated provider has no credentials")
        }
    }
}
