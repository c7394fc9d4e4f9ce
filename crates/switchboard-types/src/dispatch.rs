//! Per-dispatch records and results.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ChainErrorCode, ErrorCategory};
use crate::llm::CompletionResponse;

/// Overall deadline policy for one dispatch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BudgetTimeout {
    /// Use the configured default timeout.
    #[default]
    Default,
    /// Use an explicit timeout.
    After(Duration),
    /// No deadline; only caller cancellation ends the dispatch.
    Unbounded,
}

/// One provider tried during a single dispatch call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchAttempt {
    pub provider: String,
    /// `None` for the attempt that produced the final result.
    pub error_message: Option<String>,
    pub category: Option<ErrorCategory>,
    pub fallback_eligible: bool,
    pub abort_like: bool,
    pub circuit_open: bool,
    /// Set when the admission controller rejected the request.
    pub admission: Option<ChainErrorCode>,
    /// Calls made to this provider, including same-provider retries.
    pub tries: u32,
}

impl DispatchAttempt {
    pub fn succeeded(provider: impl Into<String>, tries: u32) -> Self {
        Self {
            provider: provider.into(),
            error_message: None,
            category: None,
            fallback_eligible: false,
            abort_like: false,
            circuit_open: false,
            admission: None,
            tries,
        }
    }

    pub fn failed(
        provider: impl Into<String>,
        message: impl Into<String>,
        category: Option<ErrorCategory>,
        fallback_eligible: bool,
    ) -> Self {
        Self {
            provider: provider.into(),
            error_message: Some(message.into()),
            category,
            fallback_eligible,
            abort_like: false,
            circuit_open: false,
            admission: None,
            tries: 1,
        }
    }

    /// Synthetic record for a provider skipped because its circuit is open.
    pub fn circuit_open(provider: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = match retry_after {
            Some(d) => format!("circuit open, retry in {}ms", d.as_millis()),
            None => "circuit open".to_string(),
        };
        Self {
            provider: provider.into(),
            error_message: Some(message),
            category: None,
            fallback_eligible: true,
            abort_like: false,
            circuit_open: true,
            admission: None,
            tries: 0,
        }
    }

    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error_message.is_none()
    }
}

impl fmt::Display for DispatchAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_message {
            None => write!(f, "{}: ok after {} call(s)", self.provider, self.tries),
            Some(msg) => {
                write!(f, "{}: {msg}", self.provider)?;
                if let Some(category) = self.category {
                    write!(f, " [{category}]")?;
                }
                if let Some(code) = self.admission {
                    write!(f, " [{code}]")?;
                }
                if self.abort_like {
                    write!(f, " (aborted)")?;
                } else if self.fallback_eligible {
                    write!(f, " (fell back)")?;
                }
                Ok(())
            }
        }
    }
}

/// Successful outcome of a buffered dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    pub response: CompletionResponse,
    /// Provider that produced `response`.
    pub provider: String,
    pub model: String,
    /// True when the winning provider was not the first one tried.
    pub fallback_used: bool,
    /// Providers that failed before the winner, in order.
    pub attempted_providers: Vec<String>,
    /// One record per provider tried, the winner included.
    pub attempts: Vec<DispatchAttempt>,
    pub elapsed: Duration,
}
