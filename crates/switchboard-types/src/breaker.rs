//! Persistable circuit-breaker state.
//!
//! `CircuitState` is the unit a breaker store reads and writes, keyed by
//! provider name. Timestamps are wall-clock so several processes sharing an
//! external store agree on when a circuit opened.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position in the closed → open → half-open cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

impl FromStr for BreakerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "closed" => Ok(BreakerState::Closed),
            "open" => Ok(BreakerState::Open),
            "half_open" => Ok(BreakerState::HalfOpen),
            other => Err(format!("invalid breaker state: '{other}'")),
        }
    }
}

/// Breaker bookkeeping for one provider.
///
/// Invariants: `state == Open` implies `opened_at.is_some()`, and
/// `consecutive_failures == 0` whenever the circuit closes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CircuitState {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    /// When the circuit last opened, or when the current half-open window began.
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_probes_in_flight: u32,
    #[serde(default)]
    pub total_failures: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl CircuitState {
    pub fn closed() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.state == BreakerState::Open
    }
}
