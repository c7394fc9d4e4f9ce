//! Request budget: one deadline and one cancellation signal per dispatch call.
//!
//! The budget owns a child of the caller's [`CancellationToken`]. It fires
//! when the caller cancels or when the deadline passes, and records which of
//! the two happened so a timeout can be told apart from a user cancel.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use switchboard_types::dispatch::BudgetTimeout;

/// Deadline applied when the caller asks for the default timeout.
pub const DEFAULT_BUDGET_TIMEOUT: Duration = Duration::from_secs(60);

/// Why a budget's signal fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's token was cancelled.
    Cancelled,
    /// The budget's own deadline elapsed.
    DeadlineExceeded,
}

/// End-to-end deadline for one dispatch call, spanning every provider and
/// retry. Dropping the budget stops its timer and detaches it from the
/// caller's token.
#[derive(Debug)]
pub struct RequestBudget {
    token: CancellationToken,
    parent: Option<CancellationToken>,
    started: Instant,
    deadline: Option<Instant>,
    reason: Arc<OnceLock<CancelReason>>,
    watcher: Option<JoinHandle<()>>,
}

impl RequestBudget {
    /// Start a budget now. Must be called inside a tokio runtime unless the
    /// budget is unbounded.
    pub fn new(timeout: BudgetTimeout, parent: Option<&CancellationToken>) -> Self {
        let started = Instant::now();
        let deadline = match timeout {
            BudgetTimeout::Default => Some(started + DEFAULT_BUDGET_TIMEOUT),
            BudgetTimeout::After(d) => {
                Some(started.checked_add(d).unwrap_or_else(|| far_future(started)))
            }
            BudgetTimeout::Unbounded => None,
        };
        let token = match parent {
            Some(p) => p.child_token(),
            None => CancellationToken::new(),
        };
        let reason = Arc::new(OnceLock::new());

        let watcher = deadline.map(|at| {
            let token = token.clone();
            let reason = Arc::clone(&reason);
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep_until(at) => {
                        let _ = reason.set(CancelReason::DeadlineExceeded);
                        token.cancel();
                    }
                }
            })
        });

        Self {
            token,
            parent: parent.cloned(),
            started,
            deadline,
            reason,
            watcher,
        }
    }

    /// The composed signal. Fires on caller cancellation or deadline.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// A token for one attempt. Cancelled with the budget, or on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_unbounded(&self) -> bool {
        self.deadline.is_none()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the deadline; `Duration::MAX` when unbounded.
    pub fn remaining(&self) -> Duration {
        match self.deadline {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    /// Once true, stays true.
    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled() || self.remaining().is_zero()
    }

    /// Why the budget fired, or `None` while it is still live.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        if let Some(reason) = self.reason.get() {
            return Some(*reason);
        }
        if self.parent.as_ref().is_some_and(|p| p.is_cancelled()) {
            return Some(CancelReason::Cancelled);
        }
        if self.deadline.is_some() && self.remaining().is_zero() {
            return Some(CancelReason::DeadlineExceeded);
        }
        self.token
            .is_cancelled()
            .then_some(CancelReason::Cancelled)
    }

    /// Sub-budget for the next provider when `providers_left` remain.
    pub fn attempt_timeout(
        &self,
        providers_left: usize,
        floor: Duration,
        override_timeout: Option<Duration>,
    ) -> Duration {
        split_budget(self.remaining(), providers_left, floor, override_timeout)
    }
}

impl Drop for RequestBudget {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.token.cancel();
    }
}

/// `max(floor, remaining / providers_left)`, never more than `remaining`.
///
/// An explicit override replaces the even share but is still capped.
pub fn split_budget(
    remaining: Duration,
    providers_left: usize,
    floor: Duration,
    override_timeout: Option<Duration>,
) -> Duration {
    let share = override_timeout.unwrap_or_else(|| remaining / providers_left.max(1) as u32);
    share.max(floor).min(remaining)
}

fn far_future(from: Instant) -> Instant {
    // ~30 years; `Instant` cannot represent arbitrary far points.
    from + Duration::from_secs(86_400 * 365 * 30)
}
