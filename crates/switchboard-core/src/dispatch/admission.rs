//! Per-provider admission control.
//!
//! Each provider gets a token bucket with discrete refill ticks, a
//! concurrency ceiling, a minimum spacing between admissions and a bounded
//! priority queue. Requests that cannot be admitted immediately wait in the
//! queue; once the queue reaches its high-water mark new requests are
//! rejected outright.
//!
//! Limiter state lives behind a `std::sync::Mutex` that is never held across
//! an await. Waiters park on a `Notify` and re-check the state when woken.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use switchboard_types::config::{AdmissionConfig, AdmissionProfile};
use switchboard_types::error::AdmissionError;
use switchboard_types::llm::Usage;

/// Priority used when the caller does not pass one. Lower runs first.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Stand-in deadline for durations too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

/// Smallest retry hint attached to a queue-full rejection.
const MIN_RETRY_HINT: Duration = Duration::from_secs(1);

/// Per-request admission parameters.
#[derive(Debug, Clone, Copy)]
pub struct AdmitOptions {
    pub priority: u8,
    /// Longest time the request may sit in the queue.
    pub queue_timeout: Duration,
}

impl Default for AdmitOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            queue_timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of one provider's limiter.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionSnapshot {
    pub provider: String,
    pub tokens: u32,
    pub reservoir: u32,
    pub in_flight: u32,
    pub max_concurrent: u32,
    pub queued: usize,
    pub high_water: u32,
    /// Remaining pause, if the provider is cooling down.
    pub paused_for_ms: Option<u64>,
    pub admitted: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub recorded_requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

enum Readiness {
    Now,
    At(Instant),
    /// Waiting on a permit release.
    Blocked,
}

struct LimiterState {
    tokens: u32,
    last_refill: Instant,
    in_flight: u32,
    last_admit: Option<Instant>,
    /// Waiters ordered by (priority, arrival).
    queue: BTreeSet<(u8, u64)>,
    next_seq: u64,
    paused_until: Option<Instant>,
    pause_generation: u64,
    admitted: u64,
    rejected: u64,
    timed_out: u64,
    recorded_requests: u64,
    input_tokens: u64,
    output_tokens: u64,
}

impl LimiterState {
    fn new(profile: &AdmissionProfile, now: Instant) -> Self {
        Self {
            tokens: profile.reservoir,
            last_refill: now,
            in_flight: 0,
            last_admit: None,
            queue: BTreeSet::new(),
            next_seq: 0,
            paused_until: None,
            pause_generation: 0,
            admitted: 0,
            rejected: 0,
            timed_out: 0,
            recorded_requests: 0,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    /// Apply whole refill ticks since the last refill. An elapsed pause
    /// restores the reservoir to capacity.
    fn refill(&mut self, profile: &AdmissionProfile, now: Instant) {
        if let Some(until) = self.paused_until {
            if now < until {
                return;
            }
            self.paused_until = None;
            self.tokens = profile.reservoir;
            self.last_refill = now;
            return;
        }

        let interval = profile.refill_interval();
        if interval.is_zero() {
            self.tokens = profile.reservoir;
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill);
        let ticks = elapsed.as_nanos() / interval.as_nanos();
        if ticks == 0 {
            return;
        }
        let added = ticks.saturating_mul(profile.refill_amount as u128);
        self.tokens = (self.tokens as u128 + added).min(profile.reservoir as u128) as u32;
        let advance = interval.as_nanos().saturating_mul(ticks);
        self.last_refill += Duration::from_nanos(advance.min(u64::MAX as u128) as u64);
    }

    fn readiness(&self, profile: &AdmissionProfile, now: Instant) -> Readiness {
        if let Some(until) = self.paused_until {
            return Readiness::At(until);
        }
        if self.in_flight >= profile.max_concurrent {
            return Readiness::Blocked;
        }
        if self.tokens == 0 {
            return Readiness::At(self.last_refill + profile.refill_interval());
        }
        if let Some(last) = self.last_admit {
            let next = last + profile.min_spacing();
            if next > now {
                return Readiness::At(next);
            }
        }
        Readiness::Now
    }

    fn admit(&mut self, now: Instant) {
        self.tokens -= 1;
        self.in_flight += 1;
        self.last_admit = Some(now);
        self.admitted += 1;
    }

    /// Time until capacity plausibly returns: the pause end or next tick.
    fn retry_hint(&self, profile: &AdmissionProfile, now: Instant) -> Duration {
        let wait = if let Some(until) = self.paused_until {
            until.saturating_duration_since(now)
        } else if self.tokens == 0 {
            (self.last_refill + profile.refill_interval()).saturating_duration_since(now)
        } else {
            Duration::ZERO
        };
        wait.max(MIN_RETRY_HINT)
    }
}

struct ProviderLimiter {
    name: String,
    profile: AdmissionProfile,
    state: Mutex<LimiterState>,
    notify: Notify,
    restore: Mutex<Option<JoinHandle<()>>>,
}

impl ProviderLimiter {
    fn new(name: &str, profile: AdmissionProfile) -> Self {
        let state = LimiterState::new(&profile, Instant::now());
        Self {
            name: name.to_string(),
            profile,
            state: Mutex::new(state),
            notify: Notify::new(),
            restore: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn restore_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.restore.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// End a pause if it is still the current one.
    fn restore(&self, generation: u64) {
        let restored = {
            let mut st = self.lock();
            if st.pause_generation != generation || st.paused_until.is_none() {
                return;
            }
            st.refill(&self.profile, Instant::now());
            st.paused_until.is_none()
        };
        if restored {
            tracing::info!(provider = %self.name, "admission restored after pause");
            self.notify.notify_waiters();
        }
    }

    fn snapshot(&self) -> AdmissionSnapshot {
        let now = Instant::now();
        let mut st = self.lock();
        st.refill(&self.profile, now);
        AdmissionSnapshot {
            provider: self.name.clone(),
            tokens: st.tokens,
            reservoir: self.profile.reservoir,
            in_flight: st.in_flight,
            max_concurrent: self.profile.max_concurrent,
            queued: st.queue.len(),
            high_water: self.profile.high_water,
            paused_for_ms: st
                .paused_until
                .map(|until| until.saturating_duration_since(now).as_millis() as u64),
            admitted: st.admitted,
            rejected: st.rejected,
            timed_out: st.timed_out,
            recorded_requests: st.recorded_requests,
            input_tokens: st.input_tokens,
            output_tokens: st.output_tokens,
        }
    }
}

/// Removes a waiter from the queue if its acquire future is dropped.
struct QueueTicket<'a> {
    limiter: &'a ProviderLimiter,
    key: (u8, u64),
    armed: bool,
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.limiter.lock().queue.remove(&self.key);
            self.limiter.notify.notify_waiters();
        }
    }
}

/// A granted admission slot. Dropping it frees the concurrency slot.
pub struct AdmissionPermit {
    limiter: Arc<ProviderLimiter>,
}

impl AdmissionPermit {
    pub fn provider(&self) -> &str {
        &self.limiter.name
    }
}

impl fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("provider", &self.limiter.name)
            .finish()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        {
            let mut st = self.limiter.lock();
            st.in_flight = st.in_flight.saturating_sub(1);
        }
        self.limiter.notify.notify_waiters();
    }
}

/// Admission gate for every provider, keyed by provider name.
pub struct AdmissionController {
    config: AdmissionConfig,
    configured: Vec<String>,
    limiters: DashMap<String, Arc<ProviderLimiter>>,
}

impl AdmissionController {
    /// Create limiters for the given providers. Others are created on first use.
    pub fn new<I, S>(config: AdmissionConfig, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let controller = Self {
            config,
            configured: providers.into_iter().map(Into::into).collect(),
            limiters: DashMap::new(),
        };
        controller.populate();
        controller
    }

    fn populate(&self) {
        for name in &self.configured {
            self.limiter(name);
        }
    }

    fn limiter(&self, provider: &str) -> Arc<ProviderLimiter> {
        if let Some(existing) = self.limiters.get(provider) {
            return Arc::clone(existing.value());
        }
        self.limiters
            .entry(provider.to_string())
            .or_insert_with(|| {
                Arc::new(ProviderLimiter::new(
                    provider,
                    self.config.profile_for(provider),
                ))
            })
            .value()
            .clone()
    }

    /// Wait for an admission slot.
    ///
    /// Rejects immediately with `QueueFull` when the queue is at its
    /// high-water mark. Gives up with `QueueTimeout` after
    /// `opts.queue_timeout`, and with `Cancelled` when `cancel` fires.
    pub async fn acquire(
        &self,
        provider: &str,
        opts: AdmitOptions,
        cancel: &CancellationToken,
    ) -> Result<AdmissionPermit, AdmissionError> {
        let limiter = self.limiter(provider);
        let profile = &limiter.profile;
        let enqueued_at = Instant::now();

        let key = {
            let mut st = limiter.lock();
            st.refill(profile, enqueued_at);
            if st.queue.is_empty() && matches!(st.readiness(profile, enqueued_at), Readiness::Now)
            {
                st.admit(enqueued_at);
                drop(st);
                tracing::trace!(provider, "admitted immediately");
                return Ok(AdmissionPermit {
                    limiter: Arc::clone(&limiter),
                });
            }
            if st.queue.len() >= profile.high_water as usize {
                st.rejected += 1;
                let retry_after = st.retry_hint(profile, enqueued_at);
                let depth = st.queue.len();
                drop(st);
                tracing::warn!(
                    provider,
                    depth,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "admission queue full, rejecting request"
                );
                return Err(AdmissionError::QueueFull {
                    provider: provider.to_string(),
                    retry_after,
                });
            }
            let key = (opts.priority, st.next_seq);
            st.next_seq += 1;
            st.queue.insert(key);
            key
        };
        tracing::debug!(provider, priority = opts.priority, "request queued for admission");

        let mut ticket = QueueTicket {
            limiter: &limiter,
            key,
            armed: true,
        };
        let queue_deadline = enqueued_at
            .checked_add(opts.queue_timeout)
            .unwrap_or_else(|| enqueued_at + FAR_FUTURE);

        loop {
            let notified = limiter.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let wake_at = {
                let mut st = limiter.lock();
                st.refill(profile, now);
                if st.queue.first() == Some(&key) {
                    match st.readiness(profile, now) {
                        Readiness::Now => {
                            st.queue.remove(&key);
                            st.admit(now);
                            drop(st);
                            ticket.armed = false;
                            limiter.notify.notify_waiters();
                            tracing::debug!(
                                provider,
                                waited_ms = now.duration_since(enqueued_at).as_millis() as u64,
                                "admitted from queue"
                            );
                            return Ok(AdmissionPermit {
                                limiter: Arc::clone(&limiter),
                            });
                        }
                        Readiness::At(at) => Some(at),
                        Readiness::Blocked => None,
                    }
                } else {
                    None
                }
            };

            let wake = async {
                match wake_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(provider, "admission wait cancelled");
                    return Err(AdmissionError::Cancelled {
                        provider: provider.to_string(),
                    });
                }
                _ = tokio::time::sleep_until(queue_deadline) => {
                    limiter.lock().timed_out += 1;
                    let waited = enqueued_at.elapsed();
                    tracing::warn!(
                        provider,
                        waited_ms = waited.as_millis() as u64,
                        "dropped from admission queue after timeout"
                    );
                    return Err(AdmissionError::QueueTimeout {
                        provider: provider.to_string(),
                        waited,
                    });
                }
                _ = &mut notified => {}
                _ = wake => {}
            }
        }
    }

    /// Run `task` once admitted, holding the slot until it completes.
    pub async fn schedule<F, Fut, T>(
        &self,
        provider: &str,
        opts: AdmitOptions,
        cancel: &CancellationToken,
        task: F,
    ) -> Result<T, AdmissionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.acquire(provider, opts, cancel).await?;
        Ok(task().await)
    }

    /// Zero the provider's reservoir for `duration`.
    ///
    /// A later call replaces the current pause and cancels its restore.
    pub fn pause(&self, provider: &str, duration: Duration) {
        let limiter = self.limiter(provider);
        let now = Instant::now();
        let until = now.checked_add(duration).unwrap_or_else(|| now + FAR_FUTURE);
        let generation = {
            let mut st = limiter.lock();
            st.tokens = 0;
            st.paused_until = Some(until);
            st.pause_generation += 1;
            st.pause_generation
        };
        tracing::info!(
            provider,
            duration_ms = duration.as_millis().min(u64::MAX as u128) as u64,
            "admission paused"
        );

        let restorer = Arc::clone(&limiter);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(until).await;
            restorer.restore(generation);
        });
        if let Some(previous) = limiter.restore_task().replace(handle) {
            previous.abort();
        }
    }

    /// Accumulate usage counters. Has no effect on admission decisions.
    pub fn record_usage(&self, provider: &str, usage: &Usage) {
        let limiter = self.limiter(provider);
        let mut st = limiter.lock();
        st.recorded_requests += 1;
        st.input_tokens += usage.input_tokens as u64;
        st.output_tokens += usage.output_tokens as u64;
    }

    pub fn snapshot(&self, provider: &str) -> AdmissionSnapshot {
        self.limiter(provider).snapshot()
    }

    /// Snapshots for every known provider, sorted by name.
    pub fn snapshots(&self) -> Vec<AdmissionSnapshot> {
        let mut all: Vec<_> = self
            .limiters
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        all.sort_by(|a, b| a.provider.cmp(&b.provider));
        all
    }

    /// Discard all limiter state and pending restores.
    ///
    /// Permits issued before the reset stay valid but no longer affect the
    /// fresh limiters.
    pub fn reset(&self) {
        for entry in self.limiters.iter() {
            if let Some(handle) = entry.value().restore_task().take() {
                handle.abort();
            }
        }
        self.limiters.clear();
        self.populate();
    }
}
