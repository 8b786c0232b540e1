//! Per-route circuit breaker.
//!
//! Tracks a rolling window of backend outcomes and fails fast once the
//! failure ratio crosses the configured threshold:
//!
//! ```text
//! Closed    → Open:      rolling count >= volume_threshold and
//!                        failure percentage >= error_percent
//! Open      → Half-Open: sleep_window elapsed since the trip
//! Half-Open → Closed:    probe success (counters reset)
//! Half-Open → Open:      probe failure or timeout (trip refreshed)
//! ```
//!
//! The tracking window is split into ten buckets; outcomes land in the
//! bucket covering their instant and age out bucket by bucket, so a failure
//! burst straddling a bucket boundary still counts toward the trip decision.
//!
//! A forced-open override sits outside the state machine and rejects
//! unconditionally until unset. Admission hands out an RAII
//! [`BreakerPermit`]; the in-flight counter is decremented exactly once when
//! the permit drops, whatever the exit path. A permit dropped without a
//! recorded outcome counts as a cancelled call and stays out of the rolling
//! statistics.
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use crate::{config::models::CircuitBreakerConfig, error::GatewayError};

/// Buckets per tracking window.
const BUCKETS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Why an admission attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerRejection {
    /// Manual override is set.
    ForcedOpen,
    /// Breaker is open and the sleep window has not elapsed.
    Open,
    /// In-flight requests reached the concurrency cap. Not a backend failure.
    Capacity,
}

/// Parsed policy numbers. Durations come from the humantime strings in the
/// configuration.
#[derive(Debug, Clone)]
struct Policy {
    max_concurrent: u32,
    error_percent: u8,
    timeout: Duration,
    volume_threshold: u64,
    sleep_window: Duration,
    message: String,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    successes: u64,
    failures: u64,
    timeouts: u64,
}

impl Counters {
    fn total(&self) -> u64 {
        self.successes + self.failures + self.timeouts
    }

    fn failed(&self) -> u64 {
        self.failures + self.timeouts
    }
}

/// Bucketed rolling window. Each bucket covers `bucket_len` of wall time;
/// only the most recent [`BUCKETS`] buckets contribute to the totals.
#[derive(Debug)]
struct Window {
    bucket_len: Duration,
    buckets: VecDeque<(u64, Counters)>,
}

impl Window {
    fn new(tracking_window: Duration) -> Self {
        let bucket_len = (tracking_window / BUCKETS as u32).max(Duration::from_nanos(1));
        Self {
            bucket_len,
            buckets: VecDeque::new(),
        }
    }

    fn bucket_index(&self, started_at: Instant, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(started_at);
        (elapsed.as_nanos() / self.bucket_len.as_nanos()) as u64
    }

    fn record(&mut self, outcome: Outcome, index: u64) {
        self.evict(index);
        if !self.buckets.iter().any(|(i, _)| *i == index) {
            self.buckets.push_back((index, Counters::default()));
        }
        if let Some((_, counters)) = self.buckets.iter_mut().rev().find(|(i, _)| *i == index) {
            match outcome {
                Outcome::Success => counters.successes += 1,
                Outcome::Failure => counters.failures += 1,
                Outcome::Timeout => counters.timeouts += 1,
            }
        }
    }

    fn evict(&mut self, index: u64) {
        while let Some((front, _)) = self.buckets.front() {
            if front + BUCKETS <= index {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn totals(&self) -> Counters {
        self.buckets
            .iter()
            .fold(Counters::default(), |mut acc, (_, c)| {
                acc.successes += c.successes;
                acc.failures += c.failures;
                acc.timeouts += c.timeouts;
                acc
            })
    }

    fn clear(&mut self) {
        self.buckets.clear();
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    tripped_at: Option<Instant>,
    started_at: Instant,
    window: Window,
}

struct Shared {
    policy: Policy,
    force_open: AtomicBool,
    in_flight: AtomicU32,
    inner: Mutex<Inner>,
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failure,
    Timeout,
}

/// Cheap to clone; all state lives behind one `Arc` per route.
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Result<Self, String> {
        let parse = |name: &str, value: &str| {
            humantime::parse_duration(value)
                .map_err(|e| format!("Invalid {name} '{value}': {e}"))
        };
        let policy = Policy {
            max_concurrent: config.max_concurrent,
            error_percent: config.error_percent,
            timeout: parse("timeout", &config.timeout)?,
            volume_threshold: config.volume_threshold,
            sleep_window: parse("sleep_window", &config.sleep_window)?,
            message: config.message.clone(),
        };
        if policy.max_concurrent == 0 {
            return Err("max_concurrent must be greater than 0".to_string());
        }
        let tracking_window = parse("tracking_window", &config.tracking_window)?;

        Ok(Self {
            shared: Arc::new(Shared {
                policy,
                force_open: AtomicBool::new(config.force_open),
                in_flight: AtomicU32::new(0),
                inner: Mutex::new(Inner {
                    state: BreakerState::Closed,
                    tripped_at: None,
                    started_at: Instant::now(),
                    window: Window::new(tracking_window),
                }),
            }),
        })
    }

    /// Admission decision at `Instant::now()`.
    pub fn try_acquire(&self) -> Result<BreakerPermit, BreakerRejection> {
        self.try_acquire_at(Instant::now())
    }

    /// Admission decision evaluated at `now`. Open → Half-Open happens lazily
    /// here once the sleep window has elapsed.
    pub fn try_acquire_at(&self, now: Instant) -> Result<BreakerPermit, BreakerRejection> {
        if self.shared.force_open.load(Ordering::Relaxed) {
            return Err(BreakerRejection::ForcedOpen);
        }

        let mut inner = self.lock_inner();

        if inner.state == BreakerState::Open {
            let slept = inner
                .tripped_at
                .is_some_and(|t| now.duration_since(t) >= self.shared.policy.sleep_window);
            if slept {
                tracing::debug!("circuit breaker sleep window elapsed, entering half-open");
                inner.state = BreakerState::HalfOpen;
            } else {
                return Err(BreakerRejection::Open);
            }
        }

        // Closed or Half-Open: enforce the concurrency cap. Admission only
        // happens under the inner lock, so load-then-add cannot overshoot.
        if self.shared.in_flight.load(Ordering::Acquire) >= self.shared.policy.max_concurrent {
            return Err(BreakerRejection::Capacity);
        }
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);

        Ok(BreakerPermit {
            shared: Arc::clone(&self.shared),
            recorded: false,
        })
    }

    /// The client-visible rejection for any refused admission.
    pub fn rejection(&self, _why: BreakerRejection) -> GatewayError {
        GatewayError::CircuitOpen {
            message: self.shared.policy.message.clone(),
        }
    }

    /// Bound for the backend call while this breaker is enabled.
    pub fn timeout(&self) -> Duration {
        self.shared.policy.timeout
    }

    pub fn state(&self) -> BreakerState {
        self.lock_inner().state
    }

    pub fn is_forced_open(&self) -> bool {
        self.shared.force_open.load(Ordering::Relaxed)
    }

    /// Manual override, orthogonal to the measured state. Stays in effect
    /// until explicitly unset.
    pub fn set_force_open(&self, forced: bool) {
        self.shared.force_open.store(forced, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> u32 {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Shared {
    fn record(&self, outcome: Outcome, now: Instant) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if inner.state == BreakerState::HalfOpen {
            match outcome {
                Outcome::Success => {
                    tracing::info!("circuit breaker probe succeeded, closing");
                    inner.state = BreakerState::Closed;
                    inner.tripped_at = None;
                    inner.window.clear();
                }
                Outcome::Failure | Outcome::Timeout => {
                    tracing::warn!("circuit breaker probe failed, re-opening");
                    inner.state = BreakerState::Open;
                    inner.tripped_at = Some(now);
                    inner.window.clear();
                }
            }
            return;
        }

        let index = inner.window.bucket_index(inner.started_at, now);
        inner.window.record(outcome, index);

        if inner.state == BreakerState::Closed {
            let totals = inner.window.totals();
            let total = totals.total();
            if total >= self.policy.volume_threshold {
                let failed_percent = totals.failed() * 100 / total;
                if failed_percent >= u64::from(self.policy.error_percent) {
                    tracing::warn!(
                        total,
                        failed_percent,
                        "circuit breaker tripped, failing fast"
                    );
                    inner.state = BreakerState::Open;
                    inner.tripped_at = Some(now);
                }
            }
        }
    }
}

/// Scoped admission: holds a slot of the concurrency cap until dropped.
///
/// Exactly one of the `record_*` methods should be called once the backend
/// call completes; dropping without recording marks the call as cancelled
/// (client went away) and leaves the rolling statistics untouched. The `_at`
/// variants pair with [`CircuitBreaker::try_acquire_at`] for callers that
/// own the clock.
pub struct BreakerPermit {
    shared: Arc<Shared>,
    recorded: bool,
}

impl BreakerPermit {
    pub fn record_success(mut self) {
        self.finish(Outcome::Success, Instant::now());
    }

    pub fn record_failure(mut self) {
        self.finish(Outcome::Failure, Instant::now());
    }

    pub fn record_timeout(mut self) {
        self.finish(Outcome::Timeout, Instant::now());
    }

    pub fn record_success_at(mut self, now: Instant) {
        self.finish(Outcome::Success, now);
    }

    pub fn record_failure_at(mut self, now: Instant) {
        self.finish(Outcome::Failure, now);
    }

    pub fn record_timeout_at(mut self, now: Instant) {
        self.finish(Outcome::Timeout, now);
    }

    fn finish(&mut self, outcome: Outcome, now: Instant) {
        self.recorded = true;
        self.shared.record(outcome, now);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
        if !self.recorded {
            tracing::debug!("breaker permit dropped without outcome, call excluded from stats");
        }
    }
}
