//! Route‑scoped rate limiting built atop `governor`.
//!
//! Each route (or endpoint) with limiting enabled owns exactly one
//! [`RouteRateLimiter`]; the state is never shared across routes, so
//! contention on a hot route cannot stall the others. Bucket style
//! algorithms (TokenBucket, SlidingWindow) map onto `governor`'s GCRA
//! quotas; FixedWindow keeps an explicit wall-clock window counter so that
//! a request arriving exactly at a window boundary belongs to the new
//! window.
use std::{
    num::NonZeroU32,
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use http::StatusCode;

use crate::{
    config::models::{RateLimitAlgorithm, RateLimitConfig},
    error::GatewayError,
};

pub type DirectRateLimiterImpl = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Wall-clock fixed window counter state.
#[derive(Debug)]
struct FixedWindowState {
    window: u64,
    admitted: u64,
}

enum LimiterKind {
    /// TokenBucket and SlidingWindow, both enforced through governor's GCRA.
    Bucket(DirectRateLimiterImpl),
    FixedWindow {
        period: Duration,
        capacity: u64,
        state: Mutex<FixedWindowState>,
    },
}

/// Admission gate for a single route: `allow` atomically checks and updates
/// the counter state, the rejection metadata mirrors the configured rule.
pub struct RouteRateLimiter {
    kind: LimiterKind,
    status_code: StatusCode,
    message: String,
}

impl RouteRateLimiter {
    /// Build a limiter from a rate limit rule. The caller is expected to have
    /// skipped construction entirely for rules with `enabled = false`.
    pub fn new(config: &RateLimitConfig) -> Result<Self, String> {
        let period = humantime::parse_duration(&config.period)
            .map_err(|e| format!("Invalid period string '{}': {e}", config.period))?;

        let status_code = StatusCode::from_u16(config.status_code)
            .map_err(|_| format!("Invalid status code: {}", config.status_code))?;

        let kind = match config.algorithm {
            RateLimitAlgorithm::TokenBucket | RateLimitAlgorithm::SlidingWindow => {
                let quota_requests = NonZeroU32::new(config.requests.min(u32::MAX as u64) as u32)
                    .ok_or_else(|| "Rate limit 'requests' must be greater than 0".to_string())?;
                let quota = Quota::with_period(period)
                    .ok_or_else(|| format!("Invalid period duration: {period:?}"))?
                    .allow_burst(quota_requests);
                LimiterKind::Bucket(RateLimiter::direct(quota))
            }
            RateLimitAlgorithm::FixedWindow => {
                if config.requests == 0 {
                    return Err("Rate limit 'requests' must be greater than 0".to_string());
                }
                LimiterKind::FixedWindow {
                    period,
                    capacity: config.requests,
                    state: Mutex::new(FixedWindowState {
                        window: 0,
                        admitted: 0,
                    }),
                }
            }
        };

        tracing::debug!(
            algorithm = ?config.algorithm,
            requests = config.requests,
            period = %config.period,
            status_code = config.status_code,
            "Creating rate limiter"
        );

        Ok(Self {
            kind,
            status_code,
            message: config.message.clone(),
        })
    }

    /// Check-and-update in one step. Returns whether the request may proceed.
    pub fn allow(&self) -> bool {
        match &self.kind {
            LimiterKind::Bucket(limiter) => limiter.check().is_ok(),
            LimiterKind::FixedWindow {
                period,
                capacity,
                state,
            } => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                let window = window_index(now, *period);
                let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if state.window != window {
                    state.window = window;
                    state.admitted = 0;
                }
                if state.admitted < *capacity {
                    state.admitted += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// The typed rejection carrying the configured status and verbatim body.
    pub fn rejection(&self) -> GatewayError {
        GatewayError::RateLimited {
            status: self.status_code,
            message: self.message.clone(),
        }
    }
}

/// Window boundaries are wall-clock based: an instant exactly at a boundary
/// falls into the new window (integer division).
fn window_index(since_epoch: Duration, period: Duration) -> u64 {
    let period_nanos = period.as_nanos().max(1);
    (since_epoch.as_nanos() / period_nanos) as u64
}
