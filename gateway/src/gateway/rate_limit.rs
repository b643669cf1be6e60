//! Per-session request rate limiting.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};

use crate::config::RateLimitConfig;

/// GCRA limiter keyed by session token.
pub struct SessionRateLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
    clock: DefaultClock,
}

impl SessionRateLimiter {
    pub fn new(quota: Quota) -> Self {
        Self {
            limiter: RateLimiter::keyed(quota),
            clock: DefaultClock::default(),
        }
    }

    /// `None` when the config leaves rate limiting off.
    pub fn from_config(config: &RateLimitConfig) -> Option<Self> {
        let per_minute = NonZeroU32::new(config.requests_per_minute?)?;
        let burst = config
            .burst
            .and_then(NonZeroU32::new)
            .unwrap_or(per_minute);
        Some(Self::new(Quota::per_minute(per_minute).allow_burst(burst)))
    }

    /// Consume one request for `session`, or return how long to wait.
    pub fn check(&self, session: &str) -> Result<(), Duration> {
        self.limiter
            .check_key(&session.to_string())
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }

    /// Forget sessions whose buckets have fully refilled.
    pub fn shrink(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }
}
