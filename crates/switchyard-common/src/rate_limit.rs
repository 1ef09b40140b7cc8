//! Rate Limiting for routing decisions
//!
//! Token buckets keyed by [`RateLimitKey`]: one global bucket, one per route
//! and one per instance. Bucket parameters come from the [`RateLimit`] passed
//! on each check, so a route table update takes effect on the next request
//! without rebuilding the limiter.
//!
//! Checks are synchronous and lock only the bucket being touched, which
//! keeps them usable on the routing hot path.
//!
//! # Example
//!
//! ```
//! use switchyard_common::rate_limit::{RateLimiter, RateLimitKey};
//! use switchyard_common::{RateLimit, RateLimitScope};
//! use tokio::time::Instant;
//!
//! let limiter = RateLimiter::new();
//! let limit = RateLimit::new(RateLimitScope::Global, 10.0, 2);
//! let now = Instant::now();
//! assert!(limiter.check(RateLimitKey::Global, &limit, now).is_allowed());
//! assert!(limiter.check(RateLimitKey::Global, &limit, now).is_allowed());
//! assert!(!limiter.check(RateLimitKey::Global, &limit, now).is_allowed());
//! ```

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::protocol::error::{Result, SwitchyardError};
use crate::protocol::routing::RateLimit;
use crate::protocol::types::InstanceId;

/// Which bucket a check draws from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    Global,
    Route(String),
    Instance(InstanceId),
}

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed,
    Limited { retry_after: Duration },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed)
    }

    /// Converts a limited result into [`SwitchyardError::RateLimited`].
    pub fn into_result(self) -> Result<()> {
        match self {
            RateLimitResult::Allowed => Ok(()),
            RateLimitResult::Limited { retry_after } => Err(SwitchyardError::RateLimited {
                retry_after_ms: retry_after.as_millis().max(1) as u64,
            }),
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn full(limit: &RateLimit, now: Instant) -> Self {
        Self {
            tokens: limit.burst as f64,
            last_update: now,
        }
    }

    fn refill(&mut self, limit: &RateLimit, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * limit.requests_per_second).min(limit.burst as f64);
        self.last_update = now;
    }

    fn try_consume(&mut self, limit: &RateLimit, now: Instant) -> bool {
        self.refill(limit, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_next_token(&self, limit: &RateLimit) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / limit.requests_per_second)
        }
    }
}

/// Keyed token-bucket limiter.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<RateLimitKey, TokenBucket>,
    entry_ttl: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_entry_ttl(Duration::from_secs(300))
    }

    /// Buckets idle for longer than `entry_ttl` are dropped by [`Self::cleanup_stale`].
    pub fn with_entry_ttl(entry_ttl: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            entry_ttl,
        }
    }

    /// Takes one token from the bucket for `key`, creating it full on first use.
    pub fn check(&self, key: RateLimitKey, limit: &RateLimit, now: Instant) -> RateLimitResult {
        let mut bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::full(limit, now));

        if bucket.try_consume(limit, now) {
            RateLimitResult::Allowed
        } else {
            RateLimitResult::Limited {
                retry_after: bucket.time_until_next_token(limit),
            }
        }
    }

    /// Checks without consuming; used to skip instances that are already over their limit.
    pub fn would_allow(&self, key: &RateLimitKey, limit: &RateLimit, now: Instant) -> bool {
        match self.buckets.get_mut(key) {
            Some(mut bucket) => {
                bucket.refill(limit, now);
                bucket.tokens >= 1.0
            }
            None => true,
        }
    }

    /// Drops buckets that have not been touched for the entry TTL.
    pub fn cleanup_stale(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        let ttl = self.entry_ttl;
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_update) < ttl);
        before - self.buckets.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}
