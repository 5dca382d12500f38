//! Per-route rate limiting
//!
//! Token buckets keyed by user id where the caller is authenticated, by IP
//! otherwise. Refusals carry a retry-after hint and never close the
//! connection.

use dashmap::DashMap;
use std::net::IpAddr;
use std::time::Instant;

use crate::config::{RateLimitsConfig, RouteLimit};
use crate::errors::{Error, Result};

/// Classic token bucket: refills continuously, spends one token per request.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    rate_per_sec: f64,
    capacity: f64,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
            rate_per_sec,
            capacity,
        }
    }

    pub fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole seconds until one token is available again.
    fn retry_after_secs(&self) -> u64 {
        if self.rate_per_sec <= 0.0 {
            return 60;
        }
        ((1.0 - self.tokens) / self.rate_per_sec).ceil().max(1.0) as u64
    }
}

/// Who is being limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimiterKey {
    User(i64),
    Ip(IpAddr),
}

/// One route family's buckets across all callers.
pub struct RouteBuckets {
    limit: RouteLimit,
    buckets: DashMap<LimiterKey, TokenBucket>,
}

impl RouteBuckets {
    pub fn new(limit: RouteLimit) -> Self {
        Self {
            limit,
            buckets: DashMap::new(),
        }
    }

    /// Spend one token for `key`, or refuse with a retry hint.
    pub fn check(&self, key: LimiterKey) -> Result<()> {
        let mut bucket = self.buckets.entry(key).or_insert_with(|| {
            TokenBucket::new(
                self.limit.per_minute as f64 / 60.0,
                self.limit.burst.max(1) as f64,
            )
        });
        if bucket.try_consume() {
            Ok(())
        } else {
            Err(Error::ResourceExhausted {
                retry_after_secs: bucket.retry_after_secs(),
            })
        }
    }
}

/// All per-route limiters, built once from configuration.
pub struct RateLimiters {
    pub auth: RouteBuckets,
    pub admin: RouteBuckets,
    pub settings_read: RouteBuckets,
    pub settings_write: RouteBuckets,
    pub fairness: RouteBuckets,
    pub leaderboard: RouteBuckets,
    pub farming: RouteBuckets,
}

impl RateLimiters {
    pub fn new(config: &RateLimitsConfig) -> Self {
        Self {
            auth: RouteBuckets::new(config.auth),
            admin: RouteBuckets::new(config.admin),
            settings_read: RouteBuckets::new(config.settings_read),
            settings_write: RouteBuckets::new(config.settings_write),
            fairness: RouteBuckets::new(config.fairness),
            leaderboard: RouteBuckets::new(config.leaderboard),
            farming: RouteBuckets::new(config.farming),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buckets(per_minute: u32, burst: u32) -> RouteBuckets {
        RouteBuckets::new(RouteLimit { per_minute, burst })
    }

    #[test]
    fn burst_then_refusal() {
        let limiter = buckets(60, 3);
        let key = LimiterKey::User(1);

        for _ in 0..3 {
            assert!(limiter.check(key).is_ok());
        }
        match limiter.check(key) {
            Err(Error::ResourceExhausted { retry_after_secs }) => {
                assert!(retry_after_secs >= 1);
            }
            other => panic!("expected ResourceExhausted, got {:?}", other),
        }
    }

    #[test]
    fn keys_are_isolated() {
        let limiter = buckets(60, 1);
        assert!(limiter.check(LimiterKey::User(1)).is_ok());
        assert!(limiter.check(LimiterKey::User(1)).is_err());
        // A different caller still has its own bucket.
        assert!(limiter.check(LimiterKey::User(2)).is_ok());
        assert!(limiter
            .check(LimiterKey::Ip("10.0.0.1".parse().unwrap()))
            .is_ok());
    }

    #[test]
    fn bucket_refills_over_time() {
        // 600/min = 10/sec: a 200ms sleep refills at least one token.
        let mut bucket = TokenBucket::new(10.0, 1.0);
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert!(bucket.try_consume());
    }
}
