// src/algorithms/token_bucket.rs

use std::sync::Arc;
use std::time::Duration;

use crate::algorithms::{
    ceil_millis, RateLimitStatus, RateLimitStrategy, Resettable, ServiceStates,
};
use crate::clock::Clock;
use crate::config::RateLimitConfig;

/// Token Bucket rate limiting algorithm
///
/// The bucket holds up to `capacity` tokens (the configured burst, or the
/// limit when no burst is given) and refills continuously at
/// `capacity / window` tokens per millisecond. Each request consumes a token.
/// Refill is computed lazily whenever the bucket is touched.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    window_ms: f64,
    clock: Arc<dyn Clock>,
    buckets: ServiceStates<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    last_refill_at: u64,
}

impl TokenBucket {
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = config.burst.unwrap_or(config.limit) as f64;
        let window_ms = config.window_millis().max(1) as f64;

        Self {
            capacity,
            window_ms,
            clock,
            buckets: ServiceStates::new(),
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate_per_ms(&self) -> f64 {
        self.capacity / self.window_ms
    }

    /// Milliseconds needed to refill `tokens` tokens
    fn millis_for(&self, tokens: f64) -> Duration {
        ceil_millis(tokens * self.window_ms / self.capacity)
    }

    /// Current token count for a service after applying refill
    pub fn available_tokens(&self, service_id: &str) -> f64 {
        self.with_bucket(service_id, |bucket, _| bucket.tokens)
    }

    /// Locks the bucket, applies the lazy refill and hands it to `f`
    fn with_bucket<R>(&self, service_id: &str, f: impl FnOnce(&mut BucketState, &Self) -> R) -> R {
        let now = self.clock.now_millis();
        let capacity = self.capacity;

        self.buckets.with_state(
            service_id,
            || BucketState {
                tokens: capacity,
                last_refill_at: now,
            },
            |bucket| {
                self.refill(bucket, now);
                f(bucket, self)
            },
        )
    }

    fn refill(&self, bucket: &mut BucketState, now: u64) {
        // A clock that went backwards refills nothing
        let elapsed = now.saturating_sub(bucket.last_refill_at) as f64;
        bucket.tokens = (bucket.tokens + elapsed * self.capacity / self.window_ms).min(self.capacity);
        bucket.last_refill_at = bucket.last_refill_at.max(now);
    }

    fn wait_for(&self, bucket: &BucketState) -> Duration {
        if bucket.tokens >= 1.0 {
            Duration::ZERO
        } else {
            self.millis_for(1.0 - bucket.tokens)
        }
    }

    fn snapshot(&self, bucket: &BucketState) -> RateLimitStatus {
        let wait_time = self.wait_for(bucket);
        RateLimitStatus {
            can_make_request: bucket.tokens >= 1.0,
            remaining_requests: bucket.tokens.floor().max(0.0) as u64,
            reset_time: self.millis_for(self.capacity - bucket.tokens),
            wait_time,
            strategy_name: self.name(),
        }
    }
}

impl RateLimitStrategy for TokenBucket {
    fn name(&self) -> &'static str {
        "token-bucket"
    }

    fn can_make_request(&self, service_id: &str) -> bool {
        self.with_bucket(service_id, |bucket, _| bucket.tokens >= 1.0)
    }

    fn record_request(&self, service_id: &str) {
        self.with_bucket(service_id, |bucket, _| {
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
            }
        })
    }

    fn wait_time(&self, service_id: &str) -> Duration {
        self.with_bucket(service_id, |bucket, this| this.wait_for(bucket))
    }

    fn status(&self, service_id: &str) -> RateLimitStatus {
        self.with_bucket(service_id, |bucket, this| this.snapshot(bucket))
    }

    fn check_and_record(&self, service_id: &str) -> RateLimitStatus {
        self.with_bucket(service_id, |bucket, this| {
            let allowed = bucket.tokens >= 1.0;
            if allowed {
                bucket.tokens -= 1.0;
            }
            RateLimitStatus {
                can_make_request: allowed,
                ..this.snapshot(bucket)
            }
        })
    }

    fn as_resettable(&self) -> Option<&dyn Resettable> {
        Some(self)
    }
}

impl Resettable for TokenBucket {
    fn reset(&self, service_id: &str) {
        self.buckets.remove(service_id);
    }
}
