//! Adaptive rate limiter: grows the rate after a run of successes,
//! shrinks it on a rate-limit hit, and charges a token debit proportional
//! to the advised `retry_after` to delay recovery.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const SUCCESS_STREAK_FOR_GROWTH: u32 = 10;
const GROWTH_FACTOR: f64 = 1.05;
const SHRINK_FACTOR: f64 = 0.9;

struct Bucket {
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

pub struct AdaptiveRateLimiter {
    bucket: Mutex<Bucket>,
    min_rate: f64,
    max_rate: f64,
    consecutive_successes: AtomicU32,
}

impl AdaptiveRateLimiter {
    pub fn new(initial_rate_per_sec: f64, min_rate: f64, max_rate: f64) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: initial_rate_per_sec,
                rate_per_sec: initial_rate_per_sec,
                last_refill: Instant::now(),
            }),
            min_rate,
            max_rate,
            consecutive_successes: AtomicU32::new(0),
        }
    }

    fn refill(bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * bucket.rate_per_sec).min(bucket.rate_per_sec);
        bucket.last_refill = now;
    }

    pub fn try_acquire(&self, count: u32) -> bool {
        let mut bucket = self.bucket.lock().expect("adaptive limiter mutex poisoned");
        Self::refill(&mut bucket);
        if bucket.tokens >= count as f64 {
            bucket.tokens -= count as f64;
            true
        } else {
            false
        }
    }

    /// Call after a successful request; every 10th consecutive success
    /// raises the rate by 5%, capped at `max_rate`.
    pub fn record_success(&self) {
        let streak = self.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;
        if streak % SUCCESS_STREAK_FOR_GROWTH == 0 {
            let mut bucket = self.bucket.lock().expect("adaptive limiter mutex poisoned");
            bucket.rate_per_sec = (bucket.rate_per_sec * GROWTH_FACTOR).min(self.max_rate);
        }
    }

    /// Call on a rate-limit hit: shrinks the rate by 10% (floored) and
    /// charges a token debit so the bucket takes `retry_after` longer to
    /// recover.
    pub fn record_rate_limit_hit(&self, retry_after: Duration) {
        self.consecutive_successes.store(0, Ordering::SeqCst);
        let mut bucket = self.bucket.lock().expect("adaptive limiter mutex poisoned");
        bucket.rate_per_sec = (bucket.rate_per_sec * SHRINK_FACTOR).max(self.min_rate);
        let debit = retry_after.as_secs_f64() * bucket.rate_per_sec;
        bucket.tokens -= debit;
    }

    pub fn current_rate(&self) -> f64 {
        self.bucket.lock().expect("adaptive limiter mutex poisoned").rate_per_sec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_after_ten_successes() {
        let limiter = AdaptiveRateLimiter::new(100.0, 10.0, 1000.0);
        for _ in 0..10 {
            limiter.record_success();
        }
        assert!((limiter.current_rate() - 105.0).abs() < 1e-6);
    }

    #[test]
    fn shrinks_on_rate_limit_hit_and_floors() {
        let limiter = AdaptiveRateLimiter::new(11.0, 10.0, 1000.0);
        limiter.record_rate_limit_hit(Duration::from_secs(1));
        assert!(limiter.current_rate() >= 10.0);
    }
}
