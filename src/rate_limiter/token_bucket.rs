//! Sharded token-bucket / sliding-window / fixed-window limiter
//! using the power-of-two-choices pattern: a key hashes to
//! a primary and a secondary shard, primary is tried first.
//!
//! Sharding mirrors the contention-reduction rationale in the teacher's
//! per-service `Mutex`-guarded `CircuitBreaker` state, generalized to N
//! shards instead of one lock per service.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

#[derive(Debug)]
enum ShardState {
    TokenBucket { tokens: f64, last_refill: Instant },
    SlidingWindow { hits: VecDeque<Instant> },
    FixedWindow { count: u32, window_start: Instant },
}

struct Shard {
    state: Mutex<ShardState>,
    capacity: f64,
    refill_per_sec: f64,
}

pub struct AcquireOutcome {
    pub allowed: bool,
    pub tokens_remaining: f64,
    pub shard_id: usize,
    pub retry_after: Option<Duration>,
}

/// Computes the optimal shard count: `floor(rate/10)` rounded down to a
/// power of two, minimum 1, capped so each shard keeps >=10 tokens
/// A single global bucket serializes every caller on one mutex; sharding
/// spreads that contention across independent buckets.
pub fn optimal_shard_count(rate: u32) -> usize {
    let raw = (rate / 10).max(1);
    let mut shards = raw.next_power_of_two();
    if shards > raw {
        shards /= 2;
    }
    let shards = shards.max(1) as usize;
    // Ensure >=10 tokens per shard.
    let max_shards_for_floor = (rate as usize / 10).max(1);
    shards.min(max_shards_for_floor)
}

fn hash_key(key: &str, salt: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    salt.hash(&mut hasher);
    key.hash(&mut hasher);
    hasher.finish()
}

pub struct ShardedRateLimiter {
    shards: Vec<Shard>,
    algorithm: Algorithm,
    period: Duration,
    rate: u32,
}

impl ShardedRateLimiter {
    pub fn new(rate: u32, period: Duration, burst: u32, algorithm: Algorithm) -> Self {
        let shard_count = optimal_shard_count(rate).max(1);
        let capacity_per_shard = (rate as f64 / shard_count as f64).ceil().max(burst as f64 / shard_count as f64).max(1.0);
        let refill_per_sec = rate as f64 / period.as_secs_f64().max(1.0) / shard_count as f64;

        let shards = (0..shard_count)
            .map(|_| {
                let initial = match algorithm {
                    Algorithm::TokenBucket => ShardState::TokenBucket {
                        tokens: capacity_per_shard,
                        last_refill: Instant::now(),
                    },
                    Algorithm::SlidingWindow => ShardState::SlidingWindow {
                        hits: VecDeque::new(),
                    },
                    Algorithm::FixedWindow => ShardState::FixedWindow {
                        count: 0,
                        window_start: Instant::now(),
                    },
                };
                Shard {
                    state: Mutex::new(initial),
                    capacity: capacity_per_shard,
                    refill_per_sec,
                }
            })
            .collect();

        Self {
            shards,
            algorithm,
            period,
            rate,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_indices(&self, key: &str) -> (usize, usize) {
        let n = self.shards.len();
        let primary = (hash_key(key, 0x9e37) as usize) % n;
        if n == 1 {
            return (primary, primary);
        }
        let mut secondary = (hash_key(key, 0x517c) as usize) % n;
        if secondary == primary {
            secondary = (secondary + 1) % n;
        }
        (primary, secondary)
    }

    fn try_shard(&self, idx: usize, count: u32) -> (bool, f64) {
        let shard = &self.shards[idx];
        let mut state = shard.state.lock().expect("rate limiter shard mutex poisoned");
        match &mut *state {
            ShardState::TokenBucket { tokens, last_refill } => {
                let now = Instant::now();
                let elapsed = now.duration_since(*last_refill).as_secs_f64();
                *tokens = (*tokens + elapsed * shard.refill_per_sec).min(shard.capacity);
                *last_refill = now;
                if *tokens >= count as f64 {
                    *tokens -= count as f64;
                    (true, *tokens)
                } else {
                    (false, *tokens)
                }
            }
            ShardState::SlidingWindow { hits } => {
                let now = Instant::now();
                while let Some(front) = hits.front() {
                    if now.duration_since(*front) > self.period {
                        hits.pop_front();
                    } else {
                        break;
                    }
                }
                if (hits.len() as u32 + count) <= shard.capacity as u32 {
                    for _ in 0..count {
                        hits.push_back(now);
                    }
                    (true, (shard.capacity as u32 - hits.len() as u32) as f64)
                } else {
                    (false, (shard.capacity as u32).saturating_sub(hits.len() as u32) as f64)
                }
            }
            ShardState::FixedWindow { count: used, window_start } => {
                let now = Instant::now();
                if now.duration_since(*window_start) >= self.period {
                    *used = 0;
                    *window_start = now;
                }
                if (*used + count) <= shard.capacity as u32 {
                    *used += count;
                    (true, (shard.capacity as u32 - *used) as f64)
                } else {
                    (false, (shard.capacity as u32).saturating_sub(*used) as f64)
                }
            }
        }
    }

    /// `acquire(key, count)`: tries the primary shard, then secondary;
    /// denies if both would starve.
    pub fn acquire(&self, key: &str, count: u32) -> AcquireOutcome {
        if self.rate == 0 {
            return AcquireOutcome {
                allowed: false,
                tokens_remaining: 0.0,
                shard_id: 0,
                retry_after: Some(self.period),
            };
        }

        let (primary, secondary) = self.shard_indices(key);
        let (ok, remaining) = self.try_shard(primary, count);
        if ok {
            return AcquireOutcome {
                allowed: true,
                tokens_remaining: remaining,
                shard_id: primary,
                retry_after: None,
            };
        }
        if secondary != primary {
            let (ok2, remaining2) = self.try_shard(secondary, count);
            if ok2 {
                return AcquireOutcome {
                    allowed: true,
                    tokens_remaining: remaining2,
                    shard_id: secondary,
                    retry_after: None,
                };
            }
        }

        let retry_after = match self.algorithm {
            Algorithm::TokenBucket => {
                let shard = &self.shards[primary];
                let deficit = count as f64;
                Duration::from_secs_f64((deficit / shard.refill_per_sec.max(0.0001)).max(0.01))
            }
            _ => Duration::from_secs_f64(self.period.as_secs_f64() / self.shards.len().max(1) as f64),
        };

        AcquireOutcome {
            allowed: false,
            tokens_remaining: remaining,
            shard_id: primary,
            retry_after: Some(retry_after),
        }
    }

    /// Refunds tokens to a shard (used by the adaptive variant to charge
    /// negative tokens on a rate-limit hit).
    pub fn debit(&self, shard_id: usize, amount: f64) {
        if let Some(shard) = self.shards.get(shard_id) {
            let mut state = shard.state.lock().expect("rate limiter shard mutex poisoned");
            if let ShardState::TokenBucket { tokens, .. } = &mut *state {
                *tokens = (*tokens - amount).max(-shard.capacity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_zero_always_denies() {
        let limiter = ShardedRateLimiter::new(0, Duration::from_secs(60), 0, Algorithm::TokenBucket);
        let outcome = limiter.acquire("k", 1);
        assert!(!outcome.allowed);
        assert!(outcome.retry_after.unwrap() > Duration::ZERO);
    }

    #[test]
    fn single_shard_when_rate_small() {
        assert_eq!(optimal_shard_count(5), 1);
        assert_eq!(optimal_shard_count(100), 8);
    }

    #[test]
    fn conformance_over_window() {
        let limiter = ShardedRateLimiter::new(100, Duration::from_secs(1), 100, Algorithm::FixedWindow);
        let mut allowed = 0;
        for _ in 0..500 {
            if limiter.acquire("same-key", 1).allowed {
                allowed += 1;
            }
        }
        // Single key always hashes to the same two shards; total allowed
        // across the window must not exceed overall shard capacity.
        assert!(allowed <= 100);
    }
}
