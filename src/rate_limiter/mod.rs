//! Sharded rate limiter with reservations.

pub mod adaptive;
pub mod composite;
pub mod pricing;
pub mod quota;
pub mod reservation;
pub mod token_bucket;

use crate::error::PipelineError;
use dashmap::DashMap;
use reservation::Reservation;
use std::time::Duration;
use token_bucket::{Algorithm, ShardedRateLimiter};
use uuid::Uuid;

pub enum AcquireResult {
    Allowed { tokens_remaining: f64, shard_id: usize },
    Denied { retry_after: Duration },
}

/// Distributed-ready interface, implemented by `RateLimiter` below —
/// in-process for now, but a remote/distributed backend could implement
/// the same trait without changing callers.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn acquire(&self, key: &str, count: u32) -> AcquireResult;
    async fn reserve(&self, key: &str, count: u32, max_wait: Duration) -> Result<Reservation, PipelineError>;
    async fn execute_reservation(&self, id: Uuid) -> Result<AcquireResult, PipelineError>;
    async fn cancel_reservation(&self, id: Uuid) -> bool;
}

pub struct RateLimiter {
    inner: ShardedRateLimiter,
    reservations: DashMap<Uuid, Reservation>,
}

impl RateLimiter {
    pub fn new(rate: u32, period: Duration, burst: u32) -> Self {
        Self {
            inner: ShardedRateLimiter::new(rate, period, burst, Algorithm::TokenBucket),
            reservations: DashMap::new(),
        }
    }

    pub fn with_algorithm(rate: u32, period: Duration, burst: u32, algorithm: Algorithm) -> Self {
        Self {
            inner: ShardedRateLimiter::new(rate, period, burst, algorithm),
            reservations: DashMap::new(),
        }
    }

    fn prune_expired(&self) {
        let now = chrono::Utc::now();
        self.reservations.retain(|_, r| !r.is_expired(now));
    }
}

#[async_trait::async_trait]
impl TokenSource for RateLimiter {
    async fn acquire(&self, key: &str, count: u32) -> AcquireResult {
        let outcome = self.inner.acquire(key, count);
        if outcome.allowed {
            AcquireResult::Allowed {
                tokens_remaining: outcome.tokens_remaining,
                shard_id: outcome.shard_id,
            }
        } else {
            AcquireResult::Denied {
                retry_after: outcome.retry_after.unwrap_or(Duration::from_secs(1)),
            }
        }
    }

    /// `reserve(key, count, max_wait)`: schedules `execute_at = now +
    /// retry_after` when tokens aren't available now; fails if the wait
    /// would exceed `max_wait`.
    async fn reserve(&self, key: &str, count: u32, max_wait: Duration) -> Result<Reservation, PipelineError> {
        self.prune_expired();
        let outcome = self.inner.acquire(key, count);
        let delay = if outcome.allowed {
            Duration::ZERO
        } else {
            outcome.retry_after.unwrap_or(Duration::from_secs(1))
        };

        if delay > max_wait {
            return Err(PipelineError::RateLimit {
                message: format!("reservation would wait {delay:?}, exceeding max_wait {max_wait:?}"),
                retry_after_secs: delay.as_secs().max(1),
            });
        }

        let reservation = Reservation::new(
            key.to_string(),
            count,
            chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
            Some(outcome.shard_id),
        );
        self.reservations.insert(reservation.id, reservation.clone());
        Ok(reservation)
    }

    /// `execute_reservation(id)`: if ready and not expired, performs the
    /// underlying `acquire`; otherwise errors with the remaining wait.
    /// Removes the reservation exactly once, win or lose.
    async fn execute_reservation(&self, id: Uuid) -> Result<AcquireResult, PipelineError> {
        let reservation = match self.reservations.remove(&id) {
            Some((_, r)) => r,
            None => {
                return Err(PipelineError::Validation(format!(
                    "no such reservation: {id}"
                )))
            }
        };

        let now = chrono::Utc::now();
        if reservation.is_expired(now) {
            return Err(PipelineError::Validation(format!(
                "reservation {id} expired at {}",
                reservation.expires_at
            )));
        }
        if !reservation.is_ready(now) {
            let remaining = (reservation.execute_at - now).num_milliseconds().max(0) as u64;
            return Err(PipelineError::RateLimit {
                message: format!("reservation {id} not ready yet"),
                retry_after_secs: (remaining / 1000).max(1),
            });
        }

        Ok(self.acquire(&reservation.key, reservation.token_count).await)
    }

    async fn cancel_reservation(&self, id: Uuid) -> bool {
        self.reservations.remove(&id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reservation_lifecycle() {
        let limiter = RateLimiter::new(600, Duration::from_secs(60), 20);
        let reservation = limiter
            .reserve("item-1", 1, Duration::from_secs(5))
            .await
            .expect("reserve succeeds");
        let result = limiter.execute_reservation(reservation.id).await;
        assert!(result.is_ok());
        // Reservation removed exactly once: a second execute fails.
        let second = limiter.execute_reservation(reservation.id).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn cancel_removes_reservation() {
        let limiter = RateLimiter::new(600, Duration::from_secs(60), 20);
        let reservation = limiter
            .reserve("item-1", 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(limiter.cancel_reservation(reservation.id).await);
        assert!(!limiter.cancel_reservation(reservation.id).await);
    }

    #[tokio::test]
    async fn execute_at_is_never_before_reserved_at() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60), 1);
        // Exhaust the single token so the next reservation must wait.
        let _ = limiter.acquire("k", 1).await;
        let reservation = limiter.reserve("k", 1, Duration::from_secs(120)).await.unwrap();
        assert!(reservation.execute_at >= reservation.reserved_at);
        assert_eq!(
            (reservation.expires_at - reservation.execute_at).num_seconds(),
            60
        );
    }
}
