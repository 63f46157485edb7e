//! Exponential backoff retry executor, grounded in the teacher's
//! `knhk-sidecar::retry::RetryExecutor` but reworked to classify errors via
//! `PipelineError::is_retryable` and to honor a server-advised `retry_after`
//! when present.

use crate::error::PipelineError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// `d(attempt) = min(initial_delay * base^attempt, max_delay)`, with
    /// half-jitter (uniform factor in [0.5, 1.0)) when enabled.
    fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.config.initial_delay.as_secs_f64()
            * self.config.exponential_base.powi(attempt as i32);
        let capped = raw.min(self.config.max_delay.as_secs_f64());
        let factor = if self.config.jitter {
            rand::thread_rng().gen_range(0.5..1.0)
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * factor)
    }

    /// Executes `f`, retrying classified-retriable errors up to
    /// `max_attempts` total attempts. Non-retriable errors are re-raised
    /// immediately. A `RateLimit` error's `retry_after` overrides the
    /// computed backoff for that attempt.
    pub async fn execute<F, Fut, T>(&self, mut f: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut last_error: Option<PipelineError> = None;

        for attempt in 0..self.config.max_attempts {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    if attempt + 1 >= self.config.max_attempts {
                        last_error = Some(err);
                        break;
                    }

                    let delay = match err.retry_after_secs() {
                        Some(secs) => Duration::from_secs(secs),
                        None => self.delay_for(attempt),
                    };
                    warn!(attempt, ?delay, "retrying after transient error: {}", err);
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        let last = last_error.expect("loop always sets last_error before exhausting attempts");
        debug!(max_attempts = self.config.max_attempts, "retries exhausted");
        Err(PipelineError::RetryExhausted {
            attempts: self.config.max_attempts,
            last_error: last.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn stops_at_max_attempts() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            exponential_base: 2.0,
            jitter: false,
        });
        let attempts = AtomicU32::new(0);
        let result: Result<(), PipelineError> = executor
            .execute(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(PipelineError::Network("down".into())) }
            })
            .await;
        assert!(matches!(result, Err(PipelineError::RetryExhausted { attempts: 3, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_short_circuits() {
        let executor = RetryExecutor::new(RetryConfig::default());
        let attempts = AtomicU32::new(0);
        let result: Result<(), PipelineError> = executor
            .execute(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(PipelineError::Authentication("bad key".into())) }
            })
            .await;
        assert!(matches!(result, Err(PipelineError::Authentication(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failure() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            exponential_base: 2.0,
            jitter: false,
        });
        let attempts = AtomicU32::new(0);
        let result = executor
            .execute(|| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(PipelineError::Network("down".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn honors_server_advised_retry_after_over_computed_backoff() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            exponential_base: 2.0,
            jitter: false,
        });
        let attempts = AtomicU32::new(0);
        let started = std::time::Instant::now();
        let result = executor
            .execute(|| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(PipelineError::RateLimit { message: "slow down".into(), retry_after_secs: 1 })
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_secs(1));
    }
}
