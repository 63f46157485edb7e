//! Per-service circuit breaker, registry-based like the teacher's
//! `CircuitBreakerRegistry` in `knhk-sidecar::circuit_breaker`, but with
//! real shared state per service (no clone-loses-state bug) and an
//! adaptive threshold variant.

use crate::error::PipelineError;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Bounds for the adaptive threshold variant (see DESIGN.md): threshold
/// never drops below 2 nor exceeds four times the configured baseline.
const ADAPTIVE_THRESHOLD_FLOOR: u32 = 2;

struct Inner {
    state: std::sync::Mutex<CircuitState>,
    consecutive_failures: AtomicU32,
    call_count: AtomicU64,
    success_count: AtomicU64,
    opened_at: std::sync::Mutex<Option<Instant>>,
    probe_in_flight: AtomicBool,
    threshold: AtomicU32,
    baseline_threshold: u32,
    recovery_timeout: Duration,
}

/// A single named circuit breaker. Cheaply cloneable; clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    service: String,
    inner: Arc<Inner>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            service: service.into(),
            inner: Arc::new(Inner {
                state: std::sync::Mutex::new(CircuitState::Closed),
                consecutive_failures: AtomicU32::new(0),
                call_count: AtomicU64::new(0),
                success_count: AtomicU64::new(0),
                opened_at: std::sync::Mutex::new(None),
                probe_in_flight: AtomicBool::new(false),
                threshold: AtomicU32::new(threshold),
                baseline_threshold: threshold,
                recovery_timeout,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.inner.state.lock().expect("circuit breaker mutex poisoned")
    }

    /// Runs `f`, returning its result or `CircuitOpen` if the breaker has
    /// tripped. Admits at most one concurrent half-open probe.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        self.admit()?;
        self.inner.call_count.fetch_add(1, Ordering::Relaxed);

        let result = f().await;

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result
    }

    /// Decides whether this call may proceed, transitioning OPEN ->
    /// HALF_OPEN when the recovery timeout has elapsed and claiming the
    /// single probe slot atomically.
    fn admit(&self) -> Result<(), PipelineError> {
        let mut state = self.inner.state.lock().expect("circuit breaker mutex poisoned");
        match *state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                // Only the thread that flips probe_in_flight false->true proceeds.
                if self
                    .inner
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    Ok(())
                } else {
                    Err(PipelineError::CircuitOpen {
                        service: self.service.clone(),
                    })
                }
            }
            CircuitState::Open => {
                let opened_at = *self.inner.opened_at.lock().expect("mutex poisoned");
                let elapsed = opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= self.inner.recovery_timeout {
                    info!(service = %self.service, "circuit breaker entering half-open probe");
                    *state = CircuitState::HalfOpen;
                    self.inner.probe_in_flight.store(true, Ordering::Release);
                    Ok(())
                } else {
                    Err(PipelineError::CircuitOpen {
                        service: self.service.clone(),
                    })
                }
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.inner.state.lock().expect("mutex poisoned");
        self.inner.success_count.fetch_add(1, Ordering::Relaxed);
        match *state {
            CircuitState::HalfOpen => {
                debug!(service = %self.service, "half-open probe succeeded, closing circuit");
                *state = CircuitState::Closed;
                self.inner.consecutive_failures.store(0, Ordering::Relaxed);
                self.inner.probe_in_flight.store(false, Ordering::Release);
                self.raise_threshold();
            }
            CircuitState::Closed => {
                self.inner.consecutive_failures.store(0, Ordering::Relaxed);
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut state = self.inner.state.lock().expect("mutex poisoned");
        match *state {
            CircuitState::HalfOpen => {
                warn!(service = %self.service, "half-open probe failed, reopening circuit");
                *state = CircuitState::Open;
                *self.inner.opened_at.lock().expect("mutex poisoned") = Some(Instant::now());
                self.inner.probe_in_flight.store(false, Ordering::Release);
            }
            CircuitState::Closed => {
                let failures = self.inner.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                let threshold = self.inner.threshold.load(Ordering::Relaxed);
                if failures >= threshold {
                    warn!(service = %self.service, failures, threshold, "circuit breaker tripping open");
                    *state = CircuitState::Open;
                    *self.inner.opened_at.lock().expect("mutex poisoned") = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Adaptive variant: lowers the trip threshold when a dense burst of
    /// failures is observed, never below the floor.
    pub fn lower_threshold(&self) {
        let current = self.inner.threshold.load(Ordering::Relaxed);
        let lowered = current.saturating_sub(1).max(ADAPTIVE_THRESHOLD_FLOOR);
        self.inner.threshold.store(lowered, Ordering::Relaxed);
    }

    /// Raises the trip threshold back toward baseline on sustained
    /// success, capped at 4x the configured baseline (DESIGN.md decision).
    fn raise_threshold(&self) {
        let ceiling = self.inner.baseline_threshold.saturating_mul(4);
        let current = self.inner.threshold.load(Ordering::Relaxed);
        let raised = (current + 1).min(ceiling).max(self.inner.baseline_threshold);
        self.inner.threshold.store(raised, Ordering::Relaxed);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn call_count(&self) -> u64 {
        self.inner.call_count.load(Ordering::Relaxed)
    }

    pub fn success_count(&self) -> u64 {
        self.inner.success_count.load(Ordering::Relaxed)
    }
}

/// Registry mapping service names to independent, lazily-constructed
/// breakers, one per named service.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, CircuitBreaker>,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl CircuitBreakerRegistry {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            failure_threshold,
            recovery_timeout,
        }
    }

    pub fn get_or_create(&self, service: &str) -> CircuitBreaker {
        if let Some(existing) = self.breakers.get(service) {
            return existing.clone();
        }
        let breaker = CircuitBreaker::new(service, self.failure_threshold, self.recovery_timeout);
        self.breakers.insert(service.to_string(), breaker.clone());
        breaker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn threshold_one_opens_immediately() {
        let cb = CircuitBreaker::new("stage1", 1, Duration::from_millis(50));
        let result: Result<(), PipelineError> = cb
            .call(|| async { Err(PipelineError::Network("boom".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        let second: Result<(), PipelineError> = cb.call(|| async { Ok(()) }).await;
        assert!(matches!(second, Err(PipelineError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn half_open_admits_single_probe() {
        let cb = CircuitBreaker::new("stage1", 1, Duration::from_millis(10));
        let _: Result<(), PipelineError> = cb
            .call(|| async { Err(PipelineError::Network("boom".into())) })
            .await;
        tokio::time::sleep(Duration::from_millis(15)).await;

        let ok: Result<(), PipelineError> = cb.call(|| async { Ok(()) }).await;
        assert!(ok.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn registry_shares_state_across_lookups() {
        let registry = CircuitBreakerRegistry::new(1, Duration::from_secs(60));
        let a = registry.get_or_create("stage2");
        let _: Result<(), PipelineError> = a
            .call(|| async { Err(PipelineError::Network("boom".into())) })
            .await;
        let b = registry.get_or_create("stage2");
        assert_eq!(b.state(), CircuitState::Open);
    }
}
