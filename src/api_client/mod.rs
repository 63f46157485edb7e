//! HTTP API client (C7): chat-completions transport, wrapped with a
//! circuit breaker, retry executor, and metrics the way the teacher's
//! `SidecarClient` wraps its gRPC channel.

mod http;

pub use http::HttpApiClient;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::PipelineError;
use crate::metrics::MetricsCollector;
use crate::retry::RetryExecutor;
use async_trait::async_trait;
use std::time::Instant;

/// Token usage reported by the upstream API for one completion call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Everything one chat-completions call needs, per `spec.md` §6's wire
/// contract (`{model, messages, temperature, max_tokens}`).
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// A single chat-completion call, decoupled from any particular
/// transport so tests can substitute a fake without touching the
/// network.
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<(String, TokenUsage), PipelineError>;
}

#[async_trait]
impl<T: ApiClient + ?Sized> ApiClient for std::sync::Arc<T> {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<(String, TokenUsage), PipelineError> {
        (**self).complete(request).await
    }
}

/// A bare pass-through client with no circuit breaker, retry, or metrics
/// of its own — the "simple" mode of the duck-typed Python client
/// collapsed into a distinct struct rather than a runtime flag, per the
/// REDESIGN FLAGS in `spec.md` §9. Useful for tests and for callers that
/// already sit behind their own resilience layer.
pub struct BasicApiClient<C: ApiClient> {
    inner: C,
}

impl<C: ApiClient> BasicApiClient<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }

    pub async fn complete(&self, request: CompletionRequest<'_>) -> Result<(String, TokenUsage), PipelineError> {
        self.inner.complete(request).await
    }
}

/// Wraps any `ApiClient` with a per-service circuit breaker, retry
/// executor, and metrics recording — the composition the teacher's
/// `SidecarClient` performs around its gRPC channel. This is the
/// "advanced" mode of the duck-typed Python client, sharing the same
/// underlying pipeline as `BasicApiClient` rather than subclassing it.
pub struct InstrumentedApiClient<C: ApiClient> {
    inner: C,
    circuit_breaker: CircuitBreaker,
    retry: RetryExecutor,
    metrics: MetricsCollector,
}

impl<C: ApiClient> InstrumentedApiClient<C> {
    pub fn new(inner: C, circuit_breaker: CircuitBreaker, retry: RetryExecutor, metrics: MetricsCollector) -> Self {
        Self { inner, circuit_breaker, retry, metrics }
    }

    pub async fn complete(&self, request: CompletionRequest<'_>) -> Result<(String, TokenUsage), PipelineError> {
        let started = Instant::now();
        let result = self
            .retry
            .execute(|| {
                let circuit_breaker = self.circuit_breaker.clone();
                async move { circuit_breaker.call(|| self.inner.complete(request)).await }
            })
            .await;

        self.metrics.record_latency(started.elapsed().as_millis() as u64);
        self.metrics.record_request(result.is_ok());
        if let Ok((_, usage)) = &result {
            self.metrics.record_tokens(usage.input_tokens, usage.output_tokens, 0);
        }
        result
    }

    /// Sliding-window success rate combined with average latency into a
    /// single `[0.0, 1.0]` health score — the advanced client's health
    /// score, per `spec.md` §4.7.
    pub fn health_score(&self) -> f64 {
        let snapshot = self.metrics.snapshot();
        if snapshot.requests.total == 0 {
            return 1.0;
        }
        let success_rate = snapshot.success_rate();
        let latency_penalty = (snapshot.latency.p95_ms as f64 / 10_000.0).min(1.0);
        (success_rate * (1.0 - latency_penalty)).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FlakyClient {
        failures_remaining: AtomicU32,
    }

    #[async_trait]
    impl ApiClient for FlakyClient {
        async fn complete(&self, _request: CompletionRequest<'_>) -> Result<(String, TokenUsage), PipelineError> {
            if self.failures_remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(PipelineError::Network("connection reset".into()))
            } else {
                Ok(("{}".to_string(), TokenUsage { input_tokens: 10, output_tokens: 20 }))
            }
        }
    }

    fn request<'a>(model: &'a str) -> CompletionRequest<'a> {
        CompletionRequest {
            model,
            system_prompt: "sys",
            user_prompt: "user",
            temperature: 0.7,
            max_tokens: 2000,
        }
    }

    #[tokio::test]
    async fn retries_through_transient_network_errors() {
        let client = InstrumentedApiClient::new(
            FlakyClient { failures_remaining: AtomicU32::new(2) },
            CircuitBreaker::new("stage1", 10, Duration::from_secs(30)),
            RetryExecutor::new(crate::retry::RetryConfig {
                max_attempts: 5,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                exponential_base: 2.0,
                jitter: false,
            }),
            MetricsCollector::new(),
        );
        let (text, usage) = client.complete(request("model")).await.unwrap();
        assert_eq!(text, "{}");
        assert_eq!(usage.total(), 30);
    }

    #[tokio::test]
    async fn repeated_failures_trip_the_circuit() {
        let client = InstrumentedApiClient::new(
            FlakyClient { failures_remaining: AtomicU32::new(100) },
            CircuitBreaker::new("stage1", 1, Duration::from_secs(30)),
            RetryExecutor::new(crate::retry::RetryConfig {
                max_attempts: 1,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
                exponential_base: 1.0,
                jitter: false,
            }),
            MetricsCollector::new(),
        );
        let _ = client.complete(request("model")).await;
        let second = client.complete(request("model")).await;
        assert!(matches!(second, Err(PipelineError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn basic_client_skips_circuit_breaker() {
        let client = BasicApiClient::new(FlakyClient { failures_remaining: AtomicU32::new(0) });
        let (text, _) = client.complete(request("model")).await.unwrap();
        assert_eq!(text, "{}");
    }
}
