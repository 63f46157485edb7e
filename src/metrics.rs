//! Metrics collection (C10): request counts, latency percentiles, cache
//! hit rate, and token/cost accounting over a bounded rolling window.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const DEFAULT_LATENCY_SAMPLES: usize = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetrics {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub cache_hits: u64,
    pub retries: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tokens_saved_by_cache: u64,
    pub cost_nano_usd: u64,
}

/// A point-in-time view of everything tracked for one batch run,
/// embedded in `Checkpoint` so a resumed run can report continuity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchMetricsSnapshot {
    pub requests: RequestMetrics,
    pub latency: LatencyMetrics,
    pub tokens: TokenMetrics,
}

impl BatchMetricsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        if self.requests.total == 0 {
            0.0
        } else {
            self.requests.cache_hits as f64 / self.requests.total as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.requests.total == 0 {
            0.0
        } else {
            self.requests.success as f64 / self.requests.total as f64
        }
    }
}

struct Inner {
    requests: Mutex<RequestMetrics>,
    latencies: Mutex<VecDeque<u64>>,
    tokens: Mutex<TokenMetrics>,
    max_latency_samples: usize,
}

/// Thread-safe metrics sink, cheap to clone and share across the
/// orchestrator's concurrent workers.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Inner>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_sample_window(DEFAULT_LATENCY_SAMPLES)
    }

    pub fn with_sample_window(max_samples: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                requests: Mutex::new(RequestMetrics::default()),
                latencies: Mutex::new(VecDeque::with_capacity(max_samples)),
                tokens: Mutex::new(TokenMetrics::default()),
                max_latency_samples: max_samples,
            }),
        }
    }

    pub fn record_request(&self, success: bool) {
        let mut requests = self.inner.requests.lock().expect("metrics mutex poisoned");
        requests.total += 1;
        if success {
            requests.success += 1;
        } else {
            requests.failure += 1;
        }
    }

    pub fn record_cache_hit(&self) {
        self.inner.requests.lock().expect("metrics mutex poisoned").cache_hits += 1;
    }

    pub fn record_retry(&self) {
        self.inner.requests.lock().expect("metrics mutex poisoned").retries += 1;
    }

    pub fn record_latency(&self, latency_ms: u64) {
        let mut latencies = self.inner.latencies.lock().expect("latency mutex poisoned");
        latencies.push_back(latency_ms);
        if latencies.len() > self.inner.max_latency_samples {
            latencies.pop_front();
        }
    }

    pub fn record_tokens(&self, input_tokens: u64, output_tokens: u64, cost_nano_usd: u64) {
        let mut tokens = self.inner.tokens.lock().expect("token mutex poisoned");
        tokens.input_tokens += input_tokens;
        tokens.output_tokens += output_tokens;
        tokens.cost_nano_usd += cost_nano_usd;
    }

    pub fn record_tokens_saved(&self, tokens: u64) {
        self.inner.tokens.lock().expect("token mutex poisoned").tokens_saved_by_cache += tokens;
    }

    pub fn snapshot(&self) -> BatchMetricsSnapshot {
        let requests = self.inner.requests.lock().expect("metrics mutex poisoned").clone();
        let tokens = self.inner.tokens.lock().expect("token mutex poisoned").clone();

        let mut sorted: Vec<u64> = self
            .inner
            .latencies
            .lock()
            .expect("latency mutex poisoned")
            .iter()
            .copied()
            .collect();
        sorted.sort_unstable();

        let latency = if sorted.is_empty() {
            LatencyMetrics::default()
        } else {
            // Nearest-rank: the smallest sample such that at least `p`
            // fraction of the data falls at or below it.
            let percentile = |p: f64| {
                let rank = (sorted.len() as f64 * p).ceil() as usize;
                let idx = rank.saturating_sub(1).min(sorted.len() - 1);
                sorted.get(idx).copied().unwrap_or(0)
            };
            LatencyMetrics {
                p50_ms: percentile(0.50),
                p95_ms: percentile(0.95),
                p99_ms: percentile(0.99),
            }
        };

        BatchMetricsSnapshot { requests, latency, tokens }
    }

    pub fn reset(&self) {
        *self.inner.requests.lock().expect("metrics mutex poisoned") = RequestMetrics::default();
        self.inner.latencies.lock().expect("latency mutex poisoned").clear();
        *self.inner.tokens.lock().expect("token mutex poisoned") = TokenMetrics::default();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_over_known_sample_set() {
        let collector = MetricsCollector::with_sample_window(100);
        for ms in 1..=100u64 {
            collector.record_latency(ms);
        }
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.latency.p50_ms, 50);
        assert_eq!(snapshot.latency.p99_ms, 99);
    }

    #[test]
    fn sample_window_is_bounded() {
        let collector = MetricsCollector::with_sample_window(10);
        for ms in 0..1000u64 {
            collector.record_latency(ms);
        }
        assert_eq!(collector.inner.latencies.lock().unwrap().len(), 10);
    }

    #[test]
    fn hit_rate_tracks_cache_hits_over_total() {
        let collector = MetricsCollector::new();
        collector.record_request(true);
        collector.record_request(true);
        collector.record_cache_hit();
        let snapshot = collector.snapshot();
        assert!((snapshot.hit_rate() - 0.5).abs() < 1e-9);
    }
}
