//! Rolling-average-latency batch-size tuner: grows batch size when items
//! are processing comfortably under target latency, shrinks it when
//! they're running hot, floored and capped.

use std::sync::atomic::{AtomicUsize, Ordering};

const GROWTH_FACTOR: f64 = 1.10;
const SHRINK_FACTOR: f64 = 0.90;
const DEVIATION_THRESHOLD: f64 = 0.10;

pub struct BatchSizeTuner {
    current: AtomicUsize,
    min_batch_size: usize,
    max_batch_size: usize,
    target_latency_ms: f64,
}

impl BatchSizeTuner {
    pub fn new(initial_batch_size: usize, min_batch_size: usize, max_batch_size: usize, target_latency_ms: f64) -> Self {
        Self {
            current: AtomicUsize::new(initial_batch_size.clamp(min_batch_size, max_batch_size)),
            min_batch_size,
            max_batch_size,
            target_latency_ms,
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// Adjusts batch size by ±10% when the rolling average latency
    /// deviates from target by at least 10%, floored and capped.
    pub fn observe(&self, rolling_avg_latency_ms: f64) {
        let lower_bound = self.target_latency_ms * (1.0 - DEVIATION_THRESHOLD);
        let upper_bound = self.target_latency_ms * (1.0 + DEVIATION_THRESHOLD);
        let current = self.current.load(Ordering::Relaxed);

        let next = if rolling_avg_latency_ms < lower_bound {
            ((current as f64) * GROWTH_FACTOR).round() as usize
        } else if rolling_avg_latency_ms > upper_bound {
            ((current as f64) * SHRINK_FACTOR).round() as usize
        } else {
            return;
        };

        self.current.store(next.clamp(self.min_batch_size, self.max_batch_size), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_when_comfortably_under_target() {
        let tuner = BatchSizeTuner::new(10, 1, 1000, 100.0);
        tuner.observe(50.0);
        assert_eq!(tuner.current(), 11);
    }

    #[test]
    fn shrinks_when_running_hot() {
        let tuner = BatchSizeTuner::new(10, 1, 1000, 100.0);
        tuner.observe(200.0);
        assert_eq!(tuner.current(), 9);
    }

    #[test]
    fn holds_steady_within_tolerance() {
        let tuner = BatchSizeTuner::new(10, 1, 1000, 100.0);
        tuner.observe(105.0);
        assert_eq!(tuner.current(), 10);
    }

    #[test]
    fn never_drops_below_floor() {
        let tuner = BatchSizeTuner::new(1, 1, 1000, 100.0);
        tuner.observe(1000.0);
        assert_eq!(tuner.current(), 1);
    }
}
