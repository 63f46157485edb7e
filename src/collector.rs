//! Ordered result collector (C6): accepts out-of-order completions keyed
//! by position and reassembles the original vocabulary-file order.

use crate::models::{ProcessingOutcome, ProcessingResult};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

struct Inner {
    total: usize,
    results: Mutex<BTreeMap<u64, ProcessingResult>>,
    notify: Notify,
}

/// Collects per-item results as they arrive from concurrent workers and
/// exposes them back in position order. Inserting the same position
/// twice is idempotent: the second insert is ignored, not appended.
pub struct OrderedCollector {
    inner: std::sync::Arc<Inner>,
}

impl OrderedCollector {
    pub fn new(total: usize) -> Self {
        Self {
            inner: std::sync::Arc::new(Inner {
                total,
                results: Mutex::new(BTreeMap::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Records one item's outcome. Returns `true` if this was the first
    /// time `position` was recorded.
    pub fn add_result(&self, result: ProcessingResult) -> bool {
        let position = result.position;
        let mut results = self.inner.results.lock().expect("collector mutex poisoned");
        let is_new = !results.contains_key(&position);
        results.entry(position).or_insert(result);
        let complete = results.len() == self.inner.total;
        drop(results);
        if complete {
            self.inner.notify.notify_waiters();
        }
        is_new
    }

    pub fn len(&self) -> usize {
        self.inner.results.lock().expect("collector mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_complete(&self) -> bool {
        self.len() == self.inner.total
    }

    /// Returns every result collected so far, in ascending position order.
    pub fn get_ordered_results(&self) -> Vec<ProcessingResult> {
        self.inner
            .results
            .lock()
            .expect("collector mutex poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn pending_positions(&self, all_positions: &[u64]) -> Vec<u64> {
        let results = self.inner.results.lock().expect("collector mutex poisoned");
        all_positions
            .iter()
            .copied()
            .filter(|p| !results.contains_key(p))
            .collect()
    }

    /// Waits until every item has been recorded or `timeout` elapses.
    /// Returns `true` if collection completed before the timeout.
    pub async fn wait_for_all(&self, timeout: Duration) -> bool {
        if self.is_complete() {
            return true;
        }
        let notified = self.inner.notify.notified();
        tokio::select! {
            _ = notified => self.is_complete(),
            _ = tokio::time::sleep(timeout) => self.is_complete(),
        }
    }

    pub fn stats(&self) -> CollectorStats {
        let results = self.inner.results.lock().expect("collector mutex poisoned");
        let mut success = 0u64;
        let mut failure = 0u64;
        let mut from_cache = 0u64;
        for r in results.values() {
            match r.outcome {
                ProcessingOutcome::Success { .. } => success += 1,
                ProcessingOutcome::Failure { .. } => failure += 1,
            }
            if r.from_cache {
                from_cache += 1;
            }
        }
        CollectorStats {
            total: self.inner.total,
            collected: results.len(),
            success,
            failure,
            from_cache,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CollectorStats {
    pub total: usize,
    pub collected: usize,
    pub success: u64,
    pub failure: u64,
    pub from_cache: u64,
}

impl CollectorStats {
    pub fn cache_hit_rate(&self) -> f64 {
        if self.collected == 0 {
            0.0
        } else {
            self.from_cache as f64 / self.collected as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(position: u64) -> ProcessingResult {
        ProcessingResult {
            position,
            term: format!("term-{position}"),
            outcome: ProcessingOutcome::Success { flashcard_tsv: "row".into() },
            from_cache: false,
            processing_time_ms: 1,
        }
    }

    #[test]
    fn idempotent_insert_keeps_first() {
        let collector = OrderedCollector::new(1);
        assert!(collector.add_result(result(0)));
        assert!(!collector.add_result(result(0)));
        assert_eq!(collector.len(), 1);
    }

    #[test]
    fn ordered_results_sort_by_position_regardless_of_arrival_order() {
        let collector = OrderedCollector::new(3);
        collector.add_result(result(2));
        collector.add_result(result(0));
        collector.add_result(result(1));
        let ordered = collector.get_ordered_results();
        let positions: Vec<u64> = ordered.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn wait_for_all_resolves_on_completion() {
        let collector = std::sync::Arc::new(OrderedCollector::new(2));
        let waiter = {
            let collector = collector.clone();
            tokio::spawn(async move { collector.wait_for_all(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        collector.add_result(result(0));
        collector.add_result(result(1));
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_all_times_out_when_incomplete() {
        let collector = OrderedCollector::new(5);
        collector.add_result(result(0));
        let completed = collector.wait_for_all(Duration::from_millis(30)).await;
        assert!(!completed);
    }

    #[tokio::test]
    async fn concurrent_inserts_land_at_correct_positions() {
        let collector = std::sync::Arc::new(OrderedCollector::new(100));
        let mut handles = Vec::new();
        for i in 0..100u64 {
            let collector = collector.clone();
            handles.push(tokio::spawn(async move {
                collector.add_result(result(i));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let ordered = collector.get_ordered_results();
        let positions: Vec<u64> = ordered.iter().map(|r| r.position).collect();
        let expected: Vec<u64> = (0..100).collect();
        assert_eq!(positions, expected);
    }
}
