//! Content-addressed cache: at-most-one build per fingerprint, an
//! in-memory LRU fronting the disk store, TTL expiry on read, and
//! explicit size-bound eviction.

mod store;

pub use store::StageDir;

use crate::error::PipelineError;
use crate::models::{stage1_cache_key, stage2_cache_key, Stage1Result, Stage2Result, VocabularyItem};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use store::{DiskRecord, DiskStore};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

struct MemoryEntry<T> {
    payload: T,
    tokens_used: u64,
    created_at: DateTime<Utc>,
    last_accessed_at: std::time::Instant,
    access_count: u64,
    approx_size: usize,
}

#[derive(Default)]
struct StatsInner {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    tokens_saved: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub tokens_saved: u64,
}

impl CacheStats {
    /// Estimated cost saved, using the default per-million pricing.
    pub fn estimated_cost_saved_usd(&self) -> f64 {
        let rate = crate::rate_limiter::pricing::PricingTable::default();
        let nano = rate.cost_nano_usd("anthropic/claude-3-5-sonnet", self.tokens_saved, 0);
        crate::rate_limiter::pricing::nano_usd_to_usd(nano)
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Content-addressed Stage-1/Stage-2 cache. Cheaply cloneable; clones
/// share the same in-memory index, disk store, and per-key locks.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    disk: DiskStore,
    ttl: Duration,
    max_entries: usize,
    stage1_memory: DashMap<String, MemoryEntry<Stage1Result>>,
    stage2_memory: DashMap<String, MemoryEntry<Stage2Result>>,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
    stats: StatsInner,
}

impl Cache {
    pub fn new(root: impl Into<std::path::PathBuf>, ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                disk: DiskStore::new(root),
                ttl,
                max_entries,
                stage1_memory: DashMap::new(),
                stage2_memory: DashMap::new(),
                locks: DashMap::new(),
                stats: StatsInner::default(),
            }),
        }
    }

    fn lock_for(&self, full_key: &str) -> Arc<AsyncMutex<()>> {
        self.inner
            .locks
            .entry(full_key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn is_expired(&self, created_at: DateTime<Utc>) -> bool {
        Utc::now().signed_duration_since(created_at).to_std().unwrap_or(Duration::ZERO) > self.inner.ttl
    }

    fn record_hit(&self, tokens: u64) {
        self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
        self.inner.stats.tokens_saved.fetch_add(tokens, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn lookup<T: Clone + Serialize + DeserializeOwned>(
        &self,
        memory: &DashMap<String, MemoryEntry<T>>,
        stage: StageDir,
        key: &str,
    ) -> Option<(T, u64)> {
        if let Some(mut entry) = memory.get_mut(key) {
            if self.is_expired(entry.created_at) {
                drop(entry);
                memory.remove(key);
            } else {
                entry.last_accessed_at = std::time::Instant::now();
                entry.access_count += 1;
                return Some((entry.payload.clone(), entry.tokens_used));
            }
        }

        let record: DiskRecord<T> = self.inner.disk.read(stage, key)?;
        if self.is_expired(record.created_at) {
            self.inner.disk.remove(stage, key);
            return None;
        }
        let approx_size = serde_json::to_vec(&record.payload).map(|v| v.len()).unwrap_or(0);
        self.insert_memory(memory, key, record.payload.clone(), record.tokens_used, record.created_at, approx_size);
        Some((record.payload, record.tokens_used))
    }

    fn insert_memory<T>(
        &self,
        memory: &DashMap<String, MemoryEntry<T>>,
        key: &str,
        payload: T,
        tokens_used: u64,
        created_at: DateTime<Utc>,
        approx_size: usize,
    ) {
        if memory.len() >= self.inner.max_entries && !memory.contains_key(key) {
            self.evict_one(memory);
        }
        memory.insert(
            key.to_string(),
            MemoryEntry {
                payload,
                tokens_used,
                created_at,
                last_accessed_at: std::time::Instant::now(),
                access_count: 1,
                approx_size,
            },
        );
    }

    fn evict_one<T>(&self, memory: &DashMap<String, MemoryEntry<T>>) {
        let oldest = memory
            .iter()
            .min_by_key(|entry| entry.value().last_accessed_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            memory.remove(&key);
            self.inner.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn persist<T: Serialize>(&self, stage: StageDir, key: &str, original_input: serde_json::Value, payload: &T, tokens_used: u64) {
        self.inner.disk.write(
            stage,
            key,
            &DiskRecord {
                original_input,
                payload,
                tokens_used,
                created_at: Utc::now(),
            },
        );
        self.inner.stats.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stage1(&self, item: &VocabularyItem) -> Option<(Stage1Result, u64)> {
        let key = stage1_cache_key(item);
        let result = self.lookup(&self.inner.stage1_memory, StageDir::Stage1, &key);
        match &result {
            Some((_, tokens)) => self.record_hit(*tokens),
            None => self.record_miss(),
        }
        result
    }

    /// Looks up Stage 1 without touching hit/miss stats. Used for the
    /// double-checked-lock re-probe so a genuine miss isn't counted twice.
    fn peek_stage1(&self, item: &VocabularyItem) -> Option<(Stage1Result, u64)> {
        let key = stage1_cache_key(item);
        self.lookup(&self.inner.stage1_memory, StageDir::Stage1, &key)
    }

    pub fn save_stage1(&self, item: &VocabularyItem, result: &Stage1Result, tokens_used: u64) {
        let key = stage1_cache_key(item);
        let approx_size = serde_json::to_vec(result).map(|v| v.len()).unwrap_or(0);
        self.insert_memory(&self.inner.stage1_memory, &key, result.clone(), tokens_used, Utc::now(), approx_size);
        self.persist(
            StageDir::Stage1,
            &key,
            serde_json::to_value(item).unwrap_or(serde_json::Value::Null),
            result,
            tokens_used,
        );
    }

    pub fn get_stage2(&self, item: &VocabularyItem, stage1: &Stage1Result) -> Option<(Stage2Result, u64)> {
        let key = stage2_cache_key(item, stage1);
        let result = self.lookup(&self.inner.stage2_memory, StageDir::Stage2, &key);
        match &result {
            Some((_, tokens)) => self.record_hit(*tokens),
            None => self.record_miss(),
        }
        result
    }

    /// Looks up Stage 2 without touching hit/miss stats. Used for the
    /// double-checked-lock re-probe so a genuine miss isn't counted twice.
    fn peek_stage2(&self, item: &VocabularyItem, stage1: &Stage1Result) -> Option<(Stage2Result, u64)> {
        let key = stage2_cache_key(item, stage1);
        self.lookup(&self.inner.stage2_memory, StageDir::Stage2, &key)
    }

    pub fn save_stage2(&self, item: &VocabularyItem, stage1: &Stage1Result, result: &Stage2Result, tokens_used: u64) {
        let key = stage2_cache_key(item, stage1);
        let approx_size = serde_json::to_vec(result).map(|v| v.len()).unwrap_or(0);
        self.insert_memory(&self.inner.stage2_memory, &key, result.clone(), tokens_used, Utc::now(), approx_size);
        self.persist(
            StageDir::Stage2,
            &key,
            serde_json::to_value(item).unwrap_or(serde_json::Value::Null),
            result,
            tokens_used,
        );
    }

    /// Single-flight `get_or_compute` for Stage 1: at most one concurrent
    /// writer per key; a miss that returns from one caller becomes a hit
    /// for every subsequent caller.
    pub async fn get_or_compute_stage1<F, Fut>(
        &self,
        item: &VocabularyItem,
        compute: F,
    ) -> Result<(Stage1Result, u64, bool), PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Stage1Result, u64), PipelineError>>,
    {
        if let Some((result, tokens)) = self.get_stage1(item) {
            debug!(term = %item.term, "stage1 cache hit");
            return Ok((result, tokens, true));
        }

        let key = stage1_cache_key(item);
        let full_key = format!("stage1:{key}");
        let lock = self.lock_for(&full_key);
        let _guard = lock.lock().await;

        // Re-check: another caller may have computed it while we waited.
        // Uses the non-recording peek; the first probe above already
        // recorded the miss for this lookup.
        if let Some((result, tokens)) = self.peek_stage1(item) {
            self.record_hit(tokens);
            return Ok((result, tokens, true));
        }

        info!(term = %item.term, "stage1 cache miss, computing");
        let (result, tokens_used) = compute().await?;
        self.save_stage1(item, &result, tokens_used);
        Ok((result, tokens_used, false))
    }

    pub async fn get_or_compute_stage2<F, Fut>(
        &self,
        item: &VocabularyItem,
        stage1: &Stage1Result,
        compute: F,
    ) -> Result<(Stage2Result, u64, bool), PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Stage2Result, u64), PipelineError>>,
    {
        if let Some((result, tokens)) = self.get_stage2(item, stage1) {
            return Ok((result, tokens, true));
        }

        let key = stage2_cache_key(item, stage1);
        let full_key = format!("stage2:{key}");
        let lock = self.lock_for(&full_key);
        let _guard = lock.lock().await;

        // Non-recording peek: the first probe above already recorded the miss.
        if let Some((result, tokens)) = self.peek_stage2(item, stage1) {
            self.record_hit(tokens);
            return Ok((result, tokens, true));
        }

        info!(term = %item.term, "stage2 cache miss, computing");
        let (result, tokens_used) = compute().await?;
        self.save_stage2(item, stage1, &result, tokens_used);
        Ok((result, tokens_used, false))
    }

    /// Evicts least-recently-accessed entries until the in-memory index
    /// fits within `target_bytes` of approximate payload size.
    pub fn invalidate_by_size(&self, target_bytes: u64) {
        let total = |m: &DashMap<String, MemoryEntry<Stage1Result>>| -> u64 {
            m.iter().map(|e| e.value().approx_size as u64).sum()
        };
        while total(&self.inner.stage1_memory)
            + self.inner.stage2_memory.iter().map(|e| e.value().approx_size as u64).sum::<u64>()
            > target_bytes
        {
            let stage1_total = total(&self.inner.stage1_memory);
            let stage2_total: u64 = self.inner.stage2_memory.iter().map(|e| e.value().approx_size as u64).sum();
            if stage1_total >= stage2_total {
                if self.inner.stage1_memory.is_empty() {
                    break;
                }
                self.evict_one(&self.inner.stage1_memory);
            } else {
                if self.inner.stage2_memory.is_empty() {
                    break;
                }
                self.evict_one(&self.inner.stage2_memory);
            }
        }
    }

    /// Removes all entries, optionally scoped to one stage.
    pub fn clear(&self, stage: Option<StageDir>) {
        match stage {
            Some(StageDir::Stage1) => self.inner.stage1_memory.clear(),
            Some(StageDir::Stage2) => self.inner.stage2_memory.clear(),
            None => {
                self.inner.stage1_memory.clear();
                self.inner.stage2_memory.clear();
            }
        }
        self.inner.disk.clear(stage);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.stats.hits.load(Ordering::Relaxed),
            misses: self.inner.stats.misses.load(Ordering::Relaxed),
            writes: self.inner.stats.writes.load(Ordering::Relaxed),
            evictions: self.inner.stats.evictions.load(Ordering::Relaxed),
            tokens_saved: self.inner.stats.tokens_saved.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Comparison, PartOfSpeech};
    use std::sync::atomic::AtomicUsize;

    fn sample_item() -> VocabularyItem {
        VocabularyItem::new(1, "안녕", PartOfSpeech::Noun)
    }

    fn sample_stage1() -> Stage1Result {
        Stage1Result {
            ipa: "an.njʌŋ".into(),
            pos: PartOfSpeech::Noun,
            primary_meaning: "hello".into(),
            metaphor: ("greeting".into(), "wave".into()),
            anchor: ("hand".into(), "warm".into()),
            location: "doorway".into(),
            explanation: "a common greeting".into(),
            comparison: Comparison { vs: "안녕하세요".into(), nuance: "less formal".into() },
            homonyms: vec![],
            korean_keywords: vec!["인사".into()],
        }
    }

    #[tokio::test]
    async fn single_flight_computes_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), Duration::from_secs(3600), 100);
        let item = sample_item();
        let compute_count = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let item = item.clone();
            let count = compute_count.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute_stage1(&item, || {
                        let count = count.clone();
                        async move {
                            count.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok((sample_stage1(), 100))
                        }
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(compute_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn warm_hit_reports_zero_compute() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), Duration::from_secs(3600), 100);
        let item = sample_item();
        cache.save_stage1(&item, &sample_stage1(), 150);

        let (_, tokens, from_cache) = cache
            .get_or_compute_stage1(&item, || async { panic!("should not compute") })
            .await
            .unwrap();
        assert!(from_cache);
        assert_eq!(tokens, 150);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn disk_persists_across_cache_instances() {
        let dir = tempfile::tempdir().unwrap();
        let item = sample_item();
        {
            let cache = Cache::new(dir.path(), Duration::from_secs(3600), 100);
            cache.save_stage1(&item, &sample_stage1(), 10);
        }
        let cache2 = Cache::new(dir.path(), Duration::from_secs(3600), 100);
        let (result, tokens) = cache2.get_stage1(&item).expect("disk hit");
        assert_eq!(result, sample_stage1());
        assert_eq!(tokens, 10);
    }

    #[test]
    fn clear_empties_memory_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), Duration::from_secs(3600), 100);
        let item = sample_item();
        cache.save_stage1(&item, &sample_stage1(), 10);
        cache.clear(None);
        assert!(cache.get_stage1(&item).is_none());
    }
}
