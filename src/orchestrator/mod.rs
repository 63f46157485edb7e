//! Batch orchestrator (C8): pulls vocabulary items through the two-stage
//! pipeline in one of three modes, feeding the ordered collector and
//! persisting checkpoints along the way.

mod cancellation;
mod prompts;
mod tuner;

pub use cancellation::CancellationToken;
pub use tuner::BatchSizeTuner;

use crate::api_client::{ApiClient, CompletionRequest, InstrumentedApiClient};
use crate::archive::{ArchiveStore, ArchivedOutput, InMemoryArchiveStore};
use crate::cache::Cache;
use crate::checkpoint::CheckpointStore;
use crate::collector::OrderedCollector;
use crate::error::PipelineError;
use crate::metrics::MetricsCollector;
use crate::models::{BatchStage, Checkpoint, ProcessingOutcome, ProcessingResult, VocabularyItem};
use crate::rate_limiter::composite::{CompositeRateLimiter, Stage};
use crate::rate_limiter::quota::{QuotaLimiter, UsageRecord};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    Sequential,
    Concurrent,
    Batched,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent {
    pub completed: usize,
    pub total: usize,
    pub in_progress: usize,
}

pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Rough per-item token estimate used to gate the composite limiter's
/// cost tier before the real usage is known.
const ESTIMATED_TOKENS_PER_CALL: u32 = 800;
const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_TOKENS: u32 = 2000;

pub struct Orchestrator<C: ApiClient> {
    cache: Cache,
    rate_limiter: Arc<CompositeRateLimiter>,
    stage1_client: Arc<InstrumentedApiClient<C>>,
    stage2_client: Arc<InstrumentedApiClient<C>>,
    checkpoint_store: Arc<CheckpointStore>,
    archive: Arc<dyn ArchiveStore>,
    quota: Option<Arc<QuotaLimiter>>,
    metrics: MetricsCollector,
    stage1_model: String,
    stage2_model: String,
    max_concurrent: usize,
    batch_size: usize,
    checkpoint_interval: usize,
    temperature: f32,
    max_tokens: u32,
}

impl<C: ApiClient + 'static> Orchestrator<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Cache,
        rate_limiter: Arc<CompositeRateLimiter>,
        stage1_client: Arc<InstrumentedApiClient<C>>,
        stage2_client: Arc<InstrumentedApiClient<C>>,
        checkpoint_store: Arc<CheckpointStore>,
        metrics: MetricsCollector,
        stage1_model: impl Into<String>,
        stage2_model: impl Into<String>,
        max_concurrent: usize,
        batch_size: usize,
        checkpoint_interval: usize,
    ) -> Self {
        Self {
            cache,
            rate_limiter,
            stage1_client,
            stage2_client,
            checkpoint_store,
            archive: Arc::new(InMemoryArchiveStore::default()),
            quota: None,
            metrics,
            stage1_model: stage1_model.into(),
            stage2_model: stage2_model.into(),
            max_concurrent,
            batch_size,
            checkpoint_interval,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    /// Overrides the default sampling temperature/max-tokens sent with
    /// every chat-completions call.
    pub fn with_generation_params(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// Substitutes the archive store used to durably record successful
    /// parses and to pre-fill checkpoint-resumed positions. Defaults to an
    /// in-memory store so callers that don't need cross-process resume
    /// don't have to wire one up.
    pub fn with_archive(mut self, archive: Arc<dyn ArchiveStore>) -> Self {
        self.archive = archive;
        self
    }

    /// Installs a daily-token/monthly-USD quota gate. Checked before every
    /// Stage-1/Stage-2 call is granted and updated with real usage after
    /// each call completes. Absent by default — without one, the pipeline
    /// is bounded only by the composite rate limiter's estimated-token tier.
    pub fn with_quota_limiter(mut self, quota: Arc<QuotaLimiter>) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Runs a full batch to completion and returns results in ascending
    /// position order. `resume_from` supplies positions already known to
    /// be processed (e.g. read back from a checkpoint) so they are
    /// skipped entirely — no API calls, no cache lookups.
    pub async fn run_batch(
        &self,
        batch_id: &str,
        items: Vec<VocabularyItem>,
        mode: BatchMode,
        cancellation: CancellationToken,
        resume_from: Option<&Checkpoint>,
        on_progress: Option<ProgressCallback>,
    ) -> Vec<ProcessingResult> {
        let in_progress = Arc::new(AtomicUsize::new(0));
        let completed_since_checkpoint = Arc::new(AtomicUsize::new(0));

        let (already_done, pending_items): (Vec<_>, Vec<_>) = match resume_from {
            Some(checkpoint) => {
                let processed: std::collections::HashSet<u64> =
                    checkpoint.processed_items.iter().copied().collect();
                items.into_iter().partition(|item| processed.contains(&item.position))
            }
            None => (Vec::new(), items),
        };

        // Checkpointed positions populate the collector as pre-filled
        // results when an archived output is still available; positions
        // with no archive hit are dropped silently and only counted for
        // accounting (they never reach `collector`).
        let mut prefilled = Vec::with_capacity(already_done.len());
        for item in &already_done {
            match self.archive.latest(batch_id, item.position, BatchStage::Stage2).await {
                Some(archived) => match serde_json::from_value::<crate::models::Stage2Result>(archived.parsed_payload) {
                    Ok(stage2) => prefilled.push(ProcessingResult {
                        position: item.position,
                        term: item.term.clone(),
                        outcome: ProcessingOutcome::Success { flashcard_tsv: stage2.to_tsv() },
                        from_cache: true,
                        processing_time_ms: 0,
                    }),
                    Err(e) => warn!(position = item.position, error = %e, "archived output for checkpointed position was malformed"),
                },
                None => debug!(position = item.position, "no archived output for checkpointed position, counting for accounting only"),
            }
        }
        if !already_done.is_empty() {
            info!(
                count = already_done.len(),
                prefilled = prefilled.len(),
                "skipping positions already recorded in checkpoint"
            );
        }

        let total = pending_items.len() + prefilled.len();
        let all_positions: Arc<Vec<u64>> = Arc::new(
            pending_items.iter().map(|i| i.position).chain(prefilled.iter().map(|r| r.position)).collect(),
        );
        let collector = Arc::new(OrderedCollector::new(total));
        for result in prefilled {
            collector.add_result(result);
        }

        match mode {
            BatchMode::Sequential => {
                for item in pending_items {
                    if cancellation.is_cancelled() {
                        warn!("batch cancelled, stopping sequential processing");
                        break;
                    }
                    self.process_one(
                        &item,
                        batch_id,
                        &collector,
                        &in_progress,
                        &completed_since_checkpoint,
                        total,
                        &all_positions,
                        &on_progress,
                    )
                    .await;
                }
            }
            BatchMode::Concurrent => {
                self.run_pool(
                    pending_items,
                    self.max_concurrent,
                    batch_id,
                    &collector,
                    &in_progress,
                    &completed_since_checkpoint,
                    total,
                    &all_positions,
                    &on_progress,
                    &cancellation,
                )
                .await;
            }
            BatchMode::Batched => {
                for chunk in pending_items.chunks(self.batch_size.max(1)) {
                    if cancellation.is_cancelled() {
                        warn!("batch cancelled, stopping batched processing");
                        break;
                    }
                    self.run_pool(
                        chunk.to_vec(),
                        self.max_concurrent,
                        batch_id,
                        &collector,
                        &in_progress,
                        &completed_since_checkpoint,
                        total,
                        &all_positions,
                        &on_progress,
                        &cancellation,
                    )
                    .await;
                }
            }
        }

        collector.get_ordered_results()
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_pool(
        &self,
        items: Vec<VocabularyItem>,
        concurrency: usize,
        batch_id: &str,
        collector: &Arc<OrderedCollector>,
        in_progress: &Arc<AtomicUsize>,
        completed_since_checkpoint: &Arc<AtomicUsize>,
        total: usize,
        all_positions: &Arc<Vec<u64>>,
        on_progress: &Option<ProgressCallback>,
        cancellation: &CancellationToken,
    ) {
        stream::iter(items)
            .for_each_concurrent(concurrency.max(1), |item| async move {
                if cancellation.is_cancelled() {
                    return;
                }
                self.process_one(
                    &item,
                    batch_id,
                    collector,
                    in_progress,
                    completed_since_checkpoint,
                    total,
                    all_positions,
                    on_progress,
                )
                .await;
            })
            .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_one(
        &self,
        item: &VocabularyItem,
        batch_id: &str,
        collector: &Arc<OrderedCollector>,
        in_progress: &Arc<AtomicUsize>,
        completed_since_checkpoint: &Arc<AtomicUsize>,
        total: usize,
        all_positions: &Arc<Vec<u64>>,
        on_progress: &Option<ProgressCallback>,
    ) {
        in_progress.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        let (outcome, from_cache) = match self.process_item_inner(batch_id, item).await {
            Ok((tsv, from_cache)) => (ProcessingOutcome::Success { flashcard_tsv: tsv }, from_cache),
            Err(e) => {
                warn!(term = %item.term, error = %e, "item processing failed");
                (ProcessingOutcome::Failure { error: e.to_string() }, false)
            }
        };

        let result = ProcessingResult {
            position: item.position,
            term: item.term.clone(),
            outcome,
            from_cache,
            processing_time_ms: started.elapsed().as_millis() as u64,
        };

        collector.add_result(result);
        in_progress.fetch_sub(1, Ordering::SeqCst);
        self.metrics.record_latency(started.elapsed().as_millis() as u64);
        if from_cache {
            self.metrics.record_cache_hit();
        }

        let completed = collector.len();
        if let Some(callback) = on_progress {
            callback(ProgressEvent {
                completed,
                total,
                in_progress: in_progress.load(Ordering::SeqCst),
            });
        }

        let since_checkpoint = completed_since_checkpoint.fetch_add(1, Ordering::SeqCst) + 1;
        if since_checkpoint % self.checkpoint_interval.max(1) == 0 {
            self.save_checkpoint(batch_id, collector, all_positions);
        }
    }

    fn save_checkpoint(&self, batch_id: &str, collector: &Arc<OrderedCollector>, all_positions: &[u64]) {
        let results = collector.get_ordered_results();
        let processed_items: Vec<u64> = results.iter().map(|r| r.position).collect();
        let processed_set: std::collections::HashSet<u64> = processed_items.iter().copied().collect();
        let pending_items: Vec<u64> =
            all_positions.iter().copied().filter(|p| !processed_set.contains(p)).collect();

        let checkpoint = Checkpoint {
            checkpoint_id: uuid::Uuid::new_v4().to_string(),
            batch_id: batch_id.to_string(),
            timestamp: chrono::Utc::now(),
            processed_items,
            pending_items,
            stage: BatchStage::Stage2,
            metrics_snapshot: self.metrics.snapshot(),
        };

        if let Err(e) = self.checkpoint_store.save(&checkpoint) {
            warn!(error = %e, "failed to persist checkpoint");
        }
    }

    /// Combined-cache short-circuit, then the independently-cached
    /// Stage-1 → Stage-2 calls.
    async fn process_item_inner(&self, batch_id: &str, item: &VocabularyItem) -> Result<(String, bool), PipelineError> {
        if let Some((stage1, _)) = self.cache.get_stage1(item) {
            if let Some((stage2, _)) = self.cache.get_stage2(item, &stage1) {
                return Ok((stage2.to_tsv(), true));
            }
        }

        let (stage1, _tokens1, from_cache1) = self
            .cache
            .get_or_compute_stage1(item, || self.call_stage1(batch_id, item))
            .await?;

        let (stage2, _tokens2, from_cache2) = self
            .cache
            .get_or_compute_stage2(item, &stage1, || self.call_stage2(batch_id, item, &stage1))
            .await?;

        Ok((stage2.to_tsv(), from_cache1 && from_cache2))
    }

    async fn call_stage1(
        &self,
        batch_id: &str,
        item: &VocabularyItem,
    ) -> Result<(crate::models::Stage1Result, u64), PipelineError> {
        if let Some(quota) = &self.quota {
            quota.check_before_grant().await?;
        }
        self.rate_limiter
            .acquire_for_stage(&item.term, Stage::Stage1, ESTIMATED_TOKENS_PER_CALL)?;

        let started = Instant::now();
        let (raw, usage) = self
            .stage1_client
            .complete(CompletionRequest {
                model: &self.stage1_model,
                system_prompt: prompts::STAGE1_SYSTEM_PROMPT,
                user_prompt: &prompts::stage1_user_prompt(item),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            })
            .await?;

        let result = crate::parser::stage1::parse(&raw)?;

        if let Some(quota) = &self.quota {
            self.record_quota_usage(quota, &self.stage1_model, &usage).await;
        }

        let archived = ArchivedOutput {
            task_id: batch_id.to_string(),
            vocabulary_id: item.position,
            stage: BatchStage::Stage1,
            raw_text: raw,
            parsed_payload: serde_json::to_value(&result).unwrap_or(serde_json::Value::Null),
            token_count: usage.total(),
            latency_ms: started.elapsed().as_millis() as u64,
            archived_at: chrono::Utc::now(),
        };
        if let Err(e) = self.archive.archive(archived).await {
            warn!(error = %e, "failed to archive stage-1 output");
        }

        Ok((result, usage.total()))
    }

    async fn call_stage2(
        &self,
        batch_id: &str,
        item: &VocabularyItem,
        stage1: &crate::models::Stage1Result,
    ) -> Result<(crate::models::Stage2Result, u64), PipelineError> {
        if let Some(quota) = &self.quota {
            quota.check_before_grant().await?;
        }
        self.rate_limiter
            .acquire_for_stage(&item.term, Stage::Stage2, ESTIMATED_TOKENS_PER_CALL)?;

        let started = Instant::now();
        let (raw, usage) = self
            .stage2_client
            .complete(CompletionRequest {
                model: &self.stage2_model,
                system_prompt: prompts::STAGE2_SYSTEM_PROMPT,
                user_prompt: &prompts::stage2_user_prompt(item, stage1),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            })
            .await?;

        let result = crate::parser::stage2::parse(&raw)?;

        if let Some(quota) = &self.quota {
            self.record_quota_usage(quota, &self.stage2_model, &usage).await;
        }

        let archived = ArchivedOutput {
            task_id: batch_id.to_string(),
            vocabulary_id: item.position,
            stage: BatchStage::Stage2,
            raw_text: raw,
            parsed_payload: serde_json::to_value(&result).unwrap_or(serde_json::Value::Null),
            token_count: usage.total(),
            latency_ms: started.elapsed().as_millis() as u64,
            archived_at: chrono::Utc::now(),
        };
        if let Err(e) = self.archive.archive(archived).await {
            warn!(error = %e, "failed to archive stage-2 output");
        }

        Ok((result, usage.total()))
    }

    /// Feeds real post-call usage into the quota tracker so the next
    /// `check_before_grant` sees it. Failures are logged, not propagated —
    /// a tracker write failure shouldn't fail an already-completed call.
    async fn record_quota_usage(&self, quota: &Arc<QuotaLimiter>, model: &str, usage: &crate::api_client::TokenUsage) {
        let pricing = crate::rate_limiter::pricing::PricingTable::default();
        let cost_nano_usd = pricing.cost_nano_usd(model, usage.input_tokens, usage.output_tokens);
        let record = UsageRecord {
            request_id: uuid::Uuid::new_v4().to_string(),
            model: model.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost_nano_usd,
            status: "success".to_string(),
            timestamp: chrono::Utc::now(),
        };
        if let Err(e) = quota.record_usage(record).await {
            warn!(error = %e, "failed to record usage against quota tracker");
        }
    }
}
