// flashcard-pipeline-core: integration tests against the public API.
//
// These exercise the orchestrator, cache, and checkpoint store together
// the way `knhk-sidecar`'s `tests/integration.rs` drives its retry
// executor, circuit breaker, and batch collector through their public
// surfaces rather than internal module paths.

use flashcard_pipeline_core::api_client::{ApiClient, CompletionRequest, InstrumentedApiClient, TokenUsage};
use flashcard_pipeline_core::archive::InMemoryArchiveStore;
use flashcard_pipeline_core::rate_limiter::composite::CompositeRateLimiter;
use flashcard_pipeline_core::{
    BatchMode, Cache, CancellationToken, CheckpointStore, MetricsCollector, Orchestrator, PipelineError,
};
use flashcard_pipeline_core::models::{BatchStage, Checkpoint, PartOfSpeech, VocabularyItem};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STAGE1_JSON: &str = r#"{
    "ipa": "an.njʌŋ", "pos": "noun", "primary_meaning": "hello",
    "metaphor": ["greeting", "wave"], "anchor": ["hand", "warm"],
    "location": "doorway", "explanation": "a common greeting",
    "comparison": {"vs": "안녕하세요", "nuance": "less formal"},
    "homonyms": [], "korean_keywords": ["인사"]
}"#;

const STAGE2_TSV: &str =
    "1\t안녕 [an.njʌŋ]\t1\tScene\tgreeting context\t안녕\thello\tgreeting,casual\tcasual";

/// Counts every call it serves, regardless of which stage asked, so
/// scenario tests can assert on total upstream traffic.
struct CountingClient {
    response: String,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ApiClient for CountingClient {
    async fn complete(&self, _request: CompletionRequest<'_>) -> Result<(String, TokenUsage), PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.response.clone(), TokenUsage { input_tokens: 12, output_tokens: 34 }))
    }
}

fn instrumented(response: &str, calls: Arc<AtomicUsize>) -> Arc<InstrumentedApiClient<CountingClient>> {
    use flashcard_pipeline_core::circuit_breaker::CircuitBreaker;
    use flashcard_pipeline_core::retry::{RetryConfig, RetryExecutor};

    Arc::new(InstrumentedApiClient::new(
        CountingClient { response: response.to_string(), calls },
        CircuitBreaker::new("integration", 5, Duration::from_secs(30)),
        RetryExecutor::new(RetryConfig { max_attempts: 1, ..RetryConfig::default() }),
        MetricsCollector::new(),
    ))
}

struct Harness {
    orchestrator: Orchestrator<CountingClient>,
    stage1_calls: Arc<AtomicUsize>,
    stage2_calls: Arc<AtomicUsize>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let stage1_calls = Arc::new(AtomicUsize::new(0));
    let stage2_calls = Arc::new(AtomicUsize::new(0));

    let orchestrator = Orchestrator::new(
        Cache::new(dir.path().join("cache"), Duration::from_secs(3600), 1000),
        Arc::new(CompositeRateLimiter::new(1000, 1000, 1000, 1_000_000, Duration::from_secs(60), 100)),
        instrumented(STAGE1_JSON, stage1_calls.clone()),
        instrumented(STAGE2_TSV, stage2_calls.clone()),
        Arc::new(CheckpointStore::new(dir.path().join("checkpoints"))),
        MetricsCollector::new(),
        "model-1",
        "model-1",
        4,
        10,
        1,
    )
    .with_archive(Arc::new(InMemoryArchiveStore::default()));

    Harness { orchestrator, stage1_calls, stage2_calls, _dir: dir }
}

fn two_items() -> Vec<VocabularyItem> {
    vec![
        VocabularyItem::new(1, "안녕".to_string(), PartOfSpeech::Noun),
        VocabularyItem::new(2, "가다".to_string(), PartOfSpeech::Verb),
    ]
}

/// Scenario 1 — cold run of two items: one Stage-1 and one Stage-2 call
/// per item, results ordered by position, nothing served from cache.
#[tokio::test]
async fn cold_run_calls_upstream_once_per_stage_per_item() {
    let h = harness();
    let results = h
        .orchestrator
        .run_batch("cold", two_items(), BatchMode::Sequential, CancellationToken::new(), None, None)
        .await;

    assert_eq!(h.stage1_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.stage2_calls.load(Ordering::SeqCst), 2);

    let positions: Vec<u64> = results.iter().map(|r| r.position).collect();
    assert_eq!(positions, vec![1, 2]);
    assert!(results.iter().all(|r| r.is_success() && !r.from_cache));
}

/// Scenario 2 — warm run of the same input against the same cache
/// directory makes zero additional upstream calls and reproduces the
/// same flashcard text.
#[tokio::test]
async fn warm_run_of_same_input_makes_no_upstream_calls() {
    let h = harness();
    let first = h
        .orchestrator
        .run_batch("warm", two_items(), BatchMode::Sequential, CancellationToken::new(), None, None)
        .await;

    let second = h
        .orchestrator
        .run_batch("warm-again", two_items(), BatchMode::Sequential, CancellationToken::new(), None, None)
        .await;

    // Two calls per stage total across both runs: the warm run adds none.
    assert_eq!(h.stage1_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.stage2_calls.load(Ordering::SeqCst), 2);
    assert!(second.iter().all(|r| r.from_cache));

    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.position, b.position);
        assert_eq!(format!("{:?}", a.outcome), format!("{:?}", b.outcome));
    }
}

/// Scenario 5 — ordered collector under concurrency: results come back
/// in strict position order with no duplicates or gaps regardless of
/// how the concurrent pool interleaves completions.
#[tokio::test]
async fn concurrent_batch_preserves_strict_order_at_scale() {
    let h = harness();
    let items: Vec<_> =
        (1..=50).map(|i| VocabularyItem::new(i, format!("term-{i}"), PartOfSpeech::Noun)).collect();

    let results = h
        .orchestrator
        .run_batch("concurrent-scale", items, BatchMode::Concurrent, CancellationToken::new(), None, None)
        .await;

    let positions: Vec<u64> = results.iter().map(|r| r.position).collect();
    assert_eq!(positions, (1..=50).collect::<Vec<_>>());
}

/// Scenario 6 — checkpoint resume: a run that starts from a checkpoint
/// covering the first half of a batch makes no upstream calls for those
/// positions and still produces every position in order.
#[tokio::test]
async fn resumed_run_skips_upstream_calls_for_checkpointed_positions() {
    let h = harness();
    let items: Vec<_> =
        (1..=10).map(|i| VocabularyItem::new(i, format!("term-{i}"), PartOfSpeech::Noun)).collect();

    let checkpoint = Checkpoint {
        checkpoint_id: "resume-test".into(),
        batch_id: "resume".into(),
        timestamp: chrono::Utc::now(),
        processed_items: (1..=5).collect(),
        pending_items: (6..=10).collect(),
        stage: BatchStage::Stage2,
        metrics_snapshot: Default::default(),
    };

    let results = h
        .orchestrator
        .run_batch(
            "resume",
            items,
            BatchMode::Sequential,
            CancellationToken::new(),
            Some(&checkpoint),
            None,
        )
        .await;

    // None of the first five positions were archived, so they are
    // dropped for accounting only; only the six pending positions run.
    assert_eq!(h.stage1_calls.load(Ordering::SeqCst), 5);
    assert_eq!(h.stage2_calls.load(Ordering::SeqCst), 5);

    let positions: Vec<u64> = results.iter().map(|r| r.position).collect();
    assert_eq!(positions, vec![6, 7, 8, 9, 10]);
}
