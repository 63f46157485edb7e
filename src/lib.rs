//! Two-stage AI flashcard generation engine: content-addressed caching,
//! sharded rate limiting with reservations, circuit breaking, retry,
//! output parsing, ordered concurrent collection, and checkpoint/resume.

#![forbid(unsafe_code)]

pub mod api_client;
pub mod archive;
pub mod cache;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod collector;
pub mod config;
pub mod error;
pub mod interfaces;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod rate_limiter;
pub mod retry;

pub use api_client::{ApiClient, BasicApiClient, CompletionRequest, HttpApiClient, InstrumentedApiClient, TokenUsage};
pub use archive::{ArchiveStore, ArchivedOutput, FileArchiveStore, InMemoryArchiveStore};
pub use cache::Cache;
pub use checkpoint::CheckpointStore;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use collector::OrderedCollector;
pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult};
pub use interfaces::{FlashcardExporter, TsvExporter, VecIngress, VocabularyIngress};
pub use metrics::MetricsCollector;
pub use orchestrator::{BatchMode, CancellationToken, Orchestrator, ProgressEvent};
pub use retry::{RetryConfig, RetryExecutor};
