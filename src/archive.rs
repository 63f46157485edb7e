//! Output archiving (C5's durable side-store): every successful parse is
//! written keyed by `(task_id, vocabulary_id, stage)` so a later reader
//! can fetch "the most recent valid archived output" — used by checkpoint
//! resume to avoid re-calling the API for positions a crashed run already
//! completed, mirroring `database/database_manager.py`'s output-archive
//! table and `export_service.py`'s read path.

use crate::error::PipelineError;
use crate::models::BatchStage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedOutput {
    pub task_id: String,
    pub vocabulary_id: u64,
    pub stage: BatchStage,
    pub raw_text: String,
    pub parsed_payload: serde_json::Value,
    pub token_count: u64,
    pub latency_ms: u64,
    pub archived_at: DateTime<Utc>,
}

fn key_of(task_id: &str, vocabulary_id: u64, stage: BatchStage) -> (String, u64, BatchStage) {
    (task_id.to_string(), vocabulary_id, stage)
}

/// Seam for the archival store. A file-backed default implementation
/// ships below; callers may substitute a database-backed one without
/// touching the parser or orchestrator.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn archive(&self, output: ArchivedOutput) -> Result<(), PipelineError>;
    async fn latest(&self, task_id: &str, vocabulary_id: u64, stage: BatchStage) -> Option<ArchivedOutput>;
}

/// File-backed archive: one JSON file per `(task_id, vocabulary_id, stage)`,
/// overwritten on each archive call so `latest()` is always the most
/// recent successful parse — archival failures are logged and swallowed,
/// same non-correctness-affecting posture as the cache (`spec.md` §4.1).
pub struct FileArchiveStore {
    root: PathBuf,
}

impl FileArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, task_id: &str, vocabulary_id: u64, stage: BatchStage) -> PathBuf {
        let stage_name = match stage {
            BatchStage::Stage1 => "stage1",
            BatchStage::Stage2 => "stage2",
            BatchStage::Completed => "completed",
        };
        self.root.join(task_id).join(stage_name).join(format!("{vocabulary_id}.json"))
    }
}

#[async_trait]
impl ArchiveStore for FileArchiveStore {
    async fn archive(&self, output: ArchivedOutput) -> Result<(), PipelineError> {
        let path = self.path_for(&output.task_id, output.vocabulary_id, output.stage);
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(error = %e, "failed to create archive directory, continuing without archival");
                return Ok(());
            }
        }
        match serde_json::to_vec_pretty(&output) {
            Ok(bytes) => {
                let tmp = path.with_extension("json.tmp");
                if std::fs::write(&tmp, &bytes).and_then(|_| std::fs::rename(&tmp, &path)).is_err() {
                    warn!(path = %path.display(), "failed to persist archived output");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize archived output"),
        }
        Ok(())
    }

    async fn latest(&self, task_id: &str, vocabulary_id: u64, stage: BatchStage) -> Option<ArchivedOutput> {
        let path = self.path_for(task_id, vocabulary_id, stage);
        let bytes = std::fs::read(&path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

/// In-memory archive used by tests and single-process short-lived runs.
#[derive(Default)]
pub struct InMemoryArchiveStore {
    entries: Mutex<BTreeMap<(String, u64, BatchStage), ArchivedOutput>>,
}

#[async_trait]
impl ArchiveStore for InMemoryArchiveStore {
    async fn archive(&self, output: ArchivedOutput) -> Result<(), PipelineError> {
        let key = key_of(&output.task_id, output.vocabulary_id, output.stage);
        self.entries.lock().expect("archive mutex poisoned").insert(key, output);
        Ok(())
    }

    async fn latest(&self, task_id: &str, vocabulary_id: u64, stage: BatchStage) -> Option<ArchivedOutput> {
        let key = key_of(task_id, vocabulary_id, stage);
        self.entries.lock().expect("archive mutex poisoned").get(&key).cloned()
    }
}
