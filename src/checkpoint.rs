//! Checkpoint store (C9): durable batch-state snapshots for resume.
//!
//! Keyed exclusively by `checkpoint_<batch_id>`; there is no other way to
//! resolve "latest" than through the `latest_checkpoint` pointer, written
//! transactionally alongside every `save`.

use crate::error::PipelineError;
use crate::models::Checkpoint;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const LATEST_POINTER_FILE: &str = "latest_checkpoint";

fn key_for(batch_id: &str) -> String {
    format!("checkpoint_{batch_id}")
}

/// File-backed checkpoint store. One JSON file per batch plus a
/// singleton pointer file naming the most recently saved batch id.
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, batch_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", key_for(batch_id)))
    }

    fn pointer_path(&self) -> PathBuf {
        self.root.join(LATEST_POINTER_FILE)
    }

    /// Persists a checkpoint and updates the `latest_checkpoint` pointer
    /// to its batch id. Write-temp-then-rename for both files so a crash
    /// mid-write never leaves a half-written record.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), PipelineError> {
        std::fs::create_dir_all(&self.root)
            .map_err(|e| PipelineError::Database(format!("failed to create checkpoint dir: {e}")))?;

        let path = self.path_for(&checkpoint.batch_id);
        let bytes = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| PipelineError::Database(format!("failed to serialize checkpoint: {e}")))?;
        write_atomic(&path, &bytes)?;
        write_atomic(&self.pointer_path(), checkpoint.batch_id.as_bytes())?;

        info!(batch_id = %checkpoint.batch_id, checkpoint_id = %checkpoint.checkpoint_id, "checkpoint saved");
        Ok(())
    }

    /// Loads the checkpoint for a specific batch, if present.
    pub fn load(&self, batch_id: &str) -> Option<Checkpoint> {
        let path = self.path_for(batch_id);
        let bytes = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "checkpoint file corrupt");
                None
            }
        }
    }

    /// Resolves the batch id of the most recently saved checkpoint via
    /// the pointer file — never by scanning the directory.
    pub fn latest_batch_id(&self) -> Option<String> {
        let bytes = std::fs::read(self.pointer_path()).ok()?;
        String::from_utf8(bytes).ok()
    }

    /// Convenience combining `latest_batch_id` + `load`.
    pub fn latest(&self) -> Option<Checkpoint> {
        self.latest_batch_id().and_then(|id| self.load(&id))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| PipelineError::Database(format!("failed to create checkpoint dir: {e}")))?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes).map_err(|e| PipelineError::Database(format!("failed to write checkpoint: {e}")))?;
    std::fs::rename(&tmp, path).map_err(|e| PipelineError::Database(format!("failed to finalize checkpoint: {e}")))?;
    Ok(())
}
