//! Disk persistence for the content-addressed cache: two directory trees
//! (`stage1/`, `stage2/`), 256 two-hex-char shard subdirectories,
//! `<key>.json` records.

use crate::models::shard_prefix;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageDir {
    Stage1,
    Stage2,
}

impl StageDir {
    fn dir_name(&self) -> &'static str {
        match self {
            StageDir::Stage1 => "stage1",
            StageDir::Stage2 => "stage2",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DiskRecord<T> {
    pub original_input: serde_json::Value,
    pub payload: T,
    pub tokens_used: u64,
    pub created_at: DateTime<Utc>,
}

pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, stage: StageDir, key: &str) -> PathBuf {
        self.root
            .join(stage.dir_name())
            .join(shard_prefix(key))
            .join(format!("{key}.json"))
    }

    /// Reads a record. Any I/O or deserialization error behaves as a miss.
    pub fn read<T: DeserializeOwned>(&self, stage: StageDir, key: &str) -> Option<DiskRecord<T>> {
        let path = self.path_for(stage, key);
        let bytes = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cache record corrupt, treating as miss");
                None
            }
        }
    }

    /// Writes a record via write-temp-then-rename so concurrent readers
    /// never observe a partial write. Failures are logged and swallowed —
    /// the cache is never allowed to affect correctness.
    pub fn write<T: Serialize>(&self, stage: StageDir, key: &str, record: &DiskRecord<T>) {
        let path = self.path_for(stage, key);
        if let Err(e) = self.write_inner(&path, record) {
            warn!(path = %path.display(), error = %e, "failed to persist cache entry, continuing without it");
        }
    }

    fn write_inner<T: Serialize>(&self, path: &Path, record: &DiskRecord<T>) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(record)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, bytes)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn remove(&self, stage: StageDir, key: &str) {
        let path = self.path_for(stage, key);
        let _ = std::fs::remove_file(path);
    }

    /// Removes every entry under one or both stage trees.
    pub fn clear(&self, stage: Option<StageDir>) {
        let dirs = match stage {
            Some(s) => vec![self.root.join(s.dir_name())],
            None => vec![
                self.root.join(StageDir::Stage1.dir_name()),
                self.root.join(StageDir::Stage2.dir_name()),
            ],
        };
        for dir in dirs {
            let _ = std::fs::remove_dir_all(&dir);
        }
    }
}
