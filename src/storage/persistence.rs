//! Snapshot persistence for the in-memory store.

use super::{InMemoryStore, StoredRecord};
use crate::core::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

// ============================================================================
// Store Snapshot
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub records: Vec<StoredRecord>,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub record_count: usize,
    pub kind_count: usize,
}

impl StoreSnapshot {
    pub fn new(records: Vec<StoredRecord>) -> Self {
        let mut kinds: Vec<&str> = records.iter().map(|r| r.kind.as_str()).collect();
        kinds.sort_unstable();
        kinds.dedup();
        let metadata = SnapshotMetadata {
            created_at: chrono::Utc::now(),
            record_count: records.len(),
            kind_count: kinds.len(),
        };
        Self {
            version: SNAPSHOT_FORMAT_VERSION,
            records,
            metadata,
        }
    }
}

// ============================================================================
// Snapshot Manager
// ============================================================================

pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    /// Write the snapshot atomically: a temp file in the target directory is
    /// fully written and synced, then renamed over the previous snapshot.
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let parent = match self.snapshot_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let serialized = rmp_serde::to_vec(snapshot)?;
        let temp_file = NamedTempFile::new_in(&parent)?;
        {
            let mut writer = BufWriter::new(temp_file.as_file());
            writer.write_all(&serialized)?;
            writer.flush()?;
        }
        temp_file.as_file().sync_all()?;
        temp_file
            .persist(&self.snapshot_path)
            .map_err(|e| crate::core::EngineError::from(e.error))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.snapshot_path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        let snapshot: StoreSnapshot = rmp_serde::from_slice(&data)?;
        if snapshot.version != SNAPSHOT_FORMAT_VERSION {
            return Err(crate::core::EngineError::Fatal(format!(
                "unsupported snapshot version {} (expected {})",
                snapshot.version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        Ok(Some(snapshot))
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }
}

impl InMemoryStore {
    /// Persist every committed record to `path`.
    pub async fn save_snapshot<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let snapshot = StoreSnapshot::new(self.export().await);
        let count = snapshot.metadata.record_count;
        SnapshotManager::new(path).save(&snapshot)?;
        tracing::debug!(records = count, "store snapshot written");
        Ok(count)
    }

    /// Open a store from a snapshot; a missing file yields an empty store.
    pub async fn load_snapshot<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = InMemoryStore::new();
        if let Some(snapshot) = SnapshotManager::new(path).load()? {
            store.restore(snapshot.records).await;
        }
        Ok(store)
    }
}
