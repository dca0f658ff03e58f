//! Snapshot storage.
//!
//! A snapshot is the full table image at a WAL position. Recovery loads the
//! latest snapshot and replays only the log written after it, which lets the
//! store delete every segment the snapshot covers.

use crate::error::StorageError;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

/// Snapshots kept on disk; older ones are deleted after a successful write.
const RETAINED_SNAPSHOTS: usize = 2;

const INDEX_FILE: &str = "index.json";

/// Metadata stored in the snapshot index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub snapshot_id: String,
    /// Replay resumes at this packed WAL offset.
    pub wal_offset: u64,
    /// Commits applied to the image.
    pub commits: u64,
    pub created_at: i64,
    pub size_bytes: u64,
    pub checksum: String,
}

/// Directory of table snapshots plus an index, oldest first.
pub struct SnapshotStore {
    dir: PathBuf,
    index: RwLock<Vec<SnapshotMeta>>,
}

impl SnapshotStore {
    /// Opens or creates a snapshot store at the given directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let index_path = dir.join(INDEX_FILE);
        let index = if index_path.exists() {
            serde_json::from_reader(BufReader::new(File::open(&index_path)?))?
        } else {
            Vec::new()
        };

        Ok(Self {
            dir,
            index: RwLock::new(index),
        })
    }

    /// Writes `image` as the newest snapshot.
    ///
    /// The file is synced and renamed into place before the index names it,
    /// so a crash leaves either the old or the new snapshot as the latest.
    pub fn create_snapshot<T: Serialize>(
        &self,
        wal_offset: u64,
        commits: u64,
        created_at: i64,
        image: &T,
    ) -> Result<SnapshotMeta, StorageError> {
        let data = serde_json::to_vec(image)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&data));
        let snapshot_id = format!("snap-{:016x}", wal_offset);

        write_atomically(&self.snapshot_path(&snapshot_id), &data)?;

        let meta = SnapshotMeta {
            snapshot_id,
            wal_offset,
            commits,
            created_at,
            size_bytes: data.len() as u64,
            checksum,
        };

        let expired: Vec<SnapshotMeta> = {
            let mut index = self.index.write();
            index.retain(|m| m.snapshot_id != meta.snapshot_id);
            index.push(meta.clone());
            let excess = index.len().saturating_sub(RETAINED_SNAPSHOTS);
            index.drain(..excess).collect()
        };
        self.save_index()?;
        for old in expired {
            let path = self.snapshot_path(&old.snapshot_id);
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }

        tracing::info!(
            snapshot = %meta.snapshot_id,
            wal_offset = meta.wal_offset,
            commits = meta.commits,
            bytes = meta.size_bytes,
            "snapshot written"
        );
        Ok(meta)
    }

    /// Loads and verifies the newest snapshot.
    pub fn load_latest<T: DeserializeOwned>(
        &self,
    ) -> Result<Option<(SnapshotMeta, T)>, StorageError> {
        let Some(meta) = self.latest() else {
            return Ok(None);
        };
        let path = self.snapshot_path(&meta.snapshot_id);
        if !path.exists() {
            return Err(StorageError::SnapshotNotFound(meta.snapshot_id));
        }
        let data = fs::read(&path)?;
        let actual = format!("{:08x}", crc32c::crc32c(&data));
        if actual != meta.checksum {
            return Err(StorageError::Corruption(format!(
                "snapshot {} checksum mismatch",
                meta.snapshot_id
            )));
        }
        let image = serde_json::from_slice(&data)?;
        Ok(Some((meta, image)))
    }

    pub fn latest(&self) -> Option<SnapshotMeta> {
        self.index.read().last().cloned()
    }

    pub fn list_snapshots(&self) -> Vec<SnapshotMeta> {
        self.index.read().clone()
    }

    pub fn snapshot_count(&self) -> usize {
        self.index.read().len()
    }

    fn save_index(&self) -> Result<(), StorageError> {
        let data = serde_json::to_vec_pretty(&*self.index.read())?;
        write_atomically(&self.dir.join(INDEX_FILE), &data)
    }

    fn snapshot_path(&self, snapshot_id: &str) -> PathBuf {
        self.dir.join(format!("{}.snap", snapshot_id))
    }
}

fn write_atomically(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    #[test]
    fn test_latest_snapshot_wins_and_old_ones_expire() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert!(store.load_latest::<Value>().unwrap().is_none());

        for n in 1..=3u64 {
            store
                .create_snapshot(n << 40, n * 10, 0, &json!({"round": n}))
                .unwrap();
        }

        let (meta, image) = store.load_latest::<Value>().unwrap().unwrap();
        assert_eq!(meta.commits, 30);
        assert_eq!(image, json!({"round": 3}));
        assert_eq!(store.snapshot_count(), RETAINED_SNAPSHOTS);
        let snaps = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.path().extension().map_or(false, |x| x == "snap"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(snaps, RETAINED_SNAPSHOTS);

        // The index survives a reopen.
        let reopened = SnapshotStore::open(dir.path()).unwrap();
        assert_eq!(reopened.latest(), Some(meta));
    }

    #[test]
    fn test_damaged_snapshot_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let meta = store.create_snapshot(7, 1, 0, &json!({"a": 1})).unwrap();

        fs::write(dir.path().join(format!("{}.snap", meta.snapshot_id)), b"{\"a\":2}").unwrap();
        assert!(matches!(
            store.load_latest::<Value>(),
            Err(StorageError::Corruption(_))
        ));
    }
}
