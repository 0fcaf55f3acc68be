use fd_lock::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Errors raised by the bridge's own stores (registry and signal log)
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store at {path} is locked by another process")]
    Locked { path: String },

    #[error("Stored state is corrupt: {reason}")]
    Corrupt { reason: String },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Backend(String),
}

/// Exclusive OS-level lock on a sidecar `.lock` file.
///
/// The guard is forgotten once acquired so the lock lives exactly as long as
/// the file descriptor; dropping the `StoreLock` closes the file and releases it.
struct StoreLock {
    _file: RwLock<File>,
}

impl StoreLock {
    fn acquire(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        let mut lock = RwLock::new(file);
        match lock.try_write() {
            Ok(guard) => std::mem::forget(guard),
            Err(_) => {
                return Err(StoreError::Locked {
                    path: path.display().to_string(),
                })
            }
        }
        Ok(Self { _file: lock })
    }
}

/// A JSON document persisted with write-then-rename, owned by one process at a time
pub struct SnapshotFile {
    path: PathBuf,
    _lock: StoreLock,
}

impl SnapshotFile {
    /// Open (or prepare to create) the snapshot at `path`, taking the process lock
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let lock = StoreLock::acquire(&path.with_extension("lock"))?;
        Ok(Self { path, _lock: lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the last saved document, `None` if nothing was saved yet
    pub async fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.is_empty() {
            warn!(path = %self.path.display(), "Snapshot file is empty, starting fresh");
            return Ok(None);
        }
        serde_json::from_slice(&bytes).map(Some).map_err(|e| StoreError::Corrupt {
            reason: format!("{}: {}", self.path.display(), e),
        })
    }

    /// Durably replace the document. A crash mid-write leaves the previous version.
    pub async fn save<T: Serialize>(&self, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(value)?;
        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), bytes = json.len(), "Snapshot saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        counter: u64,
        names: Vec<String>,
    }

    #[tokio::test]
    async fn test_snapshot_save_and_load() {
        let dir = TempDir::new().unwrap();
        let snapshot = SnapshotFile::open(dir.path().join("state/registry.json")).unwrap();
        assert!(snapshot.load::<Doc>().await.unwrap().is_none());

        let doc = Doc {
            counter: 3,
            names: vec!["a".into(), "b".into()],
        };
        snapshot.save(&doc).await.unwrap();
        assert_eq!(snapshot.load::<Doc>().await.unwrap(), Some(doc));
        assert!(!dir.path().join("state/registry.tmp").exists());
    }

    #[tokio::test]
    async fn test_second_open_is_rejected_while_locked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        let first = SnapshotFile::open(&path).unwrap();
        assert!(matches!(
            SnapshotFile::open(&path),
            Err(StoreError::Locked { .. })
        ));
        drop(first);
        assert!(SnapshotFile::open(&path).is_ok());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let snapshot = SnapshotFile::open(&path).unwrap();
        assert!(matches!(
            snapshot.load::<Doc>().await,
            Err(StoreError::Corrupt { .. })
        ));
    }
}
