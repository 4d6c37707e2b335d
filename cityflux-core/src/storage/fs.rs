use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::Result;
use crate::checkpoint::{CHECKPOINT_PATH, Checkpoint};
use crate::error::Error;
use crate::storage::{Storage, decode_checkpoint, encode_checkpoint};

/// Stores every partition path as a file under `root`. Writes go to a temporary sibling that is
/// synced and renamed over the target, so readers see either the old or the new record, never a
/// torn one. The directory is synced after the rename, so once `write` returns the record survives
/// a crash; a checkpoint written afterwards can never be durable without it.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: Arc<PathBuf>,
}

impl FileStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| unavailable(&root, "create storage root", &e))?;
        Ok(Self {
            root: Arc::new(root),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, partition_path: &str) -> Result<PathBuf> {
        let relative = Path::new(partition_path);
        let is_plain = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if partition_path.is_empty() || !is_plain {
            return Err(Error::SinkCorruption(format!(
                "Invalid partition path {partition_path:?}"
            )));
        }
        Ok(self.root.join(relative))
    }

    async fn write_atomic(&self, target: &Path, record: &[u8]) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| unavailable(parent, "create directory", &e))?;
        }

        let mut tmp = target.as_os_str().to_owned();
        tmp.push(format!(".tmp-{}", Uuid::new_v4().simple()));
        let tmp = PathBuf::from(tmp);

        if let Err(e) = write_synced(&tmp, record).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(unavailable(&tmp, "write", &e));
        }
        if let Err(e) = fs::rename(&tmp, target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(unavailable(target, "rename into", &e));
        }
        if let Some(parent) = target.parent() {
            sync_dir(parent)
                .await
                .map_err(|e| unavailable(parent, "sync directory", &e))?;
        }
        debug!(path = %target.display(), bytes = record.len(), "Wrote record");
        Ok(())
    }
}

async fn write_synced(path: &Path, record: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(record).await?;
    file.sync_all().await
}

/// Persists the directory entries of `dir`, i.e. a rename into it.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

fn unavailable(path: &Path, action: &str, error: &io::Error) -> Error {
    Error::SinkUnavailable(format!("Failed to {action} {}: {error}", path.display()))
}

impl Storage for FileStore {
    async fn write(&self, partition_path: &str, record: Bytes) -> Result<()> {
        let target = self.resolve(partition_path)?;
        self.write_atomic(&target, &record).await
    }

    async fn read(&self, partition_path: &str) -> Result<Option<Bytes>> {
        let target = self.resolve(partition_path)?;
        match fs::read(&target).await {
            Ok(raw) => Ok(Some(Bytes::from(raw))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(&target, "read", &e)),
        }
    }

    async fn read_checkpoint(&self) -> Result<Option<Checkpoint>> {
        match self.read(CHECKPOINT_PATH).await? {
            Some(raw) => decode_checkpoint(&raw).map(Some),
            None => Ok(None),
        }
    }

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let encoded = encode_checkpoint(checkpoint)?;
        self.write(CHECKPOINT_PATH, encoded).await
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::schema::StreamKind;

    fn count_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| {
                let path = entry.unwrap().path();
                if path.is_dir() { count_files(&path) } else { 1 }
            })
            .sum()
    }

    #[tokio::test]
    async fn test_write_is_idempotent_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();
        let path = "joined/date=2025-01-01/bucket=03/V1_0_60000.json";

        store.write(path, Bytes::from_static(b"{\"a\":1}")).await.unwrap();
        store.write(path, Bytes::from_static(b"{\"a\":1}")).await.unwrap();

        assert_eq!(
            store.read(path).await.unwrap(),
            Some(Bytes::from_static(b"{\"a\":1}"))
        );
        // no temporary files left behind either
        assert_eq!(count_files(temp_dir.path()), 1);
    }

    #[tokio::test]
    async fn test_write_replaces_longer_record() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();
        let path = "joined/date=2025-01-01/bucket=03/V1_0_60000.json";

        store
            .write(path, Bytes::from_static(b"{\"a\":1,\"b\":2}"))
            .await
            .unwrap();
        store.write(path, Bytes::from_static(b"{}")).await.unwrap();

        let on_disk = std::fs::read(temp_dir.path().join(path)).unwrap();
        assert_eq!(on_disk, b"{}");
        assert_eq!(count_files(temp_dir.path()), 1);
    }

    #[tokio::test]
    async fn test_sync_dir() {
        let temp_dir = TempDir::new().unwrap();
        sync_dir(temp_dir.path()).await.unwrap();
        #[cfg(unix)]
        assert!(sync_dir(&temp_dir.path().join("missing")).await.is_err());
    }

    #[tokio::test]
    async fn test_write_fails_when_directory_is_a_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();
        store.write("joined", Bytes::from_static(b"x")).await.unwrap();

        assert!(matches!(
            store.write("joined/V1.json", Bytes::from_static(b"{}")).await,
            Err(Error::SinkUnavailable(_))
        ));
        assert_eq!(count_files(temp_dir.path()), 1);
    }

    #[tokio::test]
    async fn test_missing_record() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();
        assert_eq!(store.read("joined/nothing.json").await.unwrap(), None);
        assert_eq!(store.read_checkpoint().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path().join("nested")).await.unwrap();

        let mut checkpoint = Checkpoint::default();
        checkpoint
            .offsets
            .entry(StreamKind::Gps)
            .or_default()
            .insert(0, 12);
        store.write_checkpoint(&checkpoint).await.unwrap();

        // a second handle on the same root sees it
        let reopened = FileStore::open(store.root()).await.unwrap();
        assert_eq!(reopened.read_checkpoint().await.unwrap(), Some(checkpoint));
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();
        store
            .write(CHECKPOINT_PATH, Bytes::from_static(b"{ not json"))
            .await
            .unwrap();
        assert!(matches!(
            store.read_checkpoint().await,
            Err(Error::SinkCorruption(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();
        for path in ["../outside.json", "/etc/passwd", ""] {
            assert!(matches!(
                store.write(path, Bytes::new()).await,
                Err(Error::SinkCorruption(_))
            ));
        }
    }
}
