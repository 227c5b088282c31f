use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;

use crate::error::StorageError;
use crate::storage_traits::{CasStore, ContentDigest, StorageResult};

/// Filesystem-backed content-addressed store with git-style 2-char sharding.
///
/// Layout: `<root>/objects/<first 2 hex chars>/<remaining hex chars>`
///
/// Blocking filesystem calls run on the blocking pool.
#[derive(Debug, Clone)]
pub struct FsCasStore {
    objects_dir: PathBuf,
}

impl FsCasStore {
    /// Create a new `FsCasStore` rooted at `root`. Creates `root/objects/` if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let objects_dir = root.as_ref().join("objects");
        std::fs::create_dir_all(&objects_dir)?;
        Ok(Self { objects_dir })
    }

    fn blob_path(&self, digest: &ContentDigest) -> PathBuf {
        let hex = digest.as_str();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }
}

fn write_blob(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    let shard_dir = path
        .parent()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "blob path"))?;
    std::fs::create_dir_all(shard_dir)?;

    // Write to a temp file in the shard, then rename into place.
    let mut tmp = NamedTempFile::new_in(shard_dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

async fn blocking<T, F>(f: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StorageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Backend(format!("blocking task failed: {e}")))?
}

#[async_trait]
impl CasStore for FsCasStore {
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::from_bytes(data);
        let path = self.blob_path(&digest);
        let data = data.to_vec();
        blocking(move || write_blob(&path, &data).map_err(StorageError::from)).await?;
        Ok(digest)
    }

    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        let path = self.blob_path(digest);
        let digest = digest.clone();
        blocking(move || {
            std::fs::read(&path).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StorageError::NotFound {
                        digest: digest.as_str().to_string(),
                    }
                } else {
                    StorageError::Io(e)
                }
            })
        })
        .await
    }

    async fn exists(&self, digest: &ContentDigest) -> StorageResult<bool> {
        let path = self.blob_path(digest);
        blocking(move || Ok(path.exists())).await
    }

    async fn delete(&self, digest: &ContentDigest) -> StorageResult<()> {
        let path = self.blob_path(digest);
        blocking(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsCasStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCasStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn blob_roundtrip() {
        let (_dir, store) = make_store();
        let data = b"hello world";
        let digest = store.put(data).await.unwrap();
        assert_eq!(digest, ContentDigest::from_bytes(data));
        let got = store.get(&digest).await.unwrap();
        assert_eq!(got, data);
    }

    #[tokio::test]
    async fn dedupe_keeps_single_file() {
        let (dir, store) = make_store();
        let d1 = store.put(b"duplicate me").await.unwrap();
        let d2 = store.put(b"duplicate me").await.unwrap();
        assert_eq!(d1, d2);

        let shard = dir.path().join("objects").join(&d1.as_str()[..2]);
        let count = std::fs::read_dir(shard).unwrap().count();
        assert_eq!(count, 1, "no temp files left behind");
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let (_dir, store) = make_store();
        let digest = ContentDigest::from_bytes(b"never stored");
        assert!(!store.exists(&digest).await.unwrap());
        let err = store.get(&digest).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, store) = make_store();
        let digest = store.put(b"short lived").await.unwrap();
        store.delete(&digest).await.unwrap();
        store.delete(&digest).await.unwrap();
        assert!(!store.exists(&digest).await.unwrap());
    }

    #[tokio::test]
    async fn layout_is_sharded() {
        let (dir, store) = make_store();
        let digest = store.put(b"layout").await.unwrap();
        let hex = digest.as_str();
        let expected = dir
            .path()
            .join("objects")
            .join(&hex[..2])
            .join(&hex[2..]);
        assert!(expected.is_file());
    }
}
