//! Local filesystem storage implementation.
//!
//! Writes go through a temporary sibling file that is synced and then renamed
//! over the destination, which makes every write atomic on POSIX filesystems.
//! The parent directory is synced after the rename so the new entry survives
//! a power loss.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::error::{Result, StorageError};
use crate::path::ArtifactPath;
use crate::traits::ArtifactStorage;

const TMP_SUFFIX: &str = ".tmp";

/// Local filesystem storage backend.
///
/// Stores artifacts in a directory tree matching the `ArtifactPath` format:
/// `base_path/area/section/name`
#[derive(Debug)]
pub struct LocalStorage {
    base_path: PathBuf,
    tmp_counter: AtomicU64,
}

impl LocalStorage {
    /// Create a new local storage backend.
    ///
    /// Directories are created lazily on first write.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            tmp_counter: AtomicU64::new(0),
        }
    }

    /// Convert an artifact path to a filesystem path.
    fn to_fs_path(&self, path: &ArtifactPath) -> PathBuf {
        path.to_path_buf(&self.base_path)
    }

    /// Ensure parent directories exist for a path.
    async fn ensure_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Unique temporary sibling for an in-flight write.
    fn tmp_path_for(&self, path: &Path) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        path.with_file_name(format!(
            "{}.{}-{}{}",
            file_name,
            std::process::id(),
            n,
            TMP_SUFFIX
        ))
    }
}

/// Sync a directory so renames inside it are durable.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl ArtifactStorage for LocalStorage {
    #[instrument(skip(self, data), fields(path = %path, size = data.len()))]
    async fn write(&self, path: &ArtifactPath, data: Bytes) -> Result<()> {
        let fs_path = self.to_fs_path(path);
        self.ensure_parent(&fs_path).await?;

        let tmp_path = self.tmp_path_for(&fs_path);
        debug!("Writing {} bytes to {:?} via {:?}", data.len(), fs_path, tmp_path);

        let write_result = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp_path, &fs_path).await?;
            match fs_path.parent() {
                Some(parent) => sync_dir(parent).await,
                None => Ok(()),
            }
        }
        .await;

        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(match e.kind() {
                std::io::ErrorKind::PermissionDenied => {
                    StorageError::PermissionDenied(path.to_string())
                }
                _ => e.into(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn read(&self, path: &ArtifactPath) -> Result<Bytes> {
        let fs_path = self.to_fs_path(path);
        debug!("Reading from {:?}", fs_path);

        match fs::read(&fs_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn exists(&self, path: &ArtifactPath) -> Result<bool> {
        let fs_path = self.to_fs_path(path);
        Ok(fs::try_exists(&fs_path).await?)
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn delete(&self, path: &ArtifactPath) -> Result<()> {
        let fs_path = self.to_fs_path(path);
        debug!("Deleting {:?}", fs_path);

        match fs::remove_file(&fs_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(prefix = %prefix))]
    async fn list(&self, prefix: &ArtifactPath) -> Result<Vec<ArtifactPath>> {
        let fs_prefix = self.to_fs_path(prefix);
        let mut results = Vec::new();

        let metadata = match fs::metadata(&fs_prefix).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(results),
            Err(e) => return Err(e.into()),
        };

        if metadata.is_file() {
            results.push(prefix.clone());
            return Ok(results);
        }

        self.list_recursive(&fs_prefix, &mut results).await?;
        results.sort_by_key(|p| p.to_string());

        Ok(results)
    }

    #[instrument(skip(self), fields(from = %from, to = %to))]
    async fn rename(&self, from: &ArtifactPath, to: &ArtifactPath) -> Result<()> {
        let from_path = self.to_fs_path(from);
        let to_path = self.to_fs_path(to);

        if !fs::try_exists(&from_path).await? {
            return Err(StorageError::NotFound(from.to_string()));
        }

        self.ensure_parent(&to_path).await?;
        debug!("Renaming {:?} to {:?}", from_path, to_path);
        fs::rename(&from_path, &to_path).await?;
        if let Some(parent) = to_path.parent() {
            sync_dir(parent).await?;
        }
        Ok(())
    }
}

impl LocalStorage {
    /// Recursively list files in a directory, skipping in-flight temporaries.
    #[async_recursion::async_recursion]
    async fn list_recursive(&self, dir: &Path, results: &mut Vec<ArtifactPath>) -> Result<()> {
        let mut entries = fs::read_dir(dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = entry.metadata().await?;

            if metadata.is_dir() {
                self.list_recursive(&path, results).await?;
            } else if metadata.is_file() {
                let relative = path
                    .strip_prefix(&self.base_path)
                    .map_err(|_| StorageError::InvalidPath(path.display().to_string()))?;
                let path_str = relative.to_string_lossy().replace('\\', "/");
                if path_str.ends_with(TMP_SUFFIX) {
                    continue;
                }

                if let Some(artifact_path) = ArtifactPath::parse(&path_str) {
                    results.push(artifact_path);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ArtifactArea;
    use tempfile::TempDir;

    async fn create_test_storage() -> (LocalStorage, TempDir) {
        let temp = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp.path());
        (storage, temp)
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (storage, _temp) = create_test_storage().await;

        let path = ArtifactPath::segment(ArtifactArea::Firestore, "00000001.ndjson");
        let data = Bytes::from("hello world");

        storage.write(&path, data.clone()).await.unwrap();
        let read = storage.read(&path).await.unwrap();

        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn test_write_leaves_no_temporaries() {
        let (storage, temp) = create_test_storage().await;

        let path = ArtifactPath::run_file(".checkpoint.json");
        storage.write(&path, Bytes::from("v1")).await.unwrap();
        storage.write(&path, Bytes::from("v2")).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![".checkpoint.json".to_string()]);
        assert_eq!(storage.read(&path).await.unwrap(), Bytes::from("v2"));
    }

    #[tokio::test]
    async fn test_read_not_found() {
        let (storage, _temp) = create_test_storage().await;

        let path = ArtifactPath::segment(ArtifactArea::Auth, "missing.ndjson");
        let result = storage.read(&path).await;

        assert!(matches!(result.unwrap_err(), StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_exists() {
        let (storage, _temp) = create_test_storage().await;

        let path = ArtifactPath::area_file(ArtifactArea::Auth, "records.ndjson");

        assert!(!storage.exists(&path).await.unwrap());

        storage.write(&path, Bytes::from("data")).await.unwrap();

        assert!(storage.exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        let (storage, _temp) = create_test_storage().await;

        let path = ArtifactPath::segment(ArtifactArea::Auth, "00000001.ndjson");
        storage.write(&path, Bytes::from("data")).await.unwrap();

        storage.delete(&path).await.unwrap();
        assert!(!storage.exists(&path).await.unwrap());

        // Should not error on non-existent file
        storage.delete(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_rename() {
        let (storage, _temp) = create_test_storage().await;

        let from = ArtifactPath::run_file(".checkpoint.json");
        let to = ArtifactPath::run_file(".checkpoint.completed.json");

        storage.write(&from, Bytes::from("{}")).await.unwrap();
        storage.rename(&from, &to).await.unwrap();

        assert!(!storage.exists(&from).await.unwrap());
        assert_eq!(storage.read(&to).await.unwrap(), Bytes::from("{}"));
    }

    #[tokio::test]
    async fn test_rename_not_found() {
        let (storage, _temp) = create_test_storage().await;
        let from = ArtifactPath::run_file("missing.json");
        let to = ArtifactPath::run_file("new.json");

        let result = storage.rename(&from, &to).await;
        assert!(matches!(result.unwrap_err(), StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let (storage, _temp) = create_test_storage().await;

        for name in ["00000003.ndjson", "00000001.ndjson", "00000002.ndjson"] {
            storage
                .write(&ArtifactPath::segment(ArtifactArea::Auth, name), Bytes::from("x"))
                .await
                .unwrap();
        }
        storage
            .write(
                &ArtifactPath::segment(ArtifactArea::Firestore, "00000001.ndjson"),
                Bytes::from("y"),
            )
            .await
            .unwrap();

        let prefix = ArtifactPath::new(ArtifactArea::Auth).with_section("segments");
        let results = storage.list(&prefix).await.unwrap();

        let names: Vec<&str> = results.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["00000001.ndjson", "00000002.ndjson", "00000003.ndjson"]
        );
    }

    #[tokio::test]
    async fn test_list_missing_prefix_is_empty() {
        let (storage, _temp) = create_test_storage().await;
        let prefix = ArtifactPath::new(ArtifactArea::Storage).with_section("files");
        assert!(storage.list(&prefix).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_into_new_directories_is_durable_and_readable() {
        let (storage, temp) = create_test_storage().await;

        let path = ArtifactPath::attachment(ArtifactArea::Storage, "3f2a9c1e-images_logo.png");
        storage.write(&path, Bytes::from("png")).await.unwrap();
        assert_eq!(storage.read(&path).await.unwrap(), Bytes::from("png"));

        // The directory that received the rename can itself be synced.
        sync_dir(&temp.path().join("storage/files")).await.unwrap();
    }
}
