//! Core storage trait definitions.
//!
//! The `ArtifactStorage` trait is the single interface through which the
//! exporter persists its checkpoint, batch segments and downloaded files.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::path::ArtifactPath;

/// Storage trait for export artifacts.
///
/// # Atomicity
///
/// `write` must be atomic from the perspective of any reader: a concurrent
/// or crash-interrupted read observes either the previous or the new
/// contents, never a partial write.
///
/// # Thread Safety
///
/// All implementations must be `Send + Sync` to allow concurrent access
/// from multiple async tasks.
#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    /// Atomically write data to the specified path.
    ///
    /// Creates parent directories as needed and replaces existing data.
    async fn write(&self, path: &ArtifactPath, data: Bytes) -> Result<()>;

    /// Read data from the specified path.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the path does not exist.
    async fn read(&self, path: &ArtifactPath) -> Result<Bytes>;

    /// Check if a path exists.
    async fn exists(&self, path: &ArtifactPath) -> Result<bool>;

    /// Delete data at the specified path.
    ///
    /// No-op if the path does not exist (idempotent).
    async fn delete(&self, path: &ArtifactPath) -> Result<()>;

    /// List artifacts under the given prefix, sorted by path.
    async fn list(&self, prefix: &ArtifactPath) -> Result<Vec<ArtifactPath>>;

    /// Rename/move an artifact. Atomic on the same filesystem.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if source does not exist.
    async fn rename(&self, from: &ArtifactPath, to: &ArtifactPath) -> Result<()>;

    /// Delete all artifacts under the given prefix.
    async fn delete_prefix(&self, prefix: &ArtifactPath) -> Result<usize> {
        let paths = self.list(prefix).await?;
        let count = paths.len();
        for path in paths {
            self.delete(&path).await?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ArtifactArea;
    use crate::LocalStorage;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_default_delete_prefix() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());

        for i in 0..3 {
            let path = ArtifactPath::segment(ArtifactArea::Firestore, format!("{:08}.ndjson", i));
            storage.write(&path, Bytes::from("{}\n")).await.unwrap();
        }
        storage
            .write(
                &ArtifactPath::area_file(ArtifactArea::Firestore, "records.ndjson"),
                Bytes::from("{}\n"),
            )
            .await
            .unwrap();

        let prefix = ArtifactPath::new(ArtifactArea::Firestore).with_section("segments");
        let deleted = storage.delete_prefix(&prefix).await.unwrap();
        assert_eq!(deleted, 3);

        assert!(storage.list(&prefix).await.unwrap().is_empty());
        let remaining = storage
            .list(&ArtifactPath::new(ArtifactArea::Firestore))
            .await
            .unwrap();
        assert_eq!(
            remaining,
            vec![ArtifactPath::area_file(ArtifactArea::Firestore, "records.ndjson")]
        );
    }

    #[tokio::test]
    async fn test_delete_prefix_of_whole_area() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());

        storage
            .write(&ArtifactPath::attachment(ArtifactArea::Storage, "a.bin"), Bytes::from("a"))
            .await
            .unwrap();
        storage
            .write(
                &ArtifactPath::area_file(ArtifactArea::Storage, "records.ndjson"),
                Bytes::from("{}\n"),
            )
            .await
            .unwrap();
        storage
            .write(&ArtifactPath::run_file("export_summary.json"), Bytes::from("{}"))
            .await
            .unwrap();

        let deleted = storage
            .delete_prefix(&ArtifactPath::new(ArtifactArea::Storage))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert!(storage
            .exists(&ArtifactPath::run_file("export_summary.json"))
            .await
            .unwrap());
    }
}
