pub mod auth;
pub mod firestore;
pub mod realtime_db;
pub mod storage;
pub mod traits;

pub use auth::AuthExporter;
pub use firestore::FirestoreExporter;
pub use realtime_db::RealtimeDbExporter;
pub use storage::StorageExporter;
pub use traits::{Attachment, Batch, Cursor, RawRecord, SourceExporter};

use firesafe_storage::ArtifactArea;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::{BlobStoreApi, DirectoryApi, DocumentStoreApi, TreeDatabaseApi};
use crate::config::ExportConfig;

/// One of the four exportable data domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Firestore,
    Auth,
    Storage,
    RealtimeDb,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::Firestore,
        SourceKind::Auth,
        SourceKind::Storage,
        SourceKind::RealtimeDb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Firestore => "firestore",
            SourceKind::Auth => "auth",
            SourceKind::Storage => "storage",
            SourceKind::RealtimeDb => "realtime_db",
        }
    }

    /// Area of the export tree holding this source's artifacts.
    pub fn area(&self) -> ArtifactArea {
        match self {
            SourceKind::Firestore => ArtifactArea::Firestore,
            SourceKind::Auth => ArtifactArea::Auth,
            SourceKind::Storage => ArtifactArea::Storage,
            SourceKind::RealtimeDb => ArtifactArea::RealtimeDb,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "firestore" => Ok(SourceKind::Firestore),
            "auth" | "authentication" => Ok(SourceKind::Auth),
            "storage" => Ok(SourceKind::Storage),
            "realtime_db" | "rtdb" | "database" => Ok(SourceKind::RealtimeDb),
            _ => Err(format!(
                "Invalid source '{}'. Use 'firestore', 'auth', 'storage' or 'realtime_db'",
                s
            )),
        }
    }
}

/// Build one exporter per source enabled in `config`, all backed by the
/// same platform client.
pub fn build_exporters<P>(config: &ExportConfig, platform: Arc<P>) -> Vec<Arc<dyn SourceExporter>>
where
    P: DocumentStoreApi + DirectoryApi + BlobStoreApi + TreeDatabaseApi + 'static,
{
    config
        .enabled_sources()
        .into_iter()
        .map(|kind| -> Arc<dyn SourceExporter> {
            match kind {
                SourceKind::Firestore => Arc::new(FirestoreExporter::new(
                    platform.clone(),
                    config.export.include_subcollections,
                )),
                SourceKind::Auth => Arc::new(AuthExporter::new(platform.clone())),
                SourceKind::Storage => Arc::new(StorageExporter::new(
                    platform.clone(),
                    config.export.include_storage_files,
                    config.max_storage_file_size_bytes(),
                    config.export.storage_concurrent_files,
                )),
                SourceKind::RealtimeDb => Arc::new(RealtimeDbExporter::new(
                    platform.clone(),
                    config.firebase.realtime_db_url.clone().unwrap_or_default(),
                )),
            }
        })
        .collect()
}
