use async_trait::async_trait;
use chrono::Utc;
use firesafe_storage::{ArtifactPath, ArtifactStorage, Bytes};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    Checkpoint, SourceProgress, ARCHIVED_CHECKPOINT_FILE, CHECKPOINT_FILE,
};
use crate::error::CheckpointError;
use crate::sources::SourceKind;

type Result<T> = std::result::Result<T, CheckpointError>;

/// Persistence for the run checkpoint.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the current checkpoint, `None` when there is none.
    async fn load(&self) -> Result<Option<Checkpoint>>;

    /// Atomically replace the stored checkpoint.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn exists(&self) -> Result<bool>;

    /// Move the checkpoint aside after a clean run, so the next run starts fresh.
    async fn archive(&self) -> Result<()>;
}

/// Checkpoint stored as pretty JSON at the root of the export tree.
pub struct FileCheckpointStore {
    storage: Arc<dyn ArtifactStorage>,
    path: ArtifactPath,
    archive_path: ArtifactPath,
}

impl FileCheckpointStore {
    pub fn new(storage: Arc<dyn ArtifactStorage>) -> Self {
        Self {
            storage,
            path: ArtifactPath::run_file(CHECKPOINT_FILE),
            archive_path: ArtifactPath::run_file(ARCHIVED_CHECKPOINT_FILE),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>> {
        match self.storage.read(&self.path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let data = serde_json::to_vec_pretty(checkpoint)?;
        self.storage.write(&self.path, Bytes::from(data)).await?;
        debug!(path = %self.path, "Checkpoint saved");
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.storage.exists(&self.path).await?)
    }

    async fn archive(&self) -> Result<()> {
        self.storage.rename(&self.path, &self.archive_path).await?;
        info!(path = %self.archive_path, "Checkpoint archived");
        Ok(())
    }
}

/// The single writer of the run checkpoint.
///
/// Every mutation is applied to a copy, saved, and only then made visible,
/// so the in-memory state never runs ahead of what is on disk.
pub struct CheckpointLedger {
    state: Mutex<Checkpoint>,
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointLedger {
    pub fn new(checkpoint: Checkpoint, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            state: Mutex::new(checkpoint),
            store,
        }
    }

    /// Load the existing checkpoint (validated and prepared for resume) or
    /// create a fresh one, and persist the result.
    pub async fn open(
        store: Arc<dyn CheckpointStore>,
        project_id: &str,
        kinds: &[SourceKind],
    ) -> Result<Self> {
        let checkpoint = match store.load().await? {
            Some(mut existing) => {
                existing.validate(project_id)?;
                existing.prepare_for_run(kinds);
                info!(
                    project_id,
                    created_at = %existing.created_at,
                    "Resuming from existing checkpoint"
                );
                existing
            }
            None => {
                info!(project_id, "Starting new export");
                Checkpoint::new(project_id, kinds)
            }
        };
        let ledger = Self::new(checkpoint, store);
        ledger.persist().await?;
        Ok(ledger)
    }

    /// Apply `f` to one source's progress and save the checkpoint.
    pub async fn update<F>(&self, kind: SourceKind, f: F) -> Result<SourceProgress>
    where
        F: FnOnce(&mut SourceProgress) -> std::result::Result<(), String>,
    {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let progress = next
            .sources
            .get_mut(&kind)
            .ok_or(CheckpointError::UnknownSource(kind))?;
        f(progress).map_err(|reason| CheckpointError::InvalidTransition { kind, reason })?;
        let updated = progress.clone();
        next.updated_at = Utc::now();

        self.store.save(&next).await?;
        *state = next;
        Ok(updated)
    }

    pub async fn get(&self, kind: SourceKind) -> Option<SourceProgress> {
        self.state.lock().await.sources.get(&kind).cloned()
    }

    pub async fn snapshot(&self) -> Checkpoint {
        self.state.lock().await.clone()
    }

    pub async fn archive(&self) -> Result<()> {
        let _state = self.state.lock().await;
        self.store.archive().await
    }

    async fn persist(&self) -> Result<()> {
        let state = self.state.lock().await;
        self.store.save(&state).await
    }
}
