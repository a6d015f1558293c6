//! Durable per-source progress.
//!
//! One [`Checkpoint`] exists per export run. It is rewritten atomically after
//! every committed batch, so a crash loses at most the batch in flight, which
//! is fetched again on resume.

mod store;

pub use store::{CheckpointLedger, CheckpointStore, FileCheckpointStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::CheckpointError;
use crate::sources::{Cursor, SourceKind};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const CHECKPOINT_FILE: &str = ".checkpoint.json";
pub const ARCHIVED_CHECKPOINT_FILE: &str = ".checkpoint.completed.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    LimitExceeded,
}

impl SourceStatus {
    /// The source will not be advanced again in this run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SourceStatus::Completed | SourceStatus::Failed | SourceStatus::LimitExceeded
        )
    }

    /// Statuses that reject every further mutation within a run.
    pub fn is_immutable(&self) -> bool {
        matches!(self, SourceStatus::Completed | SourceStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Pending => "pending",
            SourceStatus::InProgress => "in_progress",
            SourceStatus::Completed => "completed",
            SourceStatus::Failed => "failed",
            SourceStatus::LimitExceeded => "limit_exceeded",
        }
    }
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a source stopped in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Retries exhausted on a transient error
    Transient,
    /// Non-retryable adapter error
    Fatal,
    /// The destination could not be written
    Destination,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureClass::Transient => "transient",
            FailureClass::Fatal => "fatal",
            FailureClass::Destination => "destination",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub class: FailureClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Failure {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Progress of a single source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceProgress {
    pub status: SourceStatus,
    #[serde(default)]
    pub cursor: Option<Cursor>,
    #[serde(default)]
    pub records_processed: u64,
    #[serde(default)]
    pub records_skipped: u64,
    #[serde(default)]
    pub batches_committed: u64,
    #[serde(default)]
    pub failure: Option<Failure>,
}

impl Default for SourceProgress {
    fn default() -> Self {
        Self {
            status: SourceStatus::Pending,
            cursor: None,
            records_processed: 0,
            records_skipped: 0,
            batches_committed: 0,
            failure: None,
        }
    }
}

type Transition = std::result::Result<(), String>;

impl SourceProgress {
    /// `Pending -> InProgress`.
    pub fn start(&mut self) -> Transition {
        if self.status.is_terminal() {
            return Err(format!("cannot start a source in status {}", self.status));
        }
        self.status = SourceStatus::InProgress;
        Ok(())
    }

    /// Record one committed batch.
    ///
    /// The new cursor must differ from the current one, which is what keeps
    /// the cursor moving forward. `None` means the source is exhausted.
    pub fn advance(&mut self, next_cursor: Option<Cursor>, processed: u64, skipped: u64) -> Transition {
        if self.status != SourceStatus::InProgress {
            return Err(format!("cannot advance a source in status {}", self.status));
        }
        if next_cursor.is_some() && next_cursor == self.cursor {
            return Err("cursor did not move".to_string());
        }
        self.cursor = next_cursor;
        self.records_processed = self.records_processed.saturating_add(processed);
        self.records_skipped = self.records_skipped.saturating_add(skipped);
        self.batches_committed += 1;
        Ok(())
    }

    pub fn complete(&mut self) -> Transition {
        self.guard_mutable()?;
        self.status = SourceStatus::Completed;
        self.failure = None;
        Ok(())
    }

    pub fn fail(&mut self, failure: Failure) -> Transition {
        self.guard_mutable()?;
        self.status = SourceStatus::Failed;
        self.failure = Some(failure);
        Ok(())
    }

    pub fn limit_exceeded(&mut self) -> Transition {
        self.guard_mutable()?;
        self.status = SourceStatus::LimitExceeded;
        Ok(())
    }

    /// Put an unfinished source back to `Pending` for a new run, keeping its
    /// cursor and counts.
    pub fn reset_for_resume(&mut self) {
        if self.status != SourceStatus::Completed {
            self.status = SourceStatus::Pending;
        }
    }

    /// Nothing of this source has been committed under the current checkpoint.
    pub fn is_untouched(&self) -> bool {
        self.batches_committed == 0 && self.cursor.is_none()
    }

    fn guard_mutable(&self) -> Transition {
        if self.status.is_immutable() {
            return Err(format!("source is already {}", self.status));
        }
        Ok(())
    }
}

/// Progress record for one export run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sources: BTreeMap<SourceKind, SourceProgress>,
}

impl Checkpoint {
    pub fn new(project_id: impl Into<String>, kinds: &[SourceKind]) -> Self {
        let now = Utc::now();
        Self {
            version: CHECKPOINT_VERSION,
            project_id: project_id.into(),
            created_at: now,
            updated_at: now,
            sources: kinds
                .iter()
                .map(|k| (*k, SourceProgress::default()))
                .collect(),
        }
    }

    /// Check that a loaded checkpoint belongs to this export.
    pub fn validate(&self, project_id: &str) -> Result<(), CheckpointError> {
        if self.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: self.version,
                expected: CHECKPOINT_VERSION,
            });
        }
        if self.project_id != project_id {
            return Err(CheckpointError::ProjectMismatch {
                found: self.project_id.clone(),
                expected: project_id.to_string(),
            });
        }
        Ok(())
    }

    /// Make the checkpoint ready for a new run over `kinds`: missing sources
    /// are added as `Pending`, unfinished ones are reset for resume.
    pub fn prepare_for_run(&mut self, kinds: &[SourceKind]) {
        for kind in kinds {
            self.sources
                .entry(*kind)
                .or_default()
                .reset_for_resume();
        }
    }

    pub fn progress(&self, kind: SourceKind) -> Option<&SourceProgress> {
        self.sources.get(&kind)
    }

    /// Every recorded source completed, including sources the current run
    /// does not export.
    pub fn is_clean(&self) -> bool {
        self.sources
            .values()
            .all(|p| p.status == SourceStatus::Completed)
    }
}
