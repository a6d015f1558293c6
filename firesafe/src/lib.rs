//! firesafe: resumable, cost-bounded export of Firebase projects.
//!
//! Supported sources:
//! - Cloud Firestore (collections and nested subcollections)
//! - Firebase Authentication (users, custom claims, providers, MFA)
//! - Cloud Storage (object metadata, optional file downloads)
//! - Realtime Database (top-level subtrees)
//!
//! The engine drives every source through the same batch contract
//! ([`SourceExporter`]), gates reads with the [`SafetyLimiter`], converts
//! platform values through the type-preserving [`serializer`], and records
//! progress in a crash-consistent [`Checkpoint`] after each committed batch,
//! so re-running an interrupted export resumes where it stopped.

pub mod api;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod limiter;
pub mod orchestrator;
pub mod progress;
pub mod serializer;
pub mod sink;
pub mod sources;
pub mod summary;

pub use checkpoint::{
    Checkpoint, CheckpointLedger, CheckpointStore, Failure, FailureClass, FileCheckpointStore,
    SourceProgress, SourceStatus,
};
pub use config::ExportConfig;
pub use error::{CheckpointError, ExportError, Result, SerializationError, SourceError};
pub use limiter::SafetyLimiter;
pub use orchestrator::{Orchestrator, RetryPolicy};
pub use progress::ExportProgress;
pub use serializer::{deserialize, serialize, FieldValue, Number, SerializedValue, Timestamp};
pub use sink::{DirectorySink, ExportSink, RecordIndexEntry, SerializedRecord};
pub use sources::{Batch, Cursor, RawRecord, SourceExporter, SourceKind};
pub use summary::{ExportSummary, SourceRun, SourceSummary};
