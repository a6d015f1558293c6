//! Artifact storage for firesafe export trees.
//!
//! Every file the exporter produces (checkpoint, batch segments, downloaded
//! storage objects, summary) goes through the [`ArtifactStorage`] trait. The
//! local implementation writes atomically: data lands in a temporary sibling,
//! is synced, and is then renamed over the target (and the directory synced),
//! so a reader never observes a partially written artifact.
//!
//! # Layout
//!
//! All artifacts are addressed with hierarchical [`ArtifactPath`]s:
//!
//! ```text
//! area/[section/]name
//!
//! .checkpoint.json
//! export_summary.json
//! firestore/segments/00000001.ndjson
//! firestore/records.ndjson
//! storage/files/3f2a9c1e-images_logo.png
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use firesafe_storage::{ArtifactArea, ArtifactPath, ArtifactStorage, LocalStorage};
//! use bytes::Bytes;
//!
//! # async fn example() -> firesafe_storage::Result<()> {
//! let storage = LocalStorage::new("./firebase-export");
//!
//! let path = ArtifactPath::segment(ArtifactArea::Auth, "00000001.ndjson");
//! storage.write(&path, Bytes::from("{}\n")).await?;
//!
//! let data = storage.read(&path).await?;
//! let segments = storage
//!     .list(&ArtifactPath::new(ArtifactArea::Auth).with_section("segments"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod local;
mod path;
mod traits;

pub use error::{Result, StorageError};
pub use local::LocalStorage;
pub use path::{ArtifactArea, ArtifactPath};
pub use traits::ArtifactStorage;

// Re-export bytes for convenience
pub use bytes::Bytes;
