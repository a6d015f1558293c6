use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::SourceKind;
use crate::error::{SerializationError, SourceError};
use crate::serializer::{decode_native, serialize, NativeFormat};
use crate::sink::{RecordIndexEntry, SerializedRecord};

/// Opaque, source-defined resume token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Cursor carrying structured state as JSON.
    pub fn encode<T: Serialize>(state: &T) -> Result<Self, SourceError> {
        serde_json::to_string(state)
            .map(Self)
            .map_err(|e| SourceError::Fatal(format!("cannot encode cursor: {}", e)))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, SourceError> {
        serde_json::from_str(&self.0)
            .map_err(|e| SourceError::Fatal(format!("malformed cursor '{}': {}", self.0, e)))
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// File content travelling with a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub name: String,
    pub content: Bytes,
}

/// A record as the source delivered it
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub id: String,
    pub payload: Value,
    pub format: NativeFormat,
    /// Plain JSON describing the record (timestamps, discovered children, ...)
    pub metadata: Map<String, Value>,
    pub attachment: Option<Attachment>,
}

impl RawRecord {
    pub fn new(id: impl Into<String>, payload: Value, format: NativeFormat) -> Self {
        Self {
            id: id.into(),
            payload,
            format,
            metadata: Map::new(),
            attachment: None,
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    /// Convert the native payload into its portable form.
    pub fn serialize(self) -> Result<SerializedRecord, SerializationError> {
        let value = decode_native("", &self.payload, self.format)?;
        Ok(SerializedRecord {
            id: self.id,
            data: serialize(&value),
            metadata: self.metadata,
            attachment: self.attachment,
        })
    }
}

/// One page of records and the cursor to continue from.
#[derive(Debug, Clone)]
pub struct Batch {
    pub records: Vec<RawRecord>,
    /// `None` when the source is exhausted
    pub next_cursor: Option<Cursor>,
}

impl Batch {
    pub fn new(records: Vec<RawRecord>, next_cursor: Option<Cursor>) -> Self {
        Self {
            records,
            next_cursor,
        }
    }

    pub fn is_last(&self) -> bool {
        self.next_cursor.is_none()
    }
}

/// Batch-iteration contract shared by every source.
///
/// `next_batch(None, n)` starts from the beginning; passing back a batch's
/// `next_cursor` continues right after it. Re-requesting a cursor that was
/// already answered is allowed and returns the same continuation.
#[async_trait]
pub trait SourceExporter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Fetch up to `batch_size` records starting at `cursor`.
    async fn next_batch(
        &self,
        cursor: Option<&Cursor>,
        batch_size: usize,
    ) -> Result<Batch, SourceError>;

    /// Extra artifacts to write once the source completes, as
    /// `(file name, JSON content)` inside the source's area.
    ///
    /// `records` indexes every record in the finalized export, including
    /// those committed by earlier runs.
    async fn derived_artifacts(&self, _records: &[RecordIndexEntry]) -> Vec<(String, Value)> {
        Vec::new()
    }

    /// Source-specific counters for the summary.
    fn summary_extras(&self) -> Map<String, Value> {
        Map::new()
    }
}
