//! Destination writer for committed batches.
//!
//! Layout inside the export tree:
//!
//! ```text
//! <area>/segments/00000001.ndjson   one file per committed batch
//! <area>/records.ndjson             merged view, written by `finalize`
//! storage/files/<name>              downloaded object content
//! ```
//!
//! Each line is `{"_id": ..., "_data": ..., "_meta": {...}}` where `_data`
//! is the tagged JSON embedding of the serialized value. Segments are
//! addressed by batch sequence number, so delivering the same batch twice
//! overwrites the same file.

use async_trait::async_trait;
use firesafe_storage::{ArtifactPath, ArtifactStorage, Bytes};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::error::{ExportError, Result};
use crate::serializer::{to_json, SerializedValue};
use crate::sources::{Attachment, SourceKind};

pub const RECORDS_FILE: &str = "records.ndjson";
pub const SEGMENTS_SECTION: &str = "segments";

/// A record ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedRecord {
    pub id: String,
    pub data: SerializedValue,
    pub metadata: Map<String, Value>,
    pub attachment: Option<Attachment>,
}

impl SerializedRecord {
    fn to_line(&self) -> Value {
        json!({
            "_id": self.id,
            "_data": to_json(&self.data),
            "_meta": self.metadata,
        })
    }
}

/// Id and metadata of one finalized record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordIndexEntry {
    pub id: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[async_trait]
pub trait ExportSink: Send + Sync {
    /// Write one batch as segment `seq` of the source's area.
    async fn commit(&self, kind: SourceKind, seq: u64, records: &[SerializedRecord]) -> Result<()>;

    /// Remove everything in the source's area before its first batch.
    async fn reset(&self, kind: SourceKind) -> Result<()>;

    /// Merge all segments into the source's records file, de-duplicated by
    /// record id, and return the resulting index.
    async fn finalize(&self, kind: SourceKind) -> Result<Vec<RecordIndexEntry>>;

    /// Write a JSON file inside the source's area.
    async fn write_artifact(&self, kind: SourceKind, name: &str, content: &Value) -> Result<()>;

    /// Write a JSON file at the root of the export tree.
    async fn write_run_artifact(&self, name: &str, content: &Value) -> Result<()>;
}

/// Sink writing into an [`ArtifactStorage`] tree.
pub struct DirectorySink {
    storage: Arc<dyn ArtifactStorage>,
}

impl DirectorySink {
    pub fn new(storage: Arc<dyn ArtifactStorage>) -> Self {
        Self { storage }
    }

    pub fn segment_name(seq: u64) -> String {
        format!("{:08}.ndjson", seq)
    }

    /// Write the attachment and return the metadata describing it.
    async fn write_attachment(
        &self,
        kind: SourceKind,
        attachment: &Attachment,
    ) -> Result<Map<String, Value>> {
        let path = ArtifactPath::attachment(kind.area(), &attachment.name);
        self.storage.write(&path, attachment.content.clone()).await?;

        let mut meta = Map::new();
        meta.insert(
            "sha256".into(),
            json!(hex::encode(Sha256::digest(&attachment.content))),
        );
        meta.insert("local_path".into(), json!(path.to_string()));
        meta.insert("local_size".into(), json!(attachment.content.len()));
        Ok(meta)
    }

    async fn write_json(&self, path: &ArtifactPath, content: &Value) -> Result<()> {
        let data = serde_json::to_vec_pretty(content)?;
        self.storage.write(path, Bytes::from(data)).await?;
        Ok(())
    }
}

/// Parsed records file: line order plus id index.
#[derive(Default)]
struct MergedRecords {
    lines: Vec<(RecordIndexEntry, String)>,
    positions: HashMap<String, usize>,
}

impl MergedRecords {
    fn absorb(&mut self, data: &[u8]) -> Result<()> {
        for line in data.split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let value: Value = serde_json::from_slice(line)?;
            let id = value
                .get("_id")
                .and_then(Value::as_str)
                .ok_or_else(|| ExportError::CorruptArtifact("record line without _id".to_string()))?
                .to_string();
            let metadata = match value.get("_meta") {
                Some(Value::Object(meta)) => meta.clone(),
                _ => Map::new(),
            };
            let entry = RecordIndexEntry {
                id: id.clone(),
                metadata,
            };
            let text = String::from_utf8_lossy(line).into_owned();
            match self.positions.get(&id) {
                Some(&i) => self.lines[i] = (entry, text),
                None => {
                    self.positions.insert(id, self.lines.len());
                    self.lines.push((entry, text));
                }
            }
        }
        Ok(())
    }

    fn render(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (_, line) in &self.lines {
            out.extend_from_slice(line.as_bytes());
            out.push(b'\n');
        }
        out
    }
}

#[async_trait]
impl ExportSink for DirectorySink {
    #[instrument(skip(self, records), fields(source = %kind, records = records.len()))]
    async fn commit(&self, kind: SourceKind, seq: u64, records: &[SerializedRecord]) -> Result<()> {
        let mut out = Vec::new();
        for record in records {
            let mut line = record.to_line();
            // Content lands before the segment that references it.
            if let Some(attachment) = &record.attachment {
                let meta = self.write_attachment(kind, attachment).await?;
                if let Some(Value::Object(m)) = line.get_mut("_meta") {
                    m.extend(meta);
                }
            }
            serde_json::to_writer(&mut out, &line)?;
            out.push(b'\n');
        }

        let path = ArtifactPath::segment(kind.area(), Self::segment_name(seq));
        self.storage.write(&path, Bytes::from(out)).await?;
        debug!(path = %path, "Segment committed");
        Ok(())
    }

    #[instrument(skip(self), fields(source = %kind))]
    async fn reset(&self, kind: SourceKind) -> Result<()> {
        let removed = self
            .storage
            .delete_prefix(&ArtifactPath::new(kind.area()))
            .await?;
        if removed > 0 {
            info!(files = removed, "Cleared output of a previous export");
        }
        Ok(())
    }

    #[instrument(skip(self), fields(source = %kind))]
    async fn finalize(&self, kind: SourceKind) -> Result<Vec<RecordIndexEntry>> {
        let records_path = ArtifactPath::area_file(kind.area(), RECORDS_FILE);
        let segments_prefix = ArtifactPath::new(kind.area()).with_section(SEGMENTS_SECTION);

        let mut merged = MergedRecords::default();
        match self.storage.read(&records_path).await {
            Ok(data) => merged.absorb(&data)?,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        // Zero-padded names list in commit order.
        let segments = self.storage.list(&segments_prefix).await?;
        for segment in &segments {
            let data = self.storage.read(segment).await?;
            merged.absorb(&data)?;
        }

        self.storage
            .write(&records_path, Bytes::from(merged.render()))
            .await?;
        self.storage.delete_prefix(&segments_prefix).await?;

        info!(
            records = merged.lines.len(),
            segments = segments.len(),
            "Source finalized"
        );
        Ok(merged.lines.into_iter().map(|(entry, _)| entry).collect())
    }

    async fn write_artifact(&self, kind: SourceKind, name: &str, content: &Value) -> Result<()> {
        self.write_json(&ArtifactPath::area_file(kind.area(), name), content)
            .await
    }

    async fn write_run_artifact(&self, name: &str, content: &Value) -> Result<()> {
        self.write_json(&ArtifactPath::run_file(name), content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::Number;
    use firesafe_storage::LocalStorage;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn record(id: &str, n: i64) -> SerializedRecord {
        let mut fields = BTreeMap::new();
        fields.insert("n".to_string(), SerializedValue::Number(Number::Integer(n)));
        SerializedRecord {
            id: id.to_string(),
            data: SerializedValue::Map(fields),
            metadata: Map::new(),
            attachment: None,
        }
    }

    fn sink(dir: &TempDir) -> DirectorySink {
        DirectorySink::new(Arc::new(LocalStorage::new(dir.path())))
    }

    fn read_lines(dir: &TempDir, rel: &str) -> Vec<Value> {
        std::fs::read_to_string(dir.path().join(rel))
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_commit_writes_segment() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir);
        sink.commit(SourceKind::Auth, 1, &[record("u1", 1), record("u2", 2)])
            .await
            .unwrap();

        let lines = read_lines(&dir, "auth/segments/00000001.ndjson");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["_id"], "u1");
        assert_eq!(lines[1]["_data"]["n"], 2);
    }

    #[tokio::test]
    async fn test_recommit_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir);
        let batch = [record("a", 1), record("b", 2)];
        sink.commit(SourceKind::Firestore, 1, &batch).await.unwrap();
        let first = std::fs::read(dir.path().join("firestore/segments/00000001.ndjson")).unwrap();
        sink.commit(SourceKind::Firestore, 1, &batch).await.unwrap();
        let second = std::fs::read(dir.path().join("firestore/segments/00000001.ndjson")).unwrap();
        assert_eq!(first, second);

        let index = sink.finalize(SourceKind::Firestore).await.unwrap();
        assert_eq!(index.len(), 2);
    }

    #[tokio::test]
    async fn test_finalize_dedups_last_write_wins() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir);
        sink.commit(SourceKind::Auth, 1, &[record("a", 1), record("b", 1)])
            .await
            .unwrap();
        sink.commit(SourceKind::Auth, 2, &[record("b", 2), record("c", 2)])
            .await
            .unwrap();

        let index = sink.finalize(SourceKind::Auth).await.unwrap();
        let ids: Vec<_> = index.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let lines = read_lines(&dir, "auth/records.ndjson");
        assert_eq!(lines[1]["_data"]["n"], 2);
        assert!(!dir.path().join("auth/segments/00000001.ndjson").exists());

        // A second finalize, with segments from a later run, merges into the file.
        sink.commit(SourceKind::Auth, 3, &[record("d", 3)]).await.unwrap();
        let index = sink.finalize(SourceKind::Auth).await.unwrap();
        assert_eq!(index.len(), 4);
        let again = sink.finalize(SourceKind::Auth).await.unwrap();
        assert_eq!(index, again);
    }

    #[tokio::test]
    async fn test_attachment_written_with_checksum() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir);
        let mut rec = record("images/logo.png", 1);
        rec.attachment = Some(Attachment {
            name: "abcd1234-images_logo.png".into(),
            content: Bytes::from_static(b"hello"),
        });
        sink.commit(SourceKind::Storage, 1, &[rec]).await.unwrap();

        let content = std::fs::read(dir.path().join("storage/files/abcd1234-images_logo.png")).unwrap();
        assert_eq!(content, b"hello");

        let lines = read_lines(&dir, "storage/segments/00000001.ndjson");
        assert_eq!(
            lines[0]["_meta"]["sha256"],
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(lines[0]["_meta"]["local_path"], "storage/files/abcd1234-images_logo.png");
    }

    #[tokio::test]
    async fn test_reset_clears_only_that_area() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir);
        let mut rec = record("a.bin", 1);
        rec.attachment = Some(Attachment {
            name: "00000000-a.bin".into(),
            content: Bytes::from_static(b"a"),
        });
        sink.commit(SourceKind::Storage, 1, &[rec]).await.unwrap();
        sink.finalize(SourceKind::Storage).await.unwrap();
        sink.commit(SourceKind::Auth, 1, &[record("u1", 1)]).await.unwrap();

        sink.reset(SourceKind::Storage).await.unwrap();
        assert!(!dir.path().join("storage/records.ndjson").exists());
        assert!(!dir.path().join("storage/files/00000000-a.bin").exists());
        assert!(dir.path().join("auth/segments/00000001.ndjson").exists());

        // A reset area finalizes from scratch.
        sink.commit(SourceKind::Storage, 1, &[record("b.bin", 2)]).await.unwrap();
        let index = sink.finalize(SourceKind::Storage).await.unwrap();
        let ids: Vec<_> = index.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b.bin"]);

        // Nothing to clear is fine.
        sink.reset(SourceKind::RealtimeDb).await.unwrap();
    }

    #[tokio::test]
    async fn test_finalize_without_segments() {
        let dir = TempDir::new().unwrap();
        let index = sink(&dir).finalize(SourceKind::RealtimeDb).await.unwrap();
        assert!(index.is_empty());
        assert!(dir.path().join("realtime_db/records.ndjson").exists());
    }
}
