//! Cloud Storage: object metadata, optionally with file content.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::traits::{Attachment, Batch, Cursor, RawRecord, SourceExporter};
use super::SourceKind;
use crate::api::BlobStoreApi;
use crate::error::SourceError;
use crate::serializer::NativeFormat;

pub struct StorageExporter<A: ?Sized> {
    api: Arc<A>,
    include_files: bool,
    max_file_size: u64,
    concurrency: usize,
    files_downloaded: AtomicU64,
    bytes_downloaded: AtomicU64,
    downloads_failed: AtomicU64,
    downloads_skipped: AtomicU64,
}

enum Download {
    Fetched(Attachment),
    Skipped(String),
    Failed(String),
    NotRequested,
}

impl<A: BlobStoreApi + ?Sized> StorageExporter<A> {
    pub fn new(api: Arc<A>, include_files: bool, max_file_size: u64, concurrency: usize) -> Self {
        Self {
            api,
            include_files,
            max_file_size,
            concurrency: concurrency.max(1),
            files_downloaded: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            downloads_failed: AtomicU64::new(0),
            downloads_skipped: AtomicU64::new(0),
        }
    }

    /// Content comes over the media endpoint with the bearer token. No signed
    /// URL is recorded: signing needs a service account key.
    async fn fetch(&self, name: &str, size: u64) -> Download {
        if !self.include_files {
            return Download::NotRequested;
        }
        if size == 0 {
            return Download::Skipped("empty object".to_string());
        }
        if size >= self.max_file_size {
            return Download::Skipped(format!(
                "size {} exceeds limit of {} bytes",
                size, self.max_file_size
            ));
        }
        match self.api.download(name).await {
            Ok(content) => Download::Fetched(Attachment {
                name: attachment_name(name),
                content,
            }),
            Err(e) => Download::Failed(e.to_string()),
        }
    }

    fn to_record(&self, object: Value, download: Download) -> RawRecord {
        let name = object_name(&object).to_string();
        let payload = json!({
            "name": name,
            "bucket": object.get("bucket"),
            "size": object_size(&object),
            "content_type": object.get("contentType"),
            "time_created": object.get("timeCreated"),
            "updated": object.get("updated"),
            "etag": object.get("etag"),
            "md5_hash": object.get("md5Hash"),
            "crc32c": object.get("crc32c"),
            "metadata": object.get("metadata").cloned().unwrap_or_else(|| json!({})),
            "cache_control": object.get("cacheControl"),
            "content_disposition": object.get("contentDisposition"),
            "content_encoding": object.get("contentEncoding"),
            "content_language": object.get("contentLanguage"),
        });
        let record = RawRecord::new(name.clone(), payload, NativeFormat::PlainJson);

        match download {
            Download::Fetched(attachment) => {
                self.files_downloaded.fetch_add(1, Ordering::Relaxed);
                self.bytes_downloaded
                    .fetch_add(attachment.content.len() as u64, Ordering::Relaxed);
                record.with_attachment(attachment)
            }
            Download::Skipped(reason) => {
                debug!(object = %name, %reason, "Download skipped");
                self.downloads_skipped.fetch_add(1, Ordering::Relaxed);
                record.with_meta("download_skipped", json!(reason))
            }
            Download::Failed(reason) => {
                warn!(object = %name, error = %reason, "Could not download file; keeping metadata");
                self.downloads_failed.fetch_add(1, Ordering::Relaxed);
                record.with_meta("download_error", json!(reason))
            }
            Download::NotRequested => record,
        }
    }
}

fn object_name(object: &Value) -> &str {
    object.get("name").and_then(Value::as_str).unwrap_or_default()
}

/// The JSON API reports sizes as decimal strings.
fn object_size(object: &Value) -> u64 {
    match object.get("size") {
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        _ => 0,
    }
}

/// Flat file name for an object: path separators replaced, prefixed with a
/// short hash of the full name so `a/b` and `a_b` do not collide.
pub fn attachment_name(object_name: &str) -> String {
    let digest = Sha256::digest(object_name.as_bytes());
    let sanitized: String = object_name
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    format!("{}-{}", &hex::encode(digest)[..8], sanitized)
}

#[async_trait]
impl<A: BlobStoreApi + ?Sized + 'static> SourceExporter for StorageExporter<A> {
    fn kind(&self) -> SourceKind {
        SourceKind::Storage
    }

    async fn next_batch(
        &self,
        cursor: Option<&Cursor>,
        batch_size: usize,
    ) -> Result<Batch, SourceError> {
        let page = self
            .api
            .list_objects(batch_size, cursor.map(Cursor::as_str))
            .await?;

        for object in &page.objects {
            if object_name(object).is_empty() {
                return Err(SourceError::Fatal("object resource without name".to_string()));
            }
        }

        // Downloads run through a bounded pool; results are put back in
        // listing order.
        let jobs: Vec<(usize, String, u64)> = page
            .objects
            .iter()
            .enumerate()
            .map(|(i, object)| (i, object_name(object).to_string(), object_size(object)))
            .collect();
        let mut fetched: Vec<(usize, Download)> = stream::iter(jobs)
            .map(|(i, name, size)| async move { (i, self.fetch(&name, size).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        fetched.sort_by_key(|(i, _)| *i);

        let records = page
            .objects
            .into_iter()
            .zip(fetched)
            .map(|(object, (_, download))| self.to_record(object, download))
            .collect();

        Ok(Batch::new(records, page.next_page_token.map(Cursor::new)))
    }

    fn summary_extras(&self) -> Map<String, Value> {
        let mut extras = Map::new();
        extras.insert(
            "files_downloaded".into(),
            json!(self.files_downloaded.load(Ordering::Relaxed)),
        );
        extras.insert(
            "bytes_downloaded".into(),
            json!(self.bytes_downloaded.load(Ordering::Relaxed)),
        );
        extras.insert(
            "downloads_failed".into(),
            json!(self.downloads_failed.load(Ordering::Relaxed)),
        );
        extras.insert(
            "downloads_skipped".into(),
            json!(self.downloads_skipped.load(Ordering::Relaxed)),
        );
        extras
    }
}
