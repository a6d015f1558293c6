//! Cloud Firestore: documents of every collection, depth first.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::traits::{Batch, Cursor, RawRecord, SourceExporter};
use super::SourceKind;
use crate::api::{ApiDocument, DocumentStoreApi};
use crate::error::SourceError;
use crate::serializer::NativeFormat;
use crate::sink::RecordIndexEntry;

pub const SUBCOLLECTIONS_ARTIFACT: &str = "subcollections_discovered.json";

/// Resume state carried in the cursor.
///
/// `pending` is a stack: the next collection to export is the last element.
/// Subcollections found while exporting a page are pushed on top, so nested
/// collections are finished before the next sibling collection starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct TraversalState {
    pending: Vec<String>,
    current: Option<String>,
    page_token: Option<String>,
}

impl TraversalState {
    fn is_exhausted(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }

    fn push_collections(&mut self, paths: Vec<String>) {
        // reversed so the first listed collection is popped first
        self.pending.extend(paths.into_iter().rev());
    }
}

pub struct FirestoreExporter<A: ?Sized> {
    api: Arc<A>,
    include_subcollections: bool,
    collections_started: AtomicU64,
    subcollections_discovered: AtomicU64,
}

impl<A: DocumentStoreApi + ?Sized> FirestoreExporter<A> {
    pub fn new(api: Arc<A>, include_subcollections: bool) -> Self {
        Self {
            api,
            include_subcollections,
            collections_started: AtomicU64::new(0),
            subcollections_discovered: AtomicU64::new(0),
        }
    }

    async fn initial_state(&self) -> Result<TraversalState, SourceError> {
        let roots = self.api.list_collection_ids(None).await?;
        info!(collections = roots.len(), "Found root collections");
        let mut state = TraversalState::default();
        state.push_collections(roots);
        Ok(state)
    }

    async fn to_record(&self, doc: ApiDocument) -> Result<(RawRecord, Vec<String>), SourceError> {
        let subcollections = if self.include_subcollections {
            self.api
                .list_collection_ids(Some(&doc.path))
                .await?
                .into_iter()
                .map(|id| format!("{}/{}", doc.path, id))
                .collect()
        } else {
            Vec::new()
        };

        let mut record = RawRecord::new(
            doc.path.clone(),
            Value::Object(doc.fields),
            NativeFormat::FirestoreFields,
        )
        .with_meta("path", json!(doc.path))
        .with_meta("name", json!(doc.name));
        if let Some(t) = doc.create_time {
            record = record.with_meta("create_time", json!(t));
        }
        if let Some(t) = doc.update_time {
            record = record.with_meta("update_time", json!(t));
        }
        if !subcollections.is_empty() {
            record = record.with_meta("subcollections", json!(subcollections));
        }
        Ok((record, subcollections))
    }
}

#[async_trait]
impl<A: DocumentStoreApi + ?Sized + 'static> SourceExporter for FirestoreExporter<A> {
    fn kind(&self) -> SourceKind {
        SourceKind::Firestore
    }

    async fn next_batch(
        &self,
        cursor: Option<&Cursor>,
        batch_size: usize,
    ) -> Result<Batch, SourceError> {
        let mut state = match cursor {
            Some(c) => c.decode::<TraversalState>()?,
            None => self.initial_state().await?,
        };

        // Skip over empty collections until a page yields records.
        loop {
            let collection = match state.current.clone() {
                Some(c) => c,
                None => match state.pending.pop() {
                    Some(next) => {
                        debug!(collection = %next, "Exporting collection");
                        self.collections_started.fetch_add(1, Ordering::Relaxed);
                        state.current = Some(next.clone());
                        state.page_token = None;
                        next
                    }
                    None => return Ok(Batch::new(Vec::new(), None)),
                },
            };

            let page = self
                .api
                .list_documents(&collection, batch_size, state.page_token.as_deref())
                .await?;

            let mut records = Vec::with_capacity(page.documents.len());
            let mut discovered = Vec::new();
            for doc in page.documents {
                let (record, subs) = self.to_record(doc).await?;
                discovered.extend(subs);
                records.push(record);
            }
            if !discovered.is_empty() {
                self.subcollections_discovered
                    .fetch_add(discovered.len() as u64, Ordering::Relaxed);
            }

            match page.next_page_token {
                Some(token) => state.page_token = Some(token),
                None => {
                    state.current = None;
                    state.page_token = None;
                }
            }
            // Children are exported after the rest of the current collection
            // and before any sibling still pending.
            state.push_collections(discovered);

            if !records.is_empty() || state.is_exhausted() {
                let next_cursor = if state.is_exhausted() {
                    None
                } else {
                    Some(Cursor::encode(&state)?)
                };
                return Ok(Batch::new(records, next_cursor));
            }
        }
    }

    async fn derived_artifacts(&self, records: &[RecordIndexEntry]) -> Vec<(String, Value)> {
        let discovered: BTreeSet<&str> = records
            .iter()
            .filter_map(|r| r.metadata.get("subcollections"))
            .filter_map(Value::as_array)
            .flatten()
            .filter_map(Value::as_str)
            .collect();
        vec![(SUBCOLLECTIONS_ARTIFACT.to_string(), json!(discovered))]
    }

    fn summary_extras(&self) -> Map<String, Value> {
        let mut extras = Map::new();
        extras.insert(
            "collections_visited".into(),
            json!(self.collections_started.load(Ordering::Relaxed)),
        );
        extras.insert(
            "subcollections_discovered".into(),
            json!(self.subcollections_discovered.load(Ordering::Relaxed)),
        );
        extras
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Fault, MemoryPlatform};

    async fn drain(exporter: &FirestoreExporter<MemoryPlatform>, batch_size: usize) -> Vec<String> {
        let mut ids = Vec::new();
        let mut cursor: Option<Cursor> = None;
        loop {
            let batch = exporter.next_batch(cursor.as_ref(), batch_size).await.unwrap();
            assert!(batch.records.len() <= batch_size);
            ids.extend(batch.records.into_iter().map(|r| r.id));
            match batch.next_cursor {
                Some(next) => {
                    assert_ne!(Some(&next), cursor.as_ref());
                    cursor = Some(next);
                }
                None => break,
            }
        }
        ids
    }

    fn platform() -> Arc<MemoryPlatform> {
        let p = MemoryPlatform::new();
        p.add_document("posts/p1", json!({"title": {"stringValue": "hello"}}));
        p.add_document("users/a", json!({"n": {"integerValue": "1"}}));
        p.add_document("users/b", json!({"n": {"integerValue": "2"}}));
        p.add_document("users/c", json!({}));
        p.add_document("users/a/orders/o1", json!({}));
        p.add_document("users/a/orders/o2", json!({}));
        p.add_document("users/a/orders/o1/items/i1", json!({}));
        Arc::new(p)
    }

    #[tokio::test]
    async fn test_depth_first_traversal() {
        let exporter = FirestoreExporter::new(platform(), true);
        let ids = drain(&exporter, 2).await;
        assert_eq!(
            ids,
            vec![
                "posts/p1",
                "users/a",
                "users/b",
                "users/c",
                "users/a/orders/o1",
                "users/a/orders/o2",
                "users/a/orders/o1/items/i1",
            ]
        );
    }

    #[tokio::test]
    async fn test_without_subcollections() {
        let exporter = FirestoreExporter::new(platform(), false);
        let ids = drain(&exporter, 10).await;
        assert_eq!(ids, vec!["posts/p1", "users/a", "users/b", "users/c"]);
    }

    #[tokio::test]
    async fn test_resume_from_cursor_repeats_continuation() {
        let exporter = FirestoreExporter::new(platform(), true);
        let first = exporter.next_batch(None, 2).await.unwrap();
        let cursor = first.next_cursor.unwrap();
        let a = exporter.next_batch(Some(&cursor), 2).await.unwrap();
        let b = exporter.next_batch(Some(&cursor), 2).await.unwrap();
        let ids = |batch: &Batch| batch.records.iter().map(|r| r.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&a), ids(&b));
        assert_eq!(a.next_cursor, b.next_cursor);
    }

    #[tokio::test]
    async fn test_subcollections_in_metadata_and_artifact() {
        let exporter = FirestoreExporter::new(platform(), true);
        let batch = exporter.next_batch(None, 10).await.unwrap();
        // posts has one page and no children; the second call reaches users
        let batch = exporter
            .next_batch(batch.next_cursor.as_ref(), 10)
            .await
            .unwrap();
        let a = batch.records.iter().find(|r| r.id == "users/a").unwrap();
        assert_eq!(a.metadata["subcollections"], json!(["users/a/orders"]));

        let entries: Vec<RecordIndexEntry> = batch
            .records
            .iter()
            .map(|r| RecordIndexEntry {
                id: r.id.clone(),
                metadata: r.metadata.clone(),
            })
            .collect();
        let artifacts = exporter.derived_artifacts(&entries).await;
        assert_eq!(artifacts[0].0, SUBCOLLECTIONS_ARTIFACT);
        assert_eq!(artifacts[0].1, json!(["users/a/orders"]));
    }

    #[tokio::test]
    async fn test_empty_database() {
        let exporter = FirestoreExporter::new(Arc::new(MemoryPlatform::new()), true);
        let batch = exporter.next_batch(None, 10).await.unwrap();
        assert!(batch.records.is_empty());
        assert!(batch.is_last());
    }

    #[tokio::test]
    async fn test_errors_propagate() {
        let p = platform();
        p.inject(
            SourceKind::Firestore,
            Fault::once(SourceError::Fatal("permission denied (status 403)".into())),
        );
        let exporter = FirestoreExporter::new(p, true);
        assert!(matches!(
            exporter.next_batch(None, 2).await,
            Err(SourceError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_cursor_is_fatal() {
        let exporter = FirestoreExporter::new(platform(), true);
        let err = exporter
            .next_batch(Some(&Cursor::new("garbage")), 2)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
