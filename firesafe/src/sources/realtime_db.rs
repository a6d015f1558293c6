//! Realtime Database: one record per top-level child.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

use super::traits::{Batch, Cursor, RawRecord, SourceExporter};
use super::SourceKind;
use crate::api::{TreeDatabaseApi, TreeRoot};
use crate::error::SourceError;
use crate::serializer::NativeFormat;
use crate::sink::RecordIndexEntry;

pub const METADATA_ARTIFACT: &str = "metadata.json";

/// Record id used when the database root is a single primitive value.
pub const ROOT_RECORD_ID: &str = "$root";

/// Key order used by `orderBy="$key"`: keys that parse as 32-bit integers
/// come first in numeric order, all other keys follow in lexicographic order.
pub fn compare_keys(a: &str, b: &str) -> Ordering {
    match (integer_key(a), integer_key(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

fn integer_key(key: &str) -> Option<i32> {
    let digits = key.strip_prefix('-').unwrap_or(key);
    let canonical = !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && (digits == "0" || !digits.starts_with('0'))
        && key != "-0";
    if canonical {
        key.parse().ok()
    } else {
        None
    }
}

pub struct RealtimeDbExporter<A: ?Sized> {
    api: Arc<A>,
    database_url: String,
}

impl<A: TreeDatabaseApi + ?Sized> RealtimeDbExporter<A> {
    pub fn new(api: Arc<A>, database_url: String) -> Self {
        Self { api, database_url }
    }

    fn page_to_batch(&self, children: Vec<(String, Value)>, batch_size: usize) -> Batch {
        let next_cursor = if children.len() < batch_size {
            None
        } else {
            children.last().map(|(key, _)| Cursor::new(key.clone()))
        };
        let records = children
            .into_iter()
            .map(|(key, value)| {
                RawRecord::new(key.clone(), value, NativeFormat::PlainJson)
                    .with_meta("key", json!(key))
            })
            .collect();
        Batch::new(records, next_cursor)
    }
}

#[async_trait]
impl<A: TreeDatabaseApi + ?Sized + 'static> SourceExporter for RealtimeDbExporter<A> {
    fn kind(&self) -> SourceKind {
        SourceKind::RealtimeDb
    }

    async fn next_batch(
        &self,
        cursor: Option<&Cursor>,
        batch_size: usize,
    ) -> Result<Batch, SourceError> {
        if let Some(after) = cursor {
            let children = self
                .api
                .children_page(Some(after.as_str()), batch_size)
                .await?;
            return Ok(self.page_to_batch(children, batch_size));
        }

        match self.api.root_shape().await? {
            TreeRoot::Empty => {
                debug!("Database is empty");
                Ok(Batch::new(Vec::new(), None))
            }
            TreeRoot::Primitive(value) => Ok(Batch::new(
                vec![RawRecord::new(ROOT_RECORD_ID, value, NativeFormat::PlainJson)
                    .with_meta("key", Value::Null)],
                None,
            )),
            TreeRoot::Children => {
                let children = self.api.children_page(None, batch_size).await?;
                Ok(self.page_to_batch(children, batch_size))
            }
        }
    }

    async fn derived_artifacts(&self, records: &[RecordIndexEntry]) -> Vec<(String, Value)> {
        let data_type = match records {
            [] => "null",
            [only] if only.id == ROOT_RECORD_ID => "primitive",
            _ => "object",
        };
        vec![(
            METADATA_ARTIFACT.to_string(),
            json!({
                "database_url": self.database_url,
                "export_time": Utc::now().to_rfc3339(),
                "data_type": data_type,
                "top_level_keys": records.len(),
            }),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MemoryPlatform;

    #[test]
    fn test_key_ordering() {
        let mut keys = vec!["b", "10", "a", "2", "-1", "007", "2147483648", "-0"];
        keys.sort_by(|a, b| compare_keys(a, b));
        assert_eq!(
            keys,
            vec!["-1", "2", "10", "-0", "007", "2147483648", "a", "b"]
        );
    }

    #[tokio::test]
    async fn test_pages_by_last_key() {
        let platform = Arc::new(MemoryPlatform::new());
        platform.set_tree(json!({
            "users": {"a": 1},
            "1": true,
            "posts": [1, 2],
            "config": "x"
        }));
        let exporter = RealtimeDbExporter::new(platform, "https://demo.firebaseio.com".into());

        let first = exporter.next_batch(None, 2).await.unwrap();
        let ids: Vec<_> = first.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "config"]);
        assert_eq!(first.next_cursor, Some(Cursor::new("config")));

        let second = exporter
            .next_batch(first.next_cursor.as_ref(), 2)
            .await
            .unwrap();
        let ids: Vec<_> = second.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["posts", "users"]);

        let third = exporter
            .next_batch(second.next_cursor.as_ref(), 2)
            .await
            .unwrap();
        assert!(third.records.is_empty());
        assert!(third.is_last());
    }

    #[tokio::test]
    async fn test_primitive_root() {
        let platform = Arc::new(MemoryPlatform::new());
        platform.set_tree(json!(42));
        let exporter = RealtimeDbExporter::new(platform, String::new());

        let batch = exporter.next_batch(None, 10).await.unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].id, ROOT_RECORD_ID);
        assert_eq!(batch.records[0].payload, json!(42));
        assert!(batch.is_last());
    }

    #[tokio::test]
    async fn test_empty_database() {
        let exporter = RealtimeDbExporter::new(Arc::new(MemoryPlatform::new()), String::new());
        let batch = exporter.next_batch(None, 10).await.unwrap();
        assert!(batch.records.is_empty());
        assert!(batch.is_last());
    }

    #[tokio::test]
    async fn test_metadata_artifact() {
        let exporter = RealtimeDbExporter::new(
            Arc::new(MemoryPlatform::new()),
            "https://demo.firebaseio.com".into(),
        );
        let entries = vec![RecordIndexEntry {
            id: "users".into(),
            metadata: Default::default(),
        }];
        let artifacts = exporter.derived_artifacts(&entries).await;
        assert_eq!(artifacts[0].0, "metadata.json");
        assert_eq!(artifacts[0].1["database_url"], "https://demo.firebaseio.com");
        assert_eq!(artifacts[0].1["top_level_keys"], 1);
    }
}
