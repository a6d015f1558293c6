//! In-memory platform serving fixture data.
//!
//! Supports injected failures and per-service call counters so the engine's
//! retry, resume and limit behaviour can be exercised without a network.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use super::{
    ApiDocument, BlobStoreApi, DirectoryApi, DocumentPage, DocumentStoreApi, ObjectPage,
    TreeDatabaseApi, TreeRoot, UserPage,
};
use crate::error::SourceError;
use crate::sources::realtime_db::compare_keys;
use crate::sources::SourceKind;

/// A scripted failure for one service.
#[derive(Debug, Clone)]
pub struct Fault {
    pub error: SourceError,
    /// Calls that succeed before the fault starts firing
    pub after_calls: usize,
    /// How many calls fail once it fires
    pub times: usize,
}

impl Fault {
    pub fn once(error: SourceError) -> Self {
        Self {
            error,
            after_calls: 0,
            times: 1,
        }
    }

    pub fn always(error: SourceError) -> Self {
        Self {
            error,
            after_calls: 0,
            times: usize::MAX,
        }
    }

    pub fn after(after_calls: usize, error: SourceError) -> Self {
        Self {
            error,
            after_calls,
            times: 1,
        }
    }

    pub fn times(mut self, times: usize) -> Self {
        self.times = times;
        self
    }
}

#[derive(Default)]
struct State {
    /// collection path -> documents in listing order
    collections: BTreeMap<String, Vec<ApiDocument>>,
    users: Vec<Value>,
    objects: Vec<(Value, Bytes)>,
    tree: Option<Value>,
    faults: HashMap<SourceKind, Fault>,
    calls: HashMap<SourceKind, usize>,
    downloads: usize,
    downloads_in_flight: usize,
    peak_downloads_in_flight: usize,
    broken_downloads: HashSet<String>,
    latency: Option<Duration>,
    download_latency: Option<Duration>,
}

#[derive(Default)]
pub struct MemoryPlatform {
    state: Mutex<State>,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document at `path` (`collection/doc[/collection/doc...]`).
    pub fn add_document(&self, path: &str, fields: Value) {
        let collection = match path.rsplit_once('/') {
            Some((collection, _)) => collection.to_string(),
            None => return,
        };
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let doc = ApiDocument {
            name: format!("projects/memory/databases/(default)/documents/{}", path),
            path: path.to_string(),
            fields,
            create_time: Some("2024-01-01T00:00:00Z".to_string()),
            update_time: Some("2024-01-02T00:00:00Z".to_string()),
        };
        self.state
            .lock()
            .collections
            .entry(collection)
            .or_default()
            .push(doc);
    }

    pub fn add_user(&self, user: Value) {
        self.state.lock().users.push(user);
    }

    pub fn add_object(&self, metadata: Value, content: impl Into<Bytes>) {
        self.state.lock().objects.push((metadata, content.into()));
    }

    pub fn set_tree(&self, root: Value) {
        self.state.lock().tree = Some(root);
    }

    pub fn inject(&self, kind: SourceKind, fault: Fault) {
        self.state.lock().faults.insert(kind, fault);
    }

    /// Make downloads of `object_name` fail with a transient error.
    pub fn break_download(&self, object_name: &str) {
        self.state
            .lock()
            .broken_downloads
            .insert(object_name.to_string());
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Delay every call, so a test can cancel while a fetch is in flight.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = Some(latency);
    }

    /// Page-level calls made to the service backing `kind`.
    pub fn calls(&self, kind: SourceKind) -> usize {
        self.state.lock().calls.get(&kind).copied().unwrap_or(0)
    }

    pub fn downloads(&self) -> usize {
        self.state.lock().downloads
    }

    /// Delay every download, so concurrent downloads overlap.
    pub fn set_download_latency(&self, latency: Duration) {
        self.state.lock().download_latency = Some(latency);
    }

    /// Most downloads that were running at the same time.
    pub fn peak_downloads_in_flight(&self) -> usize {
        self.state.lock().peak_downloads_in_flight
    }

    /// Count the call and fire the scripted fault, if any.
    async fn enter(&self, kind: SourceKind) -> Result<(), SourceError> {
        let latency = {
            let mut state = self.state.lock();
            let call = {
                let calls = state.calls.entry(kind).or_insert(0);
                *calls += 1;
                *calls
            };
            if let Some(fault) = state.faults.get_mut(&kind) {
                if call > fault.after_calls && fault.times > 0 {
                    fault.times -= 1;
                    return Err(fault.error.clone());
                }
            }
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

fn offset_of(token: Option<&str>) -> Result<usize, SourceError> {
    match token {
        None => Ok(0),
        Some(t) => t
            .parse()
            .map_err(|_| SourceError::Fatal(format!("invalid page token '{}'", t))),
    }
}

fn page<T: Clone>(items: &[T], offset: usize, size: usize) -> (Vec<T>, Option<String>) {
    let end = offset.saturating_add(size).min(items.len());
    let slice = items.get(offset..end).unwrap_or_default().to_vec();
    let next = (end < items.len()).then(|| end.to_string());
    (slice, next)
}

#[async_trait]
impl DocumentStoreApi for MemoryPlatform {
    async fn list_collection_ids(&self, parent: Option<&str>) -> Result<Vec<String>, SourceError> {
        self.enter(SourceKind::Firestore).await?;
        let state = self.state.lock();
        let mut ids: Vec<String> = state
            .collections
            .keys()
            .filter_map(|path| {
                let (prefix, id) = match path.rsplit_once('/') {
                    Some((prefix, id)) => (Some(prefix), id),
                    None => (None, path.as_str()),
                };
                (prefix == parent).then(|| id.to_string())
            })
            .collect();
        ids.dedup();
        Ok(ids)
    }

    async fn list_documents(
        &self,
        collection_path: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<DocumentPage, SourceError> {
        self.enter(SourceKind::Firestore).await?;
        let offset = offset_of(page_token)?;
        let state = self.state.lock();
        let docs = state
            .collections
            .get(collection_path)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let (documents, next_page_token) = page(docs, offset, page_size);
        Ok(DocumentPage {
            documents,
            next_page_token,
        })
    }
}

#[async_trait]
impl DirectoryApi for MemoryPlatform {
    async fn list_users(
        &self,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<UserPage, SourceError> {
        self.enter(SourceKind::Auth).await?;
        let offset = offset_of(page_token)?;
        let state = self.state.lock();
        let (users, next_page_token) = page(&state.users, offset, max_results);
        Ok(UserPage {
            users,
            next_page_token,
        })
    }
}

#[async_trait]
impl BlobStoreApi for MemoryPlatform {
    async fn list_objects(
        &self,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<ObjectPage, SourceError> {
        self.enter(SourceKind::Storage).await?;
        let offset = offset_of(page_token)?;
        let state = self.state.lock();
        let metas: Vec<Value> = state.objects.iter().map(|(m, _)| m.clone()).collect();
        let (objects, next_page_token) = page(&metas, offset, max_results);
        Ok(ObjectPage {
            objects,
            next_page_token,
        })
    }

    async fn download(&self, object_name: &str) -> Result<Bytes, SourceError> {
        let latency = {
            let mut state = self.state.lock();
            state.downloads += 1;
            state.downloads_in_flight += 1;
            state.peak_downloads_in_flight =
                state.peak_downloads_in_flight.max(state.downloads_in_flight);
            state.download_latency
        };
        let _in_flight = InFlightDownload(&self.state);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let state = self.state.lock();
        if state.broken_downloads.contains(object_name) {
            return Err(SourceError::Transient(format!(
                "download of '{}' reset by peer",
                object_name
            )));
        }
        state
            .objects
            .iter()
            .find(|(m, _)| m.get("name").and_then(Value::as_str) == Some(object_name))
            .map(|(_, content)| content.clone())
            .ok_or_else(|| SourceError::Fatal(format!("object '{}' not found (status 404)", object_name)))
    }
}

/// Leaves the in-flight count when a download returns or is dropped.
struct InFlightDownload<'a>(&'a Mutex<State>);

impl Drop for InFlightDownload<'_> {
    fn drop(&mut self) {
        self.0.lock().downloads_in_flight -= 1;
    }
}

#[async_trait]
impl TreeDatabaseApi for MemoryPlatform {
    async fn root_shape(&self) -> Result<TreeRoot, SourceError> {
        self.enter(SourceKind::RealtimeDb).await?;
        let state = self.state.lock();
        Ok(match &state.tree {
            None | Some(Value::Null) => TreeRoot::Empty,
            Some(Value::Object(_)) => TreeRoot::Children,
            Some(other) => TreeRoot::Primitive(other.clone()),
        })
    }

    async fn children_page(
        &self,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Value)>, SourceError> {
        self.enter(SourceKind::RealtimeDb).await?;
        let state = self.state.lock();
        let Some(Value::Object(root)) = &state.tree else {
            return Ok(Vec::new());
        };
        let mut children: Vec<(String, Value)> =
            root.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        children.sort_by(|a, b| compare_keys(&a.0, &b.0));
        Ok(children
            .into_iter()
            .filter(|(k, _)| match start_after {
                Some(after) => compare_keys(k, after).is_gt(),
                None => true,
            })
            .take(limit)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_collection_listing() {
        let platform = MemoryPlatform::new();
        platform.add_document("users/a", json!({}));
        platform.add_document("users/a/orders/o1", json!({}));
        platform.add_document("posts/p", json!({}));

        let roots = platform.list_collection_ids(None).await.unwrap();
        assert_eq!(roots, vec!["posts".to_string(), "users".to_string()]);
        let subs = platform.list_collection_ids(Some("users/a")).await.unwrap();
        assert_eq!(subs, vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn test_paging() {
        let platform = MemoryPlatform::new();
        for i in 0..5 {
            platform.add_user(json!({ "localId": format!("u{}", i) }));
        }
        let first = platform.list_users(2, None).await.unwrap();
        assert_eq!(first.users.len(), 2);
        assert_eq!(first.next_page_token.as_deref(), Some("2"));
        let last = platform.list_users(2, Some("4")).await.unwrap();
        assert_eq!(last.users.len(), 1);
        assert!(last.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_fault_fires_after_calls() {
        let platform = MemoryPlatform::new();
        platform.inject(
            SourceKind::Auth,
            Fault::after(1, SourceError::Transient("503".into())).times(2),
        );
        assert!(platform.list_users(1, None).await.is_ok());
        assert!(platform.list_users(1, None).await.is_err());
        assert!(platform.list_users(1, None).await.is_err());
        assert!(platform.list_users(1, None).await.is_ok());
        assert_eq!(platform.calls(SourceKind::Auth), 4);
    }
}
