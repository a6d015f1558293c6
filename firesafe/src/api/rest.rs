//! REST implementation of the platform APIs.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, instrument};
use url::Url;

use super::{
    ApiDocument, BlobStoreApi, DirectoryApi, DocumentPage, DocumentStoreApi, ObjectPage,
    TreeDatabaseApi, TreeRoot, UserPage,
};
use crate::config::ExportConfig;
use crate::error::SourceError;
use crate::serializer::canonical_document_path;
use crate::sources::realtime_db::compare_keys;

const COLLECTION_ID_PAGE_SIZE: usize = 300;

/// Client for the Firestore, Identity Toolkit, Cloud Storage and Realtime
/// Database REST APIs, authenticated with an OAuth bearer token.
pub struct RestClient {
    client: Client,
    project_id: String,
    database: String,
    bucket: Option<String>,
    realtime_db_url: Option<String>,
    firestore_url: String,
    identity_toolkit_url: String,
    storage_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionIdsResponse {
    #[serde(default)]
    collection_ids: Vec<String>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDocumentsResponse {
    #[serde(default)]
    documents: Vec<RestDocument>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestDocument {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
    create_time: Option<String>,
    update_time: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchGetResponse {
    #[serde(default)]
    users: Vec<Value>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListObjectsResponse {
    #[serde(default)]
    items: Vec<Value>,
    next_page_token: Option<String>,
}

impl RestClient {
    pub fn new(config: &ExportConfig, access_token: &str) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {}", access_token).parse()?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .user_agent(concat!("firesafe/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let endpoints = &config.firebase.endpoints;
        Ok(Self {
            client,
            project_id: config.firebase.project_id.clone(),
            database: config.firebase.firestore_database.clone(),
            bucket: config.firebase.storage_bucket.clone(),
            realtime_db_url: config.firebase.realtime_db_url.clone(),
            firestore_url: endpoints.firestore.trim_end_matches('/').to_string(),
            identity_toolkit_url: endpoints.identity_toolkit.trim_end_matches('/').to_string(),
            storage_url: endpoints.storage.trim_end_matches('/').to_string(),
        })
    }

    fn documents_url(&self, suffix: &[&str]) -> Result<Url, SourceError> {
        let mut segments = vec![
            "v1",
            "projects",
            self.project_id.as_str(),
            "databases",
            self.database.as_str(),
        ];
        segments.extend_from_slice(suffix);
        build_url(&self.firestore_url, &segments)
    }

    fn bucket(&self) -> Result<&str, SourceError> {
        self.bucket
            .as_deref()
            .ok_or_else(|| SourceError::Fatal("no storage bucket configured".to_string()))
    }

    fn database_url(&self) -> Result<Url, SourceError> {
        let base = self
            .realtime_db_url
            .as_deref()
            .ok_or_else(|| SourceError::Fatal("no realtime database URL configured".to_string()))?;
        build_url(base, &[".json"])
    }
}

fn build_url(base: &str, segments: &[&str]) -> Result<Url, SourceError> {
    let mut url = Url::parse(base)
        .map_err(|e| SourceError::Fatal(format!("invalid endpoint '{}': {}", base, e)))?;
    url.path_segments_mut()
        .map_err(|_| SourceError::Fatal(format!("endpoint '{}' cannot be a base", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Turn a non-success response into a classified error.
async fn check(response: Response, context: &str) -> Result<Response, SourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SourceError::from_status(
        status.as_u16(),
        &format!("{}: {}", context, body.trim()),
    ))
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response, context: &str) -> Result<T, SourceError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| SourceError::Fatal(format!("{}: malformed response: {}", context, e)))
}

#[async_trait]
impl DocumentStoreApi for RestClient {
    #[instrument(skip(self))]
    async fn list_collection_ids(&self, parent: Option<&str>) -> Result<Vec<String>, SourceError> {
        // The action is appended to the last path segment: `.../documents/users/alice:listCollectionIds`
        let target = match parent {
            Some(parent) => format!("documents/{}:listCollectionIds", parent),
            None => "documents:listCollectionIds".to_string(),
        };
        let suffix: Vec<&str> = target.split('/').collect();
        let url = self.documents_url(&suffix)?;

        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut body = json!({ "pageSize": COLLECTION_ID_PAGE_SIZE });
            if let Some(token) = &page_token {
                body["pageToken"] = Value::String(token.clone());
            }
            let response = self.client.post(url.clone()).json(&body).send().await?;
            let response = check(response, "listCollectionIds").await?;
            let page: CollectionIdsResponse = decode(response, "listCollectionIds").await?;
            ids.extend(page.collection_ids);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        debug!(count = ids.len(), "Listed collection ids");
        Ok(ids)
    }

    #[instrument(skip(self))]
    async fn list_documents(
        &self,
        collection_path: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<DocumentPage, SourceError> {
        let mut suffix: Vec<&str> = vec!["documents"];
        suffix.extend(collection_path.split('/'));
        let mut url = self.documents_url(&suffix)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("pageSize", &page_size.to_string());
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }

        let response = self.client.get(url).send().await?;
        let response = check(response, "listDocuments").await?;
        let page: ListDocumentsResponse = decode(response, "listDocuments").await?;

        Ok(DocumentPage {
            documents: page
                .documents
                .into_iter()
                .map(|d| ApiDocument {
                    path: canonical_document_path(&d.name),
                    name: d.name,
                    fields: d.fields,
                    create_time: d.create_time,
                    update_time: d.update_time,
                })
                .collect(),
            next_page_token: page.next_page_token.filter(|t| !t.is_empty()),
        })
    }
}

#[async_trait]
impl DirectoryApi for RestClient {
    #[instrument(skip(self))]
    async fn list_users(
        &self,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<UserPage, SourceError> {
        let mut url = build_url(
            &self.identity_toolkit_url,
            &["v1", "projects", self.project_id.as_str(), "accounts:batchGet"],
        )?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("maxResults", &max_results.to_string());
            if let Some(token) = page_token {
                query.append_pair("nextPageToken", token);
            }
        }

        let response = self.client.get(url).send().await?;
        let response = check(response, "accounts:batchGet").await?;
        let page: BatchGetResponse = decode(response, "accounts:batchGet").await?;
        Ok(UserPage {
            users: page.users,
            next_page_token: page.next_page_token.filter(|t| !t.is_empty()),
        })
    }
}

#[async_trait]
impl BlobStoreApi for RestClient {
    #[instrument(skip(self))]
    async fn list_objects(
        &self,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<ObjectPage, SourceError> {
        let bucket = self.bucket()?;
        let mut url = build_url(&self.storage_url, &["storage", "v1", "b", bucket, "o"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("maxResults", &max_results.to_string());
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }

        let response = self.client.get(url).send().await?;
        let response = check(response, "objects.list").await?;
        let page: ListObjectsResponse = decode(response, "objects.list").await?;
        Ok(ObjectPage {
            objects: page.items,
            next_page_token: page.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    #[instrument(skip(self))]
    async fn download(&self, object_name: &str) -> Result<Bytes, SourceError> {
        let bucket = self.bucket()?;
        let mut url = build_url(
            &self.storage_url,
            &["storage", "v1", "b", bucket, "o", object_name],
        )?;
        url.query_pairs_mut().append_pair("alt", "media");

        let response = self.client.get(url).send().await?;
        let response = check(response, "objects.get").await?;
        Ok(response.bytes().await?)
    }
}

#[async_trait]
impl TreeDatabaseApi for RestClient {
    #[instrument(skip(self))]
    async fn root_shape(&self) -> Result<TreeRoot, SourceError> {
        let mut url = self.database_url()?;
        url.query_pairs_mut().append_pair("shallow", "true");

        let response = self.client.get(url).send().await?;
        let response = check(response, "shallow read").await?;
        let root: Value = decode(response, "shallow read").await?;
        Ok(match root {
            Value::Null => TreeRoot::Empty,
            Value::Object(_) => TreeRoot::Children,
            other => TreeRoot::Primitive(other),
        })
    }

    #[instrument(skip(self))]
    async fn children_page(
        &self,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Value)>, SourceError> {
        let mut url = self.database_url()?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("orderBy", "\"$key\"");
            query.append_pair("limitToFirst", &limit.to_string());
            if let Some(key) = start_after {
                query.append_pair("startAfter", &Value::String(key.to_string()).to_string());
            }
        }

        let response = self.client.get(url).send().await?;
        let response = check(response, "ordered read").await?;
        let page: Value = decode(response, "ordered read").await?;
        let mut children: Vec<(String, Value)> = match page {
            Value::Object(map) => map.into_iter().collect(),
            Value::Null => Vec::new(),
            _ => {
                return Err(SourceError::Fatal(
                    "ordered read returned a non-object".to_string(),
                ))
            }
        };
        // JSON objects lose the server's ordering
        children.sort_by(|a, b| compare_keys(&a.0, &b.0));
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_encodes_segments() {
        let url = build_url(
            "https://storage.googleapis.com/",
            &["storage", "v1", "b", "bkt", "o", "images/logo one.png"],
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/bkt/o/images%2Flogo%20one.png"
        );
    }

    #[test]
    fn test_build_url_rejects_garbage() {
        let err = build_url("not a url", &["x"]).unwrap_err();
        assert!(!err.is_transient());
    }
}
