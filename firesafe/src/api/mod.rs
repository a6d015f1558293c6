//! Platform API collaborators used by the source adapters.
//!
//! Each service is a narrow async trait returning one page at a time. The
//! production implementation is [`RestClient`]; [`MemoryPlatform`] serves
//! fixtures for tests and dry runs.

mod memory;
mod rest;

pub use memory::{Fault, MemoryPlatform};
pub use rest::RestClient;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};

use crate::error::SourceError;

/// A Firestore document as returned by the REST API.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiDocument {
    /// Full resource name (`projects/.../documents/users/alice`)
    pub name: String,
    /// Document path relative to the database root (`users/alice`)
    pub path: String,
    /// Typed fields, `{"field": {"stringValue": "..."}}`
    pub fields: Map<String, Value>,
    pub create_time: Option<String>,
    pub update_time: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DocumentPage {
    pub documents: Vec<ApiDocument>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait DocumentStoreApi: Send + Sync {
    /// Collection ids directly under `parent` (a document path), or the root
    /// collections when `parent` is `None`.
    async fn list_collection_ids(&self, parent: Option<&str>) -> Result<Vec<String>, SourceError>;

    /// One page of documents in the collection at `collection_path`.
    async fn list_documents(
        &self,
        collection_path: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<DocumentPage, SourceError>;
}

#[derive(Debug, Clone, Default)]
pub struct UserPage {
    /// Raw user records in the Identity Toolkit shape
    pub users: Vec<Value>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait DirectoryApi: Send + Sync {
    async fn list_users(
        &self,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<UserPage, SourceError>;
}

#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    /// Raw object resources in the Cloud Storage JSON API shape
    pub objects: Vec<Value>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait BlobStoreApi: Send + Sync {
    async fn list_objects(
        &self,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<ObjectPage, SourceError>;

    async fn download(&self, object_name: &str) -> Result<Bytes, SourceError>;
}

/// Shape of a realtime database root.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeRoot {
    Empty,
    /// The root holds a single primitive value
    Primitive(Value),
    /// The root has children; their subtrees are fetched page by page
    Children,
}

#[async_trait]
pub trait TreeDatabaseApi: Send + Sync {
    async fn root_shape(&self) -> Result<TreeRoot, SourceError>;

    /// Up to `limit` top-level children ordered by key, strictly after
    /// `start_after` when given.
    async fn children_page(
        &self,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Value)>, SourceError>;
}
