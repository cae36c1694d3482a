//! Backend store abstractions.
//!
//! Two kinds of store sit behind the sync layer:
//!
//! - [`DocumentStore`]: records addressed by `collection/id` pairs, optionally
//!   nested (`users/u1/test_results/r1`). Supports field equality queries and
//!   per-document live snapshots.
//! - [`TreeStore`]: one JSON tree addressed by slash-delimited paths. Supports
//!   full replace, merge-update and live subtree snapshots.
//!
//! Absence is never an error: reads return `Ok(None)` for missing data.

use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};

pub mod firestore;
pub mod memory;
pub mod rtdb;
pub mod sse;
pub mod tree;

pub use firestore::FirestoreStore;
pub use memory::{MemoryDocumentStore, MemoryTreeStore};
pub use rtdb::RealtimeStore;

/// An arbitrary admin-defined record.
pub type Record = Map<String, Value>;

/// Live snapshots of a single document (`None` while it doesn't exist).
pub type DocStream = BoxStream<'static, Result<Option<Record>, StoreError>>;

/// Live snapshots of a tree path (`None` while nothing is stored there).
pub type TreeStream = BoxStream<'static, Result<Option<Value>, StoreError>>;

/// Errors reported by store backends.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Transport-level failure (connect, TLS, body read)
    Http(String),
    /// Backend answered with an unexpected status
    Status { code: u16, message: String },
    /// Backend rejected the credentials or rules denied access
    PermissionDenied(String),
    /// Operation requires an existing record
    NotFound(String),
    /// Path or key cannot be addressed in this store
    InvalidPath(String),
    /// Payload could not be decoded
    Decode(String),
    /// Live stream was closed by the backend
    StreamClosed(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Http(e) => write!(f, "HTTP error: {}", e),
            StoreError::Status { code, message } => {
                write!(f, "Backend returned status {}: {}", code, message)
            }
            StoreError::PermissionDenied(e) => write!(f, "Permission denied: {}", e),
            StoreError::NotFound(e) => write!(f, "Not found: {}", e),
            StoreError::InvalidPath(p) => write!(f, "Invalid path: {}", p),
            StoreError::Decode(e) => write!(f, "Decode error: {}", e),
            StoreError::StreamClosed(e) => write!(f, "Stream closed: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

/// Identity and document APIs send `{"message": ...}`; the tree API sends a
/// bare string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorDetail {
    Message { message: String },
    Text(String),
}

/// Message carried by a JSON error body, if it has one.
pub(crate) fn error_message(body: &str) -> Option<String> {
    match serde_json::from_str::<ErrorEnvelope>(body).ok()?.error {
        ErrorDetail::Message { message } => Some(message),
        ErrorDetail::Text(text) => Some(text),
    }
}

/// Maps a non-success response to a [`StoreError`].
pub(crate) async fn status_error(response: Response) -> StoreError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = error_message(&text).unwrap_or(text);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::PermissionDenied(message),
        StatusCode::NOT_FOUND => StoreError::NotFound(message),
        other => StoreError::Status {
            code: other.as_u16(),
            message,
        },
    }
}

/// Location of a document: alternating collection and document ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocPath {
    segments: Vec<String>,
}

impl DocPath {
    /// Builds a path from raw segments.
    ///
    /// Requires an even, non-zero number of segments, none empty, none
    /// containing `/`, none equal to `.` or `..`.
    pub fn new<I, S>(segments: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() || segments.len() % 2 != 0 {
            return Err(StoreError::InvalidPath(segments.join("/")));
        }
        for segment in &segments {
            validate_doc_segment(segment)?;
        }
        Ok(Self { segments })
    }

    /// Top-level document `collection/id`.
    pub fn doc(collection: &str, id: &str) -> Result<Self, StoreError> {
        Self::new([collection, id])
    }

    /// Document in a sub-collection of this document.
    pub fn child(&self, collection: &str, id: &str) -> Result<Self, StoreError> {
        let mut segments = self.segments.clone();
        segments.push(collection.to_string());
        segments.push(id.to_string());
        Self::new(segments)
    }

    /// Parses a slash-joined path such as `users/u1`.
    pub fn parse(path: &str) -> Result<Self, StoreError> {
        Self::new(path.split('/'))
    }

    /// The document id (last segment).
    pub fn id(&self) -> &str {
        // Non-empty by construction
        &self.segments[self.segments.len() - 1]
    }

    /// The collection this document lives in.
    pub fn collection(&self) -> CollectionPath {
        CollectionPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl std::fmt::Display for DocPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

/// Location of a collection: an odd number of segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionPath {
    segments: Vec<String>,
}

impl CollectionPath {
    pub fn parse(path: &str) -> Result<Self, StoreError> {
        let segments: Vec<String> = path.split('/').map(str::to_string).collect();
        if segments.len() % 2 != 1 {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        for segment in &segments {
            validate_doc_segment(segment)?;
        }
        Ok(Self { segments })
    }

    /// The collection id (last segment).
    pub fn id(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }

    /// Segments of the document owning this collection (empty at top level).
    pub fn parent_segments(&self) -> &[String] {
        &self.segments[..self.segments.len() - 1]
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl std::fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

fn validate_doc_segment(segment: &str) -> Result<(), StoreError> {
    if segment.is_empty() || segment.contains('/') || segment == "." || segment == ".." {
        return Err(StoreError::InvalidPath(segment.to_string()));
    }
    Ok(())
}

/// Location in the tree store. The empty path is the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TreePath {
    segments: Vec<String>,
}

impl TreePath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses a slash-delimited path. Empty segments are dropped, so
    /// `"/users//u1/"` equals `"users/u1"`.
    pub fn parse(path: &str) -> Result<Self, StoreError> {
        let mut segments = Vec::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            validate_tree_segment(segment, path)?;
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// Single child below this path. `key` must be one segment.
    pub fn child(&self, key: &str) -> Result<Self, StoreError> {
        if key.is_empty() || key.contains('/') {
            return Err(StoreError::InvalidPath(key.to_string()));
        }
        validate_tree_segment(key, key)?;
        let mut segments = self.segments.clone();
        segments.push(key.to_string());
        Ok(Self { segments })
    }

    /// Appends a relative path, which may span several segments.
    pub fn join(&self, relative: &str) -> Result<Self, StoreError> {
        let relative = Self::parse(relative)?;
        let mut segments = self.segments.clone();
        segments.extend(relative.segments);
        Ok(Self { segments })
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl std::fmt::Display for TreePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

fn validate_tree_segment(segment: &str, whole: &str) -> Result<(), StoreError> {
    if segment
        .chars()
        .any(|c| matches!(c, '.' | '#' | '$' | '[' | ']') || c.is_control())
    {
        return Err(StoreError::InvalidPath(whole.to_string()));
    }
    Ok(())
}

/// A store of documents grouped into collections.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Reads one document.
    async fn get(&self, path: &DocPath) -> Result<Option<Record>, StoreError>;

    /// Creates or fully replaces a document.
    async fn set(&self, path: &DocPath, record: Record) -> Result<(), StoreError>;

    /// Overwrites the given top-level fields of an existing document.
    ///
    /// Fails with [`StoreError::NotFound`] if the document doesn't exist.
    async fn update(&self, path: &DocPath, fields: Record) -> Result<(), StoreError>;

    /// Deletes a document. Deleting a missing document succeeds.
    async fn delete(&self, path: &DocPath) -> Result<(), StoreError>;

    /// Documents of `collection` whose `field` equals `value`, ordered by id.
    async fn query_eq(
        &self,
        collection: &CollectionPath,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(DocPath, Record)>, StoreError>;

    /// Live snapshots of one document. The first item is the current state.
    fn watch(&self, path: &DocPath) -> DocStream;
}

/// A hierarchical JSON store addressed by path.
#[async_trait]
pub trait TreeStore: Send + Sync {
    /// Reads the value at `path`.
    async fn get(&self, path: &TreePath) -> Result<Option<Value>, StoreError>;

    /// Replaces the value at `path`. Writing `null` removes it.
    async fn set(&self, path: &TreePath, value: Value) -> Result<(), StoreError>;

    /// Writes each child of `fields` below `path`, leaving siblings alone.
    ///
    /// Child keys may be relative paths (`"a/b"`).
    async fn update(&self, path: &TreePath, fields: Record) -> Result<(), StoreError>;

    /// Removes the value at `path`.
    async fn remove(&self, path: &TreePath) -> Result<(), StoreError>;

    /// Live snapshots of `path`. The first item is the current state.
    fn watch(&self, path: &TreePath) -> TreeStream;
}
