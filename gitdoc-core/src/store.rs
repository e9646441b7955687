//! Target store abstraction
//!
//! A target is a document database keyed by id with revision based
//! optimistic concurrency. Bodies are plain JSON objects; the revision
//! token travels separately and never appears in a [`StoredDocument`]'s
//! body.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::StoreError;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Field carrying the revision token inside store payloads.
pub const REVISION_FIELD: &str = "_rev";

/// Field carrying the document id inside store payloads.
pub const ID_FIELD: &str = "_id";

/// A document as currently stored, with its revision token split off.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub revision: String,
    pub body: Value,
}

/// Outcome of a single-document optimistic write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// The write was applied and produced this revision.
    Written { revision: String },
    /// Another writer got there first; re-read and retry.
    Conflict,
    /// Accepted, but the stored state already satisfied it and nothing
    /// changed.
    Unchanged,
}

/// Per-document result of a bulk commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkResult {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "rev", skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BulkResult {
    pub fn ok(id: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision: Some(revision.into()),
            error: None,
            reason: None,
        }
    }

    pub fn failed(id: impl Into<String>, error: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision: None,
            error: Some(error.into()),
            reason: Some(reason.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Document store interface used as the replication target.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Ids of every stored document, used once per run for the presence scan.
    async fn list_ids(&self) -> StoreResult<Vec<String>>;

    /// Current value of a document, or `None` if it does not exist.
    async fn get(&self, id: &str) -> StoreResult<Option<StoredDocument>>;

    /// Write `body` under `id`. `revision` must be the current revision of an
    /// existing document, or `None` to create a new one.
    async fn put(&self, id: &str, body: &Value, revision: Option<&str>) -> StoreResult<PutOutcome>;

    /// Commit many documents at once: either all become visible or none do.
    /// Each document carries its own `_id` and, for updates, `_rev`.
    async fn put_all(&self, documents: &[Value]) -> StoreResult<Vec<BulkResult>>;
}

#[async_trait]
impl<T: TargetStore + ?Sized> TargetStore for Arc<T> {
    async fn list_ids(&self) -> StoreResult<Vec<String>> {
        (**self).list_ids().await
    }

    async fn get(&self, id: &str) -> StoreResult<Option<StoredDocument>> {
        (**self).get(id).await
    }

    async fn put(&self, id: &str, body: &Value, revision: Option<&str>) -> StoreResult<PutOutcome> {
        (**self).put(id, body, revision).await
    }

    async fn put_all(&self, documents: &[Value]) -> StoreResult<Vec<BulkResult>> {
        (**self).put_all(documents).await
    }
}

#[async_trait]
impl<'a, T: TargetStore + ?Sized> TargetStore for &'a T {
    async fn list_ids(&self) -> StoreResult<Vec<String>> {
        (**self).list_ids().await
    }

    async fn get(&self, id: &str) -> StoreResult<Option<StoredDocument>> {
        (**self).get(id).await
    }

    async fn put(&self, id: &str, body: &Value, revision: Option<&str>) -> StoreResult<PutOutcome> {
        (**self).put(id, body, revision).await
    }

    async fn put_all(&self, documents: &[Value]) -> StoreResult<Vec<BulkResult>> {
        (**self).put_all(documents).await
    }
}

/// Split the revision token off a store payload.
pub fn split_revision(mut body: Value) -> (Option<String>, Value) {
    let revision = body
        .as_object_mut()
        .and_then(|map| map.remove(REVISION_FIELD))
        .and_then(|rev| rev.as_str().map(str::to_string));
    (revision, body)
}

/// Attach a revision token to a store payload.
pub fn with_revision(body: &Value, revision: Option<&str>) -> Value {
    let mut body = body.clone();
    if let (Some(map), Some(rev)) = (body.as_object_mut(), revision) {
        map.insert(REVISION_FIELD.to_string(), Value::String(rev.to_string()));
    }
    body
}

/// The `_id` of a store payload, if present.
pub fn document_id(body: &Value) -> Option<&str> {
    body.get(ID_FIELD).and_then(Value::as_str)
}
