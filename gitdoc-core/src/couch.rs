//! HTTP document store client.
//!
//! Talks to a CouchDB-compatible database:
//! - `GET  /<db>/_all_docs` for the presence scan
//! - `GET  /<db>/<id>` returning the document and its `_rev`
//! - `PUT  /<db>/<id>` with an optional `_rev`, 409 on conflict
//! - `POST /<db>/_bulk_docs` with `all_or_nothing` for atomic commits

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::StoreError;
use crate::store::{
    split_revision, with_revision, BulkResult, PutOutcome, StoreResult, StoredDocument,
    TargetStore,
};

#[derive(Debug, Deserialize)]
struct AllDocs {
    rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
struct AllDocsRow {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    rev: String,
}

/// Client for one database of an HTTP document store.
#[derive(Debug, Clone)]
pub struct CouchStore {
    db_url: Url,
    http: reqwest::Client,
}

impl CouchStore {
    /// Create a client for the database at `url` (e.g. `http://host:5984/git`).
    pub fn new(url: &str) -> StoreResult<Self> {
        let db_url = Url::parse(url).map_err(|_| StoreError::InvalidUrl(url.to_string()))?;
        if db_url.cannot_be_a_base() {
            return Err(StoreError::InvalidUrl(url.to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|source| StoreError::Http {
                url: url.to_string(),
                source,
            })?;
        Ok(Self { db_url, http })
    }

    pub fn url(&self) -> &Url {
        &self.db_url
    }

    /// URL of a path below the database; segments are percent-encoded.
    fn url_for(&self, segment: &str) -> StoreResult<Url> {
        let mut url = self.db_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidUrl(self.db_url.to_string()))?
            .pop_if_empty()
            .push(segment);
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &Url) -> StoreResult<reqwest::Response> {
        request.send().await.map_err(|source| StoreError::Http {
            url: url.to_string(),
            source,
        })
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        url: &Url,
    ) -> StoreResult<T> {
        response.json().await.map_err(|e| StoreError::BadResponse {
            url: url.to_string(),
            detail: e.to_string(),
        })
    }

    async fn unexpected(method: &'static str, url: &Url, response: reqwest::Response) -> StoreError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        StoreError::UnexpectedStatus {
            method,
            url: url.to_string(),
            status,
            body,
        }
    }
}

#[async_trait]
impl TargetStore for CouchStore {
    async fn list_ids(&self) -> StoreResult<Vec<String>> {
        let url = self.url_for("_all_docs")?;
        let resp = self.send(self.http.get(url.clone()), &url).await?;
        if !resp.status().is_success() {
            return Err(Self::unexpected("GET", &url, resp).await);
        }
        let all: AllDocs = Self::read_json(resp, &url).await?;
        Ok(all.rows.into_iter().map(|row| row.id).collect())
    }

    async fn get(&self, id: &str) -> StoreResult<Option<StoredDocument>> {
        let url = self.url_for(id)?;
        let resp = self.send(self.http.get(url.clone()), &url).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::unexpected("GET", &url, resp).await);
        }
        let value: Value = Self::read_json(resp, &url).await?;
        match split_revision(value) {
            (Some(revision), body) => Ok(Some(StoredDocument { revision, body })),
            (None, _) => Err(StoreError::BadResponse {
                url: url.to_string(),
                detail: "document without _rev".to_string(),
            }),
        }
    }

    async fn put(&self, id: &str, body: &Value, revision: Option<&str>) -> StoreResult<PutOutcome> {
        let url = self.url_for(id)?;
        let payload = with_revision(body, revision);
        let resp = self
            .send(self.http.put(url.clone()).json(&payload), &url)
            .await?;
        match resp.status() {
            StatusCode::CONFLICT => Ok(PutOutcome::Conflict),
            status if status.is_success() => {
                let put: PutResponse = Self::read_json(resp, &url).await?;
                Ok(PutOutcome::Written { revision: put.rev })
            }
            _ => Err(Self::unexpected("PUT", &url, resp).await),
        }
    }

    async fn put_all(&self, documents: &[Value]) -> StoreResult<Vec<BulkResult>> {
        let url = self.url_for("_bulk_docs")?;
        let payload = json!({ "all_or_nothing": true, "docs": documents });
        let resp = self
            .send(self.http.post(url.clone()).json(&payload), &url)
            .await?;
        if !resp.status().is_success() {
            return Err(Self::unexpected("POST", &url, resp).await);
        }
        Self::read_json(resp, &url).await
    }
}
