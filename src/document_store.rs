//! Read access to the document database.
//!
//! `FirestoreClient` talks to the Firestore REST API; `InMemoryDocumentStore`
//! backs tests and local runs.

use crate::credentials::{AccessTokenSource, CredentialsError};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, trace};

pub type Fields = Map<String, Value>;

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Document store request failed: {0}")]
    Request(String),
    #[error("Document store returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Failed to decode document: {0}")]
    Decode(String),
    #[error("Credentials error: {0}")]
    Credentials(String),
    #[error("Document store unavailable: {0}")]
    Unavailable(String),
    #[error("Invalid document store URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Request(err.to_string())
    }
}

impl From<CredentialsError> for StoreError {
    fn from(err: CredentialsError) -> Self {
        StoreError::Credentials(err.to_string())
    }
}

/// A document read from a collection listing.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub fields: Fields,
    /// Changes whenever the document is written.
    pub update_time: Option<String>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Point lookup. `Ok(None)` means the document does not exist.
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Fields>, StoreError>;

    /// Every document currently in `collection`.
    async fn list_documents(&self, collection: &str) -> Result<Vec<StoredDocument>, StoreError>;
}

// --- Firestore REST ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirestoreDocument {
    pub name: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub create_time: Option<String>,
    #[serde(default)]
    pub update_time: Option<String>,
}

impl FirestoreDocument {
    /// Last path segment of the document name.
    pub fn id(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    pub fn decoded_fields(&self) -> Result<Fields, StoreError> {
        decode_fields(&self.fields)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDocumentsResponse {
    #[serde(default)]
    documents: Vec<FirestoreDocument>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Converts a Firestore `fields` map into plain JSON.
pub fn decode_fields(fields: &Map<String, Value>) -> Result<Fields, StoreError> {
    fields
        .iter()
        .map(|(k, v)| Ok((k.clone(), decode_value(v)?)))
        .collect()
}

/// Converts one typed Firestore value (`{"stringValue": "..."}` etc.) into plain JSON.
///
/// Timestamps, bytes and references become strings.
pub fn decode_value(value: &Value) -> Result<Value, StoreError> {
    let obj = value
        .as_object()
        .ok_or_else(|| StoreError::Decode(format!("expected typed value, got {}", value)))?;
    let (kind, inner) = obj
        .iter()
        .next()
        .ok_or_else(|| StoreError::Decode("empty typed value".to_string()))?;

    match kind.as_str() {
        "nullValue" => Ok(Value::Null),
        "booleanValue" | "stringValue" | "timestampValue" | "bytesValue" | "referenceValue" => {
            Ok(inner.clone())
        }
        "integerValue" => {
            // int64 values travel as decimal strings
            let n = match inner {
                Value::String(s) => s
                    .parse::<i64>()
                    .map_err(|e| StoreError::Decode(format!("integerValue {:?}: {}", s, e)))?,
                Value::Number(n) => n
                    .as_i64()
                    .ok_or_else(|| StoreError::Decode(format!("integerValue {}", n)))?,
                other => return Err(StoreError::Decode(format!("integerValue {}", other))),
            };
            Ok(Value::from(n))
        }
        "doubleValue" => match inner {
            Value::Number(_) => Ok(inner.clone()),
            // NaN and infinities are sent as strings and have no JSON number form
            _ => Ok(Value::Null),
        },
        "geoPointValue" => Ok(inner.clone()),
        "arrayValue" => {
            let values = inner
                .get("values")
                .and_then(Value::as_array)
                .map(|vs| vs.iter().map(decode_value).collect::<Result<Vec<_>, _>>())
                .transpose()?
                .unwrap_or_default();
            Ok(Value::Array(values))
        }
        "mapValue" => {
            let fields = inner
                .get("fields")
                .and_then(Value::as_object)
                .map(decode_fields)
                .transpose()?
                .unwrap_or_default();
            Ok(Value::Object(fields))
        }
        other => Err(StoreError::Decode(format!("unknown value type {}", other))),
    }
}

pub struct FirestoreClient {
    http: reqwest::Client,
    tokens: Arc<dyn AccessTokenSource>,
    documents_url: Url,
    page_size: u32,
}

/// Whether `id` can name a document. Ids never contain `/` and are never
/// `.` or `..`.
pub fn is_valid_document_id(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains('/')
}

impl FirestoreClient {
    pub fn new(
        http: reqwest::Client,
        tokens: Arc<dyn AccessTokenSource>,
        base_url: &str,
        project_id: &str,
        page_size: u32,
    ) -> Result<Self, StoreError> {
        let invalid = |reason: String| StoreError::InvalidUrl(format!("{}: {}", base_url, reason));
        let mut documents_url = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        documents_url
            .path_segments_mut()
            .map_err(|_| invalid("cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["projects", project_id, "databases", "(default)", "documents"]);

        Ok(Self {
            http,
            tokens,
            documents_url,
            page_size,
        })
    }

    /// The documents URL extended by `segments`, each percent-encoded as a
    /// single path segment.
    fn url_for(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.documents_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidUrl(self.documents_url.to_string()))?
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl DocumentStore for FirestoreClient {
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Fields>, StoreError> {
        if !is_valid_document_id(id) {
            debug!(collection, id, "Not a valid document id, treating as missing");
            return Ok(None);
        }
        let url = self.url_for(&[collection, id])?;
        let token = self.tokens.access_token().await?;
        trace!(%url, "Fetching document");

        let response = self.http.get(url).bearer_auth(token).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(collection, id, "Document does not exist");
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let document: FirestoreDocument = response.json().await?;
        document.decoded_fields().map(Some)
    }

    async fn list_documents(&self, collection: &str) -> Result<Vec<StoredDocument>, StoreError> {
        let url = self.url_for(&[collection])?;
        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let token = self.tokens.access_token().await?;
            let mut request = self
                .http
                .get(url.clone())
                .bearer_auth(token)
                .query(&[("pageSize", self.page_size.to_string())]);
            if let Some(page) = page_token.as_deref() {
                request = request.query(&[("pageToken", page)]);
            }

            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(StoreError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            let page: ListDocumentsResponse = response.json().await?;
            for document in page.documents {
                documents.push(StoredDocument {
                    id: document.id().to_string(),
                    fields: document.decoded_fields()?,
                    update_time: document.update_time.clone(),
                });
            }

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        trace!(collection, count = documents.len(), "Listed documents");
        Ok(documents)
    }
}

// --- In-memory ---

#[derive(Default)]
struct Inner {
    collections: HashMap<String, BTreeMap<String, (Fields, u64)>>,
    lookups: Vec<(String, String)>,
    next_version: u64,
    lookup_error: Option<StoreError>,
    list_error: Option<StoreError>,
}

/// An in-process document store that records every point lookup.
#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites a document. Overwrites count as a modification.
    pub fn put(&self, collection: &str, id: &str, fields: Fields) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_version += 1;
        let version = inner.next_version;
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), (fields, version));
    }

    pub fn remove(&self, collection: &str, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner
            .collections
            .get_mut(collection)
            .map(|docs| docs.remove(id).is_some())
            .unwrap_or(false)
    }

    /// Point lookups performed so far, as `(collection, id)`.
    pub fn lookups(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().lookups.clone()
    }

    /// Makes every following point lookup fail with `error`.
    pub fn fail_lookups_with(&self, error: StoreError) {
        self.inner.lock().unwrap().lookup_error = Some(error);
    }

    /// Makes every following collection listing fail with `error`.
    pub fn fail_listing_with(&self, error: StoreError) {
        self.inner.lock().unwrap().list_error = Some(error);
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Fields>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.lookups.push((collection.to_string(), id.to_string()));
        if let Some(error) = inner.lookup_error.clone() {
            return Err(error);
        }
        Ok(inner
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|(fields, _)| fields.clone()))
    }

    async fn list_documents(&self, collection: &str) -> Result<Vec<StoredDocument>, StoreError> {
        let inner = self.inner.lock().unwrap();
        if let Some(error) = inner.list_error.clone() {
            return Err(error);
        }
        Ok(inner
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, (fields, version))| StoredDocument {
                        id: id.clone(),
                        fields: fields.clone(),
                        update_time: Some(version.to_string()),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
