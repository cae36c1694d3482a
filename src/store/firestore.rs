//! Document store backed by the Firestore v1 REST API.
//!
//! Documents travel as typed values (`{"stringValue": "..."}` etc.); this
//! module converts them to and from plain JSON. Live subscriptions poll the
//! document, since the streaming listen API isn't available over REST.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{status_error, CollectionPath, DocPath, DocStream, DocumentStore, Record, StoreError};
use crate::auth::AuthSession;
use crate::config::BackendConfig;

/// Encodes a JSON value as a Firestore typed value.
pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64().unwrap_or(0.0) }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => json!({
            "arrayValue": { "values": items.iter().map(encode_value).collect::<Vec<_>>() }
        }),
        Value::Object(map) => json!({ "mapValue": { "fields": encode_fields(map) } }),
    }
}

/// Encodes a record as a Firestore `fields` map.
pub fn encode_fields(record: &Record) -> Map<String, Value> {
    record
        .iter()
        .map(|(k, v)| (k.clone(), encode_value(v)))
        .collect()
}

/// Decodes a Firestore typed value into plain JSON.
///
/// Timestamps, references and bytes come back as their string form;
/// geo points as `{latitude, longitude}`.
pub fn decode_value(value: &Value) -> Result<Value, StoreError> {
    let (kind, inner) = value
        .as_object()
        .filter(|map| map.len() == 1)
        .and_then(|map| map.iter().next())
        .ok_or_else(|| StoreError::Decode(format!("not a typed value: {}", value)))?;

    match kind.as_str() {
        "nullValue" => Ok(Value::Null),
        "booleanValue" => inner
            .as_bool()
            .map(Value::Bool)
            .ok_or_else(|| StoreError::Decode(format!("bad booleanValue: {}", inner))),
        "integerValue" => {
            let parsed = match inner {
                Value::String(s) => s.parse::<i64>().ok(),
                Value::Number(n) => n.as_i64(),
                _ => None,
            };
            parsed
                .map(|i| Value::Number(i.into()))
                .ok_or_else(|| StoreError::Decode(format!("bad integerValue: {}", inner)))
        }
        "doubleValue" => match inner {
            Value::Number(n) => Ok(Value::Number(n.clone())),
            // NaN and the infinities arrive as strings and have no JSON form
            Value::String(_) => Ok(Value::Null),
            _ => Err(StoreError::Decode(format!("bad doubleValue: {}", inner))),
        },
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => inner
            .as_str()
            .map(|s| Value::String(s.to_string()))
            .ok_or_else(|| StoreError::Decode(format!("bad {}: {}", kind, inner))),
        "geoPointValue" => Ok(inner.clone()),
        "mapValue" => {
            let fields = inner.get("fields").and_then(Value::as_object);
            match fields {
                Some(fields) => decode_fields(fields).map(Value::Object),
                None => Ok(Value::Object(Map::new())),
            }
        }
        "arrayValue" => {
            let values = inner.get("values").and_then(Value::as_array);
            match values {
                Some(values) => values
                    .iter()
                    .map(decode_value)
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array),
                None => Ok(Value::Array(Vec::new())),
            }
        }
        other => Err(StoreError::Decode(format!("unknown value type: {}", other))),
    }
}

/// Decodes a Firestore `fields` map into a record.
pub fn decode_fields(fields: &Map<String, Value>) -> Result<Record, StoreError> {
    fields
        .iter()
        .map(|(k, v)| decode_value(v).map(|v| (k.clone(), v)))
        .collect()
}

/// Quotes a field name for use in a field path if it isn't a plain
/// identifier.
fn quote_field_path(field: &str) -> String {
    let mut chars = field.chars();
    let simple = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if simple {
        field.to_string()
    } else {
        format!("`{}`", field.replace('\\', "\\\\").replace('`', "\\`"))
    }
}

#[derive(Debug, Deserialize)]
struct FirestoreDocument {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RunQueryItem {
    document: Option<FirestoreDocument>,
}

/// Shortest gap between two polls of a watched document.
pub const MIN_WATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Firestore REST client implementing [`DocumentStore`].
#[derive(Debug, Clone)]
pub struct FirestoreStore {
    http: reqwest::Client,
    /// `.../projects/{id}/databases/(default)/documents`
    documents_url: String,
    api_key: String,
    session: Arc<AuthSession>,
    watch_interval: Duration,
}

impl FirestoreStore {
    pub fn new(
        http: reqwest::Client,
        backend: &BackendConfig,
        session: Arc<AuthSession>,
        watch_interval: Duration,
    ) -> Self {
        let documents_url = format!(
            "{}/projects/{}/databases/(default)/documents",
            backend.firestore_endpoint.trim_end_matches('/'),
            urlencoding::encode(&backend.project_id)
        );
        if watch_interval < MIN_WATCH_INTERVAL {
            tracing::warn!(
                "Watch interval {:?} is below {:?}, using the minimum",
                watch_interval,
                MIN_WATCH_INTERVAL
            );
        }
        Self {
            http,
            documents_url,
            api_key: backend.api_key.clone(),
            session,
            watch_interval: watch_interval.max(MIN_WATCH_INTERVAL),
        }
    }

    fn url_for(&self, segments: &[String]) -> String {
        let mut url = self.documents_url.clone();
        for segment in segments {
            url.push('/');
            url.push_str(&urlencoding::encode(segment));
        }
        url
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .query(&[("key", self.api_key.as_str())]);
        match self.session.id_token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, StoreError> {
        let response = builder
            .send()
            .await
            .map_err(|e| StoreError::Http(e.to_string()))?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(status_error(response).await)
        }
    }

    /// Converts a full resource name back into a [`DocPath`].
    fn path_from_name(&self, name: &str) -> Result<DocPath, StoreError> {
        let relative = name
            .split_once("/documents/")
            .map(|(_, rest)| rest)
            .ok_or_else(|| StoreError::Decode(format!("unexpected document name: {}", name)))?;
        DocPath::new(relative.split('/').map(|s| {
            urlencoding::decode(s)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| s.to_string())
        }))
    }
}

#[async_trait]
impl DocumentStore for FirestoreStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Record>, StoreError> {
        let url = self.url_for(path.segments());
        match self.send(self.request(Method::GET, &url)).await {
            Ok(response) => {
                let doc: FirestoreDocument = response
                    .json()
                    .await
                    .map_err(|e| StoreError::Decode(e.to_string()))?;
                decode_fields(&doc.fields).map(Some)
            }
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set(&self, path: &DocPath, record: Record) -> Result<(), StoreError> {
        let url = self.url_for(path.segments());
        let body = json!({ "fields": encode_fields(&record) });
        self.send(self.request(Method::PATCH, &url).json(&body))
            .await?;
        Ok(())
    }

    async fn update(&self, path: &DocPath, fields: Record) -> Result<(), StoreError> {
        let url = self.url_for(path.segments());
        let mut params: Vec<(&str, String)> = fields
            .keys()
            .map(|k| ("updateMask.fieldPaths", quote_field_path(k)))
            .collect();
        params.push(("currentDocument.exists", "true".to_string()));

        let body = json!({ "fields": encode_fields(&fields) });
        match self
            .send(self.request(Method::PATCH, &url).query(&params).json(&body))
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound(_)) => Err(StoreError::NotFound(path.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, path: &DocPath) -> Result<(), StoreError> {
        let url = self.url_for(path.segments());
        match self.send(self.request(Method::DELETE, &url)).await {
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn query_eq(
        &self,
        collection: &CollectionPath,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(DocPath, Record)>, StoreError> {
        let url = format!("{}:runQuery", self.url_for(collection.parent_segments()));
        let body = json!({
            "structuredQuery": {
                "from": [{ "collectionId": collection.id() }],
                "where": {
                    "fieldFilter": {
                        "field": { "fieldPath": quote_field_path(field) },
                        "op": "EQUAL",
                        "value": encode_value(value)
                    }
                },
                "orderBy": [{ "field": { "fieldPath": "__name__" }, "direction": "ASCENDING" }]
            }
        });

        let response = self
            .send(self.request(Method::POST, &url).json(&body))
            .await?;
        let items: Vec<RunQueryItem> = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        items
            .into_iter()
            .filter_map(|item| item.document)
            .map(|doc| {
                let path = self.path_from_name(&doc.name)?;
                let record = decode_fields(&doc.fields)?;
                Ok((path, record))
            })
            .collect()
    }

    fn watch(&self, path: &DocPath) -> DocStream {
        let state = PollState {
            store: self.clone(),
            path: path.clone(),
            last: None,
            polled: false,
        };

        futures::stream::unfold(state, |mut state| async move {
            loop {
                if state.polled {
                    tokio::time::sleep(state.store.watch_interval).await;
                }
                state.polled = true;
                match state.store.get(&state.path).await {
                    Ok(current) => {
                        if state.last.as_ref() != Some(&current) {
                            state.last = Some(current.clone());
                            return Some((Ok(current), state));
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Poll of {} failed: {}", state.path, e);
                        return Some((Err(e), state));
                    }
                }
            }
        })
        .boxed()
    }
}

struct PollState {
    store: FirestoreStore,
    path: DocPath,
    /// Last emitted snapshot; `None` until one has been emitted
    last: Option<Option<Record>>,
    polled: bool,
}
