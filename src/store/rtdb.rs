//! Tree store backed by the Realtime Database REST API.
//!
//! Every path maps to `{database_url}/{path}.json`. Live subscriptions use the
//! streaming endpoint: the server sends `put` and `patch` events relative to
//! the watched path, which are applied to a local copy of the subtree. A
//! dropped or revoked stream is reopened with exponential backoff, and the
//! first `put` after reconnecting carries the whole subtree again.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;

use super::sse::{SseEvent, SseParser};
use super::tree::{prune, write_at};
use super::{status_error, Record, StoreError, TreePath, TreeStore, TreeStream};
use crate::auth::AuthSession;
use crate::config::BackendConfig;

/// Realtime Database REST client implementing [`TreeStore`].
#[derive(Debug, Clone)]
pub struct RealtimeStore {
    http: reqwest::Client,
    database_url: String,
    session: Arc<AuthSession>,
}

impl RealtimeStore {
    pub fn new(http: reqwest::Client, backend: &BackendConfig, session: Arc<AuthSession>) -> Self {
        Self {
            http,
            database_url: backend.database_url.trim_end_matches('/').to_string(),
            session,
        }
    }

    fn url_for(&self, path: &TreePath) -> String {
        let encoded: Vec<String> = path
            .segments()
            .iter()
            .map(|s| urlencoding::encode(s).into_owned())
            .collect();
        format!("{}/{}.json", self.database_url, encoded.join("/"))
    }

    fn request(&self, method: Method, path: &TreePath) -> RequestBuilder {
        let builder = self.http.request(method, self.url_for(path));
        match self.session.id_token() {
            Some(token) => builder.query(&[("auth", token)]),
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

    async fn open_event_stream(&self, path: &TreePath) -> Result<ByteStream, StoreError> {
        let response = self
            .send(
                self.request(Method::GET, path)
                    .header(ACCEPT, "text/event-stream"),
            )
            .await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed())
    }
}

#[async_trait]
impl TreeStore for RealtimeStore {
    async fn get(&self, path: &TreePath) -> Result<Option<Value>, StoreError> {
        let response = self.send(self.request(Method::GET, path)).await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(prune(value))
    }

    async fn set(&self, path: &TreePath, value: Value) -> Result<(), StoreError> {
        self.send(self.request(Method::PUT, path).json(&value))
            .await?;
        Ok(())
    }

    async fn update(&self, path: &TreePath, fields: Record) -> Result<(), StoreError> {
        // Validate child paths locally; the server would reject them anyway
        for key in fields.keys() {
            path.join(key)?;
        }
        self.send(self.request(Method::PATCH, path).json(&fields))
            .await?;
        Ok(())
    }

    async fn remove(&self, path: &TreePath) -> Result<(), StoreError> {
        self.send(self.request(Method::DELETE, path)).await?;
        Ok(())
    }

    fn watch(&self, path: &TreePath) -> TreeStream {
        let watcher = Watcher {
            store: self.clone(),
            path: path.clone(),
            events: None,
            reconnect_delay: None,
            finished: false,
        };
        futures::stream::unfold(watcher, |mut watcher| async move {
            let item = watcher.next_item().await?;
            Some((item, watcher))
        })
        .boxed()
    }
}

const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(100);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

type ByteStream = BoxStream<'static, Result<Vec<u8>, reqwest::Error>>;

/// Drives one `watch`: keeps an event stream open, reopening it with
/// backoff when it drops. Only a denied subscription ends the stream.
struct Watcher {
    store: RealtimeStore,
    path: TreePath,
    events: Option<Box<EventStream>>,
    /// Wait before the next connect; `None` for the first attempt
    reconnect_delay: Option<Duration>,
    finished: bool,
}

impl Watcher {
    async fn next_item(&mut self) -> Option<Result<Option<Value>, StoreError>> {
        loop {
            if self.finished {
                return None;
            }

            let Some(events) = self.events.as_mut() else {
                if let Some(delay) = self.reconnect_delay {
                    tracing::warn!("Reconnecting to {} in {:?}", self.path, delay);
                    tokio::time::sleep(delay).await;
                }
                match self.store.open_event_stream(&self.path).await {
                    Ok(body) => {
                        tracing::debug!("Opened event stream for {}", self.path);
                        self.events = Some(Box::new(EventStream::new(body)));
                    }
                    Err(e) => {
                        let retry = !matches!(e, StoreError::PermissionDenied(_));
                        return Some(Err(self.drop_stream(e, retry)));
                    }
                }
                continue;
            };

            if let Some(event) = events.pending.pop_front() {
                match events.apply(event) {
                    Ok(Applied::Snapshot(snapshot)) => {
                        self.reconnect_delay = None;
                        return Some(Ok(snapshot));
                    }
                    Ok(Applied::Ignored) => {}
                    // The next connect picks up the refreshed token
                    Ok(Applied::Revoked) => {
                        let e = StoreError::PermissionDenied(
                            "credential expired or revoked".to_string(),
                        );
                        return Some(Err(self.drop_stream(e, true)));
                    }
                    Err(e) => {
                        let retry = !matches!(e, StoreError::PermissionDenied(_));
                        return Some(Err(self.drop_stream(e, retry)));
                    }
                }
                continue;
            }

            match events.body.next().await {
                Some(Ok(chunk)) => {
                    let parsed = events.parser.push(&chunk);
                    events.pending.extend(parsed);
                }
                Some(Err(e)) => {
                    let e = StoreError::Http(e.to_string());
                    return Some(Err(self.drop_stream(e, true)));
                }
                None => {
                    let e = StoreError::StreamClosed("event stream ended".to_string());
                    return Some(Err(self.drop_stream(e, true)));
                }
            }
        }
    }

    /// Closes the current stream and schedules a reconnect, or ends the
    /// watch when `retry` is false. Hands `error` back for reporting.
    fn drop_stream(&mut self, error: StoreError, retry: bool) -> StoreError {
        self.events = None;
        if retry {
            let delay = self
                .reconnect_delay
                .map_or(MIN_RECONNECT_DELAY, |d| (d * 2).min(MAX_RECONNECT_DELAY));
            self.reconnect_delay = Some(delay);
        } else {
            self.finished = true;
        }
        error
    }
}

enum Applied {
    Snapshot(Option<Value>),
    Ignored,
    Revoked,
}

/// `data` payload of `put` and `patch` events.
#[derive(Debug, Deserialize)]
struct PathData {
    path: String,
    data: Value,
}

/// An open event stream and the subtree it has built so far.
struct EventStream {
    body: ByteStream,
    parser: SseParser,
    pending: VecDeque<SseEvent>,
    snapshot: Value,
}

impl EventStream {
    fn new(body: ByteStream) -> Self {
        Self {
            body,
            parser: SseParser::new(),
            pending: VecDeque::new(),
            snapshot: Value::Null,
        }
    }

    fn apply(&mut self, event: SseEvent) -> Result<Applied, StoreError> {
        match event.event.as_str() {
            "put" => {
                let put = parse_path_data(&event.data)?;
                let target = TreePath::parse(&put.path)?;
                write_at(&mut self.snapshot, target.segments(), Some(put.data));
            }
            "patch" => {
                let patch = parse_path_data(&event.data)?;
                let base = TreePath::parse(&patch.path)?;
                let children = match patch.data {
                    Value::Object(children) => children,
                    other => {
                        return Err(StoreError::Decode(format!(
                            "patch data is not an object: {}",
                            other
                        )))
                    }
                };
                for (key, value) in children {
                    let target = base.join(&key)?;
                    write_at(&mut self.snapshot, target.segments(), Some(value));
                }
            }
            "keep-alive" => return Ok(Applied::Ignored),
            "cancel" => {
                return Err(StoreError::PermissionDenied(format!(
                    "subscription cancelled: {}",
                    event.data
                )))
            }
            "auth_revoked" => return Ok(Applied::Revoked),
            other => {
                tracing::debug!("Ignoring event stream event '{}'", other);
                return Ok(Applied::Ignored);
            }
        }
        Ok(Applied::Snapshot(prune(self.snapshot.clone())))
    }
}

fn parse_path_data(data: &str) -> Result<PathData, StoreError> {
    serde_json::from_str(data).map_err(|e| StoreError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer, session: Arc<AuthSession>) -> RealtimeStore {
        let backend = BackendConfig {
            database_url: format!("{}/", server.uri()),
            ..BackendConfig::default()
        };
        RealtimeStore::new(reqwest::Client::new(), &backend, session)
    }

    fn signed_in() -> Arc<AuthSession> {
        let session = Arc::new(AuthSession::new());
        session.set_user(Some(crate::auth::AuthUser {
            uid: "admin".to_string(),
            email: None,
            id_token: "tok".to_string(),
            refresh_token: String::new(),
        }));
        session
    }

    #[test]
    fn test_url_for_encodes_segments() {
        let backend = BackendConfig {
            database_url: "https://db.example.com/".to_string(),
            ..BackendConfig::default()
        };
        let store = RealtimeStore::new(
            reqwest::Client::new(),
            &backend,
            Arc::new(AuthSession::new()),
        );
        assert_eq!(
            store.url_for(&TreePath::parse("content_data/ch 1").unwrap()),
            "https://db.example.com/content_data/ch%201.json"
        );
        assert_eq!(
            store.url_for(&TreePath::root()),
            "https://db.example.com/.json"
        );
    }

    #[tokio::test]
    async fn test_get_null_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/u1.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Value::Null))
            .mount(&server)
            .await;

        let store = store_for(&server, Arc::new(AuthSession::new()));
        let value = store.get(&TreePath::parse("users/u1").unwrap()).await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_set_puts_value_with_auth() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/users/u1.json"))
            .and(query_param("auth", "tok"))
            .and(body_json(json!({"id": "u1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "u1"})))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server, signed_in());
        store
            .set(&TreePath::parse("users/u1").unwrap(), json!({"id": "u1"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_patches_children() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/content_links.json"))
            .and(body_json(json!({"a": {"url": "x"}, "b": {"url": "y"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server, Arc::new(AuthSession::new()));
        let fields = json!({"a": {"url": "x"}, "b": {"url": "y"}})
            .as_object()
            .cloned()
            .unwrap();
        store
            .update(&TreePath::parse("content_links").unwrap(), fields)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({"error": "Permission denied"})),
            )
            .mount(&server)
            .await;

        let store = store_for(&server, Arc::new(AuthSession::new()));
        let err = store
            .get(&TreePath::parse("users").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_watch_applies_put_and_patch_events() {
        let server = MockServer::start().await;
        let body = concat!(
            "event: put\n",
            "data: {\"path\":\"/\",\"data\":{\"u1\":{\"id\":\"u1\"}}}\n\n",
            "event: keep-alive\n",
            "data: null\n\n",
            "event: patch\n",
            "data: {\"path\":\"/u1\",\"data\":{\"email\":\"a@example.com\"}}\n\n",
            "event: put\n",
            "data: {\"path\":\"/u2\",\"data\":{\"id\":\"u2\"}}\n\n",
            "event: put\n",
            "data: {\"path\":\"/u1\",\"data\":null}\n\n",
        );
        Mock::given(method("GET"))
            .and(path("/users.json"))
            .and(header("accept", "text/event-stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let store = store_for(&server, Arc::new(AuthSession::new()));
        let mut stream = store.watch(&TreePath::parse("users").unwrap());

        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            Some(json!({"u1": {"id": "u1"}}))
        );
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            Some(json!({"u1": {"id": "u1", "email": "a@example.com"}}))
        );
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            Some(json!({"u1": {"id": "u1", "email": "a@example.com"}, "u2": {"id": "u2"}}))
        );
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            Some(json!({"u2": {"id": "u2"}}))
        );

        // Body exhausted: closure is reported, then the reconnect replays the subtree
        assert!(matches!(
            stream.next().await,
            Some(Err(StoreError::StreamClosed(_)))
        ));
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            Some(json!({"u1": {"id": "u1"}}))
        );
    }

    #[tokio::test]
    async fn test_watch_reconnects_after_stream_closes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/content_links.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(concat!(
                "event: put\n",
                "data: {\"path\":\"/\",\"data\":{\"v\":1}}\n\n",
            )))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/content_links.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(concat!(
                "event: put\n",
                "data: {\"path\":\"/\",\"data\":{\"v\":2}}\n\n",
            )))
            .mount(&server)
            .await;

        let store = store_for(&server, Arc::new(AuthSession::new()));
        let mut stream = store.watch(&TreePath::parse("content_links").unwrap());

        assert_eq!(stream.next().await.unwrap().unwrap(), Some(json!({"v": 1})));
        assert!(matches!(
            stream.next().await,
            Some(Err(StoreError::StreamClosed(_)))
        ));
        assert_eq!(stream.next().await.unwrap().unwrap(), Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn test_watch_reconnects_with_new_token_after_revocation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users.json"))
            .and(query_param("auth", "tok"))
            .respond_with(ResponseTemplate::new(200).set_body_string(concat!(
                "event: put\n",
                "data: {\"path\":\"/\",\"data\":{\"u1\":true}}\n\n",
                "event: auth_revoked\n",
                "data: credential is no longer valid\n\n",
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users.json"))
            .and(query_param("auth", "fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_string(concat!(
                "event: put\n",
                "data: {\"path\":\"/\",\"data\":{\"u2\":true}}\n\n",
            )))
            .mount(&server)
            .await;

        let session = signed_in();
        let store = store_for(&server, Arc::clone(&session));
        let mut stream = store.watch(&TreePath::parse("users").unwrap());

        assert_eq!(stream.next().await.unwrap().unwrap(), Some(json!({"u1": true})));
        assert!(matches!(
            stream.next().await,
            Some(Err(StoreError::PermissionDenied(_)))
        ));

        session.set_user(Some(crate::auth::AuthUser {
            uid: "admin".to_string(),
            email: None,
            id_token: "fresh".to_string(),
            refresh_token: String::new(),
        }));
        assert_eq!(stream.next().await.unwrap().unwrap(), Some(json!({"u2": true})));
    }

    #[tokio::test]
    async fn test_watch_denied_at_connect_ends_stream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users.json"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({"error": "Permission denied"})),
            )
            .mount(&server)
            .await;

        let store = store_for(&server, Arc::new(AuthSession::new()));
        let mut stream = store.watch(&TreePath::parse("users").unwrap());

        assert!(matches!(
            stream.next().await,
            Some(Err(StoreError::PermissionDenied(_)))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_watch_cancel_event_ends_stream() {
        let server = MockServer::start().await;
        let body = concat!(
            "event: put\n",
            "data: {\"path\":\"/\",\"data\":null}\n\n",
            "event: cancel\n",
            "data: permission denied\n\n",
        );
        Mock::given(method("GET"))
            .and(path("/system_settings.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let store = store_for(&server, Arc::new(AuthSession::new()));
        let mut stream = store.watch(&TreePath::parse("system_settings").unwrap());

        assert_eq!(stream.next().await.unwrap().unwrap(), None);
        assert!(matches!(
            stream.next().await,
            Some(Err(StoreError::PermissionDenied(_)))
        ));
        assert!(stream.next().await.is_none());
    }
}
