//! Sign-in state shared by every backend client.
//!
//! [`AuthSession`] publishes the current user on a `watch` channel; store
//! clients read the ID token from it on each request and callers can
//! subscribe to sign-in changes. [`IdentityClient`] performs password
//! sign-in against the identity REST API and updates the session.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::BackendConfig;
use crate::store::error_message;
use crate::subscription::Subscription;

/// Lifetime assumed for an ID token when the service doesn't say.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);
/// How long before expiry a token is refreshed.
const REFRESH_MARGIN: Duration = Duration::from_secs(300);
/// Shortest wait between refreshes, also used after a failed refresh.
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(30);

/// A signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub uid: String,
    pub email: Option<String>,
    #[serde(skip_serializing, default)]
    pub id_token: String,
    #[serde(skip_serializing, default)]
    pub refresh_token: String,
}

/// Current sign-in state.
#[derive(Debug)]
pub struct AuthSession {
    state: watch::Sender<Option<AuthUser>>,
}

impl AuthSession {
    /// A signed-out session.
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self { state }
    }

    pub fn current_user(&self) -> Option<AuthUser> {
        self.state.borrow().clone()
    }

    /// ID token of the signed-in user, if any.
    pub fn id_token(&self) -> Option<String> {
        self.state
            .borrow()
            .as_ref()
            .map(|user| user.id_token.clone())
            .filter(|token| !token.is_empty())
    }

    /// Replaces the current user and notifies subscribers.
    pub fn set_user(&self, user: Option<AuthUser>) {
        match &user {
            Some(u) => tracing::info!("Signed in as {}", u.email.as_deref().unwrap_or(&u.uid)),
            None => tracing::info!("Signed out"),
        }
        self.state.send_replace(user);
    }

    /// Calls `callback` with the current user now and after every change.
    pub fn subscribe(
        &self,
        mut callback: impl FnMut(Option<AuthUser>) + Send + 'static,
    ) -> Subscription {
        let mut rx = self.state.subscribe();
        Subscription::spawn(move |gate| async move {
            let current = rx.borrow_and_update().clone();
            if !gate.deliver(|| callback(current)) {
                return;
            }
            while rx.changed().await.is_ok() {
                let user = rx.borrow_and_update().clone();
                if !gate.deliver(|| callback(user)) {
                    break;
                }
            }
        })
    }
}

impl Default for AuthSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors that can occur during sign-in.
#[derive(Debug)]
pub enum AuthError {
    /// Request failed before a response arrived
    Http(String),
    /// Identity service refused the credentials
    Rejected(String),
    /// Token refresh needs a signed-in user with a refresh token
    NotSignedIn,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Http(e) => write!(f, "HTTP error: {}", e),
            AuthError::Rejected(reason) => write!(f, "Sign-in rejected: {}", reason),
            AuthError::NotSignedIn => write!(f, "Not signed in"),
        }
    }
}

impl std::error::Error for AuthError {}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInRequest<'a> {
    email: &'a str,
    password: &'a str,
    return_secure_token: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    local_id: String,
    email: Option<String>,
    id_token: String,
    #[serde(default)]
    refresh_token: String,
}

/// The token endpoint answers in snake_case, unlike the identity endpoint.
#[derive(Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<String>,
}

/// When to refresh a token that lives for `lifetime`.
fn refresh_delay(lifetime: Duration) -> Duration {
    lifetime.saturating_sub(REFRESH_MARGIN).max(MIN_REFRESH_DELAY)
}

async fn rejection(response: reqwest::Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    error_message(&text).unwrap_or_else(|| format!("status {}", status))
}

/// Password sign-in and token refresh against the identity REST APIs.
#[derive(Debug, Clone)]
pub struct IdentityClient {
    http: reqwest::Client,
    endpoint: String,
    token_endpoint: String,
    api_key: String,
    session: Arc<AuthSession>,
}

impl IdentityClient {
    pub fn new(http: reqwest::Client, backend: &BackendConfig, session: Arc<AuthSession>) -> Self {
        Self {
            http,
            endpoint: backend.identity_endpoint.trim_end_matches('/').to_string(),
            token_endpoint: backend.token_endpoint.trim_end_matches('/').to_string(),
            api_key: backend.api_key.clone(),
            session,
        }
    }

    /// Signs in and publishes the user on the session.
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthUser, AuthError> {
        let url = format!("{}/accounts:signInWithPassword", self.endpoint);
        let response = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&SignInRequest {
                email,
                password,
                return_secure_token: true,
            })
            .send()
            .await
            .map_err(|e| AuthError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let reason = rejection(response).await;
            tracing::warn!("Sign-in for {} rejected: {}", email, reason);
            return Err(AuthError::Rejected(reason));
        }

        let body: SignInResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Http(e.to_string()))?;

        let user = AuthUser {
            uid: body.local_id,
            email: body.email,
            id_token: body.id_token,
            refresh_token: body.refresh_token,
        };
        self.session.set_user(Some(user.clone()));
        Ok(user)
    }

    /// Exchanges the session's refresh token for a new ID token.
    ///
    /// Publishes the refreshed user and returns the new token's lifetime.
    pub async fn refresh(&self) -> Result<Duration, AuthError> {
        let current = self
            .session
            .current_user()
            .filter(|user| !user.refresh_token.is_empty())
            .ok_or(AuthError::NotSignedIn)?;

        let url = format!("{}/token", self.token_endpoint);
        let response = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", current.refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let reason = rejection(response).await;
            tracing::warn!("Token refresh for {} rejected: {}", current.uid, reason);
            return Err(AuthError::Rejected(reason));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Http(e.to_string()))?;
        let lifetime = body
            .expires_in
            .and_then(|secs| secs.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);

        tracing::debug!("Refreshed ID token for {}", current.uid);
        self.session.set_user(Some(AuthUser {
            id_token: body.id_token,
            refresh_token: body.refresh_token,
            ..current
        }));
        Ok(lifetime)
    }

    /// Refreshes the ID token shortly before it expires, for as long as the
    /// returned handle is held.
    ///
    /// Failed refreshes are logged and retried. Long-lived subscriptions need
    /// this: the tree store revokes streams whose token has expired.
    pub fn keep_fresh(&self) -> Subscription {
        let client = self.clone();
        Subscription::spawn(move |gate| async move {
            let mut wait = refresh_delay(DEFAULT_TOKEN_LIFETIME);
            loop {
                tokio::time::sleep(wait).await;
                if gate.is_closed() {
                    break;
                }
                wait = match client.refresh().await {
                    Ok(lifetime) => refresh_delay(lifetime),
                    Err(AuthError::NotSignedIn) => break,
                    Err(e) => {
                        tracing::warn!("Token refresh failed, retrying: {}", e);
                        MIN_REFRESH_DELAY
                    }
                };
            }
        })
    }

    pub fn sign_out(&self) {
        self.session.set_user(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use wiremock::matchers::{body_partial_json, body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn user(uid: &str) -> AuthUser {
        AuthUser {
            uid: uid.to_string(),
            email: Some(format!("{}@example.com", uid)),
            id_token: format!("token-{}", uid),
            refresh_token: format!("refresh-{}", uid),
        }
    }

    fn backend_for(server: &MockServer) -> BackendConfig {
        BackendConfig {
            api_key: "test-key".to_string(),
            identity_endpoint: server.uri(),
            token_endpoint: server.uri(),
            ..BackendConfig::default()
        }
    }

    #[test]
    fn test_session_token() {
        let session = AuthSession::new();
        assert!(session.id_token().is_none());

        session.set_user(Some(user("ann")));
        assert_eq!(session.id_token().as_deref(), Some("token-ann"));
        assert_eq!(session.current_user().unwrap().uid, "ann");

        session.set_user(None);
        assert!(session.current_user().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_receives_current_and_changes() {
        let session = AuthSession::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = session.subscribe(move |user| {
            let _ = tx.send(user.map(|u| u.uid));
        });

        assert_eq!(rx.recv().await, Some(None));

        session.set_user(Some(user("ann")));
        assert_eq!(rx.recv().await, Some(Some("ann".to_string())));

        session.set_user(None);
        assert_eq!(rx.recv().await, Some(None));

        subscription.unsubscribe();
        session.set_user(Some(user("bob")));
        // Callback (and its sender) are gone with the task
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_sign_in_publishes_user() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/accounts:signInWithPassword"))
            .and(query_param("key", "test-key"))
            .and(body_partial_json(serde_json::json!({
                "email": "ann@example.com",
                "returnSecureToken": true
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "localId": "uid-1",
                "email": "ann@example.com",
                "idToken": "id-token",
                "refreshToken": "refresh",
                "expiresIn": "3600"
            })))
            .mount(&server)
            .await;

        let session = Arc::new(AuthSession::new());
        let client = IdentityClient::new(
            reqwest::Client::new(),
            &backend_for(&server),
            Arc::clone(&session),
        );

        let user = client
            .sign_in_with_password("ann@example.com", "secret")
            .await
            .unwrap();
        assert_eq!(user.uid, "uid-1");
        assert_eq!(session.id_token().as_deref(), Some("id-token"));

        client.sign_out();
        assert!(session.current_user().is_none());
    }

    #[test]
    fn test_refresh_delay() {
        assert_eq!(
            refresh_delay(Duration::from_secs(3600)),
            Duration::from_secs(3300)
        );
        assert_eq!(refresh_delay(Duration::from_secs(60)), MIN_REFRESH_DELAY);
    }

    #[tokio::test]
    async fn test_refresh_replaces_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(query_param("key", "test-key"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh-ann"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id_token": "fresh-id",
                "refresh_token": "fresh-refresh",
                "expires_in": "1800",
                "user_id": "ann"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let session = Arc::new(AuthSession::new());
        session.set_user(Some(user("ann")));
        let client = IdentityClient::new(
            reqwest::Client::new(),
            &backend_for(&server),
            Arc::clone(&session),
        );

        let lifetime = client.refresh().await.unwrap();
        assert_eq!(lifetime, Duration::from_secs(1800));

        let refreshed = session.current_user().unwrap();
        assert_eq!(refreshed.id_token, "fresh-id");
        assert_eq!(refreshed.refresh_token, "fresh-refresh");
        assert_eq!(refreshed.email.as_deref(), Some("ann@example.com"));
    }

    #[tokio::test]
    async fn test_refresh_requires_sign_in() {
        let client = IdentityClient::new(
            reqwest::Client::new(),
            &BackendConfig::default(),
            Arc::new(AuthSession::new()),
        );
        assert!(matches!(
            client.refresh().await,
            Err(AuthError::NotSignedIn)
        ));
    }

    #[tokio::test]
    async fn test_sign_in_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/accounts:signInWithPassword"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"code": 400, "message": "INVALID_PASSWORD"}
            })))
            .mount(&server)
            .await;

        let session = Arc::new(AuthSession::new());
        let client = IdentityClient::new(
            reqwest::Client::new(),
            &backend_for(&server),
            Arc::clone(&session),
        );

        let err = client
            .sign_in_with_password("ann@example.com", "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Rejected(ref m) if m == "INVALID_PASSWORD"));
        assert!(session.current_user().is_none());
    }
}
