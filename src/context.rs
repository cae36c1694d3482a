//! Shared backend clients.
//!
//! One `StoreContext` is built per process and handed to everything that
//! talks to the backends.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthSession, IdentityClient};
use crate::config::BackendConfig;
use crate::store::{
    DocumentStore, FirestoreStore, MemoryDocumentStore, MemoryTreeStore, RealtimeStore, TreeStore,
};

#[derive(Clone)]
pub struct StoreContext {
    pub documents: Arc<dyn DocumentStore>,
    pub tree: Arc<dyn TreeStore>,
    pub auth: Arc<AuthSession>,
}

impl StoreContext {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        tree: Arc<dyn TreeStore>,
        auth: Arc<AuthSession>,
    ) -> Self {
        Self {
            documents,
            tree,
            auth,
        }
    }

    /// Fresh in-memory stores with a signed-out session.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(MemoryTreeStore::new()),
            Arc::new(AuthSession::new()),
        )
    }

    /// REST clients for `backend`, sharing one HTTP client and session.
    ///
    /// Also returns the identity client bound to the same session.
    pub fn remote(backend: &BackendConfig, watch_interval: Duration) -> (Self, IdentityClient) {
        let http = reqwest::Client::new();
        let auth = Arc::new(AuthSession::new());

        tracing::debug!(
            "Connecting to project '{}' (tree store {})",
            backend.project_id,
            backend.database_url
        );

        let documents = FirestoreStore::new(http.clone(), backend, Arc::clone(&auth), watch_interval);
        let tree = RealtimeStore::new(http.clone(), backend, Arc::clone(&auth));
        let identity = IdentityClient::new(http, backend, Arc::clone(&auth));

        (
            Self::new(Arc::new(documents), Arc::new(tree), auth),
            identity,
        )
    }
}
