//! Dual-write / smart-read operations over the document and tree stores.
//!
//! Every logical record has a copy in each store:
//!
//! ```text
//! tree store                  document store
//! users/{id}                  users/{id}
//! system_settings             config/system_settings
//! content_data/{key}          content_data/{key}
//! content_links  (bulk)       content_data/{key}  (one document per entry)
//! -                           users/{id}/test_results/{testId}_{millis}
//! ```
//!
//! Writes go to the tree store first, then the document store. Reads try the
//! primary store for the record family and fall back to the other one when
//! the record is missing or the read fails. The two copies are independent:
//! nothing reconciles them if one write fails, which is reported as
//! [`SyncError::PartialWrite`].
//!
//! All operations log failures at the boundary, so callers that don't care
//! may ignore the returned `Result`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use futures::future::try_join_all;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;

use crate::auth::{AuthSession, AuthUser};
use crate::context::StoreContext;
use crate::models::{from_record, to_record, Record, TestAttempt, User};
use crate::store::{CollectionPath, DocPath, DocumentStore, StoreError, TreePath, TreeStore};
use crate::subscription::Subscription;

const USERS: &str = "users";
const TEST_RESULTS: &str = "test_results";
const CONFIG: &str = "config";
const SYSTEM_SETTINGS: &str = "system_settings";
const CONTENT_DATA: &str = "content_data";
const CONTENT_LINKS: &str = "content_links";
const EMAIL: &str = "email";
const LAST_ACTIVE_TIME: &str = "lastActiveTime";

/// Which of the two stores an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    Document,
    Tree,
}

impl StoreKind {
    fn other(self) -> Self {
        match self {
            StoreKind::Document => StoreKind::Tree,
            StoreKind::Tree => StoreKind::Document,
        }
    }
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::Document => write!(f, "document store"),
            StoreKind::Tree => write!(f, "tree store"),
        }
    }
}

/// Errors returned by sync operations.
#[derive(Debug)]
pub enum SyncError {
    /// Record has no id; nothing was written
    MissingId,
    /// Id or key can't be used as a store path
    InvalidKey(String),
    /// A store operation failed before anything was written
    Store { store: StoreKind, source: StoreError },
    /// One store took the write, the other didn't
    PartialWrite {
        written: StoreKind,
        failed: StoreKind,
        source: StoreError,
    },
    /// Record couldn't be converted to or from its typed form
    Decode(String),
}

impl SyncError {
    fn tree(source: StoreError) -> Self {
        SyncError::Store {
            store: StoreKind::Tree,
            source,
        }
    }

    fn document(source: StoreError) -> Self {
        SyncError::Store {
            store: StoreKind::Document,
            source,
        }
    }

    fn document_after_tree(source: StoreError) -> Self {
        SyncError::PartialWrite {
            written: StoreKind::Tree,
            failed: StoreKind::Document,
            source,
        }
    }

    fn decode(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::MissingId => write!(f, "Record has no id"),
            SyncError::InvalidKey(e) => write!(f, "Invalid key: {}", e),
            SyncError::Store { store, source } => write!(f, "{} failed: {}", store, source),
            SyncError::PartialWrite {
                written,
                failed,
                source,
            } => write!(
                f,
                "Write reached the {} but the {} failed: {}",
                written, failed, source
            ),
            SyncError::Decode(e) => write!(f, "Decode error: {}", e),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Store { source, .. } | SyncError::PartialWrite { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

/// Reachability of each store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub document_store: bool,
    pub tree_store: bool,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.document_store && self.tree_store
    }
}

fn logged<T>(operation: &str, result: Result<T, SyncError>) -> Result<T, SyncError> {
    match &result {
        Err(SyncError::MissingId) => tracing::debug!("{}: record has no id, skipped", operation),
        Err(e) => tracing::error!("Error in {}: {}", operation, e),
        Ok(_) => {}
    }
    result
}

fn tree_path(parts: &[&str]) -> Result<TreePath, SyncError> {
    parts
        .iter()
        .try_fold(TreePath::root(), |path, part| path.child(part))
        .map_err(|e| SyncError::InvalidKey(e.to_string()))
}

fn doc_path(parts: &[&str]) -> Result<DocPath, SyncError> {
    DocPath::new(parts.iter().copied()).map_err(|e| SyncError::InvalidKey(e.to_string()))
}

fn users_from_snapshot(snapshot: Option<Value>) -> Vec<User> {
    let Some(Value::Object(entries)) = snapshot else {
        return Vec::new();
    };
    entries
        .into_iter()
        .filter_map(|(key, value)| match serde_json::from_value::<User>(value) {
            Ok(user) => Some(user),
            Err(e) => {
                tracing::warn!("Skipping malformed user '{}': {}", key, e);
                None
            }
        })
        .collect()
}

/// Façade over the two stores.
#[derive(Clone)]
pub struct DualStoreSync {
    documents: Arc<dyn DocumentStore>,
    tree: Arc<dyn TreeStore>,
    auth: Arc<AuthSession>,
}

impl DualStoreSync {
    pub fn new(context: StoreContext) -> Self {
        Self {
            documents: context.documents,
            tree: context.tree,
            auth: context.auth,
        }
    }

    // ---------------------------------------------------------------------
    // Users
    // ---------------------------------------------------------------------

    /// Writes the user to the tree store, then the document store.
    ///
    /// Users without an id are rejected with [`SyncError::MissingId`] before
    /// anything is written.
    pub async fn save_user(&self, user: &User) -> Result<(), SyncError> {
        let result = async {
            if user.id.is_empty() {
                return Err(SyncError::MissingId);
            }
            let record = to_record(user).map_err(SyncError::decode)?;
            self.dual_write(
                &tree_path(&[USERS, &user.id])?,
                &doc_path(&[USERS, &user.id])?,
                record,
            )
            .await
        }
        .await;
        logged("save_user", result)
    }

    /// Live list of all users from the tree store.
    ///
    /// `callback` gets the full list on subscription and after every change.
    /// Subscription errors are logged only; there is no document-store
    /// fallback.
    pub fn subscribe_users(
        &self,
        mut callback: impl FnMut(Vec<User>) + Send + 'static,
    ) -> Result<Subscription, SyncError> {
        let path = tree_path(&[USERS])?;
        let mut snapshots = self.tree.watch(&path);

        Ok(Subscription::spawn(move |gate| async move {
            while let Some(snapshot) = snapshots.next().await {
                match snapshot {
                    Ok(value) => {
                        let users = users_from_snapshot(value);
                        if !gate.deliver(|| callback(users)) {
                            break;
                        }
                    }
                    Err(e) => tracing::error!("Users subscription error: {}", e),
                }
            }
        }))
    }

    /// Tree store first, then the document store. Copies are never merged.
    pub async fn get_user(&self, id: &str) -> Result<Option<User>, SyncError> {
        let result = async {
            let record = self
                .smart_read(
                    StoreKind::Tree,
                    &tree_path(&[USERS, id])?,
                    &doc_path(&[USERS, id])?,
                )
                .await?;
            record
                .map(from_record::<User>)
                .transpose()
                .map_err(SyncError::decode)
        }
        .await;
        logged("get_user", result)
    }

    /// First user (by id) in the document store with this email.
    ///
    /// Only the document store is searched.
    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, SyncError> {
        let result = async {
            let users = CollectionPath::parse(USERS)
                .map_err(|e| SyncError::InvalidKey(e.to_string()))?;
            let matches = self
                .documents
                .query_eq(&users, EMAIL, &Value::String(email.to_string()))
                .await
                .map_err(SyncError::document)?;
            matches
                .into_iter()
                .next()
                .map(|(_, record)| from_record::<User>(record))
                .transpose()
                .map_err(SyncError::decode)
        }
        .await;
        logged("get_user_by_email", result)
    }

    /// Records the user as active now.
    ///
    /// Only the tree store is updated. `_time` is accepted for call-site
    /// compatibility but the stored `lastActiveTime` is always the current
    /// wall-clock time.
    pub async fn update_user_status(&self, user_id: &str, _time: i64) -> Result<(), SyncError> {
        let result = async {
            let path = tree_path(&[USERS, user_id])?;
            let mut fields = Record::new();
            fields.insert(
                LAST_ACTIVE_TIME.to_string(),
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
            self.tree.update(&path, fields).await.map_err(SyncError::tree)
        }
        .await;
        logged("update_user_status", result)
    }

    /// Removes the user from the tree store, then the document store.
    pub async fn delete_user(&self, id: &str) -> Result<(), SyncError> {
        let result = async {
            self.dual_delete(&tree_path(&[USERS, id])?, &doc_path(&[USERS, id])?)
                .await
        }
        .await;
        logged("delete_user", result)
    }

    /// Stores a test attempt in the document store only, under an id made
    /// of the test id and the current time in milliseconds.
    ///
    /// Returns the path written. Two attempts at the same test within one
    /// millisecond share an id and the later one wins.
    pub async fn save_test_result(
        &self,
        user_id: &str,
        attempt: &TestAttempt,
    ) -> Result<DocPath, SyncError> {
        let result = async {
            let doc_id = format!("{}_{}", attempt.test_id, Utc::now().timestamp_millis());
            let path = doc_path(&[USERS, user_id, TEST_RESULTS, &doc_id])?;
            let record = to_record(attempt).map_err(SyncError::decode)?;
            self.documents
                .set(&path, record)
                .await
                .map_err(SyncError::document)?;
            Ok(path)
        }
        .await;
        logged("save_test_result", result)
    }

    // ---------------------------------------------------------------------
    // System settings
    // ---------------------------------------------------------------------

    pub async fn save_system_settings(&self, settings: Record) -> Result<(), SyncError> {
        let result = async {
            self.dual_write(
                &tree_path(&[SYSTEM_SETTINGS])?,
                &doc_path(&[CONFIG, SYSTEM_SETTINGS])?,
                settings,
            )
            .await
        }
        .await;
        logged("save_system_settings", result)
    }

    /// Document store first, then the tree store.
    pub async fn get_system_settings(&self) -> Result<Option<Record>, SyncError> {
        let result = async {
            self.smart_read(
                StoreKind::Document,
                &tree_path(&[SYSTEM_SETTINGS])?,
                &doc_path(&[CONFIG, SYSTEM_SETTINGS])?,
            )
            .await
        }
        .await;
        logged("get_system_settings", result)
    }

    /// Live settings from the document store.
    ///
    /// While the settings document doesn't exist, each snapshot triggers a
    /// single read of the tree copy instead, and `callback` runs only if
    /// that copy exists.
    pub fn subscribe_settings(
        &self,
        mut callback: impl FnMut(Record) + Send + 'static,
    ) -> Result<Subscription, SyncError> {
        let fallback = tree_path(&[SYSTEM_SETTINGS])?;
        let mut snapshots = self.documents.watch(&doc_path(&[CONFIG, SYSTEM_SETTINGS])?);
        let tree = Arc::clone(&self.tree);

        Ok(Subscription::spawn(move |gate| async move {
            while let Some(snapshot) = snapshots.next().await {
                let settings = match snapshot {
                    Ok(Some(settings)) => Some(settings),
                    Ok(None) => match tree.get(&fallback).await {
                        Ok(Some(Value::Object(settings))) => Some(settings),
                        Ok(_) => None,
                        Err(e) => {
                            tracing::warn!("Settings fallback read failed: {}", e);
                            None
                        }
                    },
                    Err(e) => {
                        tracing::error!("Settings subscription error: {}", e);
                        None
                    }
                };
                if let Some(settings) = settings {
                    if !gate.deliver(|| callback(settings)) {
                        break;
                    }
                }
            }
        }))
    }

    // ---------------------------------------------------------------------
    // Content
    // ---------------------------------------------------------------------

    /// Saves many content records at once.
    ///
    /// The whole map is merged into the tree store's `content_links` node in
    /// one update, then each entry is written as its own `content_data`
    /// document, concurrently. If one document write fails the others may
    /// already have landed.
    pub async fn bulk_save_links(
        &self,
        updates: &BTreeMap<String, Record>,
    ) -> Result<(), SyncError> {
        let result = async {
            if updates.is_empty() {
                return Ok(());
            }

            let links = tree_path(&[CONTENT_LINKS])?;
            let mut documents = Vec::with_capacity(updates.len());
            let mut merged = Record::new();
            for (key, record) in updates {
                // Reject keys either store can't address before writing anything
                tree_path(&[CONTENT_LINKS, key])?;
                documents.push((doc_path(&[CONTENT_DATA, key])?, record.clone()));
                merged.insert(key.clone(), Value::Object(record.clone()));
            }

            self.tree
                .update(&links, merged)
                .await
                .map_err(SyncError::tree)?;

            let writes = documents.into_iter().map(|(path, record)| {
                let store = Arc::clone(&self.documents);
                async move { store.set(&path, record).await }
            });
            try_join_all(writes)
                .await
                .map_err(SyncError::document_after_tree)?;

            tracing::info!("Saved {} content link(s)", updates.len());
            Ok(())
        }
        .await;
        logged("bulk_save_links", result)
    }

    pub async fn save_chapter_data(&self, key: &str, data: Record) -> Result<(), SyncError> {
        let result = async {
            self.dual_write(
                &tree_path(&[CONTENT_DATA, key])?,
                &doc_path(&[CONTENT_DATA, key])?,
                data,
            )
            .await
        }
        .await;
        logged("save_chapter_data", result)
    }

    /// Tree store first, then the document store.
    pub async fn get_chapter_data(&self, key: &str) -> Result<Option<Record>, SyncError> {
        let result = async {
            self.smart_read(
                StoreKind::Tree,
                &tree_path(&[CONTENT_DATA, key])?,
                &doc_path(&[CONTENT_DATA, key])?,
            )
            .await
        }
        .await;
        logged("get_chapter_data", result)
    }

    /// Live chapter data from the tree store.
    ///
    /// While the tree copy is missing, each snapshot triggers a one-shot read
    /// of the document copy; changes made only to the document store are not
    /// followed.
    pub fn subscribe_chapter_data(
        &self,
        key: &str,
        mut callback: impl FnMut(Record) + Send + 'static,
    ) -> Result<Subscription, SyncError> {
        let fallback = doc_path(&[CONTENT_DATA, key])?;
        let mut snapshots = self.tree.watch(&tree_path(&[CONTENT_DATA, key])?);
        let documents = Arc::clone(&self.documents);

        Ok(Subscription::spawn(move |gate| async move {
            while let Some(snapshot) = snapshots.next().await {
                let data = match snapshot {
                    Ok(Some(Value::Object(data))) => Some(data),
                    Ok(Some(other)) => {
                        tracing::warn!("Ignoring non-object chapter data at {}: {}", fallback, other);
                        None
                    }
                    Ok(None) => match documents.get(&fallback).await {
                        Ok(data) => data,
                        Err(e) => {
                            tracing::warn!("Chapter fallback read failed: {}", e);
                            None
                        }
                    },
                    Err(e) => {
                        tracing::error!("Chapter subscription error: {}", e);
                        None
                    }
                };
                if let Some(data) = data {
                    if !gate.deliver(|| callback(data)) {
                        break;
                    }
                }
            }
        }))
    }

    pub async fn delete_chapter_data(&self, key: &str) -> Result<(), SyncError> {
        let result = async {
            self.dual_delete(
                &tree_path(&[CONTENT_DATA, key])?,
                &doc_path(&[CONTENT_DATA, key])?,
            )
            .await
        }
        .await;
        logged("delete_chapter_data", result)
    }

    // ---------------------------------------------------------------------
    // Connection and auth
    // ---------------------------------------------------------------------

    /// Reads the settings copy from each store to see which ones respond.
    pub async fn check_connection(&self) -> Result<ConnectionStatus, SyncError> {
        let tree_path = tree_path(&[SYSTEM_SETTINGS])?;
        let doc_path = doc_path(&[CONFIG, SYSTEM_SETTINGS])?;
        let (tree, documents) =
            tokio::join!(self.tree.get(&tree_path), self.documents.get(&doc_path));

        if let Err(e) = &tree {
            tracing::warn!("Tree store unreachable: {}", e);
        }
        if let Err(e) = &documents {
            tracing::warn!("Document store unreachable: {}", e);
        }

        Ok(ConnectionStatus {
            document_store: documents.is_ok(),
            tree_store: tree.is_ok(),
        })
    }

    /// Calls `callback` with the signed-in user now and on every change.
    pub fn subscribe_to_auth(
        &self,
        callback: impl FnMut(Option<AuthUser>) + Send + 'static,
    ) -> Subscription {
        self.auth.subscribe(callback)
    }

    pub fn current_user(&self) -> Option<AuthUser> {
        self.auth.current_user()
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    async fn dual_write(
        &self,
        tree_path: &TreePath,
        doc_path: &DocPath,
        record: Record,
    ) -> Result<(), SyncError> {
        self.tree
            .set(tree_path, Value::Object(record.clone()))
            .await
            .map_err(SyncError::tree)?;
        self.documents
            .set(doc_path, record)
            .await
            .map_err(SyncError::document_after_tree)
    }

    async fn dual_delete(&self, tree_path: &TreePath, doc_path: &DocPath) -> Result<(), SyncError> {
        self.tree.remove(tree_path).await.map_err(SyncError::tree)?;
        self.documents
            .delete(doc_path)
            .await
            .map_err(SyncError::document_after_tree)
    }

    /// Reads from `primary`, falling back to the other store when the record
    /// is missing or the read fails.
    ///
    /// If the primary read failed and the fallback finds nothing, the
    /// primary's error is returned rather than `None`.
    async fn smart_read(
        &self,
        primary: StoreKind,
        tree_path: &TreePath,
        doc_path: &DocPath,
    ) -> Result<Option<Record>, SyncError> {
        let primary_error = match self.read_from(primary, tree_path, doc_path).await {
            Ok(Some(record)) => return Ok(Some(record)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("{} read failed, trying {}: {}", primary, primary.other(), e);
                Some(e)
            }
        };

        let secondary = primary.other();
        match self.read_from(secondary, tree_path, doc_path).await {
            Ok(Some(record)) => Ok(Some(record)),
            Ok(None) => match primary_error {
                Some(source) => Err(SyncError::Store {
                    store: primary,
                    source,
                }),
                None => Ok(None),
            },
            Err(source) => Err(SyncError::Store {
                store: secondary,
                source,
            }),
        }
    }

    async fn read_from(
        &self,
        store: StoreKind,
        tree_path: &TreePath,
        doc_path: &DocPath,
    ) -> Result<Option<Record>, StoreError> {
        match store {
            StoreKind::Document => self.documents.get(doc_path).await,
            StoreKind::Tree => match self.tree.get(tree_path).await? {
                Some(Value::Object(record)) => Ok(Some(record)),
                Some(other) => {
                    tracing::warn!("Ignoring non-object value at {}: {}", tree_path, other);
                    Ok(None)
                }
                None => Ok(None),
            },
        }
    }
}
