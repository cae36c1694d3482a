//! Process-local store implementations.
//!
//! Both stores keep their data behind a `RwLock` and announce every write on a
//! broadcast channel, which `watch` streams use to re-read their path.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};

use super::tree::{prune, value_at, write_at};
use super::{
    CollectionPath, DocPath, DocStream, DocumentStore, Record, StoreError, TreePath, TreeStore,
    TreeStream,
};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

fn poisoned() -> StoreError {
    StoreError::Http("in-memory store lock poisoned".to_string())
}

struct TreeInner {
    root: RwLock<Value>,
    changes: broadcast::Sender<()>,
}

impl TreeInner {
    fn read(&self, path: &TreePath) -> Result<Option<Value>, StoreError> {
        let root = self.root.read().map_err(|_| poisoned())?;
        Ok(value_at(&root, path.segments()).cloned().and_then(prune))
    }
}

/// In-memory [`TreeStore`].
#[derive(Clone)]
pub struct MemoryTreeStore {
    inner: Arc<TreeInner>,
}

impl MemoryTreeStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(TreeInner {
                root: RwLock::new(Value::Null),
                changes,
            }),
        }
    }

    /// Copy of the whole tree (`Null` when empty).
    pub fn snapshot(&self) -> Value {
        self.inner
            .root
            .read()
            .map(|root| root.clone())
            .unwrap_or(Value::Null)
    }

    fn write(&self, edits: Vec<(TreePath, Option<Value>)>) -> Result<(), StoreError> {
        {
            let mut root = self.inner.root.write().map_err(|_| poisoned())?;
            for (path, value) in edits {
                write_at(&mut root, path.segments(), value);
            }
        }
        // No receivers is fine
        let _ = self.inner.changes.send(());
        Ok(())
    }
}

impl Default for MemoryTreeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TreeStore for MemoryTreeStore {
    async fn get(&self, path: &TreePath) -> Result<Option<Value>, StoreError> {
        self.inner.read(path)
    }

    async fn set(&self, path: &TreePath, value: Value) -> Result<(), StoreError> {
        self.write(vec![(path.clone(), Some(value))])
    }

    async fn update(&self, path: &TreePath, fields: Record) -> Result<(), StoreError> {
        // Resolve every key before touching the tree so a bad key writes nothing
        let edits = fields
            .into_iter()
            .map(|(key, value)| Ok((path.join(&key)?, Some(value))))
            .collect::<Result<Vec<_>, StoreError>>()?;
        self.write(edits)
    }

    async fn remove(&self, path: &TreePath) -> Result<(), StoreError> {
        self.write(vec![(path.clone(), None)])
    }

    fn watch(&self, path: &TreePath) -> TreeStream {
        let inner = Arc::clone(&self.inner);
        let changes = inner.changes.subscribe();
        let state = WatchState {
            source: inner,
            key: path.clone(),
            changes,
            last: None,
        };

        futures::stream::unfold(state, |mut state| async move {
            loop {
                if state.last.is_some() && !state.next_change(|_| true).await {
                    return None;
                }
                let current = match state.source.read(&state.key) {
                    Ok(current) => current,
                    Err(e) => return Some((Err(e), state)),
                };
                if state.last.as_ref() != Some(&current) {
                    state.last = Some(current.clone());
                    return Some((Ok(current), state));
                }
            }
        })
        .boxed()
    }
}

struct DocInner {
    docs: RwLock<BTreeMap<DocPath, Record>>,
    changes: broadcast::Sender<DocPath>,
}

impl DocInner {
    fn read(&self, path: &DocPath) -> Result<Option<Record>, StoreError> {
        let docs = self.docs.read().map_err(|_| poisoned())?;
        Ok(docs.get(path).cloned())
    }
}

/// In-memory [`DocumentStore`]. Documents iterate in path order, so query
/// results within a collection come back ordered by id.
#[derive(Clone)]
pub struct MemoryDocumentStore {
    inner: Arc<DocInner>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(DocInner {
                docs: RwLock::new(BTreeMap::new()),
                changes,
            }),
        }
    }

    /// Number of stored documents, across all collections.
    pub fn len(&self) -> usize {
        self.inner.docs.read().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, path: &DocPath) {
        let _ = self.inner.changes.send(path.clone());
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Record>, StoreError> {
        self.inner.read(path)
    }

    async fn set(&self, path: &DocPath, record: Record) -> Result<(), StoreError> {
        self.inner
            .docs
            .write()
            .map_err(|_| poisoned())?
            .insert(path.clone(), record);
        self.notify(path);
        Ok(())
    }

    async fn update(&self, path: &DocPath, fields: Record) -> Result<(), StoreError> {
        {
            let mut docs = self.inner.docs.write().map_err(|_| poisoned())?;
            let doc = docs
                .get_mut(path)
                .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
            doc.extend(fields);
        }
        self.notify(path);
        Ok(())
    }

    async fn delete(&self, path: &DocPath) -> Result<(), StoreError> {
        let removed = self
            .inner
            .docs
            .write()
            .map_err(|_| poisoned())?
            .remove(path)
            .is_some();
        if removed {
            self.notify(path);
        }
        Ok(())
    }

    async fn query_eq(
        &self,
        collection: &CollectionPath,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(DocPath, Record)>, StoreError> {
        let docs = self.inner.docs.read().map_err(|_| poisoned())?;
        Ok(docs
            .iter()
            .filter(|(path, _)| path.collection() == *collection)
            .filter(|(_, doc)| doc.get(field) == Some(value))
            .map(|(path, doc)| (path.clone(), doc.clone()))
            .collect())
    }

    fn watch(&self, path: &DocPath) -> DocStream {
        let inner = Arc::clone(&self.inner);
        let changes = inner.changes.subscribe();
        let state = WatchState {
            source: inner,
            key: path.clone(),
            changes,
            last: None,
        };

        futures::stream::unfold(state, |mut state| async move {
            loop {
                if state.last.is_some() {
                    let key = state.key.clone();
                    if !state.next_change(|changed| *changed == key).await {
                        return None;
                    }
                }
                let current = match state.source.read(&state.key) {
                    Ok(current) => current,
                    Err(e) => return Some((Err(e), state)),
                };
                if state.last.as_ref() != Some(&current) {
                    state.last = Some(current.clone());
                    return Some((Ok(current), state));
                }
            }
        })
        .boxed()
    }
}

/// Shared bookkeeping for `watch` streams over either store.
struct WatchState<S, K, C, V> {
    source: Arc<S>,
    key: K,
    changes: broadcast::Receiver<C>,
    /// Last emitted snapshot; `None` until the first emission.
    last: Option<V>,
}

impl<S, K, C: Clone, V> WatchState<S, K, C, V> {
    /// Waits for a change accepted by `relevant`. Returns false once the
    /// channel is closed. A lagged receiver counts as a change.
    async fn next_change(&mut self, relevant: impl Fn(&C) -> bool) -> bool {
        loop {
            match self.changes.recv().await {
                Ok(change) if relevant(&change) => return true,
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => return true,
                Err(RecvError::Closed) => return false,
            }
        }
    }
}
