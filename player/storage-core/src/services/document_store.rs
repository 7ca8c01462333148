//! Remote document database abstraction.
//!
//! Documents live at `sources/{sourceKey}/{collection}/{id}`. Queries are
//! equality filters within one collection, and snapshot listeners receive the
//! full result set of their query immediately and after every matching write.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use super::watchers::Unsubscribe;
use crate::error::{StorageError, StorageResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionPath {
    source_key: String,
    name: String,
}

impl CollectionPath {
    pub fn new(source_key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source_key: source_key.into(),
            name: name.into(),
        }
    }

    pub fn source_key(&self) -> &str {
        &self.source_key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self, id: impl Into<String>) -> DocumentPath {
        DocumentPath {
            collection: self.clone(),
            id: id.into(),
        }
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sources/{}/{}", self.source_key, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentPath {
    collection: CollectionPath,
    id: String,
}

impl DocumentPath {
    pub fn collection(&self) -> &CollectionPath {
        &self.collection
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub value: Value,
}

impl FieldFilter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, doc: &Value) -> bool {
        doc.get(&self.field) == Some(&self.value)
    }
}

pub fn matches_all(filters: &[FieldFilter], doc: &Value) -> bool {
    filters.iter().all(|f| f.matches(doc))
}

pub type SnapshotCallback = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Opens an authenticated session for `app_name`. Writes fail with
    /// `NotAuthenticated` until this succeeds.
    async fn sign_in(&self, app_name: &str, token: Option<&str>) -> StorageResult<()>;

    async fn sign_out(&self) -> StorageResult<()>;

    fn is_signed_in(&self) -> bool;

    /// Writes `data` at `path`. With `merge`, top-level fields are merged into
    /// an existing document instead of replacing it.
    async fn set_document(&self, path: &DocumentPath, data: Value, merge: bool)
        -> StorageResult<()>;

    async fn get_document(&self, path: &DocumentPath) -> StorageResult<Option<Value>>;

    async fn query(
        &self,
        collection: &CollectionPath,
        filters: &[FieldFilter],
    ) -> StorageResult<Vec<Value>>;

    /// Delivers the current result of the query, then every new result after
    /// a write through this store that matches the filters.
    async fn on_snapshot(
        &self,
        collection: CollectionPath,
        filters: Vec<FieldFilter>,
        callback: SnapshotCallback,
    ) -> StorageResult<Unsubscribe>;
}

struct SnapshotListener {
    id: u64,
    filters: Vec<FieldFilter>,
    callback: SnapshotCallback,
}

/// Snapshot listeners keyed by collection, shared by store implementations.
#[derive(Default)]
pub struct SnapshotListeners {
    next_id: AtomicU64,
    listeners: Arc<Mutex<HashMap<CollectionPath, Vec<SnapshotListener>>>>,
}

impl SnapshotListeners {
    pub fn add(
        &self,
        collection: CollectionPath,
        filters: Vec<FieldFilter>,
        callback: SnapshotCallback,
    ) -> Unsubscribe {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(collection.clone())
            .or_default()
            .push(SnapshotListener {
                id,
                filters,
                callback,
            });

        let weak = Arc::downgrade(&self.listeners);
        Unsubscribe::new(move || {
            if let Some(listeners) = weak.upgrade() {
                let mut listeners = listeners.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(list) = listeners.get_mut(&collection) {
                    list.retain(|l| l.id != id);
                }
            }
        })
    }

    /// Listeners of `collection` whose filters accept `doc`.
    pub fn matching(
        &self,
        collection: &CollectionPath,
        doc: &Value,
    ) -> Vec<(Vec<FieldFilter>, SnapshotCallback)> {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(collection)
            .map(|list| {
                list.iter()
                    .filter(|l| matches_all(&l.filters, doc))
                    .map(|l| (l.filters.clone(), l.callback.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Re-runs the query of every listener matching `written` and delivers the
    /// result. The write has already landed, so a listener whose query fails
    /// is skipped with a warning rather than failing the write. Returns the
    /// number of listeners that were delivered to.
    pub async fn refresh<F, Fut>(
        &self,
        collection: &CollectionPath,
        written: &Value,
        fetch: F,
    ) -> usize
    where
        F: Fn(Vec<FieldFilter>) -> Fut,
        Fut: Future<Output = StorageResult<Vec<Value>>>,
    {
        let mut delivered = 0;
        for (filters, callback) in self.matching(collection, written) {
            match fetch(filters).await {
                Ok(docs) => {
                    callback(docs);
                    delivered += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        collection = %collection,
                        "Skipping snapshot listener after failed refresh: {}",
                        e
                    );
                }
            }
        }
        delivered
    }
}

/// In-process document store. Backs preview runs, where nothing may reach the
/// real database, and doubles as a controllable remote in tests.
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: Mutex<BTreeMap<String, (CollectionPath, Value)>>,
    signed_in: AtomicBool,
    offline: AtomicBool,
    sign_in_count: AtomicUsize,
    sign_out_count: AtomicUsize,
    listeners: SnapshotListeners,
}

impl MemoryDocumentStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulates losing the network: every operation fails until reset.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn sign_in_count(&self) -> usize {
        self.sign_in_count.load(Ordering::SeqCst)
    }

    pub fn sign_out_count(&self) -> usize {
        self.sign_out_count.load(Ordering::SeqCst)
    }

    pub fn document_count(&self, collection: &CollectionPath) -> usize {
        self.lock_docs()
            .values()
            .filter(|(c, _)| c == collection)
            .count()
    }

    fn check_reachable(&self) -> StorageResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Remote("network unavailable".to_string()));
        }
        Ok(())
    }

    fn check_session(&self) -> StorageResult<()> {
        self.check_reachable()?;
        if !self.signed_in.load(Ordering::SeqCst) {
            return Err(StorageError::NotAuthenticated);
        }
        Ok(())
    }

    fn lock_docs(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, (CollectionPath, Value)>> {
        self.docs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn collect(&self, collection: &CollectionPath, filters: &[FieldFilter]) -> Vec<Value> {
        self.lock_docs()
            .values()
            .filter(|(c, doc)| c == collection && matches_all(filters, doc))
            .map(|(_, doc)| doc.clone())
            .collect()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn sign_in(&self, app_name: &str, _token: Option<&str>) -> StorageResult<()> {
        self.check_reachable()?;
        self.signed_in.store(true, Ordering::SeqCst);
        self.sign_in_count.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(app_name, "signed in to in-memory document store");
        Ok(())
    }

    async fn sign_out(&self) -> StorageResult<()> {
        self.signed_in.store(false, Ordering::SeqCst);
        self.sign_out_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_signed_in(&self) -> bool {
        self.signed_in.load(Ordering::SeqCst)
    }

    async fn set_document(
        &self,
        path: &DocumentPath,
        data: Value,
        merge: bool,
    ) -> StorageResult<()> {
        self.check_session()?;
        let stored = {
            let mut docs = self.lock_docs();
            let key = path.to_string();
            let next = match (merge, docs.get(&key)) {
                (true, Some((_, Value::Object(existing)))) => {
                    let mut merged = existing.clone();
                    if let Value::Object(fields) = data {
                        merged.extend(fields);
                    }
                    Value::Object(merged)
                }
                _ => data,
            };
            docs.insert(key, (path.collection().clone(), next.clone()));
            next
        };

        self.listeners
            .refresh(path.collection(), &stored, |filters| {
                futures::future::ready(Ok(self.collect(path.collection(), &filters)))
            })
            .await;
        Ok(())
    }

    async fn get_document(&self, path: &DocumentPath) -> StorageResult<Option<Value>> {
        self.check_session()?;
        Ok(self.lock_docs().get(&path.to_string()).map(|(_, doc)| doc.clone()))
    }

    async fn query(
        &self,
        collection: &CollectionPath,
        filters: &[FieldFilter],
    ) -> StorageResult<Vec<Value>> {
        self.check_session()?;
        Ok(self.collect(collection, filters))
    }

    async fn on_snapshot(
        &self,
        collection: CollectionPath,
        filters: Vec<FieldFilter>,
        callback: SnapshotCallback,
    ) -> StorageResult<Unsubscribe> {
        self.check_session()?;
        callback(self.collect(&collection, &filters));
        Ok(self.listeners.add(collection, filters, callback))
    }
}
