//! Answer and plugin-state persistence behind one interface, backed either by
//! the local transactional store (offline) or the remote document store.

pub mod document_store;
pub mod local_db;
pub mod local_storage;
pub mod logger;
pub mod mongo_store;
pub mod portal_service;
pub mod remote_storage;
pub mod sync_tracker;
pub mod watchers;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::models::{AnswerRecord, ExportFile, PortalData, QuestionFeedback};
use crate::utils::retry::RetryPolicy;

pub use document_store::{DocumentStore, MemoryDocumentStore};
pub use local_db::LocalDatabase;
pub use local_storage::LocalStorage;
pub use portal_service::PortalDataSource;
pub use remote_storage::RemoteStorage;
pub use watchers::{Callback, Unsubscribe};

pub type AnswerCallback = Callback<Option<AnswerRecord>>;
pub type AnswersCallback = Callback<Vec<AnswerRecord>>;
pub type FeedbackCallback = Callback<Option<QuestionFeedback>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Local,
    Remote,
}

impl StorageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageKind::Local => "local",
            StorageKind::Remote => "remote",
        }
    }
}

#[async_trait]
pub trait PlayerStorage: Send + Sync {
    fn kind(&self) -> StorageKind;

    async fn initialize_db(&self) -> StorageResult<()>;

    /// Calls `callback` with the current answer for the question, then again
    /// after every write to it. The local store delivers write notifications
    /// before `create_or_update_answer` returns.
    async fn watch_answer(
        &self,
        question_ref_id: &str,
        callback: AnswerCallback,
    ) -> StorageResult<Unsubscribe>;

    async fn watch_all_answers(&self, callback: AnswersCallback) -> StorageResult<Unsubscribe>;

    async fn watch_question_feedback(
        &self,
        question_ref_id: &str,
        callback: FeedbackCallback,
    ) -> StorageResult<Unsubscribe>;

    /// Upserts `answer` and returns it as stored. The local store keeps the id
    /// of an existing answer to the same question in the same activity.
    async fn create_or_update_answer(&self, answer: AnswerRecord) -> StorageResult<AnswerRecord>;

    async fn get_plugin_learner_state(&self, plugin_id: u32) -> StorageResult<Option<String>>;

    async fn set_plugin_learner_state(&self, plugin_id: u32, state: &str) -> StorageResult<()>;

    async fn export_activity_to_json(&self, activity_id: Option<&str>) -> StorageResult<ExportFile>;

    /// Returns `false` instead of failing when the file is unusable, so the
    /// caller can prompt for another file.
    async fn import_student_answers_from_json_file(&self, raw: &str, filename: &str) -> bool;

    fn can_sync_data(&self) -> bool;

    /// Pushes locally stored answers to the remote store, returning how many
    /// were written. Not atomic; safe to call again after a failure.
    async fn sync_data(&self) -> StorageResult<usize>;
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Remote application name used when signing in.
    pub name: String,
    pub preview: bool,
    pub offline: bool,
    /// Activity the local store partitions answers under.
    pub activity: String,
    /// Local database file; in-memory when unset.
    pub local_db_path: Option<PathBuf>,
    pub sync_retry: RetryPolicy,
}

impl StorageConfig {
    pub fn new(name: impl Into<String>, activity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            preview: false,
            offline: false,
            activity: activity.into(),
            local_db_path: None,
            sync_retry: RetryPolicy::default(),
        }
    }
}

/// Builds the storage backend selected by `config.offline` and initializes it.
///
/// Portal and initialization failures are logged rather than returned: the
/// storage then behaves as unauthenticated. Only failing to open the local
/// database is an error. Preview runs never touch `remote`.
pub async fn init_storage(
    config: &StorageConfig,
    portal_source: &dyn PortalDataSource,
    remote: Arc<dyn DocumentStore>,
) -> StorageResult<Arc<dyn PlayerStorage>> {
    let portal: Option<PortalData> = match portal_source.fetch_portal_data().await {
        Ok(data) => Some(data),
        Err(e) => {
            tracing::error!("Failed to fetch portal data, continuing unauthenticated: {:#}", e);
            None
        }
    };

    let remote: Arc<dyn DocumentStore> = if config.preview {
        tracing::info!("Preview run, using in-memory document store");
        MemoryDocumentStore::new()
    } else {
        remote
    };

    let storage: Arc<dyn PlayerStorage> = if config.offline {
        let db = match &config.local_db_path {
            Some(path) => LocalDatabase::open(path)?,
            None => LocalDatabase::open_in_memory()?,
        };
        Arc::new(
            LocalStorage::new(Arc::new(db), config.activity.clone(), portal, remote, &config.name)
                .with_retry_policy(config.sync_retry.clone()),
        )
    } else {
        Arc::new(RemoteStorage::new(portal, remote, &config.name))
    };

    if let Err(e) = storage.initialize_db().await {
        tracing::error!(
            backend = storage.kind().as_str(),
            "Storage initialization failed: {}",
            e
        );
    } else {
        tracing::info!(backend = storage.kind().as_str(), "Storage initialized");
    }

    Ok(storage)
}
