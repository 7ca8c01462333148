use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;

use super::document_store::DocumentStore;
use super::local_db::LocalDatabase;
use super::remote_storage::RemoteStorage;
use super::watchers::{Unsubscribe, WatcherRegistry};
use super::{
    AnswerCallback, AnswersCallback, FeedbackCallback, PlayerStorage, StorageKind,
};
use crate::error::{StorageError, StorageResult};
use crate::metrics::{track_storage_operation, ANSWERS_PUSHED_TOTAL, ANSWERS_SAVED_TOTAL};
use crate::models::offline::canonical_activity_url;
use crate::models::{
    question_id_from_ref_id, AnswerRecord, ExportFile, ImportFile, OfflineActivity, PortalData,
    OFFLINE_ANSWER_SCHEMA_VERSION,
};
use crate::utils::retry::{retry_with_policy, RetryPolicy};
use crate::utils::time::now_epoch_seconds;

lazy_static! {
    static ref FILENAME_UNSAFE_RE: Regex = Regex::new(r"[^A-Za-z0-9]+").unwrap();
}

/// Storage for offline play. Answers are partitioned by the activity this
/// instance was created for; watchers are notified synchronously on write.
pub struct LocalStorage {
    db: Arc<LocalDatabase>,
    activity: String,
    portal: Option<PortalData>,
    remote: Arc<dyn DocumentStore>,
    app_name: String,
    remote_connected: AtomicBool,
    retry: RetryPolicy,
    answer_watchers: WatcherRegistry<String, Option<AnswerRecord>>,
    activity_watchers: WatcherRegistry<String, Vec<AnswerRecord>>,
    plugin_states: Mutex<HashMap<u32, String>>,
}

impl LocalStorage {
    pub fn new(
        db: Arc<LocalDatabase>,
        activity: impl Into<String>,
        portal: Option<PortalData>,
        remote: Arc<dyn DocumentStore>,
        app_name: &str,
    ) -> Self {
        Self {
            db,
            activity: activity.into(),
            portal,
            remote,
            app_name: app_name.to_string(),
            remote_connected: AtomicBool::new(false),
            retry: RetryPolicy::default(),
            answer_watchers: WatcherRegistry::default(),
            activity_watchers: WatcherRegistry::default(),
            plugin_states: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn activity(&self) -> &str {
        &self.activity
    }

    pub fn database(&self) -> &Arc<LocalDatabase> {
        &self.db
    }

    /// Records an activity whose assets finished caching.
    pub fn save_offline_activity(&self, name: &str, url: &str) -> StorageResult<OfflineActivity> {
        let activity = OfflineActivity::new(name, url)?;
        self.db.put_offline_activity(&activity)?;
        tracing::info!(url = %activity.url, "Offline activity cached");
        Ok(activity)
    }

    pub fn offline_activities(&self) -> StorageResult<Vec<OfflineActivity>> {
        self.db.offline_activities()
    }

    pub fn delete_offline_activity(&self, url: &str) -> StorageResult<bool> {
        self.db.delete_offline_activity(&canonical_activity_url(url)?)
    }

    /// Runs `op` against the database on the blocking pool, keeping SQLite
    /// I/O and its busy timeout off the async workers.
    async fn with_db<T, F>(&self, op: F) -> StorageResult<T>
    where
        F: FnOnce(&LocalDatabase) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || op(&db)).await?
    }

    async fn current_answers(&self) -> StorageResult<Vec<AnswerRecord>> {
        let activity = self.activity.clone();
        self.with_db(move |db| db.answers_for_activity(&activity))
            .await
    }

    async fn notify_watchers(&self, stored: &[AnswerRecord]) -> StorageResult<()> {
        for answer in stored {
            self.answer_watchers
                .notify(&answer.question_id, Some(answer.clone()));
        }
        if self.activity_watchers.has_watchers(&self.activity) {
            let all = self.current_answers().await?;
            self.activity_watchers.notify(&self.activity, all);
        }
        Ok(())
    }

    async fn connect_remote(&self, portal: &PortalData) -> StorageResult<()> {
        if self.remote_connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.remote
            .sign_in(&self.app_name, portal.database().raw_firebase_jwt.as_deref())
            .await?;
        self.remote_connected.store(true, Ordering::SeqCst);
        tracing::info!(backend = self.remote.backend_name(), "Connected to remote store for sync");
        Ok(())
    }

    /// Forgets the remote connection so the next sync signs in from scratch.
    async fn disconnect_remote(&self) {
        self.remote_connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.remote.sign_out().await {
            tracing::warn!("Failed to sign out of remote store: {}", e);
        }
    }

    async fn push_answers(&self, portal: &PortalData) -> StorageResult<usize> {
        self.connect_remote(portal).await?;

        let target = RemoteStorage::new(Some(portal.clone()), self.remote.clone(), &self.app_name);
        let answers = self.current_answers().await?;
        let mut pushed = 0;
        for answer in &answers {
            let result = retry_with_policy(&self.retry, "push_answer", || {
                target.write_answer(answer)
            })
            .await;
            match result {
                Ok(()) => {
                    ANSWERS_PUSHED_TOTAL.with_label_values(&["success"]).inc();
                    pushed += 1;
                }
                Err(e) => {
                    ANSWERS_PUSHED_TOTAL.with_label_values(&["error"]).inc();
                    tracing::error!(
                        answer_id = %answer.id,
                        pushed,
                        total = answers.len(),
                        "Failed to push offline answer: {}",
                        e
                    );
                    return Err(e);
                }
            }
        }
        Ok(pushed)
    }
}

pub fn export_filename(activity: &str) -> String {
    let stem = FILENAME_UNSAFE_RE.replace_all(activity, "_");
    format!(
        "{}-{}.json",
        stem.trim_matches('_'),
        Utc::now().format("%Y%m%d-%H%M%S")
    )
}

#[async_trait]
impl PlayerStorage for LocalStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }

    async fn initialize_db(&self) -> StorageResult<()> {
        self.with_db(|db| db.migrate()).await
    }

    async fn watch_answer(
        &self,
        question_ref_id: &str,
        callback: AnswerCallback,
    ) -> StorageResult<Unsubscribe> {
        let question_id = question_id_from_ref_id(question_ref_id);
        let (activity, question) = (self.activity.clone(), question_id.clone());
        let current = self
            .with_db(move |db| db.find_answer(&activity, &question))
            .await?;
        callback(current);
        Ok(self.answer_watchers.register(question_id, callback))
    }

    async fn watch_all_answers(&self, callback: AnswersCallback) -> StorageResult<Unsubscribe> {
        callback(self.current_answers().await?);
        Ok(self
            .activity_watchers
            .register(self.activity.clone(), callback))
    }

    async fn watch_question_feedback(
        &self,
        _question_ref_id: &str,
        callback: FeedbackCallback,
    ) -> StorageResult<Unsubscribe> {
        // Feedback is authored online; there is never any offline.
        callback(None);
        Ok(Unsubscribe::noop())
    }

    async fn create_or_update_answer(&self, answer: AnswerRecord) -> StorageResult<AnswerRecord> {
        let activity = answer
            .activity
            .clone()
            .unwrap_or_else(|| self.activity.clone());
        let type_name = answer.type_name();

        let target = activity.clone();
        let stored = track_storage_operation(
            "create_or_update_answer",
            "local",
            self.with_db(move |db| db.upsert_answer(&target, answer)),
        )
        .await?;
        ANSWERS_SAVED_TOTAL
            .with_label_values(&["local", type_name])
            .inc();
        tracing::debug!(
            answer_id = %stored.id,
            question_id = %stored.question_id,
            activity = %activity,
            "Answer saved locally"
        );

        if activity == self.activity {
            self.notify_watchers(std::slice::from_ref(&stored)).await?;
        }
        Ok(stored)
    }

    async fn get_plugin_learner_state(&self, plugin_id: u32) -> StorageResult<Option<String>> {
        if let Some(state) = self
            .plugin_states
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?
            .get(&plugin_id)
        {
            return Ok(Some(state.clone()));
        }

        let state = self.with_db(move |db| db.plugin_state(plugin_id)).await?;
        if let Some(state) = &state {
            self.plugin_states
                .lock()
                .map_err(|_| StorageError::LockPoisoned)?
                .insert(plugin_id, state.clone());
        }
        Ok(state)
    }

    async fn set_plugin_learner_state(&self, plugin_id: u32, state: &str) -> StorageResult<()> {
        let owned = state.to_string();
        self.with_db(move |db| db.put_plugin_state(plugin_id, &owned))
            .await?;
        self.plugin_states
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?
            .insert(plugin_id, state.to_string());
        Ok(())
    }

    async fn export_activity_to_json(&self, activity_id: Option<&str>) -> StorageResult<ExportFile> {
        let activity = activity_id.unwrap_or(&self.activity).to_string();
        let target = activity.clone();
        let answers = self
            .with_db(move |db| db.answers_for_activity(&target))
            .await?;
        tracing::info!(activity = %activity, count = answers.len(), "Exporting offline answers");
        Ok(ExportFile {
            filename: export_filename(&activity),
            activity,
            version: OFFLINE_ANSWER_SCHEMA_VERSION,
            answers,
        })
    }

    async fn import_student_answers_from_json_file(&self, raw: &str, filename: &str) -> bool {
        let file = match ImportFile::parse(raw) {
            Ok(file) => file,
            Err(reason) => {
                tracing::warn!(filename, "Rejected answer import: {}", reason);
                return false;
            }
        };
        // `parse` guarantees the activity is present.
        let Some(activity) = file.activity else {
            return false;
        };

        let target = activity.clone();
        let answers = file.answers;
        let stored = match self
            .with_db(move |db| db.upsert_answers(&target, answers))
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!(filename, activity = %activity, "Failed to import answers: {}", e);
                return false;
            }
        };
        for answer in &stored {
            ANSWERS_SAVED_TOTAL
                .with_label_values(&["local", answer.type_name()])
                .inc();
        }
        tracing::info!(filename, activity = %activity, count = stored.len(), "Imported offline answers");

        if activity == self.activity {
            if let Err(e) = self.notify_watchers(&stored).await {
                tracing::warn!(filename, "Imported answers but failed to notify watchers: {}", e);
            }
        }
        true
    }

    fn can_sync_data(&self) -> bool {
        self.portal
            .as_ref()
            .and_then(PortalData::portal_jwt)
            .map(|jwt| jwt.is_valid_at(now_epoch_seconds()))
            .unwrap_or(false)
    }

    async fn sync_data(&self) -> StorageResult<usize> {
        let Some(portal) = &self.portal else {
            return Err(StorageError::NotAuthenticated);
        };

        match self.push_answers(portal).await {
            Ok(pushed) => {
                tracing::info!(pushed, activity = %self.activity, "Offline answers synced");
                Ok(pushed)
            }
            Err(e) => {
                self.disconnect_remote().await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnswerKind;
    use crate::services::MemoryDocumentStore;

    fn open_response(question: &str, text: &str) -> AnswerRecord {
        AnswerRecord::new(
            question,
            AnswerKind::OpenResponse {
                answer: text.to_string(),
            },
            "{}".to_string(),
        )
    }

    #[tokio::test]
    async fn failed_import_leaves_no_answers_behind() {
        let db = LocalDatabase::open_in_memory().unwrap();
        db.migrate().unwrap();
        db.lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_q3 BEFORE INSERT ON answers
                 WHEN NEW.question_id = 'q3'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();
        let storage = LocalStorage::new(
            Arc::new(db),
            "act-1",
            None,
            MemoryDocumentStore::new(),
            "report-service-dev",
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _watch = storage
            .watch_all_answers(Arc::new(move |answers: Vec<AnswerRecord>| {
                s.lock().unwrap().push(answers.len())
            }))
            .await
            .unwrap();

        let raw = serde_json::json!({
            "activity": "act-1",
            "version": OFFLINE_ANSWER_SCHEMA_VERSION,
            "answers": [
                open_response("q1", "a"),
                open_response("q2", "b"),
                open_response("q3", "c"),
            ]
        })
        .to_string();
        assert!(
            !storage
                .import_student_answers_from_json_file(&raw, "partial.json")
                .await
        );

        let export = storage.export_activity_to_json(None).await.unwrap();
        assert!(export.answers.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![0]);
    }

    #[test]
    fn export_filename_is_filesystem_safe() {
        let name = export_filename("https://example.org/activities/42");
        assert!(name.starts_with("https_example_org_activities_42-"));
        assert!(name.ends_with(".json"));
    }
}
