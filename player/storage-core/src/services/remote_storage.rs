use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Value};

use super::document_store::{CollectionPath, DocumentPath, DocumentStore, FieldFilter};
use super::watchers::Unsubscribe;
use super::{AnswerCallback, AnswersCallback, FeedbackCallback, PlayerStorage, StorageKind};
use crate::error::{StorageError, StorageResult};
use crate::metrics::{track_storage_operation, ANSWERS_SAVED_TOTAL};
use crate::models::{question_id_from_ref_id, AnswerRecord, ExportFile, PortalData, QuestionFeedback};

const ANSWERS: &str = "answers";
const FEEDBACKS: &str = "question_feedbacks";
const PLUGIN_STATES: &str = "plugin_states";

/// Storage for online play, writing straight to the remote document store
/// under `sources/{sourceKey}/...`. Every document carries the learner's
/// identity fields so queries can be scoped to them.
pub struct RemoteStorage {
    portal: Option<PortalData>,
    store: Arc<dyn DocumentStore>,
    app_name: String,
    plugin_states: Mutex<HashMap<u32, String>>,
}

impl RemoteStorage {
    pub fn new(portal: Option<PortalData>, store: Arc<dyn DocumentStore>, app_name: &str) -> Self {
        Self {
            portal,
            store,
            app_name: app_name.to_string(),
            plugin_states: Mutex::new(HashMap::new()),
        }
    }

    fn portal(&self) -> StorageResult<&PortalData> {
        self.portal.as_ref().ok_or(StorageError::NotAuthenticated)
    }

    fn collection(&self, name: &str) -> StorageResult<CollectionPath> {
        Ok(CollectionPath::new(self.portal()?.source_key(), name))
    }

    fn plugin_state_path(&self, plugin_id: u32) -> StorageResult<DocumentPath> {
        Ok(self
            .collection(PLUGIN_STATES)?
            .doc(format!("{}-{}", plugin_id, self.portal()?.learner_key())))
    }

    fn cached_plugin_states(&self) -> StorageResult<MutexGuard<'_, HashMap<u32, String>>> {
        self.plugin_states
            .lock()
            .map_err(|_| StorageError::LockPoisoned)
    }

    fn learner_filters(&self, question_id: Option<&str>) -> StorageResult<Vec<FieldFilter>> {
        let mut filters: Vec<FieldFilter> = self
            .portal()?
            .identity_filters()
            .into_iter()
            .map(|(field, value)| FieldFilter::eq(field, value))
            .collect();
        if let Some(question_id) = question_id {
            filters.push(FieldFilter::eq("question_id", question_id));
        }
        Ok(filters)
    }

    /// Writes one answer document at `answers/{id}`, merged over any existing
    /// one so repeated pushes are harmless.
    pub async fn write_answer(&self, answer: &AnswerRecord) -> StorageResult<()> {
        let portal = self.portal()?;
        let path = self.collection(ANSWERS)?.doc(answer.id.as_str());

        let mut body = serde_json::to_value(answer)?;
        if let Value::Object(fields) = &mut body {
            fields.remove("activity");
            fields.extend(portal.answer_identity());
        }

        track_storage_operation(
            "write_answer",
            "remote",
            self.store.set_document(&path, body, true),
        )
        .await
    }
}

fn parse_documents<T: serde::de::DeserializeOwned>(docs: Vec<Value>, what: &str) -> Vec<T> {
    docs.into_iter()
        .filter_map(|doc| match serde_json::from_value(doc) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!("Skipping malformed {} document: {}", what, e);
                None
            }
        })
        .collect()
}

#[async_trait]
impl PlayerStorage for RemoteStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Remote
    }

    async fn initialize_db(&self) -> StorageResult<()> {
        let portal = self.portal()?;
        self.store
            .sign_in(&self.app_name, portal.database().raw_firebase_jwt.as_deref())
            .await
    }

    async fn watch_answer(
        &self,
        question_ref_id: &str,
        callback: AnswerCallback,
    ) -> StorageResult<Unsubscribe> {
        let question_id = question_id_from_ref_id(question_ref_id);
        let filters = self.learner_filters(Some(&question_id))?;
        self.store
            .on_snapshot(
                self.collection(ANSWERS)?,
                filters,
                Arc::new(move |docs: Vec<Value>| {
                    callback(parse_documents::<AnswerRecord>(docs, "answer").into_iter().next())
                }),
            )
            .await
    }

    async fn watch_all_answers(&self, callback: AnswersCallback) -> StorageResult<Unsubscribe> {
        self.store
            .on_snapshot(
                self.collection(ANSWERS)?,
                self.learner_filters(None)?,
                Arc::new(move |docs: Vec<Value>| callback(parse_documents(docs, "answer"))),
            )
            .await
    }

    async fn watch_question_feedback(
        &self,
        question_ref_id: &str,
        callback: FeedbackCallback,
    ) -> StorageResult<Unsubscribe> {
        let question_id = question_id_from_ref_id(question_ref_id);
        self.store
            .on_snapshot(
                self.collection(FEEDBACKS)?,
                self.learner_filters(Some(&question_id))?,
                Arc::new(move |docs: Vec<Value>| {
                    callback(
                        parse_documents::<QuestionFeedback>(docs, "feedback")
                            .into_iter()
                            .next(),
                    )
                }),
            )
            .await
    }

    async fn create_or_update_answer(&self, mut answer: AnswerRecord) -> StorageResult<AnswerRecord> {
        answer.activity = None;
        self.write_answer(&answer).await?;
        ANSWERS_SAVED_TOTAL
            .with_label_values(&["remote", answer.type_name()])
            .inc();
        tracing::debug!(answer_id = %answer.id, question_id = %answer.question_id, "Answer saved remotely");
        Ok(answer)
    }

    async fn get_plugin_learner_state(&self, plugin_id: u32) -> StorageResult<Option<String>> {
        if let Some(state) = self.cached_plugin_states()?.get(&plugin_id) {
            return Ok(Some(state.clone()));
        }

        let doc = self.store.get_document(&self.plugin_state_path(plugin_id)?).await?;
        let state = doc.and_then(|d| d.get("state").and_then(Value::as_str).map(str::to_string));
        if let Some(state) = &state {
            self.cached_plugin_states()?.insert(plugin_id, state.clone());
        }
        Ok(state)
    }

    async fn set_plugin_learner_state(&self, plugin_id: u32, state: &str) -> StorageResult<()> {
        let portal = self.portal()?;
        let path = self.plugin_state_path(plugin_id)?;

        let mut body = json!({ "plugin_id": plugin_id, "state": state });
        if let Value::Object(fields) = &mut body {
            fields.extend(portal.answer_identity());
        }
        self.store.set_document(&path, body, false).await?;
        self.cached_plugin_states()?
            .insert(plugin_id, state.to_string());
        Ok(())
    }

    async fn export_activity_to_json(&self, _activity_id: Option<&str>) -> StorageResult<ExportFile> {
        Err(StorageError::Unsupported {
            backend: "remote",
            operation: "export_activity_to_json",
        })
    }

    async fn import_student_answers_from_json_file(&self, _raw: &str, filename: &str) -> bool {
        tracing::warn!(filename, "Answer import is only available while offline");
        false
    }

    fn can_sync_data(&self) -> bool {
        false
    }

    async fn sync_data(&self) -> StorageResult<usize> {
        Ok(0)
    }
}
