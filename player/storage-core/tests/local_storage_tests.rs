mod common;

use std::sync::{Arc, Mutex};

use activity_player_storage::models::{
    AnswerRecord, ExportFile, QuestionFeedback, OFFLINE_ANSWER_SCHEMA_VERSION,
};
use activity_player_storage::services::document_store::{CollectionPath, DocumentStore};
use activity_player_storage::services::{LocalDatabase, MemoryDocumentStore, PlayerStorage};
use activity_player_storage::StorageError;
use serde_json::json;

use common::{ACTIVITY, SOURCE_KEY};

#[tokio::test]
async fn test_upsert_keeps_one_answer_per_question() {
    let storage = common::local_storage(None, MemoryDocumentStore::new());

    let first = storage
        .create_or_update_answer(common::open_response("123-ManagedInteractive", "draft"))
        .await
        .unwrap();
    let second = storage
        .create_or_update_answer(common::open_response("123-ManagedInteractive", "final"))
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.question_id, "managed_interactive_123");

    let export = storage.export_activity_to_json(None).await.unwrap();
    assert_eq!(export.answers.len(), 1);
    assert_eq!(export.answers[0], second);
}

#[tokio::test]
async fn test_answers_are_partitioned_by_activity() {
    let storage = common::local_storage(None, MemoryDocumentStore::new());

    storage
        .create_or_update_answer(common::open_response("q1", "here"))
        .await
        .unwrap();
    storage
        .create_or_update_answer(common::open_response("q1", "elsewhere").with_activity("other"))
        .await
        .unwrap();

    let here = storage.export_activity_to_json(None).await.unwrap();
    let other = storage.export_activity_to_json(Some("other")).await.unwrap();
    assert_eq!(here.answers.len(), 1);
    assert_eq!(other.answers.len(), 1);
    assert_ne!(here.answers[0].id, other.answers[0].id);
}

#[tokio::test]
async fn test_export_import_round_trip() {
    let source = common::local_storage(None, MemoryDocumentStore::new());
    for (question, text) in [("1-ManagedInteractive", "a"), ("2-ManagedInteractive", "b")] {
        source
            .create_or_update_answer(common::open_response(question, text))
            .await
            .unwrap();
    }
    let export = source.export_activity_to_json(None).await.unwrap();
    assert_eq!(export.activity, ACTIVITY);
    assert_eq!(export.version, OFFLINE_ANSWER_SCHEMA_VERSION);
    assert!(export.filename.ends_with(".json"));

    let raw = serde_json::to_string(&export).unwrap();
    let target = common::local_storage(None, MemoryDocumentStore::new());
    assert!(
        target
            .import_student_answers_from_json_file(&raw, &export.filename)
            .await
    );

    let imported: ExportFile = target.export_activity_to_json(None).await.unwrap();
    assert_eq!(imported.answers, export.answers);
}

#[tokio::test]
async fn test_invalid_import_is_rejected_without_writing() {
    let storage = common::local_storage(None, MemoryDocumentStore::new());

    let missing_activity = json!({ "version": 1, "answers": [] }).to_string();
    let missing_version = json!({ "activity": ACTIVITY, "answers": [] }).to_string();
    let too_new = json!({ "activity": ACTIVITY, "version": 99, "answers": [] }).to_string();

    for raw in [missing_activity, missing_version, too_new, "not json".to_string()] {
        assert!(
            !storage
                .import_student_answers_from_json_file(&raw, "bad.json")
                .await
        );
    }
    assert!(storage
        .export_activity_to_json(None)
        .await
        .unwrap()
        .answers
        .is_empty());
}

#[tokio::test]
async fn test_watcher_sees_write_before_call_returns() {
    let storage = common::local_storage(None, MemoryDocumentStore::new());
    let seen: Arc<Mutex<Vec<Option<AnswerRecord>>>> = Arc::new(Mutex::new(Vec::new()));

    let s = seen.clone();
    let handle = storage
        .watch_answer(
            "5-ManagedInteractive",
            Arc::new(move |answer: Option<AnswerRecord>| s.lock().unwrap().push(answer)),
        )
        .await
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![None]);

    let saved = storage
        .create_or_update_answer(common::open_response("5-ManagedInteractive", "hello"))
        .await
        .unwrap();
    assert_eq!(seen.lock().unwrap().last().cloned(), Some(Some(saved)));

    // Other questions do not reach this watcher.
    storage
        .create_or_update_answer(common::open_response("6-ManagedInteractive", "other"))
        .await
        .unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);

    handle.unsubscribe();
    storage
        .create_or_update_answer(common::open_response("5-ManagedInteractive", "again"))
        .await
        .unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_watch_all_answers_is_live() {
    let storage = common::local_storage(None, MemoryDocumentStore::new());
    let counts = Arc::new(Mutex::new(Vec::new()));

    let c = counts.clone();
    let _handle = storage
        .watch_all_answers(Arc::new(move |answers: Vec<AnswerRecord>| {
            c.lock().unwrap().push(answers.len())
        }))
        .await
        .unwrap();

    storage
        .create_or_update_answer(common::open_response("q1", "a"))
        .await
        .unwrap();
    storage
        .create_or_update_answer(common::open_response("q2", "b"))
        .await
        .unwrap();

    assert_eq!(*counts.lock().unwrap(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_feedback_is_never_available_offline() {
    let storage = common::local_storage(None, MemoryDocumentStore::new());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let s = seen.clone();
    storage
        .watch_question_feedback(
            "q1",
            Arc::new(move |feedback: Option<QuestionFeedback>| {
                s.lock().unwrap().push(feedback)
            }),
        )
        .await
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![None]);
}

#[tokio::test]
async fn test_plugin_state_persists_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("player.sqlite3");

    {
        let db = LocalDatabase::open(&path).unwrap();
        db.migrate().unwrap();
        let storage = activity_player_storage::services::LocalStorage::new(
            Arc::new(db),
            ACTIVITY,
            None,
            MemoryDocumentStore::new(),
            "report-service-dev",
        );
        storage.set_plugin_learner_state(3, r#"{"step":2}"#).await.unwrap();
        assert_eq!(
            storage.get_plugin_learner_state(3).await.unwrap().as_deref(),
            Some(r#"{"step":2}"#)
        );
    }

    let db = LocalDatabase::open(&path).unwrap();
    db.migrate().unwrap();
    let storage = activity_player_storage::services::LocalStorage::new(
        Arc::new(db),
        ACTIVITY,
        None,
        MemoryDocumentStore::new(),
        "report-service-dev",
    );
    assert_eq!(
        storage.get_plugin_learner_state(3).await.unwrap().as_deref(),
        Some(r#"{"step":2}"#)
    );
    assert_eq!(storage.get_plugin_learner_state(4).await.unwrap(), None);
}

#[tokio::test]
async fn test_offline_activity_catalogue() {
    let storage = common::local_storage(None, MemoryDocumentStore::new());

    storage
        .save_offline_activity("Seasons", "https://authoring.example.org/activities/2#page-1")
        .unwrap();
    storage
        .save_offline_activity("Seasons (renamed)", "https://authoring.example.org/activities/2")
        .unwrap();
    storage
        .save_offline_activity("Atoms", "https://authoring.example.org/activities/3")
        .unwrap();

    let activities = storage.offline_activities().unwrap();
    assert_eq!(activities.len(), 2);
    assert!(storage
        .delete_offline_activity("https://authoring.example.org/activities/3")
        .unwrap());
    assert_eq!(storage.offline_activities().unwrap().len(), 1);
    assert!(storage.save_offline_activity("Bad", "not a url").is_err());
}

#[tokio::test]
async fn test_can_sync_data_follows_portal_jwt_expiry() {
    let remote = MemoryDocumentStore::new();
    assert!(!common::local_storage(None, remote.clone()).can_sync_data());
    assert!(!common::local_storage(Some(common::anonymous_portal()), remote.clone()).can_sync_data());
    assert!(
        !common::local_storage(Some(common::authenticated_portal(common::past())), remote.clone())
            .can_sync_data()
    );
    assert!(
        common::local_storage(Some(common::authenticated_portal(common::far_future())), remote)
            .can_sync_data()
    );
}

#[tokio::test]
async fn test_sync_pushes_answers_and_is_repeatable() {
    let remote = MemoryDocumentStore::new();
    let storage = common::local_storage(
        Some(common::authenticated_portal(common::far_future())),
        remote.clone(),
    );
    for question in ["q1", "q2", "q3"] {
        storage
            .create_or_update_answer(common::open_response(question, "x"))
            .await
            .unwrap();
    }

    assert_eq!(storage.sync_data().await.unwrap(), 3);
    assert_eq!(storage.sync_data().await.unwrap(), 3);

    let answers = CollectionPath::new(SOURCE_KEY, "answers");
    assert_eq!(remote.document_count(&answers), 3);
    // The remote session is established once and reused.
    assert_eq!(remote.sign_in_count(), 1);

    let docs = remote.query(&answers, &[]).await.unwrap();
    assert!(docs.iter().all(|d| d["platform_user_id"] == "7"));
    assert!(docs.iter().all(|d| d.get("activity").is_none()));
}

#[tokio::test]
async fn test_failed_sync_signs_out_and_recovers() {
    let remote = MemoryDocumentStore::new();
    let storage = common::local_storage(
        Some(common::authenticated_portal(common::far_future())),
        remote.clone(),
    );
    storage
        .create_or_update_answer(common::open_response("q1", "x"))
        .await
        .unwrap();

    storage.sync_data().await.unwrap();
    assert_eq!(remote.sign_in_count(), 1);

    remote.set_offline(true);
    let err = storage.sync_data().await.unwrap_err();
    assert!(matches!(err, StorageError::Remote(_)));
    assert_eq!(remote.sign_out_count(), 1);
    assert!(!remote.is_signed_in());

    remote.set_offline(false);
    assert_eq!(storage.sync_data().await.unwrap(), 1);
    assert_eq!(remote.sign_in_count(), 2);
}

#[tokio::test]
async fn test_sync_without_portal_is_unauthenticated() {
    let storage = common::local_storage(None, MemoryDocumentStore::new());
    assert!(matches!(
        storage.sync_data().await,
        Err(StorageError::NotAuthenticated)
    ));
}
