#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use activity_player_storage::models::{AnswerKind, AnswerRecord, PortalData};
use activity_player_storage::services::{LocalDatabase, LocalStorage, MemoryDocumentStore};
use activity_player_storage::utils::retry::RetryPolicy;
use serde_json::json;

pub const ACTIVITY: &str = "https://authoring.example.org/activities/1";
pub const SOURCE_KEY: &str = "authoring.example.org";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn authenticated_portal(exp: i64) -> PortalData {
    serde_json::from_value(json!({
        "type": "authenticated",
        "contextId": "class-1",
        "database": {
            "appName": "report-service-dev",
            "sourceKey": SOURCE_KEY,
            "rawFirebaseJWT": "header.payload.signature"
        },
        "offering": { "id": 42 },
        "platformId": "https://portal.example.org",
        "platformUserId": "7",
        "resourceLinkId": "99",
        "resourceUrl": ACTIVITY,
        "toolId": "activity-player",
        "userType": "learner",
        "portalJWT": { "exp": exp }
    }))
    .expect("valid portal fixture")
}

pub fn anonymous_portal() -> PortalData {
    serde_json::from_value(json!({
        "type": "anonymous",
        "database": { "appName": "report-service-dev", "sourceKey": SOURCE_KEY },
        "resourceUrl": ACTIVITY,
        "toolId": "activity-player",
        "toolUserId": "anonymous",
        "userType": "learner",
        "runKey": "run-abc"
    }))
    .expect("valid portal fixture")
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        jitter_max: None,
    }
}

/// Migrated local storage over an in-memory database.
pub fn local_storage(
    portal: Option<PortalData>,
    remote: Arc<MemoryDocumentStore>,
) -> LocalStorage {
    init_tracing();
    let db = LocalDatabase::open_in_memory().expect("in-memory database");
    db.migrate().expect("migrate");
    LocalStorage::new(Arc::new(db), ACTIVITY, portal, remote, "report-service-dev")
        .with_retry_policy(fast_retry())
}

pub fn open_response(question_ref_id: &str, text: &str) -> AnswerRecord {
    AnswerRecord::new(
        question_ref_id,
        AnswerKind::OpenResponse {
            answer: text.to_string(),
        },
        json!({ "mode": "report" }).to_string(),
    )
}

pub fn far_future() -> i64 {
    chrono::Utc::now().timestamp() + 3600
}

pub fn past() -> i64 {
    chrono::Utc::now().timestamp() - 60
}
