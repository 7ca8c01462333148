use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::error::{StorageError, StorageResult};
use crate::models::{AnswerRecord, OfflineActivity};

/// Bumped whenever `LOCAL_DB_SCHEMA` changes shape.
pub const LOCAL_DB_SCHEMA_VERSION: i32 = 1;

const LOCAL_DB_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS answers (
    id TEXT PRIMARY KEY,
    question_id TEXT NOT NULL,
    activity TEXT NOT NULL,
    body TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_answers_question_id ON answers(question_id);
CREATE INDEX IF NOT EXISTS idx_answers_activity ON answers(activity);

CREATE TABLE IF NOT EXISTS plugin_states (
    plugin_id INTEGER PRIMARY KEY,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS offline_activities (
    url TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// Local transactional store holding answers, plugin states and the offline
/// activity catalogue.
pub struct LocalDatabase {
    conn: Mutex<Connection>,
}

impl LocalDatabase {
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
        tracing::debug!(path = %path.as_ref().display(), "opened local database");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    /// Creates missing tables and records the schema version. Safe to re-run.
    pub fn migrate(&self) -> StorageResult<()> {
        let conn = self.lock()?;
        let current: i32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
        if current > LOCAL_DB_SCHEMA_VERSION {
            tracing::warn!(
                current,
                supported = LOCAL_DB_SCHEMA_VERSION,
                "local database was written by a newer player"
            );
        }
        conn.execute_batch(LOCAL_DB_SCHEMA)?;
        if current < LOCAL_DB_SCHEMA_VERSION {
            conn.execute_batch(&format!(
                "PRAGMA user_version = {};",
                LOCAL_DB_SCHEMA_VERSION
            ))?;
        }
        Ok(())
    }

    pub fn schema_version(&self) -> StorageResult<i32> {
        let conn = self.lock()?;
        Ok(conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?)
    }

    pub fn find_answer(
        &self,
        activity: &str,
        question_id: &str,
    ) -> StorageResult<Option<AnswerRecord>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM answers WHERE activity = ?1 AND question_id = ?2 LIMIT 1",
                params![activity, question_id],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(StorageError::from))
            .transpose()
    }

    pub fn answers_for_activity(&self, activity: &str) -> StorageResult<Vec<AnswerRecord>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT body FROM answers WHERE activity = ?1 ORDER BY rowid")?;
        let bodies = stmt
            .query_map(params![activity], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(StorageError::from))
            .collect()
    }

    /// Writes `answer` into `activity`, reusing the id of any answer already
    /// stored for the same question. Returns the record as stored.
    pub fn upsert_answer(
        &self,
        activity: &str,
        answer: AnswerRecord,
    ) -> StorageResult<AnswerRecord> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let stored = upsert_in(&tx, activity, answer)?;
        tx.commit()?;
        Ok(stored)
    }

    /// Upserts every answer in one transaction: either all of them are stored
    /// or none are.
    pub fn upsert_answers(
        &self,
        activity: &str,
        answers: Vec<AnswerRecord>,
    ) -> StorageResult<Vec<AnswerRecord>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let stored = answers
            .into_iter()
            .map(|answer| upsert_in(&tx, activity, answer))
            .collect::<StorageResult<Vec<_>>>()?;
        tx.commit()?;
        Ok(stored)
    }

    pub fn plugin_state(&self, plugin_id: u32) -> StorageResult<Option<String>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT state FROM plugin_states WHERE plugin_id = ?1",
                params![i64::from(plugin_id)],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn put_plugin_state(&self, plugin_id: u32, state: &str) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO plugin_states (plugin_id, state, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(plugin_id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
            params![i64::from(plugin_id), state, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn put_offline_activity(&self, activity: &OfflineActivity) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO offline_activities (url, name, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(url) DO UPDATE SET name = excluded.name, updated_at = excluded.updated_at",
            params![activity.url, activity.name, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn offline_activities(&self) -> StorageResult<Vec<OfflineActivity>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT name, url FROM offline_activities ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(OfflineActivity {
                    name: row.get(0)?,
                    url: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_offline_activity(&self, url: &str) -> StorageResult<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM offline_activities WHERE url = ?1", params![url])?;
        Ok(deleted > 0)
    }

    pub(crate) fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

fn upsert_in(
    tx: &Transaction<'_>,
    activity: &str,
    mut answer: AnswerRecord,
) -> StorageResult<AnswerRecord> {
    let existing_id: Option<String> = tx
        .query_row(
            "SELECT id FROM answers WHERE activity = ?1 AND question_id = ?2 LIMIT 1",
            params![activity, answer.question_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing_id {
        answer.id = id;
    }
    answer.activity = Some(activity.to_string());

    let body = serde_json::to_string(&answer)?;
    tx.execute(
        "INSERT INTO answers (id, question_id, activity, body, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            question_id = excluded.question_id,
            activity = excluded.activity,
            body = excluded.body,
            updated_at = excluded.updated_at",
        params![
            answer.id,
            answer.question_id,
            activity,
            body,
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(answer)
}
