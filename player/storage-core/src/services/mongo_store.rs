use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::options::{ReplaceOptions, UpdateOptions};
use mongodb::{Client, Collection, Database};
use serde_json::Value;

use super::document_store::{
    CollectionPath, DocumentPath, DocumentStore, FieldFilter, SnapshotCallback, SnapshotListeners,
};
use super::watchers::Unsubscribe;
use crate::error::{StorageError, StorageResult};
use crate::metrics::track_storage_operation;
use crate::utils::time::chrono_to_bson;

/// Remote document store backed by MongoDB. Each logical collection maps to a
/// Mongo collection of the same name; `_id` holds the full document path so
/// `sources/{sourceKey}/answers/{answerId}` stays the document identity.
///
/// Snapshot listeners are driven by writes made through this client only.
pub struct MongoDocumentStore {
    db: Database,
    signed_in: AtomicBool,
    listeners: SnapshotListeners,
}

impl MongoDocumentStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            signed_in: AtomicBool::new(false),
            listeners: SnapshotListeners::default(),
        }
    }

    pub async fn connect(uri: &str, database: &str) -> StorageResult<Self> {
        let client = Client::with_uri_str(uri).await?;
        tracing::info!(database, "MongoDB client created");
        Ok(Self::new(client.database(database)))
    }

    fn collection(&self, path: &CollectionPath) -> Collection<Document> {
        self.db.collection(path.name())
    }

    fn ensure_signed_in(&self) -> StorageResult<()> {
        if self.signed_in.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::NotAuthenticated)
        }
    }

    fn filter_for(collection: &CollectionPath, filters: &[FieldFilter]) -> StorageResult<Document> {
        let mut filter = doc! { "source_key": collection.source_key() };
        for f in filters {
            filter.insert(f.field.clone(), bson::to_bson(&f.value)?);
        }
        Ok(filter)
    }

    fn to_json(mut document: Document) -> Value {
        document.remove("_id");
        document.remove("updated_at");
        Bson::Document(document).into_relaxed_extjson()
    }

    async fn find_all(
        &self,
        collection: &CollectionPath,
        filters: &[FieldFilter],
    ) -> StorageResult<Vec<Value>> {
        let filter = Self::filter_for(collection, filters)?;
        let mut cursor = self.collection(collection).find(filter).await?;

        let mut docs = Vec::new();
        while cursor.advance().await? {
            docs.push(Self::to_json(cursor.deserialize_current()?));
        }
        Ok(docs)
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    fn backend_name(&self) -> &'static str {
        "mongodb"
    }

    async fn sign_in(&self, app_name: &str, token: Option<&str>) -> StorageResult<()> {
        if token.is_none() {
            tracing::debug!(app_name, "signing in to MongoDB without a session token");
        }
        self.db.run_command(doc! { "ping": 1 }).await?;
        self.signed_in.store(true, Ordering::SeqCst);
        tracing::info!(app_name, database = %self.db.name(), "MongoDB session established");
        Ok(())
    }

    async fn sign_out(&self) -> StorageResult<()> {
        self.signed_in.store(false, Ordering::SeqCst);
        tracing::info!(database = %self.db.name(), "MongoDB session closed");
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
        self.ensure_signed_in()?;
        let collection = self.collection(path.collection());
        let id = path.to_string();

        let mut body = bson::to_document(&data)?;
        body.insert("source_key", path.collection().source_key());
        body.insert("updated_at", chrono_to_bson(Utc::now()));

        track_storage_operation("set_document", "mongodb", async {
            if merge {
                collection
                    .update_one(doc! { "_id": id.as_str() }, doc! { "$set": body })
                    .with_options(UpdateOptions::builder().upsert(true).build())
                    .await?;
            } else {
                body.insert("_id", id.clone());
                collection
                    .replace_one(doc! { "_id": id.as_str() }, body)
                    .with_options(ReplaceOptions::builder().upsert(true).build())
                    .await?;
            }
            Ok::<_, StorageError>(())
        })
        .await?;

        let mut written = data;
        if let Value::Object(fields) = &mut written {
            fields.insert(
                "source_key".into(),
                path.collection().source_key().into(),
            );
        }
        self.listeners
            .refresh(path.collection(), &written, |filters| async move {
                self.find_all(path.collection(), &filters).await
            })
            .await;
        Ok(())
    }

    async fn get_document(&self, path: &DocumentPath) -> StorageResult<Option<Value>> {
        self.ensure_signed_in()?;
        let found = self
            .collection(path.collection())
            .find_one(doc! { "_id": path.to_string() })
            .await?;
        Ok(found.map(Self::to_json))
    }

    async fn query(
        &self,
        collection: &CollectionPath,
        filters: &[FieldFilter],
    ) -> StorageResult<Vec<Value>> {
        self.ensure_signed_in()?;
        track_storage_operation("query", "mongodb", self.find_all(collection, filters)).await
    }

    async fn on_snapshot(
        &self,
        collection: CollectionPath,
        filters: Vec<FieldFilter>,
        callback: SnapshotCallback,
    ) -> StorageResult<Unsubscribe> {
        self.ensure_signed_in()?;
        callback(self.find_all(&collection, &filters).await?);
        Ok(self.listeners.add(collection, filters, callback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_is_scoped_to_source() {
        let collection = CollectionPath::new("authoring.example.org", "answers");
        let filter = MongoDocumentStore::filter_for(
            &collection,
            &[FieldFilter::eq("question_id", "managed_interactive_1")],
        )
        .unwrap();

        assert_eq!(
            filter,
            doc! {
                "source_key": "authoring.example.org",
                "question_id": "managed_interactive_1",
            }
        );
    }

    #[test]
    fn stored_document_loses_storage_fields() {
        let stored = doc! {
            "_id": "sources/local/answers/a1",
            "updated_at": chrono_to_bson(Utc::now()),
            "id": "a1",
            "question_id": "q1",
        };
        assert_eq!(
            MongoDocumentStore::to_json(stored),
            json!({ "id": "a1", "question_id": "q1" })
        );
    }
}
