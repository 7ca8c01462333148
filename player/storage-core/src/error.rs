use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("BSON encoding error: {0}")]
    BsonEncode(#[from] mongodb::bson::ser::Error),
    #[error("Not authenticated with the remote store")]
    NotAuthenticated,
    #[error("Operation not supported by the {backend} store: {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },
    #[error("Remote store error: {0}")]
    Remote(String),
    #[error("Invalid activity URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Portal data unavailable: {0}")]
    Portal(String),
    #[error("Storage lock poisoned")]
    LockPoisoned,
    #[error("Local database task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("DataSyncTracker TimeOut after {limit:?}")]
    TimeOut { limit: Duration },
}
