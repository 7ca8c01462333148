pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use error::{StorageError, StorageResult, SyncError};
pub use events::EventBus;
pub use services::sync_tracker::DataSyncTracker;
pub use services::{init_storage, PlayerStorage, StorageConfig};
