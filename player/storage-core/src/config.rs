use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::StorageConfig;
use crate::utils::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageSettings,
    pub mongo_uri: String,
    pub mongo_database: String,
    pub portal: PortalSettings,
    pub logger_url: Option<String>,
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    pub name: String,
    pub offline: bool,
    pub preview: bool,
    pub activity: String,
    pub local_db_path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortalSettings {
    pub data_url: Option<String>,
    pub token: Option<String>,
    pub data_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    pub timeout_seconds: u64,
    pub plugin_heartbeat_seconds: u64,
}

impl SyncSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn plugin_heartbeat(&self) -> Duration {
        Duration::from_secs(self.plugin_heartbeat_seconds)
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Local .env is optional; real deployments set the environment directly
        dotenvy::dotenv().ok();

        // Determine environment (defaults to dev)
        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // Build configuration from config/*.toml + ENV overrides
        let settings = config::Config::builder()
            .set_default("storage.name", "report-service-dev")?
            .set_default("storage.offline", false)?
            .set_default("storage.preview", false)?
            .set_default("storage.activity", "")?
            .set_default("storage.local_db_path", "activity-player.sqlite3")?
            .set_default("database.mongo_database", "activity_player")?
            .set_default("sync.timeout_seconds", 3600)?
            .set_default("sync.plugin_heartbeat_seconds", 10)?
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            // Override with environment variables (prefix: APP_)
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());

        let mongo_database = settings.get_string("database.mongo_database")?;

        let storage = StorageSettings {
            name: settings.get_string("storage.name")?,
            offline: settings.get_bool("storage.offline")?,
            preview: settings.get_bool("storage.preview")?,
            activity: settings.get_string("storage.activity")?,
            local_db_path: PathBuf::from(settings.get_string("storage.local_db_path")?),
        };

        let portal = PortalSettings {
            data_url: settings.get_string("portal.data_url").ok(),
            token: settings
                .get_string("portal.token")
                .or_else(|_| env::var("PORTAL_TOKEN"))
                .ok(),
            data_file: settings.get_string("portal.data_file").ok().map(PathBuf::from),
        };

        let sync = SyncSettings {
            timeout_seconds: settings.get_int("sync.timeout_seconds")?.max(1) as u64,
            plugin_heartbeat_seconds: settings.get_int("sync.plugin_heartbeat_seconds")?.max(1)
                as u64,
        };

        if storage.offline && storage.activity.is_empty() {
            tracing::warn!("Offline storage configured without storage.activity");
        }

        Ok(Config {
            storage,
            mongo_uri,
            mongo_database,
            portal,
            logger_url: settings.get_string("logger.url").ok(),
            sync,
        })
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            name: self.storage.name.clone(),
            preview: self.storage.preview,
            offline: self.storage.offline,
            activity: self.storage.activity.clone(),
            local_db_path: Some(self.storage.local_db_path.clone()),
            sync_retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn defaults_apply_without_overrides() {
        env::remove_var("APP__STORAGE__OFFLINE");
        env::remove_var("APP__SYNC__TIMEOUT_SECONDS");

        let config = Config::load().unwrap();
        assert_eq!(config.storage.name, "report-service-dev");
        assert!(!config.storage.offline);
        assert_eq!(config.sync.timeout(), Duration::from_secs(3600));
        assert_eq!(config.sync.plugin_heartbeat(), Duration::from_secs(10));
    }

    #[test]
    #[serial]
    fn env_overrides_take_precedence() {
        env::set_var("APP__STORAGE__OFFLINE", "true");
        env::set_var("APP__SYNC__TIMEOUT_SECONDS", "30");

        let config = Config::load().unwrap();
        assert!(config.storage.offline);
        assert_eq!(config.sync.timeout_seconds, 30);
        assert!(config.storage_config().offline);

        env::remove_var("APP__STORAGE__OFFLINE");
        env::remove_var("APP__SYNC__TIMEOUT_SECONDS");
    }
}
