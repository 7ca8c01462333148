use serde::{Deserialize, Serialize};

/// Progress a plugin reports back while answering a sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginSyncStatus {
    Started,
    Working,
    Completed,
    Failed,
}

impl PluginSyncStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PluginSyncStatus::Completed | PluginSyncStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PluginSyncStatus::Started => "started",
            PluginSyncStatus::Working => "working",
            PluginSyncStatus::Completed => "completed",
            PluginSyncStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSyncUpdate {
    pub status: PluginSyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PluginSyncUpdate {
    pub fn new(status: PluginSyncStatus) -> Self {
        Self {
            status,
            message: None,
        }
    }
}

/// Outcome of one `DataSyncTracker::start` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub plugin_successes: u32,
    pub plugin_failures: u32,
    /// Plugins that reported `started` but never finished.
    pub plugin_drops: u32,
    pub logger_synced: bool,
}
