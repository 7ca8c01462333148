use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One learner-activity log record, buffered until the logger flushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_value: Option<serde_json::Value>,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    pub time: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            event_value: None,
            parameters: serde_json::Value::Null,
            activity: None,
            time: Utc::now(),
        }
    }
}
