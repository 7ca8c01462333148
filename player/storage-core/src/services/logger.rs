use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::events::EventBus;
use crate::metrics::LOG_ENTRIES_FLUSHED_TOTAL;
use crate::models::LogEntry;

/// Destination for flushed log entries.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn send(&self, entries: &[LogEntry]) -> Result<()>;
}

/// Writes entries to the process's tracing output. Used when no log manager
/// endpoint is configured.
pub struct TracingLogSink;

#[async_trait]
impl LogSink for TracingLogSink {
    async fn send(&self, entries: &[LogEntry]) -> Result<()> {
        for entry in entries {
            tracing::info!(
                target: "activity_log",
                event = %entry.event,
                activity = entry.activity.as_deref().unwrap_or(""),
                time = %entry.time,
                parameters = %entry.parameters,
                "activity log entry"
            );
        }
        Ok(())
    }
}

/// Posts entries as a JSON array to the log manager.
pub struct HttpLogSink {
    http_client: Client,
    url: String,
}

impl HttpLogSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http_client: Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl LogSink for HttpLogSink {
    async fn send(&self, entries: &[LogEntry]) -> Result<()> {
        self.http_client
            .post(&self.url)
            .json(entries)
            .send()
            .await
            .context("Failed to reach log manager")?
            .error_for_status()
            .context("Log manager rejected log batch")?;
        Ok(())
    }
}

/// Something the sync tracker waits on before letting the player navigate.
#[async_trait]
pub trait LogFlusher: Send + Sync {
    /// Returns whether everything buffered so far was delivered.
    async fn flush_logs(&self) -> bool;
}

/// Buffers activity log entries, announcing each on the bus as it is logged.
pub struct Logger {
    bus: Arc<EventBus>,
    sink: Arc<dyn LogSink>,
    activity: Option<String>,
    buffer: Mutex<Vec<LogEntry>>,
}

impl Logger {
    pub fn new(bus: Arc<EventBus>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            bus,
            sink,
            activity: None,
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn with_activity(mut self, activity: impl Into<String>) -> Self {
        self.activity = Some(activity.into());
        self
    }

    pub fn log(&self, event: &str, event_value: Option<Value>, parameters: Value) {
        let mut entry = LogEntry::new(event);
        entry.event_value = event_value;
        entry.parameters = parameters;
        entry.activity = self.activity.clone();

        self.bus.emit_log(&entry);
        self.lock_buffer().push(entry);
    }

    pub fn pending(&self) -> usize {
        self.lock_buffer().len()
    }

    /// Sends everything buffered to the sink. On failure the entries are put
    /// back ahead of anything logged meanwhile.
    pub async fn flush(&self) -> Result<usize> {
        let batch = std::mem::take(&mut *self.lock_buffer());
        if batch.is_empty() {
            return Ok(0);
        }

        match self.sink.send(&batch).await {
            Ok(()) => {
                LOG_ENTRIES_FLUSHED_TOTAL.inc_by(batch.len() as u64);
                tracing::debug!(count = batch.len(), "Log entries flushed");
                Ok(batch.len())
            }
            Err(e) => {
                let mut buffer = self.lock_buffer();
                let newer = std::mem::replace(&mut *buffer, batch);
                buffer.extend(newer);
                Err(e)
            }
        }
    }

    fn lock_buffer(&self) -> std::sync::MutexGuard<'_, Vec<LogEntry>> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LogFlusher for Logger {
    async fn flush_logs(&self) -> bool {
        match self.flush().await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Failed to flush activity log: {:#}", e);
                false
            }
        }
    }
}
