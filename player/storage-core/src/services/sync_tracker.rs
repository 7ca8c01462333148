//! Gate that holds a page transition until pending saves have settled.
//!
//! A run waits on three things at once: promises registered with
//! `add_promise`, plugins answering the sync request broadcast on the bus, and
//! the logger flush. Plugin and logger progress share one watchdog that is
//! re-armed by every `started`/`working` heartbeat and by the logger finishing.
//! Once the watchdog sees a full heartbeat interval with no activity, plugins
//! are no longer waited on. The whole run is bounded by `sync_timeout`.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::{join_all, BoxFuture, FutureExt};
use tokio::sync::Notify;

use super::logger::LogFlusher;
use crate::error::SyncError;
use crate::events::{EventBus, PluginSyncRequest, PluginSyncUpdater};
use crate::metrics::{PLUGIN_SYNC_STATUS_TOTAL, SYNC_RUNS_TOTAL};
use crate::models::{PluginSyncStatus, PluginSyncUpdate, SyncReport};

pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_PLUGIN_HEARTBEAT: Duration = Duration::from_secs(10);

pub struct DataSyncTracker {
    bus: Arc<EventBus>,
    sync_timeout: Duration,
    plugin_heartbeat: Duration,
    logger: Option<Arc<dyn LogFlusher>>,
    promises: Vec<BoxFuture<'static, ()>>,
}

impl DataSyncTracker {
    pub fn new(bus: Arc<EventBus>, sync_timeout: Duration, plugin_heartbeat: Duration) -> Self {
        Self {
            bus,
            sync_timeout,
            plugin_heartbeat,
            logger: None,
            promises: Vec::new(),
        }
    }

    pub fn with_defaults(bus: Arc<EventBus>) -> Self {
        Self::new(bus, DEFAULT_SYNC_TIMEOUT, DEFAULT_PLUGIN_HEARTBEAT)
    }

    pub fn with_logger(mut self, logger: Arc<dyn LogFlusher>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Registers a save the run must wait for. Its outcome is the caller's
    /// concern; the tracker only waits for it to finish.
    pub fn add_promise<F>(&mut self, promise: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.promises.push(promise.boxed());
    }

    pub fn pending_promises(&self) -> usize {
        self.promises.len()
    }

    pub async fn start(self) -> Result<SyncReport, SyncError> {
        let Self {
            bus,
            sync_timeout,
            plugin_heartbeat,
            logger,
            promises,
        } = self;
        let started_at = Instant::now();
        let report = Arc::new(Mutex::new(SyncReport::default()));
        let activity = Arc::new(Notify::new());

        let request = PluginSyncRequest::new(
            plugin_heartbeat,
            heartbeat_callback(report.clone(), activity.clone()),
        );
        let plugins = bus.emit_plugin_sync_request(&request);
        tracing::debug!(
            plugins,
            promises = promises.len(),
            heartbeat = ?plugin_heartbeat,
            "Data sync started"
        );

        let watchdog = async {
            while tokio::time::timeout(plugin_heartbeat, activity.notified())
                .await
                .is_ok()
            {}
        };

        let logger_flush = async {
            if let Some(logger) = logger {
                let synced = logger.flush_logs().await;
                lock(&report).logger_synced = synced;
                activity.notify_one();
            }
        };

        let everything = async {
            tokio::join!(join_all(promises), watchdog, logger_flush);
        };

        if tokio::time::timeout(sync_timeout, everything).await.is_err() {
            SYNC_RUNS_TOTAL.with_label_values(&["timeout"]).inc();
            tracing::error!(
                limit = ?sync_timeout,
                "Data sync did not finish before the hard timeout"
            );
            return Err(SyncError::TimeOut {
                limit: sync_timeout,
            });
        }

        let report = *lock(&report);
        SYNC_RUNS_TOTAL.with_label_values(&["completed"]).inc();
        tracing::info!(
            successes = report.plugin_successes,
            failures = report.plugin_failures,
            drops = report.plugin_drops,
            logger_synced = report.logger_synced,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Data sync finished"
        );
        Ok(report)
    }
}

fn heartbeat_callback(report: Arc<Mutex<SyncReport>>, activity: Arc<Notify>) -> PluginSyncUpdater {
    Arc::new(move |update: PluginSyncUpdate| {
        PLUGIN_SYNC_STATUS_TOTAL
            .with_label_values(&[update.status.as_str()])
            .inc();
        {
            let mut report = lock(&report);
            match update.status {
                PluginSyncStatus::Started => report.plugin_drops += 1,
                PluginSyncStatus::Working => {}
                PluginSyncStatus::Completed => {
                    report.plugin_successes += 1;
                    report.plugin_drops = report.plugin_drops.saturating_sub(1);
                }
                PluginSyncStatus::Failed => {
                    report.plugin_failures += 1;
                    report.plugin_drops = report.plugin_drops.saturating_sub(1);
                    tracing::warn!(
                        message = update.message.as_deref().unwrap_or(""),
                        "Plugin failed to sync"
                    );
                }
            }
        }
        if !update.status.is_terminal() {
            activity.notify_one();
        }
    })
}

fn lock(report: &Mutex<SyncReport>) -> std::sync::MutexGuard<'_, SyncReport> {
    report.lock().unwrap_or_else(|e| e.into_inner())
}
