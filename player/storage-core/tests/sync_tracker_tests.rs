mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use activity_player_storage::events::PluginSyncRequest;
use activity_player_storage::models::{PluginSyncStatus, PluginSyncUpdate, SyncReport};
use activity_player_storage::services::logger::{LogSink, Logger};
use activity_player_storage::{DataSyncTracker, EventBus, SyncError};
use async_trait::async_trait;

const HEARTBEAT: Duration = Duration::from_millis(80);
const GENEROUS: Duration = Duration::from_secs(10);

/// Registers a plugin that replays `statuses` with `gap` between them.
fn plugin(bus: &EventBus, statuses: Vec<PluginSyncStatus>, gap: Duration) {
    bus.on_plugin_sync_request(move |request: &PluginSyncRequest| {
        let request = request.clone();
        let statuses = statuses.clone();
        tokio::spawn(async move {
            for status in statuses {
                tokio::time::sleep(gap).await;
                request.update(PluginSyncUpdate::new(status));
            }
        });
    });
}

#[tokio::test]
async fn test_no_participants_resolves_after_one_interval() {
    common::init_tracing();
    let started = Instant::now();

    let report = DataSyncTracker::new(EventBus::new(), GENEROUS, HEARTBEAT)
        .start()
        .await
        .unwrap();

    assert_eq!(report, SyncReport::default());
    let elapsed = started.elapsed();
    assert!(elapsed >= HEARTBEAT);
    assert!(elapsed < HEARTBEAT * 5);
}

#[tokio::test]
async fn test_mixed_plugin_outcomes() {
    common::init_tracing();
    let bus = EventBus::new();
    plugin(
        &bus,
        vec![PluginSyncStatus::Started, PluginSyncStatus::Completed],
        Duration::from_millis(10),
    );
    plugin(
        &bus,
        vec![PluginSyncStatus::Started, PluginSyncStatus::Failed],
        Duration::from_millis(10),
    );

    let report = DataSyncTracker::new(bus, GENEROUS, HEARTBEAT)
        .start()
        .await
        .unwrap();

    assert_eq!(report.plugin_successes, 1);
    assert_eq!(report.plugin_failures, 1);
    assert_eq!(report.plugin_drops, 0);
}

#[tokio::test]
async fn test_silent_plugin_counts_as_drop() {
    common::init_tracing();
    let bus = EventBus::new();
    plugin(&bus, vec![PluginSyncStatus::Started], Duration::from_millis(5));

    let report = DataSyncTracker::new(bus, GENEROUS, HEARTBEAT)
        .start()
        .await
        .unwrap();

    assert_eq!(report.plugin_drops, 1);
    assert_eq!(report.plugin_failures, 0);
    assert_eq!(report.plugin_successes, 0);
}

#[tokio::test]
async fn test_plugin_that_never_answers_contributes_nothing() {
    common::init_tracing();
    let bus = EventBus::new();
    let requests = Arc::new(AtomicUsize::new(0));
    let r = requests.clone();
    bus.on_plugin_sync_request(move |_request: &PluginSyncRequest| {
        r.fetch_add(1, Ordering::SeqCst);
    });

    let report = DataSyncTracker::new(bus, GENEROUS, HEARTBEAT)
        .start()
        .await
        .unwrap();

    assert_eq!(requests.load(Ordering::SeqCst), 1);
    assert_eq!(report, SyncReport::default());
}

#[tokio::test]
async fn test_request_carries_heartbeat_interval() {
    let bus = EventBus::new();
    let interval = Arc::new(std::sync::Mutex::new(None));
    let i = interval.clone();
    bus.on_plugin_sync_request(move |request: &PluginSyncRequest| {
        *i.lock().unwrap() = Some(request.max_update_callback_interval);
    });

    DataSyncTracker::new(bus, GENEROUS, HEARTBEAT)
        .start()
        .await
        .unwrap();
    assert_eq!(*interval.lock().unwrap(), Some(HEARTBEAT));
}

#[tokio::test]
async fn test_hard_timeout_rejects() {
    common::init_tracing();
    let mut tracker = DataSyncTracker::new(EventBus::new(), Duration::from_millis(150), HEARTBEAT);
    tracker.add_promise(tokio::time::sleep(Duration::from_secs(3)));

    let err = tracker.start().await.unwrap_err();
    assert_eq!(
        err,
        SyncError::TimeOut {
            limit: Duration::from_millis(150)
        }
    );
    assert!(err.to_string().contains("TimeOut"));
}

struct SlowSink {
    delay: Duration,
    delivered: AtomicUsize,
}

#[async_trait]
impl LogSink for SlowSink {
    async fn send(
        &self,
        entries: &[activity_player_storage::models::LogEntry],
    ) -> anyhow::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.delivered.fetch_add(entries.len(), Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_waits_for_logger_flush() {
    common::init_tracing();
    let bus = EventBus::new();
    let sink = Arc::new(SlowSink {
        delay: HEARTBEAT * 2,
        delivered: AtomicUsize::new(0),
    });
    let logger = Arc::new(Logger::new(bus.clone(), sink.clone()));
    logger.log("page_exit", None, serde_json::Value::Null);

    let report = DataSyncTracker::new(bus, GENEROUS, HEARTBEAT)
        .with_logger(logger.clone())
        .start()
        .await
        .unwrap();

    assert!(report.logger_synced);
    assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
    assert_eq!(logger.pending(), 0);
}
