//! Publish/subscribe channels connecting the player, its plugins and the logger.
//!
//! Each channel delivers to its listeners in registration order. Nothing is
//! ordered across channels.

pub mod container;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::models::{LogEntry, PluginSyncUpdate};

pub use container::{
    ContainerEvents, ContainerTree, InteractiveAvailableEvent, SupportedFeaturesEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Unbounded listener list for one event type.
pub struct Listeners<T> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(ListenerId, Handler<T>)>>,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Listeners<T> {
    pub fn on<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.lock().push((id, Arc::new(handler)));
        id
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Invokes every handler with `event` and returns how many were called.
    /// Handlers run outside the lock so they may register or emit themselves.
    pub fn emit(&self, event: &T) -> usize {
        let snapshot: Vec<Handler<T>> = self.lock().iter().map(|(_, h)| h.clone()).collect();
        for handler in &snapshot {
            handler(event);
        }
        snapshot.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, Handler<T>)>> {
        // A panicking handler runs outside the lock, so poisoning only follows
        // a panic inside `Vec` itself; the list is still consistent.
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub type PluginSyncUpdater = Arc<dyn Fn(PluginSyncUpdate) + Send + Sync>;

/// Sent to every plugin when the player needs all pending state saved.
/// Plugins answer through `update` with `started`, any number of `working`,
/// then `completed` or `failed`, never letting more than
/// `max_update_callback_interval` pass between calls.
#[derive(Clone)]
pub struct PluginSyncRequest {
    pub max_update_callback_interval: Duration,
    update_callback: PluginSyncUpdater,
}

impl PluginSyncRequest {
    pub fn new(max_update_callback_interval: Duration, update_callback: PluginSyncUpdater) -> Self {
        Self {
            max_update_callback_interval,
            update_callback,
        }
    }

    pub fn update(&self, update: PluginSyncUpdate) {
        (self.update_callback)(update)
    }
}

impl std::fmt::Debug for PluginSyncRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSyncRequest")
            .field(
                "max_update_callback_interval",
                &self.max_update_callback_interval,
            )
            .finish_non_exhaustive()
    }
}

/// Process-wide channels shared by the player, plugins and logger.
#[derive(Default)]
pub struct EventBus {
    log: Listeners<LogEntry>,
    plugin_sync: Listeners<PluginSyncRequest>,
    containers: ContainerEvents,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_log<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&LogEntry) + Send + Sync + 'static,
    {
        self.log.on(handler)
    }

    pub fn off_log(&self, id: ListenerId) -> bool {
        self.log.off(id)
    }

    pub fn emit_log(&self, entry: &LogEntry) -> usize {
        self.log.emit(entry)
    }

    pub fn on_plugin_sync_request<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&PluginSyncRequest) + Send + Sync + 'static,
    {
        self.plugin_sync.on(handler)
    }

    pub fn off_plugin_sync_request(&self, id: ListenerId) -> bool {
        self.plugin_sync.off(id)
    }

    pub fn emit_plugin_sync_request(&self, request: &PluginSyncRequest) -> usize {
        self.plugin_sync.emit(request)
    }

    pub fn plugin_sync_listener_count(&self) -> usize {
        self.plugin_sync.len()
    }

    pub fn containers(&self) -> &ContainerEvents {
        &self.containers
    }
}
