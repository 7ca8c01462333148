use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};

/// Handle returned by every watch operation. Dropping it keeps the watcher
/// registered; call `unsubscribe` to stop further notifications.
pub struct Unsubscribe(Option<Box<dyn FnOnce() + Send>>);

impl Unsubscribe {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Some(Box::new(f)))
    }

    pub fn noop() -> Self {
        Self(None)
    }

    pub fn unsubscribe(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Unsubscribe").field(&self.0.is_some()).finish()
    }
}

pub type Callback<V> = Arc<dyn Fn(V) + Send + Sync>;

struct Inner<K, V> {
    next_id: u64,
    watchers: HashMap<K, Vec<(u64, Callback<V>)>>,
}

/// Callbacks grouped by key, notified synchronously by the write path.
pub struct WatcherRegistry<K, V> {
    inner: Arc<Mutex<Inner<K, V>>>,
}

impl<K, V> Default for WatcherRegistry<K, V> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 1,
                watchers: HashMap::new(),
            })),
        }
    }
}

impl<K, V> WatcherRegistry<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + 'static,
{
    pub fn register(&self, key: K, callback: Callback<V>) -> Unsubscribe {
        let id = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner
                .watchers
                .entry(key.clone())
                .or_default()
                .push((id, callback));
            id
        };

        let weak: Weak<Mutex<Inner<K, V>>> = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = lock(&inner);
                if let Some(list) = inner.watchers.get_mut(&key) {
                    list.retain(|(existing, _)| *existing != id);
                    if list.is_empty() {
                        inner.watchers.remove(&key);
                    }
                }
            }
        })
    }

    /// Calls every watcher of `key` with `value`, outside the registry lock.
    pub fn notify(&self, key: &K, value: V) -> usize {
        let callbacks: Vec<Callback<V>> = lock(&self.inner)
            .watchers
            .get(key)
            .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        for callback in &callbacks {
            callback(value.clone());
        }
        callbacks.len()
    }

    pub fn count(&self, key: &K) -> usize {
        lock(&self.inner)
            .watchers
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn has_watchers(&self, key: &K) -> bool {
        self.count(key) > 0
    }
}

fn lock<K, V>(inner: &Mutex<Inner<K, V>>) -> std::sync::MutexGuard<'_, Inner<K, V>> {
    // Callbacks never run under the lock, so a poisoned guard still holds a
    // consistent map.
    inner.lock().unwrap_or_else(|e| e.into_inner())
}
