//! Notifications scoped to the container an embeddable is rendered in.
//!
//! A handler registered for container `C` receives events raised on `C` and
//! on any ancestor of `C`. Wrapper plugins are rendered in a container that
//! surrounds the wrapped embeddable's container, so an event raised on the
//! wrapper also reaches handlers of the wrapped embeddable.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use super::ListenerId;

/// Parent links between containers.
#[derive(Debug, Default, Clone)]
pub struct ContainerTree {
    parents: HashMap<String, String>,
}

impl ContainerTree {
    pub fn set_parent(&mut self, child: impl Into<String>, parent: impl Into<String>) {
        self.parents.insert(child.into(), parent.into());
    }

    pub fn remove(&mut self, container: &str) {
        self.parents.remove(container);
    }

    /// True when `candidate` is `container` itself or one of its ancestors.
    pub fn is_self_or_ancestor(&self, candidate: &str, container: &str) -> bool {
        let mut visited = HashSet::new();
        let mut current = Some(container);
        while let Some(node) = current {
            if node == candidate {
                return true;
            }
            if !visited.insert(node) {
                return false;
            }
            current = self.parents.get(node).map(String::as_str);
        }
        false
    }
}

pub trait ContainerScoped {
    fn container(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractiveAvailableEvent {
    pub container: String,
    pub available: bool,
}

impl ContainerScoped for InteractiveAvailableEvent {
    fn container(&self) -> &str {
        &self.container
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportedFeaturesEvent {
    pub container: String,
    pub features: serde_json::Value,
}

impl ContainerScoped for SupportedFeaturesEvent {
    fn container(&self) -> &str {
        &self.container
    }
}

type ScopedHandler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct ScopedListeners<E> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(ListenerId, String, ScopedHandler<E>)>>,
}

impl<E> Default for ScopedListeners<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
        }
    }
}

impl<E: ContainerScoped> ScopedListeners<E> {
    fn on(&self, container: String, handler: ScopedHandler<E>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, container, handler));
        id
    }

    fn off(&self, id: ListenerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|(existing, _, _)| *existing != id);
        handlers.len() != before
    }

    fn emit(&self, tree: &ContainerTree, event: &E) -> usize {
        let matching: Vec<ScopedHandler<E>> = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, registered, _)| tree.is_self_or_ancestor(event.container(), registered))
            .map(|(_, _, handler)| handler.clone())
            .collect();
        for handler in &matching {
            handler(event);
        }
        matching.len()
    }
}

/// Observer registry for container-scoped interactive notifications.
#[derive(Default)]
pub struct ContainerEvents {
    tree: RwLock<ContainerTree>,
    interactive_available: ScopedListeners<InteractiveAvailableEvent>,
    supported_features: ScopedListeners<SupportedFeaturesEvent>,
}

impl ContainerEvents {
    pub fn set_parent(&self, child: impl Into<String>, parent: impl Into<String>) {
        self.tree
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .set_parent(child, parent);
    }

    pub fn remove_container(&self, container: &str) {
        self.tree
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(container);
    }

    pub fn on_interactive_available<F>(&self, container: impl Into<String>, handler: F) -> ListenerId
    where
        F: Fn(&InteractiveAvailableEvent) + Send + Sync + 'static,
    {
        self.interactive_available
            .on(container.into(), Arc::new(handler))
    }

    pub fn off_interactive_available(&self, id: ListenerId) -> bool {
        self.interactive_available.off(id)
    }

    pub fn emit_interactive_available(&self, event: &InteractiveAvailableEvent) -> usize {
        let tree = self.snapshot();
        self.interactive_available.emit(&tree, event)
    }

    pub fn on_supported_features<F>(&self, container: impl Into<String>, handler: F) -> ListenerId
    where
        F: Fn(&SupportedFeaturesEvent) + Send + Sync + 'static,
    {
        self.supported_features.on(container.into(), Arc::new(handler))
    }

    pub fn off_supported_features(&self, id: ListenerId) -> bool {
        self.supported_features.off(id)
    }

    pub fn emit_supported_features(&self, event: &SupportedFeaturesEvent) -> usize {
        let tree = self.snapshot();
        self.supported_features.emit(&tree, event)
    }

    fn snapshot(&self) -> ContainerTree {
        self.tree.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
