//! # Handler Registry
//!
//! Event-name keyed handler table. Names are matched case-insensitively, the
//! same way the hub protocol resolves client methods.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use super::lock;

/// Callback invoked with the raw invocation arguments.
pub type EventHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Identifies one registration for removal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerHandle {
    event: String,
    id: u64,
}

impl HandlerHandle {
    /// Normalised event name this handler is registered for.
    pub fn event(&self) -> &str {
        &self.event
    }
}

/// Handlers per event name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<String, Vec<(u64, EventHandler)>>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `handler` for `event`. The same name may carry many handlers.
    pub fn register(&self, event: &str, handler: EventHandler) -> HandlerHandle {
        let event = event.to_ascii_lowercase();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.handlers)
            .entry(event.clone())
            .or_default()
            .push((id, handler));
        HandlerHandle { event, id }
    }

    /// Removes one registration. Returns false if it was already gone.
    pub fn remove(&self, handle: &HandlerHandle) -> bool {
        let mut handlers = lock(&self.handlers);
        let Some(list) = handlers.get_mut(&handle.event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != handle.id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&handle.event);
        }
        removed
    }

    /// Calls every handler registered for `event`. Returns how many ran.
    ///
    /// Handlers run after the lock is released, so a handler may register or
    /// remove handlers itself.
    pub fn invoke(&self, event: &str, args: &[Value]) -> usize {
        let targets: Vec<EventHandler> = {
            let handlers = lock(&self.handlers);
            match handlers.get(&event.to_ascii_lowercase()) {
                Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => Vec::new(),
            }
        };
        if targets.is_empty() {
            log::debug!("No handler registered for hub event '{}'", event);
        }
        for handler in &targets {
            handler(args);
        }
        targets.len()
    }

    /// Number of handlers registered for `event`.
    pub fn len(&self, event: &str) -> usize {
        lock(&self.handlers)
            .get(&event.to_ascii_lowercase())
            .map_or(0, Vec::len)
    }

    /// True when no handler is registered at all.
    pub fn is_empty(&self) -> bool {
        lock(&self.handlers).is_empty()
    }
}
