//! # Subject-Filtered Event Dispatcher
//!
//! The connection manager knows event names only. The `Dispatcher` sits on top
//! of it and routes each hub event to the subscriptions registered for the
//! event's *subject*, the order id carried as the first argument.
//!
//! ## Guarantees
//!
//! 1.  **Exactly once per dispatch**: every live subscription whose event name
//!     and subject match is invoked once. Subscriptions for other subjects are
//!     never touched.
//!
//! 2.  **Optional duplicate suppression**: with a non-zero dedupe window, a
//!     delivery identical to the previous one for the same `(event, subject)`
//!     inside the window is dropped. The window is off by default, since the
//!     hub sends `AssignOrder` with the id only and two real changes in quick
//!     succession would look identical. Repeated refetches are harmless: the
//!     reconciler commits an unchanged payload without a version bump.
//!
//! 3.  **Arrival order**: the hub session task calls `dispatch` sequentially,
//!     and handlers run to completion, so events for one subject are handled
//!     first-in first-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use super::connection_manager::ConnectionHandle;
use super::lock;
use super::registry::HandlerHandle;
use crate::models::EntityId;

/// Entries kept for duplicate detection before expired ones are pruned.
const RECENT_PRUNE_THRESHOLD: usize = 1024;

/// Callback for one subject: receives the subject id and the raw arguments.
pub type SubjectHandler = Arc<dyn Fn(&EntityId, &[Value]) + Send + Sync>;

struct Subscription {
    id: u64,
    event: String,
    subject: EntityId,
    handler: SubjectHandler,
}

struct Delivery {
    args: Vec<Value>,
    at: Instant,
}

/// # Core Dispatcher
///
/// Holds the live subscriptions and the short memory of recent deliveries.
pub struct Dispatcher {
    subscriptions: Mutex<Vec<Subscription>>,
    recent: Mutex<HashMap<(String, EntityId), Delivery>>,
    attached: Mutex<HashMap<String, HandlerHandle>>,
    dedupe_window: Duration,
    next_id: AtomicU64,
}

impl Dispatcher {
    /// Creates a dispatcher. A zero `dedupe_window` disables duplicate suppression.
    pub fn new(dedupe_window: Duration) -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            recent: Mutex::new(HashMap::new()),
            attached: Mutex::new(HashMap::new()),
            dedupe_window,
            next_id: AtomicU64::new(1),
        }
    }

    /// # Subscribe
    ///
    /// Registers `handler` for `event` deliveries about `subject`.
    ///
    /// The returned handle owns the subscription: it is released exactly once,
    /// either by [`SubscriptionHandle::release`] or when the handle drops.
    pub fn subscribe<H>(self: &Arc<Self>, event: &str, subject: EntityId, handler: H) -> SubscriptionHandle
    where
        H: Fn(&EntityId, &[Value]) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        log::debug!("Subscribing #{} to {} for {}", id, event, subject);
        lock(&self.subscriptions).push(Subscription {
            id,
            event: event.to_ascii_lowercase(),
            subject: subject.clone(),
            handler: Arc::new(handler),
        });
        SubscriptionHandle {
            id,
            subject,
            dispatcher: Arc::downgrade(self),
            released: false,
        }
    }

    fn remove(&self, id: u64) -> bool {
        let mut subscriptions = lock(&self.subscriptions);
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        before != subscriptions.len()
    }

    /// # Dispatch
    ///
    /// Routes one hub event. The subject id is taken from `args[0]`; events
    /// without one are logged and dropped.
    ///
    /// # Returns
    /// How many handlers ran. Zero for suppressed duplicates.
    pub fn dispatch(&self, event: &str, args: &[Value]) -> usize {
        let Some(subject) = args.first().and_then(EntityId::from_json) else {
            log::warn!("Hub event '{}' carries no subject id, ignoring: {:?}", event, args);
            return 0;
        };
        let event_key = event.to_ascii_lowercase();

        if self.is_duplicate(&event_key, &subject, args) {
            log::debug!("Suppressing duplicate {} for {}", event, subject);
            return 0;
        }

        let targets: Vec<SubjectHandler> = lock(&self.subscriptions)
            .iter()
            .filter(|s| s.event == event_key && s.subject == subject)
            .map(|s| Arc::clone(&s.handler))
            .collect();

        for handler in &targets {
            handler(&subject, args);
        }
        targets.len()
    }

    fn is_duplicate(&self, event: &str, subject: &EntityId, args: &[Value]) -> bool {
        if self.dedupe_window.is_zero() {
            return false;
        }
        let now = Instant::now();
        let window = self.dedupe_window;
        let mut recent = lock(&self.recent);

        if recent.len() >= RECENT_PRUNE_THRESHOLD {
            recent.retain(|_, d| now.duration_since(d.at) < window);
        }

        let key = (event.to_string(), subject.clone());
        match recent.get_mut(&key) {
            Some(last) if last.args == args && now.duration_since(last.at) < window => true,
            Some(last) => {
                last.args = args.to_vec();
                last.at = now;
                false
            }
            None => {
                recent.insert(
                    key,
                    Delivery {
                        args: args.to_vec(),
                        at: now,
                    },
                );
                false
            }
        }
    }

    /// # Attach
    ///
    /// Feeds `event` invocations from `connection` into [`Dispatcher::dispatch`].
    /// Attaching the same event name again is a no-op and returns `false`.
    pub fn attach(self: &Arc<Self>, connection: &ConnectionHandle, event: &str) -> bool {
        let mut attached = lock(&self.attached);
        let key = event.to_ascii_lowercase();
        if attached.contains_key(&key) {
            return false;
        }
        let weak = Arc::downgrade(self);
        let name = event.to_string();
        let handle = connection.on(event, move |args| {
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.dispatch(&name, args);
            }
        });
        attached.insert(key, handle);
        log::debug!("Dispatcher attached to hub event {}", event);
        true
    }

    /// Removes every hub handler installed by [`Dispatcher::attach`] from
    /// `connection`. Returns how many were removed.
    pub fn detach_all(&self, connection: &ConnectionHandle) -> usize {
        let handles: Vec<HandlerHandle> = lock(&self.attached).drain().map(|(_, h)| h).collect();
        let removed = handles.iter().filter(|h| connection.off(h)).count();
        if removed > 0 {
            log::debug!("Dispatcher detached from {} hub event(s)", removed);
        }
        removed
    }

    /// Live subscriptions for `event` and `subject`.
    pub fn subscription_count(&self, event: &str, subject: &EntityId) -> usize {
        let event = event.to_ascii_lowercase();
        lock(&self.subscriptions)
            .iter()
            .filter(|s| s.event == event && &s.subject == subject)
            .count()
    }
}

/// Owns one subscription; releasing or dropping it unsubscribes.
pub struct SubscriptionHandle {
    id: u64,
    subject: EntityId,
    dispatcher: Weak<Dispatcher>,
    released: bool,
}

impl SubscriptionHandle {
    /// The subject this subscription listens for.
    pub fn subject(&self) -> &EntityId {
        &self.subject
    }

    /// Unsubscribes. Only the first call has an effect.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.dispatcher
            .upgrade()
            .is_some_and(|dispatcher| dispatcher.remove(self.id))
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .field("released", &self.released)
            .finish()
    }
}
