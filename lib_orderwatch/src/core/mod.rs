//! # Core Watch Engine
//!
//! The components below form the push/poll pipeline that keeps a watched
//! order's local view current. Leaf first:
//!
//! - **`connection_manager`**: owns the one persistent hub connection. It
//!   performs the initial handshake, reconnects with bounded exponential
//!   backoff when the transport drops, and keeps a handler registry that
//!   survives reconnects.
//!
//! - **`registry`**: the per-event-name handler table used by the connection
//!   manager. Registrations live here, not on the transport, so a reconnect
//!   never loses or duplicates them.
//!
//! - **`dispatcher`**: fans hub events out to handlers subscribed for a
//!   specific subject (order id), dropping duplicate deliveries.
//!
//! - **`reconciler`**: the single place where fetch results become state. A
//!   result is committed only if its fetch was issued after the last
//!   committed one, so a slow poll can never overwrite a fast push.
//!
//! - **`poll_scheduler`**: one repeating timer per watched order that runs
//!   the same fetch-and-reconcile path while the watch condition holds.
//!
//! - **`watch_session`**: the presentation-facing facade tying the above
//!   together (`open_watch` / `close_watch`).

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Hub connection lifecycle and reconnect policy.
pub mod connection_manager;
/// Subject-filtered fan-out of hub events.
pub mod dispatcher;
/// The fetch collaborator trait.
pub mod fetcher;
/// Fetch-on-a-timer fallback.
pub mod poll_scheduler;
/// Stale-write-safe merge of fetch results.
pub mod reconciler;
/// Event-name handler registry.
pub mod registry;
/// Hub transport traits and frames.
pub mod transport;
/// open_watch / close_watch facade.
pub mod watch_session;

// --- Public API Re-exports ---
pub use connection_manager::{ConnectionHandle, ConnectionManager, ConnectionState};
pub use dispatcher::{Dispatcher, SubscriptionHandle};
pub use fetcher::EntityFetcher;
pub use poll_scheduler::{PollScheduler, WatchPhase};
pub use reconciler::{EntityView, ReconcileOutcome, Reconciler, WatchCondition};
pub use registry::{HandlerHandle, HandlerRegistry};
pub use transport::{HubConnector, HubFrame, HubTransport};
pub use watch_session::{WatchHandle, WatchSession};

/// Locks a mutex, recovering the data if a handler panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
