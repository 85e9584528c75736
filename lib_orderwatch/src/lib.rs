//! # lib_orderwatch
//!
//! Keeps open order detail views in sync with the backend. Push events arrive
//! over a persistent hub connection (`AssignOrder`), a poll timer covers the
//! same orders while they wait for a delivery person, and every fetch result
//! goes through a single reconciler that refuses to let an older fetch
//! overwrite a newer one.
//!
//! The watch engine lives in [`core`]. Concrete adapters sit behind features:
//! `hub` (SignalR JSON protocol over WebSocket), `retrieve` (order REST API)
//! and `loggers` (fern setup).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// The watch engine: connection manager, dispatcher, reconciler, poll scheduler.
pub mod core;
/// Error types shared across the crate.
pub mod error;
/// Domain models: entity ids, fetch stamps, orders and hub events.
pub mod models;
/// Library configuration with serde defaults.
pub mod configs;

/// Hub transports.
#[cfg(feature = "hub")]
pub mod ingestors;
/// HTTP retrieval: retrying API client and the order fetcher.
#[cfg(feature = "retrieve")]
pub mod retrieve;
/// Logging setup.
#[cfg(feature = "loggers")]
pub mod loggers;

#[cfg(test)]
pub(crate) mod test_support;

// --- Public API Re-exports ---
pub use crate::configs::{ReconnectPolicy, WatchConfig};
pub use crate::core::{
    ConnectionHandle, ConnectionManager, ConnectionState, Dispatcher, EntityFetcher, EntityView,
    HubConnector, HubFrame, HubTransport, PollScheduler, ReconcileOutcome, Reconciler,
    WatchCondition, WatchHandle, WatchSession,
};
pub use crate::error::{FetchError, WatchError, WatchResult};
pub use crate::models::{AssignOrderEvent, EntityId, FetchStamp, Order, ASSIGN_ORDER};
