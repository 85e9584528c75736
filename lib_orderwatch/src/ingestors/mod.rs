//! # Hub Ingestors
//!
//! Concrete [`HubConnector`](crate::core::HubConnector) implementations. The
//! only one shipped speaks the SignalR JSON hub protocol over WebSocket, which
//! is what the order backend exposes at `/OrdersHub`.

/// SignalR JSON hub protocol framing.
pub mod hub_protocol;
/// WebSocket transport for the hub.
pub mod hub_wss;

pub use hub_protocol::{hub_url, HUB_PATH};
pub use hub_wss::{SignalRConnector, SignalRTransport};
