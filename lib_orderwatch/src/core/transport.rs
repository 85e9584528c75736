use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::error::WatchResult;

/// A decoded hub message.
#[derive(Debug, Clone, PartialEq)]
pub enum HubFrame {
    /// The server invoked a client method.
    Invocation {
        /// Method name, e.g. `AssignOrder`.
        target: String,
        /// Positional arguments.
        arguments: Vec<Value>,
    },
    /// Server keep-alive.
    Ping,
    /// The server is closing the connection.
    Close {
        /// Reason given by the server, if any.
        error: Option<String>,
    },
}

/// One live hub session. Owned by the connection manager's session task.
pub trait HubTransport: Send {
    /// Next frame. `None` means the stream ended; `Err` means the transport
    /// failed. Must be cancel-safe: dropping the future loses no frame.
    fn next_frame(&mut self) -> BoxFuture<'_, Option<WatchResult<HubFrame>>>;

    /// Sends a keep-alive ping.
    fn send_ping(&mut self) -> BoxFuture<'_, WatchResult<()>>;

    /// Closes the session. Errors are swallowed.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Opens hub sessions; the handshake happens inside `connect`.
pub trait HubConnector: Send + Sync + 'static {
    /// Connects and completes the handshake, or fails with `WatchError::Connection`.
    fn connect(&self, url: &str) -> BoxFuture<'static, WatchResult<Box<dyn HubTransport>>>;
}
