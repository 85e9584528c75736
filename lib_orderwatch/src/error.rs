use std::time::Duration;

use thiserror::Error;

/// Failure of a single fetch of an entity from the backend.
///
/// Fetch errors are transient from the watch engine's point of view: they are
/// surfaced on the entity view and the next poll tick or push retries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Transport failure or a non-2xx status other than 404.
    #[error("Network error: {0}")]
    Network(String),

    /// The backend does not know the entity.
    #[error("Entity {0} not found")]
    NotFound(String),

    /// The response body was not the expected record.
    #[error("Failed to decode payload: {0}")]
    Decode(String),

    /// The caller-supplied fetch deadline elapsed.
    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors surfaced by the watch engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WatchError {
    /// The initial hub handshake failed. Never retried automatically.
    #[error("Hub connection failed: {0}")]
    Connection(String),

    /// The hub transport dropped mid-session. Recovered by reconnecting.
    #[error("Hub transport dropped: {0}")]
    TransportDrop(String),

    /// Reconnect attempts are exhausted; the connection is offline for good.
    #[error("Hub connection lost after {attempts} reconnect attempts")]
    ConnectionLost {
        /// How many reconnects were tried before giving up.
        attempts: u32,
    },

    /// A fetch failed; the cached payload is untouched.
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// A hub frame could not be understood.
    #[error("Hub protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Convenience alias used throughout the crate.
pub type WatchResult<T> = Result<T, WatchError>;
