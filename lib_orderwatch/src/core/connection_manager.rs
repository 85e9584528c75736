//! # Connection Manager
//!
//! Owns one logical hub connection. The initial handshake is the caller's
//! business: a failure comes back as [`WatchError::Connection`] and is not
//! retried. Once connected, a session task reads frames, dispatches
//! invocations to the handler registry, pings the hub and reconnects with
//! bounded exponential backoff whenever the transport drops.
//!
//! Handlers live in the manager's registry rather than on the transport, so a
//! reconnect keeps every registration exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};

use super::lock;
use super::registry::{HandlerHandle, HandlerRegistry};
use super::transport::{HubConnector, HubFrame, HubTransport};
use crate::configs::{ReconnectPolicy, WatchConfig};
use crate::error::{WatchError, WatchResult};

/// Lifecycle of the hub connection. Only the manager writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session, either never connected, disconnected or given up.
    Disconnected,
    /// Initial handshake in progress.
    Connecting,
    /// Session is live.
    Connected,
    /// Transport dropped; waiting for or running reconnect attempt `attempt`.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
    },
}

struct Shared {
    registry: HandlerRegistry,
    state_tx: watch::Sender<ConnectionState>,
    lost: Mutex<Option<WatchError>>,
    reconnects: AtomicU64,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            log::debug!("Hub connection state: {:?} -> {:?}", previous, state);
        }
    }
}

/// Opens hub connections with a fixed connector and configuration.
pub struct ConnectionManager {
    connector: Arc<dyn HubConnector>,
    config: WatchConfig,
}

impl ConnectionManager {
    /// Creates a manager around `connector`.
    pub fn new(connector: Arc<dyn HubConnector>, config: &WatchConfig) -> Self {
        Self {
            connector,
            config: config.clone(),
        }
    }

    /// Performs the initial handshake and starts the session task.
    ///
    /// # Errors
    /// `WatchError::Connection` if the handshake fails, `WatchError::Config`
    /// for an unusable configuration.
    pub async fn connect(&self, url: &str) -> WatchResult<ConnectionHandle> {
        self.config.validate()?;
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);

        log::info!("Connecting to hub at {}", url);
        let transport = match self.connector.connect(url).await {
            Ok(transport) => transport,
            Err(WatchError::Connection(reason)) => return Err(WatchError::Connection(reason)),
            Err(other) => return Err(WatchError::Connection(other.to_string())),
        };
        state_tx.send_replace(ConnectionState::Connected);
        log::info!("Hub connection established");

        let shared = Arc::new(Shared {
            registry: HandlerRegistry::new(),
            state_tx,
            lost: Mutex::new(None),
            reconnects: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        });

        let task = tokio::spawn(run_session(
            Arc::clone(&shared),
            Arc::clone(&self.connector),
            url.to_string(),
            self.config.clone(),
            transport,
        ));
        *lock(&shared.task) = Some(task);

        Ok(ConnectionHandle {
            _guard: Arc::new(shared.shutdown.clone().drop_guard()),
            shared,
        })
    }
}

/// Shared handle to a live connection. Dropping the last clone disconnects.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
    _guard: Arc<DropGuard>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("state", &self.state())
            .field("reconnects", &self.reconnect_count())
            .finish()
    }
}

impl ConnectionHandle {
    /// Registers `handler` for hub invocations named `event`.
    pub fn on<H>(&self, event: &str, handler: H) -> HandlerHandle
    where
        H: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.shared.registry.register(event, Arc::new(handler))
    }

    /// Removes a handler. Removing twice is a no-op.
    pub fn off(&self, handle: &HandlerHandle) -> bool {
        self.shared.registry.remove(handle)
    }

    /// Handlers currently registered for `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        self.shared.registry.len(event)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Successful reconnects since the initial handshake.
    pub fn reconnect_count(&self) -> u64 {
        self.shared.reconnects.load(Ordering::Acquire)
    }

    /// The fatal error once reconnect attempts are exhausted.
    pub fn connection_lost(&self) -> Option<WatchError> {
        lock(&self.shared.lost).clone()
    }

    /// True once the connection has been given up for good.
    pub fn is_offline(&self) -> bool {
        lock(&self.shared.lost).is_some()
    }

    /// Stops the session. Idempotent; returns without waiting for the task.
    pub fn disconnect(&self) {
        if !self.shared.shutdown.is_cancelled() {
            log::info!("Disconnecting from hub");
            self.shared.shutdown.cancel();
        }
    }

    /// Stops the session and waits until the transport is closed.
    pub async fn shutdown(&self) {
        self.disconnect();
        let task = lock(&self.shared.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Hub session task failed: {}", e);
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    #[cfg(test)]
    pub(crate) fn live_clones(&self) -> usize {
        Arc::strong_count(&self._guard)
    }
}

async fn run_session(
    shared: Arc<Shared>,
    connector: Arc<dyn HubConnector>,
    url: String,
    config: WatchConfig,
    mut transport: Box<dyn HubTransport>,
) {
    loop {
        let dropped = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => None,
            reason = pump(&shared, transport.as_mut(), &config) => Some(reason),
        };
        transport.close().await;

        let Some(reason) = dropped else {
            break;
        };
        log::warn!("{}", reason);

        match reconnect(&shared, connector.as_ref(), &url, &config.reconnect).await {
            Some(next) => transport = next,
            None => break,
        }
    }
    shared.set_state(ConnectionState::Disconnected);
    log::info!("Hub session ended");
}

/// Reads frames until the session drops. Returns the drop reason.
async fn pump(shared: &Shared, transport: &mut dyn HubTransport, config: &WatchConfig) -> WatchError {
    let keep_alive = config.keep_alive_interval();
    let server_timeout = config.server_timeout();
    let mut ping = interval_at(Instant::now() + keep_alive, keep_alive);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            frame = transport.next_frame() => {
                last_activity = Instant::now();
                match frame {
                    None => return WatchError::TransportDrop("hub closed the stream".into()),
                    Some(Err(WatchError::Protocol(msg))) => {
                        log::warn!("Skipping undecodable hub message: {}", msg);
                    }
                    Some(Err(e)) => return WatchError::TransportDrop(e.to_string()),
                    Some(Ok(HubFrame::Ping)) => log::trace!("Hub ping"),
                    Some(Ok(HubFrame::Close { error })) => {
                        return WatchError::TransportDrop(
                            error.unwrap_or_else(|| "hub closed the connection".into()),
                        );
                    }
                    Some(Ok(HubFrame::Invocation { target, arguments })) => {
                        log::debug!("Hub invocation {} {:?}", target, arguments);
                        shared.registry.invoke(&target, &arguments);
                    }
                }
            }
            _ = ping.tick() => {
                if let Err(e) = transport.send_ping().await {
                    return WatchError::TransportDrop(format!("keep-alive failed: {}", e));
                }
            }
            _ = sleep_until(last_activity + server_timeout) => {
                return WatchError::TransportDrop(format!(
                    "no message from hub for {:?}",
                    server_timeout
                ));
            }
        }
    }
}

async fn reconnect(
    shared: &Shared,
    connector: &dyn HubConnector,
    url: &str,
    policy: &ReconnectPolicy,
) -> Option<Box<dyn HubTransport>> {
    for attempt in 1..=policy.max_attempts {
        shared.set_state(ConnectionState::Reconnecting { attempt });
        let delay = policy.delay_for(attempt);
        log::info!(
            "Reconnecting to hub in {:?} (attempt {}/{})",
            delay,
            attempt,
            policy.max_attempts
        );

        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => return None,
            _ = sleep(delay) => {}
        }

        let result = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => return None,
            result = connector.connect(url) => result,
        };

        match result {
            Ok(transport) => {
                shared.reconnects.fetch_add(1, Ordering::AcqRel);
                shared.set_state(ConnectionState::Connected);
                log::info!("Hub reconnected after {} attempt(s)", attempt);
                return Some(transport);
            }
            Err(e) => log::warn!("Reconnect attempt {} failed: {}", attempt, e),
        }
    }

    let lost = WatchError::ConnectionLost {
        attempts: policy.max_attempts,
    };
    log::error!("{}", lost);
    *lock(&shared.lost) = Some(lost);
    None
}
