use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{WatchError, WatchResult};

/// Bounded exponential backoff for hub reconnects.
///
/// Attempt `n` (1-based) waits `min(base * 2^(n-1), max)`; after
/// `max_attempts` failed reconnects the connection is declared lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay.
    pub max_delay_ms: u64,
    /// Reconnect attempts before giving up. Zero disables reconnecting.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Watch engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchConfig {
    /// Poll fallback interval per watched order.
    pub poll_interval_ms: u64,
    /// Identical pushes for the same subject inside this window are dropped.
    /// Zero, the default, delivers every push.
    pub dedupe_window_ms: u64,
    /// Optional deadline for a single fetch.
    pub fetch_timeout_ms: Option<u64>,
    /// Silence on the hub longer than this counts as a transport drop.
    pub server_timeout_ms: u64,
    /// How often the client pings the hub.
    pub keep_alive_interval_ms: u64,
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 20_000,
            dedupe_window_ms: 0,
            fetch_timeout_ms: None,
            server_timeout_ms: 30_000,
            keep_alive_interval_ms: 15_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl WatchConfig {
    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Duplicate suppression window.
    pub fn dedupe_window(&self) -> Duration {
        Duration::from_millis(self.dedupe_window_ms)
    }

    /// Fetch deadline, if any.
    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }

    /// Hub inactivity limit.
    pub fn server_timeout(&self) -> Duration {
        Duration::from_millis(self.server_timeout_ms)
    }

    /// Client ping interval.
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> WatchResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(WatchError::Config("pollIntervalMs must be greater than zero".into()));
        }
        if self.keep_alive_interval_ms == 0 || self.server_timeout_ms == 0 {
            return Err(WatchError::Config(
                "keepAliveIntervalMs and serverTimeoutMs must be greater than zero".into(),
            ));
        }
        if self.keep_alive_interval_ms >= self.server_timeout_ms {
            return Err(WatchError::Config(format!(
                "keepAliveIntervalMs ({}) must be below serverTimeoutMs ({})",
                self.keep_alive_interval_ms, self.server_timeout_ms
            )));
        }
        if self.fetch_timeout_ms == Some(0) {
            return Err(WatchError::Config("fetchTimeoutMs must be greater than zero".into()));
        }
        if self.reconnect.max_attempts > 0 && self.reconnect.base_delay_ms == 0 {
            return Err(WatchError::Config("reconnect.baseDelayMs must be greater than zero".into()));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(WatchError::Config(
                "reconnect.maxDelayMs must not be below reconnect.baseDelayMs".into(),
            ));
        }
        Ok(())
    }
}
