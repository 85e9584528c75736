use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use lib_orderwatch::ingestors::{HUB_PATH, hub_url};
use lib_orderwatch::{EntityId, Order, ReconnectPolicy, WatchCondition, WatchConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CONFIG_FILE_NAME: &str = "order_watch.conf";

/// Which orders keep their poll timer running.
#[derive(ValueEnum, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum PollWhile {
    /// Poll until a delivery person is assigned.
    #[default]
    Unassigned,
    /// Poll while the order stays assigned, e.g. to notice an unassignment.
    Assigned,
}

impl PollWhile {
    pub fn condition(self) -> WatchCondition<Order> {
        match self {
            PollWhile::Unassigned => Arc::new(|order: &Order| order.awaiting_assignment()),
            PollWhile::Assigned => Arc::new(|order: &Order| order.is_assigned),
        }
    }
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Watches orders for delivery assignment over the order hub", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(value_name = "ORDER_ID", help = "Order ids to watch.")]
    #[serde(default)]
    pub order_ids: Vec<String>,

    #[clap(long, env = "ORDER_WATCH_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "ORDER_WATCH_API_URL", help = "Base URL of the order backend.")]
    pub api_url: Option<String>,

    #[clap(long, env = "ORDER_WATCH_HUB_URL", help = "Hub WebSocket URL. Derived from the API URL when omitted.")]
    pub hub_url: Option<String>,

    #[clap(long, env = "ORDER_WATCH_TOKEN", hide_env_values = true, help = "Bearer token for the API and the hub.")]
    pub token: Option<String>,

    #[clap(long, env = "ORDER_WATCH_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "ORDER_WATCH_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, value_enum, env = "ORDER_WATCH_POLL_WHILE", help = "Keep polling while orders are in this state.")]
    pub poll_while: Option<PollWhile>,

    #[clap(long, env = "ORDER_WATCH_POLL_INTERVAL_MS", help = "Poll fallback interval in milliseconds.")]
    pub poll_interval_ms: Option<u64>,

    #[clap(long, env = "ORDER_WATCH_DEDUPE_WINDOW_MS", help = "Window in milliseconds for dropping identical pushes (0, the default, keeps every push).")]
    pub dedupe_window_ms: Option<u64>,

    #[clap(long, env = "ORDER_WATCH_FETCH_TIMEOUT_MS", help = "Deadline in milliseconds for a single order fetch.")]
    pub fetch_timeout_ms: Option<u64>,

    #[clap(long, env = "ORDER_WATCH_HTTP_RETRIES", help = "Retries for transient HTTP failures.")]
    pub http_retries: Option<u32>,

    #[clap(long, env = "ORDER_WATCH_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for hub reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "ORDER_WATCH_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for hub reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "ORDER_WATCH_RECONNECT_MAX_ATTEMPTS", help = "Reconnect attempts before the hub is declared lost.")]
    pub reconnect_max_attempts: Option<u32>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            order_ids: if other.order_ids.is_empty() { self.order_ids } else { other.order_ids },
            config_path: other.config_path.or(self.config_path),
            api_url: other.api_url.or(self.api_url),
            hub_url: other.hub_url.or(self.hub_url),
            token: other.token.or(self.token),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            poll_while: other.poll_while.or(self.poll_while),
            poll_interval_ms: other.poll_interval_ms.or(self.poll_interval_ms),
            dedupe_window_ms: other.dedupe_window_ms.or(self.dedupe_window_ms),
            fetch_timeout_ms: other.fetch_timeout_ms.or(self.fetch_timeout_ms),
            http_retries: other.http_retries.or(self.http_retries),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            reconnect_max_attempts: other.reconnect_max_attempts.or(self.reconnect_max_attempts),
        }
    }

    fn defaults() -> Config {
        let watch = WatchConfig::default();
        Config {
            api_url: Some("http://localhost:5000".to_string()),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            poll_while: Some(PollWhile::Unassigned),
            poll_interval_ms: Some(watch.poll_interval_ms),
            dedupe_window_ms: Some(watch.dedupe_window_ms),
            http_retries: Some(3),
            reconnect_base_delay_ms: Some(watch.reconnect.base_delay_ms),
            reconnect_max_delay_ms: Some(watch.reconnect.max_delay_ms),
            reconnect_max_attempts: Some(watch.reconnect.max_attempts),
            ..Default::default()
        }
    }

    /// Order ids from the command line or the config file.
    pub fn order_ids(&self) -> anyhow::Result<Vec<EntityId>> {
        let ids: Vec<EntityId> = self
            .order_ids
            .iter()
            .filter(|id| !id.trim().is_empty())
            .map(|id| EntityId::new(id.as_str()))
            .collect();
        if ids.is_empty() {
            bail!("no order ids given; pass them as arguments or set orderIds in {}", CONFIG_FILE_NAME);
        }
        Ok(ids)
    }

    pub fn api_url(&self) -> anyhow::Result<&str> {
        self.api_url.as_deref().context("no API URL configured")
    }

    /// Hub endpoint: the explicit override, else `{api_url}/OrdersHub` on ws(s).
    pub fn hub_endpoint(&self) -> anyhow::Result<String> {
        if let Some(url) = &self.hub_url {
            return Ok(url.clone());
        }
        Ok(hub_url(self.api_url()?, HUB_PATH)?.to_string())
    }

    /// Engine settings; unset fields keep the library defaults.
    pub fn watch_config(&self) -> WatchConfig {
        let defaults = WatchConfig::default();
        WatchConfig {
            poll_interval_ms: self.poll_interval_ms.unwrap_or(defaults.poll_interval_ms),
            dedupe_window_ms: self.dedupe_window_ms.unwrap_or(defaults.dedupe_window_ms),
            fetch_timeout_ms: self.fetch_timeout_ms.or(defaults.fetch_timeout_ms),
            reconnect: ReconnectPolicy {
                base_delay_ms: self.reconnect_base_delay_ms.unwrap_or(defaults.reconnect.base_delay_ms),
                max_delay_ms: self.reconnect_max_delay_ms.unwrap_or(defaults.reconnect.max_delay_ms),
                max_attempts: self.reconnect_max_attempts.unwrap_or(defaults.reconnect.max_attempts),
            },
            ..defaults
        }
    }
}

/// Defaults, then `order_watch.conf`, then environment and CLI.
pub fn load_config() -> Config {
    resolve(Config::parse())
}

/// Layers the config file and `cli` over the defaults.
pub fn resolve(cli: Config) -> Config {
    let mut current_config = Config::defaults();

    match config_file_path(cli.config_path.as_deref()) {
        Some(path) => match read_config_file(&path) {
            Ok(file_config) => current_config = current_config.merge(file_config),
            Err(e) => log::warn!("{:#}. Falling back to other sources.", e),
        },
        None => log::info!("No {} found. Using defaults and environment/CLI variables.", CONFIG_FILE_NAME),
    }

    current_config.merge(cli)
}

fn config_file_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("order_watch").join(CONFIG_FILE_NAME))
        .filter(|path| path.exists())
}

fn read_config_file(path: &Path) -> anyhow::Result<Config> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse config file: {}", path.display()))
}
