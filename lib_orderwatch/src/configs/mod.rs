//! # Configuration Modules
//!
//! Runtime knobs for the watch engine. Binaries layer their own CLI/env/file
//! handling on top and hand a finished [`WatchConfig`] to the library.

/// Watch engine configuration and reconnect policy.
pub mod watch_config;

pub use watch_config::{ReconnectPolicy, WatchConfig};
