//! # Logging Setup
//!
//! The library itself only talks to the `log` facade. Binaries call
//! [`setup_logging`] once at startup to route records to a coloured console
//! and a per-run log file.

/// fern dispatch configuration and log file housekeeping.
pub mod setup;

pub use setup::{cleanup_old_logs, parse_level, setup_logging};
