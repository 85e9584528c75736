use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Local};
use colored::Colorize;
use log::{Level, LevelFilter};

/// Log files from earlier runs kept next to the current one.
const KEEP_PREVIOUS_RUNS: usize = 1;

/// Installs the global logger: coloured stdout plus `{app_name}_{timestamp}.log`
/// in `log_dir`. Older files of the same app are pruned first.
///
/// Returns the path of the new log file.
pub fn setup_logging(log_dir: &Path, log_level: &str, app_name: &str) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("cannot create log directory {}", log_dir.display()))?;

    let removed = cleanup_old_logs(log_dir, app_name, KEEP_PREVIOUS_RUNS)?;
    let log_path = log_dir.join(log_file_name(app_name, &Local::now()));
    let level = parse_level(log_level);

    let console = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {} {} {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string().dimmed(),
                colored_level(record.level()),
                record.target().truecolor(128, 128, 128),
                message
            ))
        })
        .chain(io::stdout());

    let file = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                Local::now().format("[%Y-%m-%d %H:%M:%S%.3f]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .chain(fern::log_file(&log_path).with_context(|| format!("cannot open {}", log_path.display()))?);

    fern::Dispatch::new()
        .level(level)
        .level_for("tungstenite", LevelFilter::Warn)
        .level_for("tokio_tungstenite", LevelFilter::Warn)
        .level_for("hyper_util", LevelFilter::Warn)
        .level_for("reqwest", LevelFilter::Warn)
        .chain(console)
        .chain(file)
        .apply()
        .context("a global logger is already installed")?;

    log::info!(
        "Logging at {} to {} ({} old log file(s) removed)",
        level,
        log_path.display(),
        removed
    );
    Ok(log_path)
}

/// Maps a level name to a filter. Unknown names fall back to `Info`.
pub fn parse_level(name: &str) -> LevelFilter {
    match name.trim().to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Deletes `{app_name}_*.log` files in `log_dir`, keeping the `keep` newest.
/// File names embed the start timestamp, so name order is age order.
pub fn cleanup_old_logs(log_dir: &Path, app_name: &str, keep: usize) -> io::Result<usize> {
    let prefix = format!("{}_", app_name);
    let mut logs: Vec<PathBuf> = fs::read_dir(log_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path.extension().is_some_and(|ext| ext == "log")
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(&prefix))
        })
        .collect();

    logs.sort_unstable_by(|a, b| b.file_name().cmp(&a.file_name()));

    let mut removed = 0;
    for path in logs.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

fn log_file_name(app_name: &str, started: &DateTime<Local>) -> String {
    format!("{}_{}.log", app_name, started.format("%Y-%m-%d_%H-%M-%S"))
}

fn colored_level(level: Level) -> colored::ColoredString {
    let label = format!("{:<5}", level);
    match level {
        Level::Error => label.red().bold(),
        Level::Warn => label.yellow(),
        Level::Info => label.green(),
        Level::Debug => label.blue(),
        Level::Trace => label.truecolor(128, 128, 128),
    }
}
