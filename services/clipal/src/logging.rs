//! Logging setup
//!
//! Tracing subscriber with a reloadable level filter (the config watcher
//! adjusts it on hot-reload), an optional stdout layer, and a daily-rolling
//! file in the log directory. Rotated files older than the retention window
//! are swept at startup. File-logging setup failure is non-fatal; the proxy
//! keeps running with stdout only.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::config::{Config, LogLevel};

const LOG_FILE_PREFIX: &str = "clipal.log";

/// Handle for adjusting the log level at runtime.
#[derive(Clone)]
pub struct LogHandle {
    reload: reload::Handle<EnvFilter, Registry>,
}

impl LogHandle {
    pub fn set_level(&self, level: LogLevel) {
        if let Err(e) = self.reload.reload(filter_for(level)) {
            tracing::warn!(error = %e, "failed to adjust log level");
        }
    }
}

fn filter_for(level: LogLevel) -> EnvFilter {
    // RUST_LOG wins so individual runs can turn on dependency logging.
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Install the global subscriber. Call once at startup.
pub fn init(config: &Config) -> LogHandle {
    let (filter_layer, handle) = reload::Layer::new(filter_for(config.global.log_level));

    let stdout_layer = config
        .global
        .log_stdout
        .then(|| tracing_subscriber::fmt::layer().with_target(false));

    let file_layer = match file_appender(config) {
        Ok(appender) => Some(
            tracing_subscriber::fmt::layer()
                .with_writer(appender)
                .with_ansi(false)
                .with_target(false),
        ),
        Err(e) => {
            eprintln!("Warning: log file setup failed: {e} (logs will only go to stdout)");
            None
        }
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    LogHandle { reload: handle }
}

/// The effective log directory: `log_dir` or `<config-dir>/logs`.
pub fn log_directory(config: &Config) -> PathBuf {
    let dir = config.global.log_dir.trim();
    if dir.is_empty() {
        config.config_dir().join("logs")
    } else {
        PathBuf::from(dir)
    }
}

fn file_appender(config: &Config) -> std::io::Result<tracing_appender::rolling::RollingFileAppender> {
    let dir = log_directory(config);
    std::fs::create_dir_all(&dir)?;

    let retention = config.global.log_retention_days.max(1);
    if let Err(e) = cleanup_old_logs(&dir, retention) {
        eprintln!(
            "Warning: log retention sweep failed in {}: {e}",
            dir.display()
        );
    }

    Ok(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX))
}

/// Delete rotated `clipal.log.*` files whose mtime is older than the
/// retention window. Returns how many were removed.
pub fn cleanup_old_logs(dir: &Path, retention_days: u32) -> std::io::Result<usize> {
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(LOG_FILE_PREFIX) {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let Ok(modified) = meta.modified() else { continue };
        if expired(modified, now, retention_days) {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn expired(modified: SystemTime, now: SystemTime, retention_days: u32) -> bool {
    let retention = Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);
    match now.duration_since(modified) {
        Ok(age) => age > retention,
        // Clock skew: files from the future are never expired.
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_respects_retention_window() {
        let now = SystemTime::now();
        let day = Duration::from_secs(24 * 60 * 60);
        assert!(expired(now - 8 * day, now, 7));
        assert!(!expired(now - 6 * day, now, 7));
        assert!(!expired(now + day, now, 7));
    }

    #[test]
    fn cleanup_removes_only_aged_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let old_log = dir.path().join("clipal.log.2020-01-01");
        let fresh_log = dir.path().join("clipal.log.2099-01-01");
        let other = dir.path().join("notes.txt");
        for path in [&old_log, &fresh_log, &other] {
            std::fs::write(path, b"x").unwrap();
        }

        let ancient = SystemTime::now() - Duration::from_secs(30 * 24 * 60 * 60);
        let f = std::fs::OpenOptions::new().write(true).open(&old_log).unwrap();
        f.set_modified(ancient).unwrap();
        let f = std::fs::OpenOptions::new().write(true).open(&other).unwrap();
        f.set_modified(ancient).unwrap();

        let removed = cleanup_old_logs(dir.path(), 7).unwrap();
        assert_eq!(removed, 1);
        assert!(!old_log.exists());
        assert!(fresh_log.exists(), "fresh log must be kept");
        assert!(other.exists(), "non-log files must never be touched");
    }

    #[test]
    fn log_directory_defaults_under_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = crate::config::Config::load(dir.path()).unwrap();
        assert_eq!(log_directory(&cfg), dir.path().join("logs"));
    }
}
