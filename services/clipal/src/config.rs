//! Configuration loading and validation
//!
//! Configuration lives in a directory (default `~/.clipal`, overridable with
//! `CLIPAL_CONFIG_DIR` or `--config-dir`): `config.yaml` holds the global
//! settings, and `claude-code.yaml` / `codex.yaml` / `gemini.yaml` each hold
//! one client kind's provider list. Every file is optional; unknown keys are
//! rejected so typos fail loudly instead of silently disabling a provider.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clipal_common::{Error, Result};
use clipal_failover::{parse_duration_str, sort_by_priority, ClientKind, Provider};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Provider config files, one per client kind, in [`ClientKind::ALL`] order.
pub const PROVIDER_CONFIG_FILES: [&str; 3] = ["claude-code.yaml", "codex.yaml", "gemini.yaml"];

const GLOBAL_CONFIG_FILE: &str = "config.yaml";

pub const DEFAULT_REACTIVATE_AFTER: Duration = Duration::from_secs(3600);
pub const DEFAULT_UPSTREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<LogLevel> {
        match s.trim().to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desktop notification settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NotificationsConfig {
    pub enabled: bool,
    /// Minimum log level that raises a notification (default error).
    pub min_level: Option<LogLevel>,
    /// Notify when the active provider changes (default true).
    pub provider_switch: Option<bool>,
}

impl NotificationsConfig {
    pub fn min_level(&self) -> LogLevel {
        self.min_level.unwrap_or(LogLevel::Error)
    }

    pub fn provider_switch(&self) -> bool {
        self.provider_switch.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GlobalConfig {
    pub listen_addr: String,
    pub port: u16,
    pub log_level: LogLevel,
    /// Cooldown installed for hard deactivations (auth/billing/quota).
    pub reactivate_after: String,
    pub max_request_body_bytes: u64,
    /// How long idle upstream connections stay pooled.
    pub upstream_idle_timeout: String,
    pub log_dir: String,
    pub log_retention_days: u32,
    pub log_stdout: bool,
    /// Route Claude Code count_tokens through its own sticky provider so its
    /// failures cannot move the main conversation off a warm context cache.
    pub ignore_count_tokens_failover: bool,
    pub notifications: NotificationsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            listen_addr: "127.0.0.1".into(),
            port: 3333,
            log_level: LogLevel::Info,
            reactivate_after: "1h".into(),
            // Request bodies are buffered for replay across failover
            // attempts, so the cap bounds per-request memory.
            max_request_body_bytes: 32 * 1024 * 1024,
            upstream_idle_timeout: "3m".into(),
            log_dir: String::new(),
            log_retention_days: 7,
            log_stdout: true,
            ignore_count_tokens_failover: false,
            notifications: NotificationsConfig::default(),
        }
    }
}

/// One client kind's provider list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClientConfig {
    pub providers: Vec<Provider>,
}

/// The complete application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub global: GlobalConfig,
    pub claude_code: ClientConfig,
    pub codex: ClientConfig,
    pub gemini: ClientConfig,
    config_dir: PathBuf,
}

impl Config {
    /// Load the configuration from `config_dir`. Missing files fall back to
    /// defaults; present files must parse and contain no unknown keys.
    pub fn load(config_dir: &Path) -> Result<Config> {
        let global = load_yaml::<GlobalConfig>(&config_dir.join(GLOBAL_CONFIG_FILE))?
            .unwrap_or_default();

        let mut claude_code = load_yaml::<ClientConfig>(&config_dir.join(PROVIDER_CONFIG_FILES[0]))?
            .unwrap_or_default();
        let mut codex = load_yaml::<ClientConfig>(&config_dir.join(PROVIDER_CONFIG_FILES[1]))?
            .unwrap_or_default();
        let mut gemini = load_yaml::<ClientConfig>(&config_dir.join(PROVIDER_CONFIG_FILES[2]))?
            .unwrap_or_default();

        sort_by_priority(&mut claude_code.providers);
        sort_by_priority(&mut codex.providers);
        sort_by_priority(&mut gemini.providers);

        Ok(Config {
            global,
            claude_code,
            codex,
            gemini,
            config_dir: config_dir.to_path_buf(),
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn client(&self, kind: ClientKind) -> &ClientConfig {
        match kind {
            ClientKind::ClaudeCode => &self.claude_code,
            ClientKind::Codex => &self.codex,
            ClientKind::Gemini => &self.gemini,
        }
    }

    /// Enabled providers for a client kind, in priority order.
    pub fn enabled_providers(&self, kind: ClientKind) -> Vec<Provider> {
        clipal_failover::enabled_providers(&self.client(kind).providers)
    }

    /// Parsed `reactivate_after`, falling back to one hour with a warning.
    pub fn reactivate_after(&self) -> Duration {
        match parse_duration_str(&self.global.reactivate_after) {
            Some(d) => d,
            None => {
                tracing::warn!(
                    value = %self.global.reactivate_after,
                    "invalid reactivate_after, defaulting to 1h"
                );
                DEFAULT_REACTIVATE_AFTER
            }
        }
    }

    /// Parsed `upstream_idle_timeout`, falling back to 3 minutes with a warning.
    pub fn upstream_idle_timeout(&self) -> Duration {
        match parse_duration_str(&self.global.upstream_idle_timeout) {
            Some(d) => d,
            None => {
                tracing::warn!(
                    value = %self.global.upstream_idle_timeout,
                    "invalid upstream_idle_timeout, defaulting to 3m"
                );
                DEFAULT_UPSTREAM_IDLE_TIMEOUT
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.global.listen_addr.trim().is_empty() {
            return Err(Error::Config("listen_addr cannot be empty".into()));
        }
        if self.global.port == 0 {
            return Err(Error::Config("invalid port: 0".into()));
        }
        if self.global.max_request_body_bytes == 0 {
            return Err(Error::Config("invalid max_request_body_bytes: 0".into()));
        }
        if parse_duration_str(&self.global.reactivate_after).is_none() {
            return Err(Error::Config(format!(
                "invalid reactivate_after: {}",
                self.global.reactivate_after
            )));
        }

        for kind in ClientKind::ALL {
            validate_providers(kind, &self.client(kind).providers)?;
        }
        Ok(())
    }
}

fn validate_providers(kind: ClientKind, providers: &[Provider]) -> Result<()> {
    for (i, p) in providers.iter().enumerate() {
        if p.name.trim().is_empty() {
            return Err(Error::Config(format!(
                "{kind} provider {}: name is required",
                i + 1
            )));
        }
        if p.base_url.trim().is_empty() {
            return Err(Error::Config(format!(
                "{kind} provider {}: base_url is required",
                p.name
            )));
        }
        if p.api_key.expose().trim().is_empty() {
            return Err(Error::Config(format!(
                "{kind} provider {}: api_key is required",
                p.name
            )));
        }
    }
    Ok(())
}

/// Read and parse one YAML file; `Ok(None)` when it does not exist.
fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    warn_if_world_readable(path);
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_yaml::from_str(&data)?))
}

/// Config files hold API keys; warn when group or others can read them.
/// Writes to stderr because the logger is not up yet during startup load.
#[cfg(unix)]
fn warn_if_world_readable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(meta) = std::fs::metadata(path) {
        let mode = meta.permissions().mode() & 0o777;
        if mode & 0o044 != 0 {
            eprintln!(
                "Warning: config file {} has permissive permissions ({mode:o}), consider chmod 600",
                path.display()
            );
        }
    }
}

#[cfg(not(unix))]
fn warn_if_world_readable(_path: &Path) {}

/// Resolve the default config directory: `CLIPAL_CONFIG_DIR`, then
/// `~/.clipal`, then `./.clipal`.
pub fn default_config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("CLIPAL_CONFIG_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        if !home.is_empty() {
            return Path::new(&home).join(".clipal");
        }
    }
    PathBuf::from(".clipal")
}
