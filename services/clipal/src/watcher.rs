//! Provider config hot-reload
//!
//! A background ticker stats the three provider YAML files every 5 seconds.
//! When any mtime moves (or a tracked file disappears) the whole
//! configuration is reloaded and validated; on success the router's
//! `(config, proxies)` pair is swapped atomically. The listen endpoint is
//! pinned for the lifetime of the process - only a restart can move it. A
//! reload that fails to parse or validate is logged and dropped; the old
//! configuration stays live. The same tick sweeps expired deactivations so
//! reactivation is logged even when no traffic arrives.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Config, PROVIDER_CONFIG_FILES};
use crate::logging::LogHandle;
use crate::notify::Notifier;
use crate::proxy::build_proxies;
use crate::router::AppState;

pub const WATCH_INTERVAL: Duration = Duration::from_secs(5);

pub struct ConfigWatcher {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl ConfigWatcher {
    pub fn spawn(
        state: AppState,
        notifier: Notifier,
        log_handle: Option<LogHandle>,
        interval: Duration,
    ) -> ConfigWatcher {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let config_dir = state.read().await.config.config_dir().to_path_buf();
            // Seed the snapshot so startup never triggers an immediate reload.
            let mut mtimes = snapshot_mtimes(&config_dir);

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if configs_changed(&config_dir, &mut mtimes) {
                            reload(&state, &notifier, log_handle.as_ref(), &config_dir).await;
                        }
                        sweep_reactivations(&state).await;
                    }
                }
            }
        });
        ConfigWatcher {
            stop: stop_tx,
            handle,
        }
    }

    /// Signal the watcher and wait for its current tick to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.handle.await;
    }
}

fn snapshot_mtimes(config_dir: &Path) -> HashMap<PathBuf, SystemTime> {
    let mut mtimes = HashMap::new();
    for name in PROVIDER_CONFIG_FILES {
        let path = config_dir.join(name);
        if let Some(mtime) = mtime_of(&path) {
            mtimes.insert(path, mtime);
        }
    }
    mtimes
}

fn mtime_of(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn configs_changed(config_dir: &Path, mtimes: &mut HashMap<PathBuf, SystemTime>) -> bool {
    let mut changed = false;
    for name in PROVIDER_CONFIG_FILES {
        let path = config_dir.join(name);
        match mtime_of(&path) {
            Some(mtime) => match mtimes.get(&path) {
                Some(last) if mtime <= *last => {}
                _ => {
                    mtimes.insert(path, mtime);
                    changed = true;
                }
            },
            None => {
                if mtimes.remove(&path).is_some() {
                    changed = true;
                }
            }
        }
    }
    changed
}

async fn reload(
    state: &AppState,
    notifier: &Notifier,
    log_handle: Option<&LogHandle>,
    config_dir: &Path,
) {
    let mut new_config = match Config::load(config_dir) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "provider config reload failed");
            return;
        }
    };

    // The listen endpoint is stable at runtime.
    {
        let shared = state.read().await;
        new_config.global.listen_addr = shared.config.global.listen_addr.clone();
        new_config.global.port = shared.config.global.port;
    }

    if let Err(e) = new_config.validate() {
        warn!(error = %e, "provider config reload failed validation");
        return;
    }

    if let Some(handle) = log_handle {
        handle.set_level(new_config.global.log_level);
    }

    let proxies = match build_proxies(&new_config, notifier) {
        Ok(proxies) => proxies,
        Err(e) => {
            warn!(error = %e, "provider config reload failed to build proxies");
            return;
        }
    };

    for (kind, proxy) in &proxies {
        info!(client = %kind, providers = proxy.failover().len(), "providers loaded");
    }
    state.swap(new_config, proxies).await;
    info!(config_dir = %config_dir.display(), "provider configs reloaded");
}

async fn sweep_reactivations(state: &AppState) {
    let proxies: Vec<_> = state.read().await.proxies.values().cloned().collect();
    for proxy in proxies {
        proxy.failover().reactivate_expired();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipal_failover::ClientKind;
    use std::path::Path;

    const FAST: Duration = Duration::from_millis(25);

    fn provider_yaml(names: &[&str]) -> String {
        let mut out = String::from("providers:\n");
        for (i, name) in names.iter().enumerate() {
            out.push_str(&format!(
                "  - {{name: {name}, base_url: 'https://{name}.example.com', api_key: k, priority: {}}}\n",
                i + 1
            ));
        }
        out
    }

    fn setup(dir: &Path) -> AppState {
        std::fs::write(dir.join("claude-code.yaml"), provider_yaml(&["one"])).unwrap();
        let config = Config::load(dir).unwrap();
        let proxies = build_proxies(&config, &Notifier::disabled()).unwrap();
        AppState::new(config, proxies)
    }

    async fn provider_count(state: &AppState, kind: ClientKind) -> Option<usize> {
        let shared = state.read().await;
        shared.proxies.get(&kind).map(|p| p.failover().len())
    }

    async fn wait_for<F>(mut check: F)
    where
        F: AsyncFnMut() -> bool,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(FAST).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn reloads_when_a_provider_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let state = setup(dir.path());
        assert_eq!(
            provider_count(&state, ClientKind::ClaudeCode).await,
            Some(1)
        );

        let watcher = ConfigWatcher::spawn(state.clone(), Notifier::disabled(), None, FAST);
        tokio::time::sleep(2 * FAST).await;

        std::fs::write(
            dir.path().join("claude-code.yaml"),
            provider_yaml(&["one", "two"]),
        )
        .unwrap();

        let state2 = state.clone();
        wait_for(async move || {
            provider_count(&state2, ClientKind::ClaudeCode).await == Some(2)
        })
        .await;
        watcher.stop().await;
    }

    #[tokio::test]
    async fn invalid_reload_keeps_old_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let state = setup(dir.path());

        let watcher = ConfigWatcher::spawn(state.clone(), Notifier::disabled(), None, FAST);
        tokio::time::sleep(2 * FAST).await;

        // Unknown key makes the reload fail parsing; old proxies stay live.
        std::fs::write(
            dir.path().join("claude-code.yaml"),
            "providers:\n  - {name: x, base_url: 'https://x', api_key: k, wat: 1}\n",
        )
        .unwrap();
        tokio::time::sleep(6 * FAST).await;

        assert_eq!(
            provider_count(&state, ClientKind::ClaudeCode).await,
            Some(1)
        );
        watcher.stop().await;
    }

    #[tokio::test]
    async fn listen_endpoint_is_pinned_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let state = setup(dir.path());
        let original_port = state.read().await.config.global.port;

        let watcher = ConfigWatcher::spawn(state.clone(), Notifier::disabled(), None, FAST);
        tokio::time::sleep(2 * FAST).await;

        // Reload picks up new global settings but never the listen endpoint.
        std::fs::write(dir.path().join("config.yaml"), "port: 9999\nlog_level: debug\n").unwrap();
        std::fs::write(
            dir.path().join("claude-code.yaml"),
            provider_yaml(&["one", "two"]),
        )
        .unwrap();

        let state2 = state.clone();
        wait_for(async move || {
            provider_count(&state2, ClientKind::ClaudeCode).await == Some(2)
        })
        .await;

        let shared = state.read().await;
        assert_eq!(shared.config.global.port, original_port);
        assert_eq!(shared.config.global.log_level, crate::config::LogLevel::Debug);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn vanished_file_drops_its_client_kind() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("codex.yaml"), provider_yaml(&["c"])).unwrap();
        let state = setup(dir.path());
        assert_eq!(provider_count(&state, ClientKind::Codex).await, Some(1));

        let watcher = ConfigWatcher::spawn(state.clone(), Notifier::disabled(), None, FAST);
        tokio::time::sleep(2 * FAST).await;

        std::fs::remove_file(dir.path().join("codex.yaml")).unwrap();

        let state2 = state.clone();
        wait_for(async move || provider_count(&state2, ClientKind::Codex).await.is_none()).await;
        watcher.stop().await;
    }
}
