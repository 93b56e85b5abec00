//! clipal - localhost failover proxy for CLI LLM clients
//!
//! Fronts the upstream APIs that Claude Code, Codex, and Gemini CLI talk to.
//! Each client kind gets an ordered provider list; requests stick to the last
//! working provider, fail over on upstream errors, and hard failures (auth,
//! billing, quota) pull a provider out of rotation until its cooldown
//! expires. Provider config files hot-reload without dropping in-flight
//! requests.

mod config;
mod logging;
mod notify;
mod proxy;
mod router;
mod watcher;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::config::{default_config_dir, Config, LogLevel};
use crate::notify::{desktop_sender, Notifier, NotifierWorker};
use crate::router::AppState;
use crate::watcher::{ConfigWatcher, WATCH_INTERVAL};

/// How long shutdown waits for in-flight requests before forcing exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "clipal", version, about = "Localhost failover proxy for CLI LLM clients")]
struct Cli {
    /// Configuration directory (default: ~/.clipal)
    #[arg(long, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// Override listen address from config
    #[arg(long)]
    listen_addr: Option<String>,

    /// Override port from config
    #[arg(long)]
    port: Option<u16>,

    /// Override log level (debug/info/warn/error)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Download and install the latest release
    Update {
        /// Check for updates only
        #[arg(long)]
        check: bool,
        /// Force update (allow reinstall/downgrade)
        #[arg(long)]
        force: bool,
        /// Show what would be downloaded and replaced
        #[arg(long)]
        dry_run: bool,
        /// Overall update timeout (e.g. 2m, 90s)
        #[arg(long, default_value = "2m")]
        timeout: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Update {
        check,
        force,
        dry_run,
        timeout,
    }) = cli.command
    {
        return run_update(check, force, dry_run, &timeout).await;
    }

    run_serve(cli).await
}

async fn run_serve(cli: Cli) -> anyhow::Result<()> {
    let config_dir = cli.config_dir.unwrap_or_else(default_config_dir);
    let mut config = Config::load(&config_dir)
        .with_context(|| format!("failed to load config from {}", config_dir.display()))?;

    if let Some(listen_addr) = cli.listen_addr {
        config.global.listen_addr = listen_addr;
    }
    if let Some(port) = cli.port {
        config.global.port = port;
    }
    if let Some(level) = cli.log_level {
        config.global.log_level = LogLevel::parse(&level)
            .with_context(|| format!("invalid log level: {level}"))?;
    }

    config.validate().context("invalid configuration")?;

    let log_handle = logging::init(&config);

    let (notifier, notifier_worker): (Notifier, Option<NotifierWorker>) =
        if config.global.notifications.enabled {
            let (notifier, worker) =
                Notifier::spawn(&config.global.notifications, desktop_sender());
            (notifier, Some(worker))
        } else {
            (Notifier::disabled(), None)
        };

    let listen_addr = config.global.listen_addr.clone();
    let port = config.global.port;

    let proxies = proxy::build_proxies(&config, &notifier)?;
    for (kind, proxy) in &proxies {
        info!(client = %kind, providers = proxy.failover().len(), "providers loaded");
    }

    let state = AppState::new(config, proxies);
    let app = router::build_router(state.clone());

    let addr = format!("{listen_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    info!(%addr, "clipal starting");

    let watch = ConfigWatcher::spawn(
        state.clone(),
        notifier.clone(),
        Some(log_handle),
        WATCH_INTERVAL,
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    watch.stop().await;
    if let Some(worker) = notifier_worker {
        worker.shutdown().await;
    }

    info!("clipal stopped");
    Ok(())
}

async fn run_update(check: bool, force: bool, dry_run: bool, timeout: &str) -> anyhow::Result<()> {
    let timeout = clipal_failover::parse_duration_str(timeout)
        .with_context(|| format!("invalid timeout: {timeout}"))?;
    let opts = clipal_selfupdate::Options {
        check,
        force,
        dry_run,
        timeout,
    };

    let current = env!("CARGO_PKG_VERSION");
    let (plan, changed) = clipal_selfupdate::update(current, opts)
        .await
        .context("update failed")?;

    if check {
        if changed {
            println!(
                "update available: {} -> {}",
                plan.current_version, plan.latest_version
            );
        } else {
            println!("up to date: {}", plan.current_version);
        }
        return Ok(());
    }
    if dry_run {
        println!("current: {}", plan.current_version);
        println!("latest: {}", plan.latest_version);
        println!("exe: {}", plan.executable_path.display());
        println!(
            "asset: {}\nchecksums: {}",
            plan.binary_asset.name, plan.checksums_asset.name
        );
        println!("download: {}", plan.binary_asset.browser_download_url);
        return Ok(());
    }
    if changed {
        println!(
            "updated: {} -> {}",
            plan.current_version, plan.latest_version
        );
    } else {
        println!("up to date: {}", plan.current_version);
    }
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
