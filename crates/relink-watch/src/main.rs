//! relink-watch
//!
//! Background process of relink. It keeps paired devices connected while the
//! server is not running, sharing the pairing registry and device logs with it
//! through the data directory.
//!
//! # Commands
//!
//! - `run`: Scan and reconnect until nothing is paired or a signal arrives
//! - `install` / `uninstall`: Manage the systemd user unit that starts `run` at login
//! - `status`: Show paired devices, their log sizes, and the autostart state
//!
//! # Environment Variables
//!
//! - `RELINK_CONFIG`: Optional. Configuration file when `--config` is not given
//! - `RELINK_LOG_LEVEL` / `RUST_LOG`: Optional. Logging filter

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relink_core::{
    logging, platform_radio, AutostartHook, Config, FileStore, LogStore, PairingRegistry, Radio,
    SystemdUserUnit, Tracker, WatchExit, WatchLoop,
};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "relink-watch")]
#[command(about = "Keep paired BLE devices connected in the background")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to RELINK_CONFIG or the platform path)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the watch loop in the foreground
    Run,
    /// Start `run` automatically at login
    Install,
    /// Stop starting `run` at login
    Uninstall,
    /// Show paired devices and autostart state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => {
            logging::init("relink-watch", &config.logging)?;
            info!(version = env!("CARGO_PKG_VERSION"), "Starting relink-watch");

            let radio = platform_radio(config.tracker.adapter.clone()).await?;
            let exit = run(&config, radio).await?;
            info!(?exit, "relink-watch finished");
        }
        Commands::Install => {
            let hook = autostart_hook(cli.config.as_deref())?;
            hook.install()?;
            println!("Installed {}", hook.unit_path().display());
        }
        Commands::Uninstall => {
            let hook = autostart_hook(cli.config.as_deref())?;
            hook.uninstall()?;
            println!("Removed {}", hook.unit_path().display());
        }
        Commands::Status => {
            let hook = autostart_hook(cli.config.as_deref())?;
            print!("{}", status(&config, &hook).await?);
        }
    }

    Ok(())
}

/// An explicit path must exist; otherwise fall back to the defaults.
fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_required(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::load_default().context("Failed to load configuration")?,
    };
    Ok(config)
}

fn autostart_hook(config_path: Option<&Path>) -> Result<SystemdUserUnit> {
    let exe = std::env::current_exe().context("Cannot locate the relink-watch executable")?;
    let hook = SystemdUserUnit::for_current_user(exe)?;
    Ok(match config_path {
        Some(path) => hook.with_config(std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())),
        None => hook,
    })
}

/// Track paired devices over `radio` until the watch loop ends.
async fn run(config: &Config, radio: Arc<dyn Radio>) -> Result<WatchExit> {
    let store = Arc::new(FileStore::open(&config.storage.data_dir)?);
    let registry = PairingRegistry::new(store.clone());
    let logs = LogStore::new(store, config.retention.policy());

    let tracker = Tracker::new(radio, registry, logs)
        .with_config(config.tracker.clone())
        .start()
        .await?;

    let watch = WatchLoop::new(tracker.clone(), config.watch.interval());
    let cancel = watch.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            cancel.cancel();
        }
    });

    let exit = watch.run().await;

    if let Err(e) = tracker.shutdown().await {
        warn!(error = %e, "Tracker did not shut down cleanly");
    }
    Ok(exit)
}

/// Human-readable summary of what the background process would track.
async fn status(config: &Config, hook: &dyn AutostartHook) -> Result<String> {
    let store = Arc::new(FileStore::open(&config.storage.data_dir)?);
    let registry = PairingRegistry::new(store.clone());
    let logs = LogStore::new(store, config.retention.policy());
    let paired = registry.load_all()?;

    let mut report = String::new();
    writeln!(report, "data dir:  {}", config.storage.data_dir.display())?;
    writeln!(report, "paired:    {}", paired.len())?;
    for device_id in &paired {
        let entries = logs.load(device_id).await?.len();
        writeln!(report, "  {device_id}  ({entries} log entries)")?;
    }
    writeln!(
        report,
        "autostart: {}",
        if hook.is_installed() { "installed" } else { "not installed" }
    )?;
    Ok(report)
}
