//! Tracing setup shared by `relink-server` and `relink-watch`.
//!
//! With `logging.production` set, events go to a daily JSON file named after
//! the binary and to plain stdout for the service manager. Otherwise a single
//! pretty console layer is installed, with span open/close events.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Environment variable overriding the configured level.
pub const LOG_LEVEL_ENV: &str = "RELINK_LOG_LEVEL";

// Dropping a guard stops its background writer, so both live until exit.
static WRITER_GUARDS: OnceLock<(WorkerGuard, WorkerGuard)> = OnceLock::new();

/// Install the global subscriber for the binary `app_name`.
///
/// Directives are read from `RUST_LOG` first, then [`LOG_LEVEL_ENV`], then
/// `config.level`.
///
/// # Errors
///
/// Fails when the directives do not parse or a subscriber is already set.
pub fn init(app_name: &str, config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = build_filter(
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
        std::env::var(LOG_LEVEL_ENV).ok(),
        &config.level,
    )?;

    if config.production {
        install_production(app_name, filter)
    } else {
        install_console(filter)
    }
}

/// Directive precedence: `rust_log`, then `override_level`, then `configured`.
///
/// An unparsable `RUST_LOG` falls through to the next source instead of
/// failing startup.
fn build_filter(
    rust_log: Option<String>,
    override_level: Option<String>,
    configured: &str,
) -> anyhow::Result<EnvFilter> {
    if let Some(directives) = rust_log {
        if let Ok(filter) = EnvFilter::try_new(&directives) {
            return Ok(filter);
        }
    }
    let level = override_level.unwrap_or_else(|| configured.to_string());
    Ok(EnvFilter::try_new(level)?)
}

fn install_production(app_name: &str, filter: EnvFilter) -> anyhow::Result<()> {
    let (file_writer, file_guard) = file_writer(app_name);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let json = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // journald adds its own timestamps and does not render colors.
    let plain = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .try_init()?;

    let _ = WRITER_GUARDS.set((file_guard, stdout_guard));
    Ok(())
}

fn file_writer(app_name: &str) -> (NonBlocking, WorkerGuard) {
    let dir = log_directory();
    // Missing permissions surface as write errors from the appender; the
    // stdout layer still works.
    if let Err(error) = std::fs::create_dir_all(&dir) {
        eprintln!("relink: cannot create {}: {error}", dir.display());
    }
    tracing_appender::non_blocking(RollingFileAppender::new(Rotation::DAILY, dir, app_name))
}

fn install_console(filter: EnvFilter) -> anyhow::Result<()> {
    let pretty = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .try_init()?;
    Ok(())
}

/// Directory production logs are written to.
///
/// `/var/log/relink` on Linux, the per-user data directory elsewhere.
#[must_use]
pub fn log_directory() -> PathBuf {
    if cfg!(target_os = "linux") {
        return PathBuf::from("/var/log/relink");
    }
    directories::ProjectDirs::from("", "", "relink")
        .map(|dirs| dirs.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("./logs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directory_is_named_for_app() {
        let dir = log_directory();
        assert!(dir.ends_with("relink") || dir.ends_with("logs"));
    }

    #[test]
    fn test_rust_log_wins_over_other_sources() {
        let filter = build_filter(
            Some("relink_core=trace".to_string()),
            Some("warn".to_string()),
            "info",
        )
        .unwrap();
        assert_eq!(filter.to_string(), "relink_core=trace");
    }

    #[test]
    fn test_override_level_wins_over_config() {
        let filter = build_filter(None, Some("warn".to_string()), "info").unwrap();
        assert_eq!(filter.to_string(), "warn");
    }

    #[test]
    fn test_configured_level_is_the_fallback() {
        let filter = build_filter(None, None, "debug").unwrap();
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    fn test_bad_rust_log_falls_through() {
        let filter = build_filter(Some("=[".to_string()), None, "info").unwrap();
        assert_eq!(filter.to_string(), "info");
    }

    #[test]
    fn test_bad_configured_level_is_an_error() {
        assert!(build_filter(None, None, "=[").is_err());
    }
}
