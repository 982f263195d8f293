//! OS autostart hook for the background watcher.
//!
//! On Linux the watcher runs as a systemd user service. The unit points at the
//! installed binary path, so replacing the binary on update is enough for the
//! next start to pick up the new version.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info};

/// Autostart installation failures.
#[derive(Debug, Error)]
pub enum AutostartError {
    /// The unit file could not be written or removed.
    #[error("Failed to update '{path}': {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// No home directory to install a user unit into.
    #[error("Could not determine the user configuration directory")]
    NoConfigDir,

    /// The service manager rejected a command.
    #[error("systemctl {args} failed: {message}")]
    ServiceManager {
        /// Arguments passed to systemctl.
        args: String,
        /// Exit status or stderr.
        message: String,
    },
}

/// Registers the background watcher with the OS so it survives reboot.
pub trait AutostartHook: Send + Sync {
    /// Install (or refresh) the hook. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the hook cannot be written or activated.
    fn install(&self) -> Result<(), AutostartError>;

    /// Remove the hook. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the hook cannot be removed or deactivated.
    fn uninstall(&self) -> Result<(), AutostartError>;

    /// Whether the hook is installed.
    fn is_installed(&self) -> bool;
}

/// A systemd user unit running `relink-watch run`.
#[derive(Debug, Clone)]
pub struct SystemdUserUnit {
    unit_dir: PathBuf,
    exec_path: PathBuf,
    config_path: Option<PathBuf>,
    manage_service: bool,
}

impl SystemdUserUnit {
    /// Unit file name.
    pub const UNIT_NAME: &'static str = "relink-watch.service";

    /// A unit written into `unit_dir`, without calling `systemctl`.
    pub fn new(unit_dir: impl Into<PathBuf>, exec_path: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
            exec_path: exec_path.into(),
            config_path: None,
            manage_service: false,
        }
    }

    /// The current user's unit, enabled and started through `systemctl --user`.
    ///
    /// # Errors
    ///
    /// Returns [`AutostartError::NoConfigDir`] if there is no home directory.
    pub fn for_current_user(exec_path: impl Into<PathBuf>) -> Result<Self, AutostartError> {
        let base = directories::BaseDirs::new().ok_or(AutostartError::NoConfigDir)?;
        Ok(Self {
            manage_service: true,
            ..Self::new(base.config_dir().join("systemd").join("user"), exec_path)
        })
    }

    /// Pass `--config <path>` to the watcher.
    #[must_use]
    pub fn with_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Full path of the unit file.
    #[must_use]
    pub fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(Self::UNIT_NAME)
    }

    /// Unit file contents.
    #[must_use]
    pub fn render(&self) -> String {
        let mut exec = format!("{} run", self.exec_path.display());
        if let Some(config) = &self.config_path {
            exec.push_str(&format!(" --config {}", config.display()));
        }
        format!(
            "[Unit]\n\
             Description=relink background reconnect watcher\n\
             After=bluetooth.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             ExecStart={exec}\n\
             Restart=on-failure\n\
             RestartSec=10\n\
             \n\
             [Install]\n\
             WantedBy=default.target\n"
        )
    }

    fn systemctl(&self, args: &[&str]) -> Result<(), AutostartError> {
        if !self.manage_service {
            return Ok(());
        }
        let joined = args.join(" ");
        debug!(args = %joined, "Running systemctl --user");
        let output = Command::new("systemctl")
            .arg("--user")
            .args(args)
            .output()
            .map_err(|e| AutostartError::ServiceManager {
                args: joined.clone(),
                message: e.to_string(),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(AutostartError::ServiceManager {
                args: joined,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> AutostartError + '_ {
    move |source| AutostartError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl AutostartHook for SystemdUserUnit {
    fn install(&self) -> Result<(), AutostartError> {
        fs::create_dir_all(&self.unit_dir).map_err(io_error(&self.unit_dir))?;
        let path = self.unit_path();
        fs::write(&path, self.render()).map_err(io_error(&path))?;
        self.systemctl(&["daemon-reload"])?;
        self.systemctl(&["enable", "--now", Self::UNIT_NAME])?;
        info!(path = %path.display(), "Autostart unit installed");
        Ok(())
    }

    fn uninstall(&self) -> Result<(), AutostartError> {
        let path = self.unit_path();
        if !path.exists() {
            return Ok(());
        }
        self.systemctl(&["disable", "--now", Self::UNIT_NAME])?;
        fs::remove_file(&path).map_err(io_error(&path))?;
        self.systemctl(&["daemon-reload"])?;
        info!(path = %path.display(), "Autostart unit removed");
        Ok(())
    }

    fn is_installed(&self) -> bool {
        self.unit_path().is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_writes_unit() {
        let dir = tempfile::tempdir().unwrap();
        let unit = SystemdUserUnit::new(dir.path().join("user"), "/usr/bin/relink-watch");

        assert!(!unit.is_installed());
        unit.install().unwrap();
        assert!(unit.is_installed());

        let contents = fs::read_to_string(unit.unit_path()).unwrap();
        assert!(contents.contains("ExecStart=/usr/bin/relink-watch run\n"));
        assert!(contents.contains("Restart=on-failure"));
        assert!(contents.contains("WantedBy=default.target"));
    }

    #[test]
    fn test_install_is_idempotent_and_uninstall_removes() {
        let dir = tempfile::tempdir().unwrap();
        let unit = SystemdUserUnit::new(dir.path(), "/opt/relink/relink-watch")
            .with_config("/etc/relink/config.toml");

        unit.install().unwrap();
        unit.install().unwrap();
        assert!(unit.render().contains("run --config /etc/relink/config.toml"));

        unit.uninstall().unwrap();
        assert!(!unit.is_installed());
        unit.uninstall().unwrap();
    }
}
