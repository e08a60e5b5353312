//! Daemon configuration.
//!
//! A YAML file with three sections, each optional:
//!
//! ```yaml
//! server:
//!   socket_path: /run/hostsd/dnsproxyd.sock
//!   max_workers: 0
//! hosts:
//!   path: /etc/hosts
//! logging:
//!   level: info
//!   output: stdout
//!   format: pretty
//!   include_target: true
//! ```
//!
//! [`ConfigManager`] keeps the current [`AppConfig`] behind an `RwLock` and
//! can watch the file, announcing every successful reload on a channel.

use crate::error::{HostsError, Result};
use crate::hosts::DEFAULT_HOSTS_PATH;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Default location of the control socket.
pub const DEFAULT_SOCKET_PATH: &str = "/run/hostsd/dnsproxyd.sock";

/// Quiet period after the last file event before a reload is attempted.
const RELOAD_SETTLE: Duration = Duration::from_millis(500);

/// `server:` section.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub socket_path: String,

    /// Upper bound on live request workers; 0 disables the bound.
    pub max_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            max_workers: 0,
        }
    }
}

/// `hosts:` section.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostsConfig {
    pub path: String,
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_HOSTS_PATH.to_string(),
        }
    }
}

/// Minimum severity that gets logged.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human oriented.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// One JSON object per event.
    Json,
}

/// `logging:` section.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,

    /// `stdout`, `stderr`, or a file path opened for append.
    pub output: String,

    pub format: LogFormat,

    /// Prefix events with their module path.
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: "stdout".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub hosts: HostsConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Reads, parses and validates the file at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => HostsError::ConfigNotFound {
                path: path.display().to_string(),
            },
            _ => HostsError::Io(e),
        })?;

        let config: AppConfig =
            serde_yaml::from_str(&contents).map_err(|e| HostsError::config_parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks what serde cannot: the paths must be usable.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("server.socket_path", &self.server.socket_path),
            ("hosts.path", &self.hosts.path),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(HostsError::config_validation(format!(
                    "{field} cannot be empty"
                )));
            }
        }
        Ok(())
    }

    pub fn hosts_path(&self) -> PathBuf {
        PathBuf::from(&self.hosts.path)
    }
}

fn read_lock(config: &RwLock<AppConfig>) -> RwLockReadGuard<'_, AppConfig> {
    config.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock(config: &RwLock<AppConfig>) -> RwLockWriteGuard<'_, AppConfig> {
    config.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared, reloadable configuration.
#[derive(Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<AppConfig>>,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Loads `path`; fails if the initial configuration is unusable.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_path = path.as_ref().to_path_buf();
        let config = AppConfig::load(&config_path)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// A copy of the current configuration.
    pub fn get(&self) -> AppConfig {
        read_lock(&self.config).clone()
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Re-reads the file. An invalid file leaves the current configuration
    /// in place.
    pub fn reload(&self) -> Result<()> {
        debug!(path = %self.config_path.display(), "Reloading configuration");

        let fresh = AppConfig::load(&self.config_path).map_err(|e| {
            error!(path = %self.config_path.display(), error = %e, "Configuration reload rejected");
            e
        })?;

        let mut current = write_lock(&self.config);
        if *current != fresh {
            info!(path = %self.config_path.display(), "Configuration reloaded");
        }
        *current = fresh;
        Ok(())
    }

    /// Watches the configuration file and reloads it after each burst of
    /// changes. The returned receiver yields once per successful reload;
    /// dropping it stops the watcher.
    pub fn start_watcher(&self) -> Result<mpsc::Receiver<()>> {
        let file_name = self
            .config_path
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| HostsError::config_validation("configuration path has no file name"))?;

        let (event_tx, event_rx) = std_mpsc::channel();
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                let Ok(event) = res else { return };
                let relevant = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                    && event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()));
                if relevant {
                    let _ = event_tx.send(());
                }
            })?;

        // The directory is watched so that renames over the file are seen.
        let dir = match self.config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        info!(path = %self.config_path.display(), "Watching configuration for changes");

        let (reload_tx, reload_rx) = mpsc::channel(1);
        let manager = self.clone();
        std::thread::Builder::new()
            .name("config-watcher".to_string())
            .spawn(move || watch_loop(watcher, event_rx, &manager, reload_tx))?;

        Ok(reload_rx)
    }
}

fn watch_loop(
    _watcher: RecommendedWatcher,
    events: std_mpsc::Receiver<()>,
    manager: &ConfigManager,
    reloads: mpsc::Sender<()>,
) {
    while events.recv().is_ok() {
        while events.recv_timeout(RELOAD_SETTLE).is_ok() {}

        if manager.reload().is_err() {
            continue;
        }
        if reloads.blocking_send(()).is_err() {
            debug!("Reload receiver dropped, stopping config watcher");
            return;
        }
    }
    debug!("Config watcher stopped");
}
