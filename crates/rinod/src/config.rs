//! Daemon configuration.
//!
//! Values come from three layers, highest priority first:
//!
//! 1. Command-line flags ([`ConfigOverrides`])
//! 2. The optional TOML file, `<service_dir>/rino.toml` by default ([`FileConfig`])
//! 3. Built-in defaults
//!
//! ```toml
//! link = "CI:9001,BUILDBOX:9002"
//! bind_address = "127.0.0.1"
//! notifier_cmd = "/usr/bin/notify-send"
//! read_timeout_secs = 30
//! delimiter = "|x|"
//! ```

use std::fs;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use rino_core::{DomainError, LinkSet};
use rino_protocol::DEFAULT_DELIMITER;

use crate::notifier::{
    CommandNotifier, NotifierStyle, DEFAULT_NOTIFIER_CMD, DEFAULT_NOTIFIER_SENDER,
    DEFAULT_NOTIFY_TIMEOUT,
};
use crate::pidfile::pid_file_path;
use crate::server::{ServerOptions, DEFAULT_READ_TIMEOUT};

/// Name of the config file inside the service directory.
pub const CONFIG_FILE_NAME: &str = "rino.toml";

/// Name of the log file used when daemonized.
pub const LOG_FILE_NAME: &str = "rino.log";

/// Default bind address. SSH forwards arrive on loopback.
pub const DEFAULT_BIND_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Returns the default service directory, `~/.rino`.
pub fn default_service_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".rino"))
        .unwrap_or_else(|| PathBuf::from("/tmp/rino"))
}

/// Returns the config file path inside `service_dir`.
pub fn default_config_path(service_dir: &Path) -> PathBuf {
    service_dir.join(CONFIG_FILE_NAME)
}

/// Errors while loading or validating configuration. Startup-fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config file {path}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("No links configured: pass --link TAG:PORT or set `link` in {config}")]
    MissingLinks { config: PathBuf },

    #[error(transparent)]
    InvalidLinks(#[from] DomainError),

    #[error("Invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

// ============================================================================
// Layers
// ============================================================================

/// Contents of the TOML config file. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub link: Option<LinkSet>,
    pub bind_address: Option<IpAddr>,
    pub notifier_cmd: Option<PathBuf>,
    pub notifier_sender: Option<String>,
    pub notifier_style: Option<NotifierStyle>,
    pub read_timeout_secs: Option<u64>,
    pub notify_timeout_secs: Option<u64>,
    pub delimiter: Option<String>,
    pub debug: Option<bool>,
}

impl FileConfig {
    /// Loads the file at `path`. A missing file yields the empty layer.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                })
            }
        };
        Self::parse(&contents).map_err(|error| ConfigError::Parse {
            path: path.to_path_buf(),
            error,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, String> {
        toml::from_str(contents).map_err(|e| e.to_string())
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub link: Option<LinkSet>,
    pub bind_address: Option<IpAddr>,
    pub notifier_cmd: Option<PathBuf>,
    pub notifier_sender: Option<String>,
    pub notifier_style: Option<NotifierStyle>,
    pub read_timeout_secs: Option<u64>,
    pub delimiter: Option<String>,
    pub debug: bool,
}

// ============================================================================
// Resolved configuration
// ============================================================================

/// Fully resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub links: LinkSet,
    pub service_dir: PathBuf,
    pub bind_address: IpAddr,
    pub notifier_cmd: PathBuf,
    pub notifier_sender: String,
    /// Forced argument style; detected from `notifier_cmd` when unset
    pub notifier_style: Option<NotifierStyle>,
    pub read_timeout: Duration,
    pub notify_timeout: Duration,
    pub delimiter: String,
    pub debug: bool,
}

impl DaemonConfig {
    /// Merges the layers, flags first, then file, then defaults.
    pub fn resolve(
        service_dir: PathBuf,
        config_path: &Path,
        overrides: ConfigOverrides,
        file: FileConfig,
    ) -> Result<Self, ConfigError> {
        let links = overrides
            .link
            .or(file.link)
            .ok_or_else(|| ConfigError::MissingLinks {
                config: config_path.to_path_buf(),
            })?;

        let read_timeout_secs = overrides
            .read_timeout_secs
            .or(file.read_timeout_secs)
            .unwrap_or(DEFAULT_READ_TIMEOUT.as_secs());
        let notify_timeout_secs = file
            .notify_timeout_secs
            .unwrap_or(DEFAULT_NOTIFY_TIMEOUT.as_secs());
        for (field, secs) in [
            ("read_timeout_secs", read_timeout_secs),
            ("notify_timeout_secs", notify_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be at least 1 second".to_string(),
                });
            }
        }

        let delimiter = overrides
            .delimiter
            .or(file.delimiter)
            .unwrap_or_else(|| DEFAULT_DELIMITER.to_string());
        if delimiter.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "delimiter",
                reason: "must not be empty".to_string(),
            });
        }

        Ok(Self {
            links,
            service_dir,
            bind_address: overrides
                .bind_address
                .or(file.bind_address)
                .unwrap_or(DEFAULT_BIND_ADDRESS),
            notifier_cmd: overrides
                .notifier_cmd
                .or(file.notifier_cmd)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_NOTIFIER_CMD)),
            notifier_sender: overrides
                .notifier_sender
                .or(file.notifier_sender)
                .unwrap_or_else(|| DEFAULT_NOTIFIER_SENDER.to_string()),
            notifier_style: overrides.notifier_style.or(file.notifier_style),
            read_timeout: Duration::from_secs(read_timeout_secs),
            notify_timeout: Duration::from_secs(notify_timeout_secs),
            delimiter,
            debug: overrides.debug || file.debug.unwrap_or(false),
        })
    }

    /// Options for the link supervisor.
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            bind_address: self.bind_address,
            read_timeout: self.read_timeout,
            delimiter: self.delimiter.clone(),
        }
    }

    /// Builds the command notifier described by this configuration.
    pub fn notifier(&self) -> CommandNotifier {
        let notifier = CommandNotifier::new(&self.notifier_cmd)
            .with_app_sender(&self.notifier_sender)
            .with_timeout(self.notify_timeout);
        match self.notifier_style {
            Some(style) => notifier.with_style(style),
            None => notifier,
        }
    }

    /// PID file for this link identity.
    pub fn pid_file(&self) -> PathBuf {
        pid_file_path(&self.service_dir, &self.links.identity())
    }

    /// Log file used when running daemonized.
    pub fn log_file(&self) -> PathBuf {
        self.service_dir.join(LOG_FILE_NAME)
    }
}
