//! Server configuration.
//!
//! Loaded from an optional TOML file. Every key has a default, so an empty
//! file (or no file at all) yields a working configuration:
//!
//! ```toml
//! [storage]
//! path = "./rrdb_data"
//! default_policy = "1 min for 1 day"
//! auto_create = true
//! sync_writes = false
//! flush_interval = "10 secs"
//!
//! [server]
//! status_update_interval = "10 secs"
//!
//! [server_tcp]
//! address = "0.0.0.0"
//! port = 9876
//! max_message_size = 4096
//! read_timeout = "5 secs"
//!
//! [server_udp]
//! address = "0.0.0.0"
//! port = 9876
//! max_message_size = 2048
//!
//! [log]
//! level = "info"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use rrdb::{Duration, RegistryOptions, RetentionPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading or validating the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// Path of the file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema.
    #[error("invalid config file '{path}': {source}")]
    Parse {
        /// Path of the file.
        path: String,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// The configuration could not be rendered back to TOML.
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    /// A value is out of range.
    #[error("invalid config value '{key}': {reason}")]
    Invalid {
        /// Dotted key of the offending value.
        key: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Complete server configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Data directory and metric defaults.
    pub storage: StorageConfig,
    /// Settings shared by all listeners.
    pub server: ServerConfig,
    /// TCP statement listener.
    pub server_tcp: TcpConfig,
    /// UDP command listener.
    pub server_udp: UdpConfig,
    /// Logging.
    pub log: LogConfig,
}

/// `[storage]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Data directory.
    pub path: PathBuf,
    /// Policy for metrics created implicitly by an update.
    pub default_policy: RetentionPolicy,
    /// Create unknown metrics on update instead of rejecting the sample.
    pub auto_create: bool,
    /// Flush every touched slot before acknowledging an update.
    pub sync_writes: bool,
    /// Period of the background flush.
    pub flush_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./rrdb_data"),
            default_policy: RetentionPolicy::default(),
            auto_create: true,
            sync_writes: false,
            flush_interval: Duration::from_secs(10),
        }
    }
}

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Period at which status counters are recorded into `self.*` metrics.
    pub status_update_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            status_update_interval: Duration::from_secs(10),
        }
    }
}

/// `[server_tcp]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TcpConfig {
    /// Listen address.
    pub address: String,
    /// Listen port; 0 disables the listener.
    pub port: u16,
    /// Longest statement accepted, in bytes.
    pub max_message_size: usize,
    /// Time allowed to receive a complete statement.
    pub read_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9876,
            max_message_size: 4096,
            read_timeout: Duration::from_secs(5),
        }
    }
}

/// `[server_udp]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UdpConfig {
    /// Listen address.
    pub address: String,
    /// Listen port; 0 disables the listener.
    pub port: u16,
    /// Receive buffer size; longer datagrams are truncated.
    pub max_message_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9876,
            max_message_size: 2048,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive, used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads the configuration from `path`, or the defaults if `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if a
    /// value is out of range.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::parse(&text).map_err(|e| match e {
                    ConfigError::Parse { source, .. } => ConfigError::Parse {
                        path: path.display().to_string(),
                        source,
                    },
                    other => other,
                })?
            }
            None => Self::default(),
        };
        Ok(config)
    }

    /// Parses and validates TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges that the types alone cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_tcp.max_message_size == 0 {
            return Err(ConfigError::Invalid {
                key: "server_tcp.max_message_size",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.server_udp.max_message_size == 0 {
            return Err(ConfigError::Invalid {
                key: "server_udp.max_message_size",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.storage.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                key: "storage.path",
                reason: "must not be empty".to_string(),
            });
        }
        if tracing_subscriber::EnvFilter::try_new(&self.log.level).is_err() {
            return Err(ConfigError::Invalid {
                key: "log.level",
                reason: format!("'{}' is not a valid filter", self.log.level),
            });
        }
        Ok(())
    }

    /// Renders the effective configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Render`] if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Registry options derived from the `[storage]` section.
    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            sync_writes: self.storage.sync_writes,
            default_policy: self
                .storage
                .auto_create
                .then(|| self.storage.default_policy.clone()),
        }
    }
}
