use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use common::protocol::{DEFAULT_MAX_FRAME_SIZE, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "shroud";
pub const CONFIG_FILE_NAME: &str = "server.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the server accepts client connections on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Version string clients must present in their hello
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Largest request frame accepted, in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,
    /// Number of keys the membership filter is sized for
    #[serde(default = "default_filter_expected_items")]
    pub filter_expected_items: u64,
    /// Target false positive rate of the membership filter
    #[serde(default = "default_filter_false_positive_rate")]
    pub filter_false_positive_rate: f64,
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7878))
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

fn default_max_frame_size() -> u32 {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_filter_expected_items() -> u64 {
    1_000_000
}

fn default_filter_false_positive_rate() -> f64 {
    0.01
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            protocol_version: default_protocol_version(),
            max_frame_size: default_max_frame_size(),
            filter_expected_items: default_filter_expected_items(),
            filter_false_positive_rate: default_filter_false_positive_rate(),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// `~/.config/shroud/server.toml` on Linux
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load from `path`, or from the default location when it exists, or
    /// fall back to built-in defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::MissingFile(path.to_path_buf()));
        }
        let config_toml = fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&config_toml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size == 0 {
            return Err(ConfigError::Invalid("max_frame_size must be positive"));
        }
        if !(self.filter_false_positive_rate > 0.0 && self.filter_false_positive_rate < 1.0) {
            return Err(ConfigError::Invalid(
                "filter_false_positive_rate must be between 0 and 1",
            ));
        }
        if self.protocol_version.is_empty() {
            return Err(ConfigError::Invalid("protocol_version must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    MissingFile(PathBuf),

    #[error("invalid config: {0}")]
    Invalid(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}
