//! Configuration management

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use rg_crypto::ids::DEFAULT_DEVICE_ID;
use rg_crypto::streaming::DEFAULT_SEGMENT_SIZE;

use crate::codec::{MAX_FILE_BYTES, MAX_STREAM_HEADER_BYTES};
use crate::replay_cache::DEFAULT_REPLAY_CAPACITY;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Runtime settings, from defaults, then a TOML file, then `RG_*` variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for key files, keyring database and replay state.
    pub data_dir: PathBuf,
    pub account: String,
    pub device_id: String,
    pub replay_capacity: usize,
    pub max_file_bytes: usize,
    pub max_stream_header_bytes: usize,
    pub stream_segment_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".rg"),
            account: "default".to_string(),
            device_id: DEFAULT_DEVICE_ID.to_string(),
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            max_file_bytes: MAX_FILE_BYTES,
            max_stream_header_bytes: MAX_STREAM_HEADER_BYTES,
            stream_segment_size: DEFAULT_SEGMENT_SIZE,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration: optional TOML file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse TOML; missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `RG_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("RG_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(account) = lookup("RG_ACCOUNT") {
            self.account = account;
        }
        if let Some(device) = lookup("RG_DEVICE_ID") {
            self.device_id = device;
        }
        if let Some(level) = lookup("RG_LOG_LEVEL") {
            self.log_level = level;
        }
        let numbers: [(&str, &mut usize); 4] = [
            ("RG_REPLAY_CAPACITY", &mut self.replay_capacity),
            ("RG_MAX_FILE_BYTES", &mut self.max_file_bytes),
            ("RG_MAX_STREAM_HEADER_BYTES", &mut self.max_stream_header_bytes),
            ("RG_STREAM_SEGMENT_SIZE", &mut self.stream_segment_size),
        ];
        for (name, slot) in numbers {
            if let Some(value) = lookup(name) {
                *slot = value
                    .trim()
                    .parse()
                    .map_err(|e| ConfigError::Invalid(format!("{}: {}", name, e)))?;
            }
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.account.trim().is_empty() {
            return Err(ConfigError::Invalid("account must not be empty".to_string()));
        }
        if self.device_id.trim().is_empty() {
            return Err(ConfigError::Invalid("device_id must not be empty".to_string()));
        }
        if self.replay_capacity == 0 {
            return Err(ConfigError::Invalid("replay_capacity must be > 0".to_string()));
        }
        if self.max_file_bytes == 0 || self.max_stream_header_bytes == 0 {
            return Err(ConfigError::Invalid("size limits must be > 0".to_string()));
        }
        // the stream header and one tag must fit in the first segment
        if self.stream_segment_size < 128 {
            return Err(ConfigError::Invalid("stream_segment_size must be >= 128".to_string()));
        }
        Ok(())
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }

    pub fn keyring_db_path(&self) -> PathBuf {
        self.data_dir.join(format!("keyring-{}.db", self.account))
    }

    pub fn replay_dir(&self) -> PathBuf {
        self.data_dir.join("replay")
    }
}
