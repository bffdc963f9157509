use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Tunables for the reliable channel, enumerated in the wire/behavior spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HudpConfig {
    /// Sender/receiver window size in packets.
    pub window_size: u16,
    pub initial_rto_ms: u64,
    pub min_rto_ms: u64,
    pub max_rto_ms: u64,
    pub max_retries: u32,
    /// 0 disables the skip-after-threshold policy entirely.
    pub skip_threshold_ms: u64,
    pub receiver_max_buffer: usize,
    pub initial_cwnd: f64,
    pub ssthresh_floor: f64,
    pub dupack_threshold: u32,
    pub send_block_timeout_ms: u64,
}

impl Default for HudpConfig {
    fn default() -> Self {
        let window_size = 64;
        Self {
            window_size,
            initial_rto_ms: 200,
            min_rto_ms: 100,
            max_rto_ms: 4000,
            max_retries: 10,
            skip_threshold_ms: 200,
            receiver_max_buffer: 2 * window_size as usize,
            initial_cwnd: 10.0,
            ssthresh_floor: 10.0,
            dupack_threshold: 3,
            send_block_timeout_ms: 1000,
        }
    }
}

impl HudpConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(ConfigError::Validation(
                "window_size must be greater than 0".to_string(),
            ));
        }
        if self.min_rto_ms > self.max_rto_ms {
            return Err(ConfigError::Validation(format!(
                "min_rto_ms ({}) must not exceed max_rto_ms ({})",
                self.min_rto_ms, self.max_rto_ms
            )));
        }
        if self.initial_rto_ms == 0 {
            return Err(ConfigError::Validation(
                "initial_rto_ms must be greater than 0".to_string(),
            ));
        }
        if self.receiver_max_buffer == 0 {
            return Err(ConfigError::Validation(
                "receiver_max_buffer must be greater than 0".to_string(),
            ));
        }
        if self.receiver_max_buffer > u16::MAX as usize {
            return Err(ConfigError::Validation(format!(
                "receiver_max_buffer ({}) must fit in the ACK's u16 recv_window field",
                self.receiver_max_buffer
            )));
        }
        if self.dupack_threshold == 0 {
            return Err(ConfigError::Validation(
                "dupack_threshold must be greater than 0".to_string(),
            ));
        }
        if self.initial_cwnd < 1.0 {
            return Err(ConfigError::Validation(
                "initial_cwnd must be at least 1".to_string(),
            ));
        }
        if self.ssthresh_floor < 1.0 {
            return Err(ConfigError::Validation(
                "ssthresh_floor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Loads a TOML config from `path`, or writes and returns the default if
    /// the file does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Self::default();
            let content = toml::to_string_pretty(&config)?;
            fs::write(path, content)?;
            Ok(config)
        }
    }
}
