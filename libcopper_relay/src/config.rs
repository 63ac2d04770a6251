use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::constants::DEFAULT_MAX_EVENT_WORDS;
use super::error::ConfigError;
use super::pause::DEFAULT_PAUSE_SHM_PATH;
use super::raw_copper::EventNumberCheck;
use super::transport::{FaultMode, TransportOptions};

/// Structure representing the relay configuration. Contains the upstream and downstream
/// endpoints, buffer sizing, and the run-control and error policies.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub upstream_host: String,
    pub upstream_port: u16,
    pub listen_host: String,
    pub listen_port: u16,
    pub tcp_nodelay: bool,
    pub fault_mode: FaultMode,
    pub event_number_check: EventNumberCheck,
    pub num_buffers: usize,
    pub buffer_words: usize,
    pub max_event_words: usize,
    pub events_per_cycle: usize,
    pub send_timeout_ms: u64,
    pub connect_retry_ms: u64,
    pub resume_poll_ms: u64,
    pub eagain_backoff_us: u64,
    pub max_backoff_us: u64,
    pub pause_shm_path: Option<PathBuf>,
    pub verify_send_checksum: bool,
}

impl Default for Config {
    /// A relay on localhost with no run control
    fn default() -> Self {
        Self {
            upstream_host: String::from("localhost"),
            upstream_port: 30000,
            listen_host: String::from("0.0.0.0"),
            listen_port: 33000,
            tcp_nodelay: true,
            fault_mode: FaultMode::Normal,
            event_number_check: EventNumberCheck::Strict,
            num_buffers: 1000,
            buffer_words: 10_000,
            max_event_words: DEFAULT_MAX_EVENT_WORDS,
            events_per_cycle: 1,
            send_timeout_ms: 1000,
            connect_retry_ms: 1000,
            resume_poll_ms: 100,
            eagain_backoff_us: 0,
            max_backoff_us: 10_000,
            pause_shm_path: None,
            verify_send_checksum: true,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        let config = serde_yaml::from_str::<Self>(&yaml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to a YAML file. Every field is written, defaults included.
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    pub fn is_buffer_config_valid(&self) -> bool {
        self.num_buffers >= self.events_per_cycle && self.buffer_words > 0
    }

    pub fn is_events_per_cycle_valid(&self) -> bool {
        self.events_per_cycle >= 1
    }

    pub fn is_max_event_words_valid(&self) -> bool {
        self.max_event_words > 0 && self.max_event_words <= u32::MAX as usize
    }

    pub fn is_backoff_valid(&self) -> bool {
        self.eagain_backoff_us <= self.max_backoff_us
    }

    pub fn is_timeout_valid(&self) -> bool {
        self.send_timeout_ms > 0
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.is_timeout_valid() {
            return Err(ConfigError::InvalidValue(String::from(
                "send_timeout_ms must be non-zero",
            )));
        }
        if !self.is_events_per_cycle_valid() {
            return Err(ConfigError::InvalidValue(format!(
                "events_per_cycle must be at least 1, got {}",
                self.events_per_cycle
            )));
        }
        if !self.is_buffer_config_valid() {
            return Err(ConfigError::InvalidValue(format!(
                "num_buffers ({}) must cover events_per_cycle ({}) and buffer_words must be non-zero",
                self.num_buffers, self.events_per_cycle
            )));
        }
        if !self.is_max_event_words_valid() {
            return Err(ConfigError::InvalidValue(format!(
                "max_event_words {} is out of range",
                self.max_event_words
            )));
        }
        if !self.is_backoff_valid() {
            return Err(ConfigError::InvalidValue(format!(
                "eagain_backoff_us ({}) exceeds max_backoff_us ({})",
                self.eagain_backoff_us, self.max_backoff_us
            )));
        }
        Ok(())
    }

    /// Run-control flag to use. `None` in the file means the standard shared-memory location
    /// is used only if it exists.
    pub fn get_pause_shm_path(&self) -> Option<PathBuf> {
        match &self.pause_shm_path {
            Some(path) => Some(path.clone()),
            None => {
                let default = PathBuf::from(DEFAULT_PAUSE_SHM_PATH);
                default.exists().then_some(default)
            }
        }
    }

    pub fn get_resume_poll(&self) -> Duration {
        Duration::from_millis(self.resume_poll_ms)
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            fault_mode: self.fault_mode,
            tcp_nodelay: self.tcp_nodelay,
            socket_timeout: Duration::from_millis(self.send_timeout_ms),
            eagain_backoff: Duration::from_micros(self.eagain_backoff_us),
            max_backoff: Duration::from_micros(self.max_backoff_us),
            connect_retry: Duration::from_millis(self.connect_retry_ms),
        }
    }
}
