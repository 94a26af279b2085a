//! Hub and connection tuning
//!
//! Loads liveness, deadline and queue settings from an optional TOML file.
//! Every key is optional; anything left out keeps its default.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Time a peer may stay silent (no frame, no pong) before it is considered dead
pub const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(60);

/// Deadline applied to every outbound frame and control frame
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Pending outbound payloads per connection before the connection is evicted
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Largest inbound frame accepted from a peer, in bytes
pub const DEFAULT_MAX_FRAME_SIZE: usize = 512;

/// Upper bound for the liveness window and the write deadline
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Largest queue a tokio channel can be built with
pub const MAX_QUEUE_CAPACITY: usize = tokio::sync::Semaphore::MAX_PERMITS;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Ping period that guarantees one ping per liveness window
pub fn ping_interval_for(liveness_window: Duration) -> Duration {
    // Divide first so no window can overflow
    liveness_window / 10 * 9
}

/// Runtime settings shared by the hub and every connection
#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    /// Read deadline extension granted by every inbound frame or pong
    pub liveness_window: Duration,
    /// Period of the write pump's ping ticker
    pub ping_interval: Duration,
    /// Deadline for a single outbound write
    pub write_wait: Duration,
    /// Capacity of each connection's outbound queue
    pub queue_capacity: usize,
    /// Maximum inbound frame size in bytes
    pub max_frame_size: usize,
    /// Merge payloads already queued into one outbound frame
    pub coalesce: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            liveness_window: DEFAULT_LIVENESS_WINDOW,
            ping_interval: ping_interval_for(DEFAULT_LIVENESS_WINDOW),
            write_wait: DEFAULT_WRITE_WAIT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            coalesce: true,
        }
    }
}

/// On-disk shape of the config file
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HubConfigFile {
    liveness_window_ms: Option<u64>,
    ping_interval_ms: Option<u64>,
    write_wait_ms: Option<u64>,
    queue_capacity: Option<usize>,
    max_frame_size: Option<usize>,
    coalesce: Option<bool>,
}

impl From<HubConfigFile> for HubConfig {
    fn from(file: HubConfigFile) -> Self {
        let mut config = HubConfig::default();
        if let Some(ms) = file.liveness_window_ms {
            config = config.with_liveness_window(Duration::from_millis(ms));
        }
        if let Some(ms) = file.ping_interval_ms {
            config.ping_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = file.write_wait_ms {
            config.write_wait = Duration::from_millis(ms);
        }
        if let Some(capacity) = file.queue_capacity {
            config.queue_capacity = capacity;
        }
        if let Some(size) = file.max_frame_size {
            config.max_frame_size = size;
        }
        if let Some(coalesce) = file.coalesce {
            config.coalesce = coalesce;
        }
        config
    }
}

impl HubConfig {
    /// Load configuration from a TOML file
    ///
    /// A missing file yields the defaults. The result is validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let file: HubConfigFile = toml::from_str(content)?;
        let config = HubConfig::from(file);
        config.validate()?;
        Ok(config)
    }

    /// Set the liveness window
    ///
    /// A ping interval still derived from the old window is re-derived from
    /// the new one; an explicitly chosen interval is kept.
    pub fn with_liveness_window(mut self, window: Duration) -> Self {
        if self.ping_interval == ping_interval_for(self.liveness_window) {
            self.ping_interval = ping_interval_for(window);
        }
        self.liveness_window = window;
        self
    }

    /// Override the ping interval
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the outbound write deadline
    pub fn with_write_wait(mut self, wait: Duration) -> Self {
        self.write_wait = wait;
        self
    }

    /// Set the outbound queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the maximum inbound frame size
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Enable or disable outbound coalescing
    pub fn with_coalesce(mut self, coalesce: bool) -> Self {
        self.coalesce = coalesce;
        self
    }

    /// Check that the settings can keep a connection alive
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.liveness_window.is_zero() || self.liveness_window > MAX_TIMEOUT {
            return Err(ConfigError::Invalid(format!(
                "liveness window {:?} must be between zero and {:?}",
                self.liveness_window, MAX_TIMEOUT
            )));
        }
        if self.ping_interval.is_zero() || self.ping_interval >= self.liveness_window {
            return Err(ConfigError::Invalid(format!(
                "ping interval {:?} must be non-zero and shorter than the liveness window {:?}",
                self.ping_interval, self.liveness_window
            )));
        }
        if self.write_wait.is_zero() || self.write_wait > MAX_TIMEOUT {
            return Err(ConfigError::Invalid(format!(
                "write deadline {:?} must be between zero and {:?}",
                self.write_wait, MAX_TIMEOUT
            )));
        }
        if self.queue_capacity == 0 || self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(ConfigError::Invalid(format!(
                "queue capacity {} must be between 1 and {}",
                self.queue_capacity, MAX_QUEUE_CAPACITY
            )));
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::Invalid(
                "max frame size must be at least 1 byte".to_string(),
            ));
        }
        Ok(())
    }
}
