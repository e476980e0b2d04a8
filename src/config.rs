//! Worker engine configuration.

use crate::connection::DEFAULT_HIGH_WATER;
use crate::handlers::Mode;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Main configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listener and backend addresses.
    pub proxy: ProxyConfig,

    /// Worker thread configuration.
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Accelerator offload configuration.
    #[serde(default)]
    pub offload: OffloadConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Shutdown configuration.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the workers cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.threads == Some(0) {
            return Err(ConfigError::Invalid("workers.threads must be at least 1".into()));
        }
        if self.workers.max_events == 0 {
            return Err(ConfigError::Invalid("workers.max_events must be at least 1".into()));
        }
        if self.workers.high_water_bytes == 0 {
            return Err(ConfigError::Invalid(
                "workers.high_water_bytes must be at least 1".into(),
            ));
        }
        if let Some(cpus) = self.cpu_affinity() {
            if cpus.is_empty() {
                return Err(ConfigError::Invalid(
                    "workers.cpu_affinity does not name any cpu".into(),
                ));
            }
            if self.threads() > cpus.len() {
                return Err(ConfigError::Invalid(format!(
                    "workers.threads ({}) exceeds the {} cpus in workers.cpu_affinity",
                    self.threads(),
                    cpus.len()
                )));
            }
        }

        let offload = &self.offload;
        if offload.input_buffers < 2 || offload.output_buffers < 2 {
            return Err(ConfigError::Invalid(
                "offload requires at least 2 input and 2 output buffers".into(),
            ));
        }
        if offload.batch_items == 0 {
            return Err(ConfigError::Invalid("offload.batch_items must be at least 1".into()));
        }
        if offload.max_item_size == 0 || offload.max_item_size > offload.batch_bytes {
            return Err(ConfigError::Invalid(format!(
                "offload.max_item_size ({}) must be between 1 and offload.batch_bytes ({})",
                offload.max_item_size, offload.batch_bytes
            )));
        }
        Ok(())
    }

    /// Get the number of worker threads.
    pub fn threads(&self) -> usize {
        self.workers.threads.unwrap_or_else(num_cpus::get)
    }

    /// Get CPU affinity list if configured.
    pub fn cpu_affinity(&self) -> Option<Vec<usize>> {
        self.workers
            .cpu_affinity
            .as_ref()
            .map(|s| parse_cpu_list(s))
    }

    /// Handler table variant every worker binds at startup.
    pub fn mode(&self) -> Mode {
        if self.offload.enabled {
            Mode::Offload
        } else {
            Mode::Passthrough
        }
    }
}

/// Listener and backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Address to listen on for client connections.
    #[serde(default = "ProxyConfig::default_listen")]
    pub listen: SocketAddr,

    /// Backend every client session is paired with.
    pub backend: SocketAddr,
}

impl ProxyConfig {
    fn default_listen() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], 8443))
    }
}

/// Worker thread configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    /// Number of worker threads. Defaults to number of CPUs.
    pub threads: Option<usize>,

    /// CPU affinity string (e.g., "0-3,6-8").
    pub cpu_affinity: Option<String>,

    /// Maximum readiness events processed per wait.
    #[serde(default = "WorkersConfig::default_max_events")]
    pub max_events: usize,

    /// Upper bound on a single readiness wait, in microseconds.
    #[serde(default = "WorkersConfig::default_poll_timeout_us")]
    pub poll_timeout_us: u64,

    /// Depth of each worker's session inbox.
    #[serde(default = "WorkersConfig::default_queue_depth")]
    pub queue_depth: usize,

    /// Buffered bytes per connection at which reading pauses.
    #[serde(default = "WorkersConfig::default_high_water_bytes")]
    pub high_water_bytes: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            threads: None,
            cpu_affinity: None,
            max_events: Self::default_max_events(),
            poll_timeout_us: Self::default_poll_timeout_us(),
            queue_depth: Self::default_queue_depth(),
            high_water_bytes: Self::default_high_water_bytes(),
        }
    }
}

impl WorkersConfig {
    fn default_max_events() -> usize {
        1024
    }

    fn default_poll_timeout_us() -> u64 {
        100
    }

    fn default_queue_depth() -> usize {
        1024
    }

    fn default_high_water_bytes() -> usize {
        DEFAULT_HIGH_WATER
    }

    /// The readiness wait bound as a duration.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_micros(self.poll_timeout_us)
    }
}

/// Accelerator offload configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OffloadConfig {
    /// Route client reads through the accelerator batch pipeline.
    #[serde(default)]
    pub enabled: bool,

    /// Maximum items per batch buffer.
    #[serde(default = "OffloadConfig::default_batch_items")]
    pub batch_items: usize,

    /// Payload bytes per batch buffer.
    #[serde(default = "OffloadConfig::default_batch_bytes")]
    pub batch_bytes: usize,

    /// Largest single item staged from one read.
    #[serde(default = "OffloadConfig::default_max_item_size")]
    pub max_item_size: usize,

    /// Input buffers per worker.
    #[serde(default = "OffloadConfig::default_buffers")]
    pub input_buffers: usize,

    /// Output buffers per worker.
    #[serde(default = "OffloadConfig::default_buffers")]
    pub output_buffers: usize,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_items: Self::default_batch_items(),
            batch_bytes: Self::default_batch_bytes(),
            max_item_size: Self::default_max_item_size(),
            input_buffers: Self::default_buffers(),
            output_buffers: Self::default_buffers(),
        }
    }
}

impl OffloadConfig {
    fn default_batch_items() -> usize {
        256
    }

    fn default_batch_bytes() -> usize {
        1024 * 1024 // 1MB
    }

    fn default_max_item_size() -> usize {
        16 * 1024
    }

    fn default_buffers() -> usize {
        2
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Log format: "pretty", "json", or "compact".
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: Self::default_format(),
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_format() -> String {
        "pretty".to_string()
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Drain timeout in seconds.
    #[serde(default = "ShutdownConfig::default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// How long the dispatcher waits for every worker to report initialized.
    #[serde(default = "ShutdownConfig::default_init_timeout_secs")]
    pub init_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: Self::default_drain_timeout_secs(),
            init_timeout_secs: Self::default_init_timeout_secs(),
        }
    }
}

impl ShutdownConfig {
    fn default_drain_timeout_secs() -> u64 {
        30
    }

    fn default_init_timeout_secs() -> u64 {
        10
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Parse a CPU list string like "0-3,6-8" into a Vec of CPU IDs.
pub fn parse_cpu_list(s: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) =
                (start.trim().parse::<usize>(), end.trim().parse::<usize>())
            {
                cpus.extend(start..=end);
            }
        } else if let Ok(cpu) = part.parse::<usize>() {
            cpus.push(cpu);
        }
    }
    cpus
}
