//! Event bus configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOCAL_CONFIG: &str = ".eventbus.yml";

/// Main event bus configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Log store location
    pub store: StoreConfig,

    /// Consumer loop tuning
    pub consumer: ConsumerConfig,

    /// Retry delays for transient store errors
    pub backoff: BackoffConfig,
}

impl Config {
    /// Validate configuration before use
    pub fn validate(&self) -> Result<()> {
        if self.store.stream.trim().is_empty() {
            return Err(eyre::eyre!("store.stream must not be empty"));
        }
        if self.consumer.batch_size == 0 {
            return Err(eyre::eyre!("consumer.batch-size must be at least 1"));
        }
        if self.consumer.block_ms == 0 {
            return Err(eyre::eyre!("consumer.block-ms must be at least 1"));
        }
        if self.consumer.poll_interval_ms == 0 {
            return Err(eyre::eyre!("consumer.poll-interval-ms must be at least 1"));
        }
        if self.consumer.max_deliveries == 0 {
            return Err(eyre::eyre!("consumer.max-deliveries must be at least 1"));
        }
        if self.consumer.dead_letter_stream.as_deref() == Some(self.store.stream.as_str()) {
            return Err(eyre::eyre!("consumer.dead-letter-stream must differ from store.stream"));
        }
        if self.backoff.multiplier.is_nan() || self.backoff.multiplier < 1.0 {
            return Err(eyre::eyre!(
                "backoff.multiplier must be >= 1.0 (got {})",
                self.backoff.multiplier
            ));
        }
        if self.backoff.initial_ms > self.backoff.max_ms {
            return Err(eyre::eyre!(
                "backoff.initial-ms ({}) exceeds backoff.max-ms ({})",
                self.backoff.initial_ms,
                self.backoff.max_ms
            ));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        for candidate in Self::candidate_paths() {
            if candidate.exists() {
                match Self::load_from_file(&candidate) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", candidate.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up. Errors are swallowed.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let paths = match config_path {
            Some(path) => vec![path.clone()],
            None => Self::candidate_paths(),
        };
        paths
            .iter()
            .filter(|p| p.exists())
            .find_map(|p| fs::read_to_string(p).ok())
            .and_then(|content| serde_yaml::from_str::<Self>(&content).ok())
            .and_then(|config| config.log_level)
    }

    /// Dead-letter stream name, `{stream}:dead` unless configured
    pub fn dead_letter_stream(&self) -> String {
        self.consumer
            .dead_letter_stream
            .clone()
            .unwrap_or_else(|| format!("{}:dead", self.store.stream))
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(LOCAL_CONFIG)];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("eventbus").join("eventbus.yml"));
        }
        paths
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Log store location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file
    pub path: PathBuf,

    /// Stream carrying platform events
    pub stream: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("eventbus")
                .join("events.db"),
            stream: "events".to_string(),
        }
    }
}

/// Consumer loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Maximum entries per read
    #[serde(rename = "batch-size")]
    pub batch_size: usize,

    /// How long a read waits for new entries
    #[serde(rename = "block-ms")]
    pub block_ms: u64,

    /// Re-poll interval while blocked, for appends from other processes
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,

    /// Deliveries allowed before an entry is dead-lettered
    #[serde(rename = "max-deliveries")]
    pub max_deliveries: u32,

    /// Claim entries other consumers left pending this long; disabled when unset
    #[serde(rename = "claim-idle-ms")]
    pub claim_idle_ms: Option<u64>,

    /// Stream for dead letters; `{stream}:dead` when unset
    #[serde(rename = "dead-letter-stream")]
    pub dead_letter_stream: Option<String>,
}

impl ConsumerConfig {
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn claim_idle(&self) -> Option<Duration> {
        self.claim_idle_ms.map(Duration::from_millis)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            block_ms: 5000,
            poll_interval_ms: 100,
            max_deliveries: 5,
            claim_idle_ms: None,
            dead_letter_stream: None,
        }
    }
}

/// Retry delays for transient store errors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(rename = "initial-ms")]
    pub initial_ms: u64,

    #[serde(rename = "max-ms")]
    pub max_ms: u64,

    pub multiplier: f64,

    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}
