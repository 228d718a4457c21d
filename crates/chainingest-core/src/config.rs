//! Ingestor configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::retry::RetryConfig;

/// Which topology a run uses. Chosen once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// Bounded replay of a closed range from the archive.
    #[default]
    Batch,
    /// Archive replay spliced onto the live feed, running forever.
    Live,
}

impl std::fmt::Display for IngestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Batch => write!(f, "batch"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// Configuration for one ingestion run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestorConfig {
    /// Index shard granularity; the start block must sit on a multiple of it.
    #[serde(default = "default_shard_size")]
    pub shard_size: u64,
    /// First block of the run.
    #[serde(default = "default_start_block")]
    pub start_block_num: u64,
    /// Last block of the run (inclusive). `None` = until the archive ends.
    #[serde(default)]
    pub stop_block_num: Option<u64>,
    #[serde(default)]
    pub mode: IngestMode,
    /// Root of the block archive.
    #[serde(default = "default_archive_path")]
    pub archive_path: String,
    /// Live feed endpoint, required in live mode.
    #[serde(default)]
    pub feed_address: Option<String>,
    /// Id of the irreversible block right before `start_block_num`, if known.
    /// Seeds the fork resolver so finality is not re-derived from scratch.
    #[serde(default)]
    pub previous_irreversible_id: Option<String>,
    /// Blocks buffered from the live feed.
    #[serde(default = "default_live_buffer_size")]
    pub live_buffer_size: usize,
    /// Live blocks held while waiting for the archive to catch up.
    #[serde(default = "default_join_buffer_size")]
    pub join_buffer_size: usize,
    /// Address the health endpoint binds to. `None` = disabled.
    #[serde(default)]
    pub health_listen_addr: Option<String>,
    /// Per-block debug logging in the historical source.
    #[serde(default)]
    pub verbose: bool,
    /// First block number of the chain. When set, live delivery may start at
    /// that block without the archive holding it.
    #[serde(default)]
    pub protocol_first_block: Option<u64>,
    /// Delay before an ended live stream is restarted (milliseconds).
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_shard_size() -> u64 {
    5_000
}

fn default_start_block() -> u64 {
    1
}

fn default_archive_path() -> String {
    "./blocks".into()
}

fn default_live_buffer_size() -> usize {
    250
}

fn default_join_buffer_size() -> usize {
    300
}

fn default_restart_delay_ms() -> u64 {
    2_000
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            shard_size: default_shard_size(),
            start_block_num: default_start_block(),
            stop_block_num: None,
            mode: IngestMode::Batch,
            archive_path: default_archive_path(),
            feed_address: None,
            previous_irreversible_id: None,
            live_buffer_size: default_live_buffer_size(),
            join_buffer_size: default_join_buffer_size(),
            health_listen_addr: None,
            verbose: false,
            protocol_first_block: None,
            restart_delay_ms: default_restart_delay_ms(),
            retry: RetryConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl IngestorConfig {
    /// Check internal consistency. Shard alignment is checked at bootstrap.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.shard_size == 0 {
            return Err(IngestError::Config("shard_size must be greater than zero".into()));
        }
        if self.start_block_num == 0 {
            return Err(IngestError::Config("start_block_num must be at least 1".into()));
        }
        if let Some(stop) = self.stop_block_num {
            if stop < self.start_block_num {
                return Err(IngestError::Config(format!(
                    "stop_block_num {stop} is before start_block_num {}",
                    self.start_block_num
                )));
            }
        }
        if self.mode == IngestMode::Live && self.feed_address.is_none() {
            return Err(IngestError::Config("live mode requires feed_address".into()));
        }
        if self.live_buffer_size == 0 || self.join_buffer_size == 0 {
            return Err(IngestError::Config("buffer sizes must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Log output settings for the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Override per component: crate name → level
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// Emit JSON structured logs (true) or human-readable text (false)
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: HashMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// `EnvFilter` directives, e.g. `"info,chainingest_core=debug"`.
    pub fn directives(&self) -> String {
        let mut directives = self.level.clone();
        for (component, level) in &self.components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

/// Fluent builder for [`IngestorConfig`].
#[derive(Default)]
pub struct IngestorConfigBuilder {
    config: IngestorConfig,
}

impl IngestorConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shard_size(mut self, size: u64) -> Self {
        self.config.shard_size = size;
        self
    }

    pub fn start_block(mut self, num: u64) -> Self {
        self.config.start_block_num = num;
        self
    }

    /// Set the last block of a bounded run.
    pub fn stop_block(mut self, num: u64) -> Self {
        self.config.stop_block_num = Some(num);
        self
    }

    pub fn mode(mut self, mode: IngestMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn archive_path(mut self, path: impl Into<String>) -> Self {
        self.config.archive_path = path.into();
        self
    }

    /// Set the live feed address.
    pub fn feed_address(mut self, address: impl Into<String>) -> Self {
        self.config.feed_address = Some(address.into());
        self
    }

    /// Resume from a known irreversible block.
    pub fn previous_irreversible(mut self, id: impl Into<String>) -> Self {
        self.config.previous_irreversible_id = Some(id.into());
        self
    }

    pub fn live_buffer_size(mut self, size: usize) -> Self {
        self.config.live_buffer_size = size;
        self
    }

    pub fn join_buffer_size(mut self, size: usize) -> Self {
        self.config.join_buffer_size = size;
        self
    }

    pub fn health_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.health_listen_addr = Some(addr.into());
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.config.verbose = verbose;
        self
    }

    pub fn protocol_first_block(mut self, num: u64) -> Self {
        self.config.protocol_first_block = Some(num);
        self
    }

    pub fn restart_delay_ms(mut self, ms: u64) -> Self {
        self.config.restart_delay_ms = ms;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Build and validate the config.
    pub fn build(self) -> Result<IngestorConfig, IngestError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
