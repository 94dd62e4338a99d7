//! Bridge Configuration
//!
//! Configuration is layered, lowest priority first:
//!
//! 1. Built-in defaults ([`BridgeConfig::default`])
//! 2. TOML file (`$XDG_CONFIG_HOME/scoped-stream/config.toml`, `[streaming]` table)
//! 3. Environment variables (`SCOPED_STREAM_*`)
//! 4. Explicit overrides ([`ConfigOverrides`], e.g. from CLI flags)
//!
//! # Example File
//!
//! ```toml
//! [streaming]
//! enabled = true
//! max_buffer_capacity = 1000
//! worker_pool_size = 8
//! clear_resource_interval = 500
//! ```
//!
//! # Environment Variables
//!
//! - `SCOPED_STREAM_ENABLED`: "0" or "false" to disable streaming (fallback only)
//! - `SCOPED_STREAM_MAX_BUFFER`: process-wide buffer ceiling per stream
//! - `SCOPED_STREAM_WORKERS`: worker pool size
//! - `SCOPED_STREAM_CLEAR_INTERVAL`: default scope flush interval (0 = never)
//! - `SCOPED_STREAM_QUEUE_CAPACITY`: max submissions waiting for a worker
//! - `SCOPED_STREAM_THREAD_PREFIX`: worker thread name prefix

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pool size used when neither the config nor the scope provider names one
pub const DEFAULT_POOL_SIZE: usize = 10;

/// Where the effective configuration came from (highest layer applied)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConfigSource {
    /// Built-in defaults only
    #[default]
    Default,
    /// Loaded from a TOML file
    File,
    /// At least one environment variable applied
    Env,
    /// Explicit overrides applied
    Cli,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        /// Field name
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// Process-wide bridge settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Stream through the worker pool (false = always materialize synchronously)
    pub enabled: bool,

    /// Ceiling on any single stream's buffer capacity
    pub max_buffer_capacity: usize,

    /// Number of worker threads
    ///
    /// `None` uses the scope provider's concurrency ceiling, falling back to
    /// [`DEFAULT_POOL_SIZE`].
    pub worker_pool_size: Option<usize>,

    /// Default flush interval for new [`StreamOptions`](crate::StreamOptions) (0 = never)
    pub clear_resource_interval: usize,

    /// Maximum submissions allowed to wait for a free worker
    ///
    /// `None` lets callers wait indefinitely. When set, submissions beyond
    /// `pool size + capacity` fail with `PoolExhausted`.
    pub worker_queue_capacity: Option<usize>,

    /// Worker thread name prefix
    pub thread_name_prefix: String,

    #[serde(skip)]
    pub(crate) source: ConfigSource,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_buffer_capacity: 1000,
            worker_pool_size: None,
            clear_resource_interval: 0,
            worker_queue_capacity: None,
            thread_name_prefix: "scoped-stream-".to_string(),
            source: ConfigSource::Default,
        }
    }
}

/// On-disk layout
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    streaming: BridgeConfig,
}

impl BridgeConfig {
    /// Where the effective values came from
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Defaults with environment overrides applied
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Parse the `[streaming]` table from a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        let mut config = file.streaming;
        config.source = ConfigSource::File;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SCOPED_STREAM_*` environment variables
    pub fn apply_env(&mut self) {
        self.apply_lookup(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup (environment-shaped)
    pub fn apply_lookup<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut applied = false;

        if let Some(v) = lookup("SCOPED_STREAM_ENABLED") {
            self.enabled = v != "0" && v.to_lowercase() != "false";
            applied = true;
        }
        if let Some(v) = lookup("SCOPED_STREAM_MAX_BUFFER").and_then(|v| v.parse().ok()) {
            self.max_buffer_capacity = v;
            applied = true;
        }
        if let Some(v) = lookup("SCOPED_STREAM_WORKERS").and_then(|v| v.parse().ok()) {
            self.worker_pool_size = Some(v);
            applied = true;
        }
        if let Some(v) = lookup("SCOPED_STREAM_CLEAR_INTERVAL").and_then(|v| v.parse().ok()) {
            self.clear_resource_interval = v;
            applied = true;
        }
        if let Some(v) = lookup("SCOPED_STREAM_QUEUE_CAPACITY").and_then(|v| v.parse().ok()) {
            self.worker_queue_capacity = Some(v);
            applied = true;
        }
        if let Some(v) = lookup("SCOPED_STREAM_THREAD_PREFIX") {
            self.thread_name_prefix = v;
            applied = true;
        }

        if applied {
            self.source = ConfigSource::Env;
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_buffer_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "max_buffer_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.worker_pool_size == Some(0) {
            return Err(ConfigError::Invalid {
                field: "worker_pool_size",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Worker pool size given the provider's concurrency ceiling
    #[must_use]
    pub fn resolved_pool_size(&self, provider_ceiling: Option<usize>) -> usize {
        self.worker_pool_size
            .or(provider_ceiling)
            .unwrap_or(DEFAULT_POOL_SIZE)
            .max(1)
    }
}

/// Explicit overrides, applied last
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    enabled: Option<bool>,
    max_buffer_capacity: Option<usize>,
    worker_pool_size: Option<usize>,
    clear_resource_interval: Option<usize>,
}

impl ConfigOverrides {
    /// No overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override `enabled`
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Override `max_buffer_capacity`
    #[must_use]
    pub fn with_max_buffer_capacity(mut self, capacity: usize) -> Self {
        self.max_buffer_capacity = Some(capacity);
        self
    }

    /// Override `worker_pool_size`
    #[must_use]
    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = Some(size);
        self
    }

    /// Override `clear_resource_interval`
    #[must_use]
    pub fn with_clear_resource_interval(mut self, interval: usize) -> Self {
        self.clear_resource_interval = Some(interval);
        self
    }

    /// Whether any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.enabled.is_none()
            && self.max_buffer_capacity.is_none()
            && self.worker_pool_size.is_none()
            && self.clear_resource_interval.is_none()
    }

    /// Apply onto a config
    pub fn apply(&self, config: &mut BridgeConfig) {
        if self.is_empty() {
            return;
        }
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(capacity) = self.max_buffer_capacity {
            config.max_buffer_capacity = capacity;
        }
        if let Some(size) = self.worker_pool_size {
            config.worker_pool_size = Some(size);
        }
        if let Some(interval) = self.clear_resource_interval {
            config.clear_resource_interval = interval;
        }
        config.source = ConfigSource::Cli;
    }
}

/// Default config file location
///
/// `$XDG_CONFIG_HOME/scoped-stream/config.toml`, or `None` when no config
/// directory can be determined.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("scoped-stream").join("config.toml"))
}

/// Load from the default location, then apply the environment
pub fn load_config() -> Result<BridgeConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load from `path` (if it exists), then apply the environment
///
/// A missing file is not an error; defaults are used instead.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<BridgeConfig, ConfigError> {
    let mut config = match path {
        Some(ref p) if p.exists() => read_config_file(p)?,
        _ => BridgeConfig::default(),
    };
    config.apply_env();
    config.validate()?;
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = BridgeConfig::from_toml_str(&content)?;
    tracing::debug!(path = ?path, "Loaded bridge config file");
    Ok(config)
}
