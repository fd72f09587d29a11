//! Store configuration.
//!
//! Defaults are usable as-is; a TOML file can override any subset of fields.

use crate::ConfigError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming an optional TOML config file.
pub const CONFIG_PATH_ENV: &str = "STRATA_STORE_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StoreConfig {
    /// How long a key with no retainers keeps its query and subject.
    pub key_retention_ms: u64,
    /// Period of the background gc task.
    pub gc_interval_ms: u64,
    /// Page size used when a collection query does not specify one.
    pub default_page_size: u32,
    /// Minimum gap between non-forced object revalidations.
    pub object_dedupe_interval_ms: u64,
    /// Minimum gap between non-forced collection revalidations.
    pub list_dedupe_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key_retention_ms: 60_000,
            gc_interval_ms: 1_000,
            default_page_size: 100,
            object_dedupe_interval_ms: 0,
            list_dedupe_interval_ms: 0,
        }
    }
}

impl StoreConfig {
    /// Load from `STRATA_STORE_CONFIG` if set, otherwise defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let config = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_path(Path::new(&path))?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gc_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "gc_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.default_page_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "default_page_size",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }

    /// How long a key with no holders keeps its query and subject.
    pub fn with_key_retention(mut self, retention: Duration) -> Self {
        self.key_retention_ms = millis(retention);
        self
    }

    /// Period of the background collector started by `Store::spawn_gc`.
    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval_ms = millis(interval);
        self
    }

    /// Page size for collections that do not ask for one.
    pub fn with_default_page_size(mut self, page_size: u32) -> Self {
        self.default_page_size = page_size;
        self
    }

    /// Minimum gap between non-forced object revalidations.
    pub fn with_object_dedupe_interval(mut self, interval: Duration) -> Self {
        self.object_dedupe_interval_ms = millis(interval);
        self
    }

    /// Minimum gap between non-forced list and link revalidations.
    pub fn with_list_dedupe_interval(mut self, interval: Duration) -> Self {
        self.list_dedupe_interval_ms = millis(interval);
        self
    }

    pub fn key_retention(&self) -> Duration {
        Duration::from_millis(self.key_retention_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    pub fn object_dedupe_interval(&self) -> Duration {
        Duration::from_millis(self.object_dedupe_interval_ms)
    }

    pub fn list_dedupe_interval(&self) -> Duration {
        Duration::from_millis(self.list_dedupe_interval_ms)
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
