//! Environment configuration.
//!
//! Loaded from TOML or JSON, or built in code with the `with_*` methods.
//! Missing fields take their defaults.

use crate::core::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default tile edge in pixels.
pub const DEFAULT_TILE_SIZE: i32 = 256;

/// Default cache capacity (64 MB).
pub const DEFAULT_CACHE_CAPACITY: usize = 64 * 1024 * 1024;

/// Default fraction of the capacity memory control shrinks the cache to.
pub const DEFAULT_CACHE_THRESHOLD: f32 = 0.75;

/// Default number of worker threads for asynchronous requests.
pub const DEFAULT_PARALLELISM: i32 = 2;

/// Default number of prefetch threads.
pub const DEFAULT_PREFETCH_PARALLELISM: i32 = 1;

/// Settings shared by every node created in one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Tile width for nodes that do not choose their own layout.
    pub tile_width: i32,
    /// Tile height for nodes that do not choose their own layout.
    pub tile_height: i32,
    /// Cache capacity in bytes. Zero disables caching.
    pub cache_memory_capacity: usize,
    /// Fraction of the capacity eviction stops at.
    pub cache_memory_threshold: f32,
    /// Use a no-op cache when false.
    pub cache_enabled: bool,
    /// Worker threads for asynchronous tile requests.
    pub parallelism: i32,
    /// Worker threads for prefetch requests.
    pub prefetch_parallelism: i32,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            tile_width: DEFAULT_TILE_SIZE,
            tile_height: DEFAULT_TILE_SIZE,
            cache_memory_capacity: DEFAULT_CACHE_CAPACITY,
            cache_memory_threshold: DEFAULT_CACHE_THRESHOLD,
            cache_enabled: true,
            parallelism: DEFAULT_PARALLELISM,
            prefetch_parallelism: DEFAULT_PREFETCH_PARALLELISM,
        }
    }
}

impl EnvironmentConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default tile size.
    pub fn with_tile_size(mut self, width: i32, height: i32) -> Self {
        self.tile_width = width;
        self.tile_height = height;
        self
    }

    /// Set the cache capacity in bytes.
    pub fn with_cache_capacity(mut self, bytes: usize) -> Self {
        self.cache_memory_capacity = bytes;
        self
    }

    /// Set the cache capacity in megabytes.
    pub fn with_cache_capacity_mb(mut self, mb: usize) -> Self {
        self.cache_memory_capacity = mb * 1024 * 1024;
        self
    }

    /// Set the eviction threshold.
    pub fn with_cache_threshold(mut self, threshold: f32) -> Self {
        self.cache_memory_threshold = threshold;
        self
    }

    /// Enable or disable tile caching.
    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// Set the number of asynchronous workers.
    pub fn with_parallelism(mut self, threads: i32) -> Self {
        self.parallelism = threads;
        self
    }

    /// Set the number of prefetch workers.
    pub fn with_prefetch_parallelism(mut self, threads: i32) -> Self {
        self.prefetch_parallelism = threads;
        self
    }

    /// Check every field against its legal range.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.tile_width <= 0 {
            return Err(invalid("tile_width", format!("must be positive, got {}", self.tile_width)));
        }
        if self.tile_height <= 0 {
            return Err(invalid("tile_height", format!("must be positive, got {}", self.tile_height)));
        }
        if !(0.0..=1.0).contains(&self.cache_memory_threshold) {
            return Err(invalid(
                "cache_memory_threshold",
                format!("must lie in [0, 1], got {}", self.cache_memory_threshold),
            ));
        }
        if self.parallelism < 0 {
            return Err(invalid("parallelism", format!("must not be negative, got {}", self.parallelism)));
        }
        if self.prefetch_parallelism < 0 {
            return Err(invalid(
                "prefetch_parallelism",
                format!("must not be negative, got {}", self.prefetch_parallelism),
            ));
        }
        Ok(())
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(source: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a `.toml` or `.json` file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()) {
            Some(ext) if ext == "toml" => Self::from_toml_str(&source),
            Some(ext) if ext == "json" => Self::from_json_str(&source),
            _ => Err(ConfigError::UnsupportedFormat {
                path: path.display().to_string(),
            }),
        }
    }

    /// Serialize to pretty TOML.
    pub fn to_toml_string(&self) -> String {
        // every field is a plain scalar, so serialization cannot fail
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

fn invalid(field: &str, reason: String) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason,
    }
}
