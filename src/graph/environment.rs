//! The explicit context every node is created in.
//!
//! An [`Environment`] bundles the tile cache, the scheduler and the
//! configuration, and hands out node ids. Nodes keep a clone of the
//! environment they were built in; there are no process-wide defaults.
//!
//! Node ids are unique across the process, so environments sharing one
//! cache never collide on a tile address.

use crate::core::config::EnvironmentConfig;
use crate::core::error::{ConfigError, ConfigResult, TileResult};
use crate::core::types::{ImageLayout, Rectangle, SampleType};
use crate::execution::cache::{MemoryTileCache, NoopTileCache, TileCache};
use crate::execution::scheduler::TileScheduler;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

struct EnvironmentInner {
    config: EnvironmentConfig,
    scheduler: TileScheduler,
}

/// Shared cache, scheduler and settings for a family of nodes.
///
/// Cloning is cheap and every clone refers to the same cache and scheduler.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvironmentInner>,
}

impl Environment {
    /// Build an environment from a validated configuration.
    pub fn new(config: EnvironmentConfig) -> ConfigResult<Self> {
        config.validate()?;
        let cache: Arc<dyn TileCache> = if config.cache_enabled && config.cache_memory_capacity > 0 {
            Arc::new(
                MemoryTileCache::new(config.cache_memory_capacity, config.cache_memory_threshold)
                    .map_err(|e| invalid("cache_memory_threshold", e))?,
            )
        } else {
            Arc::new(NoopTileCache::new())
        };
        Self::with_cache(config, cache)
    }

    /// Build an environment around an existing cache.
    pub fn with_cache(config: EnvironmentConfig, cache: Arc<dyn TileCache>) -> ConfigResult<Self> {
        config.validate()?;
        let scheduler = TileScheduler::new(cache, config.parallelism, config.prefetch_parallelism)
            .map_err(|e| invalid("parallelism", e))?;
        debug!(
            "Environment ready: {}x{} tiles, {} workers, {} prefetchers",
            config.tile_width, config.tile_height, config.parallelism, config.prefetch_parallelism
        );
        Ok(Self {
            inner: Arc::new(EnvironmentInner {
                config,
                scheduler,
            }),
        })
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &Arc<dyn TileCache> {
        self.inner.scheduler.cache()
    }

    pub fn scheduler(&self) -> &TileScheduler {
        &self.inner.scheduler
    }

    /// A fresh node id, unique within the process.
    pub fn next_node_id(&self) -> u64 {
        NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
    }

    /// A layout over `bounds` using the configured tile size.
    pub fn default_layout(&self, bounds: Rectangle, bands: usize, sample_type: SampleType) -> TileResult<ImageLayout> {
        ImageLayout::new(bounds, self.inner.config.tile_width, self.inner.config.tile_height, bands, sample_type)
    }

    /// Whether two handles refer to the same environment.
    pub fn same(&self, other: &Environment) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("config", &self.inner.config)
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

fn invalid(field: &str, error: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: error.to_string(),
    }
}
