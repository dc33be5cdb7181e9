//! Tile execution.
//!
//! This module decides when and where tiles are computed: the shared tile
//! cache, the scheduler with its worker pools, and asynchronous requests.

pub mod cache;
pub mod scheduler;
pub mod request;
pub mod progress;

pub use cache::{
    CacheEntryInfo, CacheEvent, CacheObserver, CacheStats, MemoryTileCache, NoopTileCache, SharedTileCache,
    TileCache, TileComparator,
};
pub use scheduler::{SchedulerStats, TileScheduler};
pub use request::{TileComputationListener, TileRequest, TileStatus};
pub use progress::{ProgressCallback, ProgressTracker, ProgressUpdate};
