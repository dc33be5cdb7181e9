//! # Tilegraph - Deferred tiled image processing
//!
//! Tilegraph builds chains of image operators whose output is computed one
//! tile at a time, only when somebody asks for it.
//!
//! ## Features
//!
//! - **Deferred execution**: building a chain computes nothing; tiles are
//!   produced on request and pull exactly the source pixels they need
//! - **Shared tile cache**: memory-bounded, with pinning and cost-aware eviction
//! - **At-most-once scheduling**: concurrent requests for one tile share a
//!   single computation, failures included
//! - **Border extension**: zero, constant, copy and reflect policies
//! - **Snapshots**: frozen views of a writable image that stay valid while
//!   it keeps changing
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tilegraph::prelude::*;
//! use std::sync::Arc;
//!
//! let env = Environment::new(EnvironmentConfig::default().with_tile_size(64, 64))?;
//! let raster = load_raster("input.png")?;
//! let source = ImageNode::source(&env, "input", Arc::new(StaticImage::new(&raster, 64, 64)?))?;
//!
//! let registry = OperatorRegistry::with_builtins();
//! let params = OperatorParams::parse("radius=2,border=reflect")?;
//! let blurred = registry.create("box_blur", &env, &[source], &params)?;
//!
//! save_raster(&blurred.render()?, "output.png")?;
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: geometry, rasters, border policies, errors and configuration
//! - [`graph`]: image nodes, operator kinds and kernels
//! - [`execution`]: tile cache, scheduler and asynchronous requests
//! - [`filters`]: operator registry and reference kernels
//! - [`snapshot`]: writable images and their snapshots
//!
//! ## Writing a kernel
//!
//! Area kernels fill a destination rectangle from padded source rasters:
//!
//! ```rust,ignore
//! use tilegraph::prelude::*;
//!
//! struct Double;
//!
//! impl AreaKernel for Double {
//!     fn name(&self) -> &str {
//!         "double"
//!     }
//!
//!     fn padding(&self) -> Padding {
//!         Padding::none()
//!     }
//!
//!     fn compute_rect(&self, sources: &[&Raster], dest: &mut Raster, rect: &Rectangle) -> anyhow::Result<()> {
//!         for y in rect.y..rect.max_y() {
//!             for x in rect.x..rect.max_x() {
//!                 for band in 0..dest.bands() {
//!                     dest.set(x, y, band, sources[0].get(x, y, band) * 2.0);
//!                 }
//!             }
//!         }
//!         Ok(())
//!     }
//! }
//! ```

#![warn(clippy::all)]

pub mod core;
pub mod execution;
pub mod filters;
pub mod graph;
pub mod snapshot;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use tilegraph::prelude::*;
/// ```
pub mod prelude {
    // Core
    pub use crate::core::border::BorderPolicy;
    pub use crate::core::config::EnvironmentConfig;
    pub use crate::core::error::{ConfigError, TileError, TileResult, TilegraphError, TilegraphResult};
    pub use crate::core::geometry::GeometryMapper;
    pub use crate::core::raster::{Raster, RasterSource, TileBuffer};
    pub use crate::core::types::{ImageLayout, Padding, Rectangle, SampleType, TileAddress};

    // Graph
    pub use crate::graph::environment::Environment;
    pub use crate::graph::kernel::{AreaKernel, StatisticAccumulator, StatisticsKernel, UntiledKernel};
    pub use crate::graph::node::{ImageNode, NodeEvent, OperatorKind};
    pub use crate::graph::source::{StaticImage, TileProvider};
    pub use crate::graph::statistics::{Sampling, StatisticValue};

    // Execution
    pub use crate::execution::cache::{CacheStats, MemoryTileCache, TileCache};
    pub use crate::execution::progress::{ProgressTracker, ProgressUpdate};
    pub use crate::execution::request::{TileComputationListener, TileRequest, TileStatus};
    pub use crate::execution::scheduler::TileScheduler;

    // Operators
    pub use crate::filters::builtin::{load_raster, save_raster};
    pub use crate::filters::registry::{OperatorParams, OperatorRegistry};

    // Snapshots
    pub use crate::snapshot::{Snapshot, SnapshotCoordinator, WritableTile, WritableTiledImage};
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
