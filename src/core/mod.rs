//! Core types for the tilegraph image processing system.
//!
//! This module contains the foundations every other layer builds on:
//! - Geometry value types (rectangles, tile addresses, padding, layouts)
//! - Typed pixel storage and shared tiles
//! - Destination/source rectangle mapping
//! - Border extension policies
//! - Error types and configuration

pub mod types;
pub mod raster;
pub mod geometry;
pub mod border;
pub mod error;
pub mod config;

// Re-export commonly used types
pub use types::{Rectangle, TileAddress, Padding, SampleType, ImageLayout};
pub use raster::{Raster, RasterSource, Sample, Samples, TileBuffer};
pub use geometry::{GeometryMapper, map_dest_to_source, map_source_to_dest};
pub use border::BorderPolicy;
pub use error::{TilegraphError, TileError, ConfigError, TilegraphResult, TileResult, ConfigResult};
pub use config::EnvironmentConfig;
