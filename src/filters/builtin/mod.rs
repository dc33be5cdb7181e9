//! Built-in operator implementations.
//!
//! This module contains the reference kernels that ship with tilegraph and
//! the file bridge used by the command line.

mod blur;
mod color;
mod io;
mod rank;
mod statistics;

use crate::filters::registry::OperatorRegistry;

/// Register all built-in operators.
pub fn register_all(registry: &mut OperatorRegistry) {
    blur::register(registry);
    rank::register(registry);
    color::register(registry);
    statistics::register(registry);
}

// Re-export for direct access
pub use blur::BoxBlur;
pub use rank::MaxFilter;
pub use color::{Invert, Normalize};
pub use statistics::{HistogramSpec, ReferenceStatistics, EXTREMA, HISTOGRAM, MEAN};
pub use io::{image_from_raster, load_raster, raster_from_image, save_raster};
