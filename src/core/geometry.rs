//! Mapping between destination and source rectangles.
//!
//! Every node answers two questions for the scheduler: which source pixels
//! a destination rectangle depends on, and which destination pixels a
//! source rectangle influences. [`GeometryMapper`] captures the three shapes
//! those answers take in this crate.

use crate::core::types::{Padding, Rectangle};
use serde::{Deserialize, Serialize};

/// Grow a destination rectangle by the padding an area operator needs.
///
/// No clamping: the result may extend past the source bounds.
pub fn map_dest_to_source(dest: &Rectangle, padding: &Padding) -> Rectangle {
    Rectangle::new(
        dest.x - padding.left,
        dest.y - padding.top,
        dest.width + padding.left + padding.right,
        dest.height + padding.top + padding.bottom,
    )
}

/// Inverse of [`map_dest_to_source`]. Width and height may go negative for
/// sources smaller than the padding; callers clamp.
pub fn map_source_to_dest(source: &Rectangle, padding: &Padding) -> Rectangle {
    Rectangle::new(
        source.x + padding.left,
        source.y + padding.top,
        source.width - padding.left - padding.right,
        source.height - padding.top - padding.bottom,
    )
}

/// How a node relates its own pixels to its sources' pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeometryMapper {
    /// Each destination pixel depends on a padded window of source pixels.
    Padded(Padding),
    /// Every destination pixel depends on the entire source.
    Whole {
        dest_bounds: Rectangle,
        source_bounds: Rectangle,
    },
    /// Destination and source coordinates coincide.
    Identity,
}

impl GeometryMapper {
    /// Source rectangle needed to compute `dest`.
    pub fn dest_to_source(&self, dest: &Rectangle) -> Rectangle {
        match self {
            GeometryMapper::Padded(padding) => map_dest_to_source(dest, padding),
            GeometryMapper::Whole { source_bounds, .. } => *source_bounds,
            GeometryMapper::Identity => *dest,
        }
    }

    /// Destination rectangle influenced by `source`.
    pub fn source_to_dest(&self, source: &Rectangle) -> Rectangle {
        match self {
            GeometryMapper::Padded(padding) => map_source_to_dest(source, padding),
            GeometryMapper::Whole { dest_bounds, .. } => *dest_bounds,
            GeometryMapper::Identity => *source,
        }
    }

    /// Padding for padded mappers, zero otherwise.
    pub fn padding(&self) -> Padding {
        match self {
            GeometryMapper::Padded(padding) => *padding,
            _ => Padding::none(),
        }
    }
}
