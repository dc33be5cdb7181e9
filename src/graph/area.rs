//! Area operators.
//!
//! Each destination pixel depends on a padded window of source pixels.
//! Without a border policy the computable region shrinks by the padding and
//! the uncomputable rim stays zero. With one, windows reaching past the
//! source are completed by the policy.

use crate::core::border::BorderPolicy;
use crate::core::error::{TileError, TileResult};
use crate::core::geometry::{map_dest_to_source, map_source_to_dest};
use crate::core::raster::{Raster, TileBuffer};
use crate::core::types::{ImageLayout, Padding, Rectangle};
use crate::graph::environment::Environment;
use crate::graph::kernel::AreaKernel;
use crate::graph::node::{ImageNode, OperatorKind};
use log::trace;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Configuration of an area node.
pub struct AreaOp {
    padding: Padding,
    border: Option<BorderPolicy>,
    kernel: Arc<dyn AreaKernel>,
    dest_region: Rectangle,
}

impl AreaOp {
    pub fn padding(&self) -> Padding {
        self.padding
    }

    pub fn border(&self) -> Option<&BorderPolicy> {
        self.border.as_ref()
    }

    pub fn kernel(&self) -> &Arc<dyn AreaKernel> {
        &self.kernel
    }

    /// Part of the node's bounds that can actually be computed.
    pub fn dest_region(&self) -> Rectangle {
        self.dest_region
    }

    pub(crate) fn compute_tile(&self, node: &ImageNode, tile_x: i32, tile_y: i32) -> TileResult<TileBuffer> {
        let layout = node.layout();
        let cell = layout.tile_cell(tile_x, tile_y);
        let mut dest = Raster::new(cell, layout.bands, layout.sample_type);

        let region = cell.intersection(&self.dest_region);
        if region.is_empty() {
            return Ok(TileBuffer::new(dest));
        }

        let source = node.source_at(0)?;
        let pieces = self.split(source.layout(), &region);
        trace!(
            "Area tile ({tile_x}, {tile_y}) of '{}' in {} pieces",
            node.name(),
            pieces.len()
        );

        for piece in pieces {
            let needed = map_dest_to_source(&piece, &self.padding);
            let data = match &self.border {
                Some(border) => source.get_extended_data(&needed, border)?,
                None => source.get_data(&needed)?,
            };
            self.kernel
                .compute_rect(&[&data], &mut dest, &piece)
                .map_err(|e| TileError::computation_failed(node.id(), tile_x, tile_y, format!("{}: {e:#}", self.kernel.name())))?;
        }
        Ok(TileBuffer::new(dest))
    }

    /// Cut `region` wherever a destination column or row starts or stops
    /// needing a different source tile.
    fn split(&self, source_layout: &ImageLayout, region: &Rectangle) -> Vec<Rectangle> {
        let footprint = map_dest_to_source(region, &self.padding);
        let inside = |v: &i32, lo: i32, hi: i32| *v > lo && *v < hi;

        let mut xs: BTreeSet<i32> = BTreeSet::new();
        for boundary in source_layout.x_splits(&footprint) {
            xs.insert(boundary - self.padding.right);
            xs.insert(boundary + self.padding.left);
        }
        xs.retain(|x| inside(x, region.x, region.max_x()));

        let mut ys: BTreeSet<i32> = BTreeSet::new();
        for boundary in source_layout.y_splits(&footprint) {
            ys.insert(boundary - self.padding.bottom);
            ys.insert(boundary + self.padding.top);
        }
        ys.retain(|y| inside(y, region.y, region.max_y()));

        let edges = |start: i32, end: i32, cuts: &BTreeSet<i32>| {
            let mut edges = Vec::with_capacity(cuts.len() + 2);
            edges.push(start);
            edges.extend(cuts.iter().copied());
            edges.push(end);
            edges
        };
        let x_edges = edges(region.x, region.max_x(), &xs);
        let y_edges = edges(region.y, region.max_y(), &ys);

        let mut pieces = Vec::with_capacity((x_edges.len() - 1) * (y_edges.len() - 1));
        for ys in y_edges.windows(2) {
            for xs in x_edges.windows(2) {
                pieces.push(Rectangle::new(xs[0], ys[0], xs[1] - xs[0], ys[1] - ys[0]));
            }
        }
        pieces
    }
}

impl ImageNode {
    /// Build an area node over `source`.
    ///
    /// By default the node shares the source's bounds and tile grid. A
    /// custom `layout` must overlap the source bounds.
    pub fn area(
        env: &Environment,
        name: impl Into<String>,
        source: Arc<ImageNode>,
        kernel: Arc<dyn AreaKernel>,
        border: Option<BorderPolicy>,
        layout: Option<ImageLayout>,
    ) -> TileResult<Arc<ImageNode>> {
        let padding = kernel.padding();
        let source_bounds = source.bounds();

        let layout = match layout {
            Some(layout) => {
                layout.validate()?;
                if !layout.bounds.intersects(&source_bounds) {
                    return Err(TileError::invalid_argument(format!(
                        "layout bounds {} do not intersect source bounds {}",
                        layout.bounds, source_bounds
                    )));
                }
                layout
            }
            None => {
                let mut layout = *source.layout();
                layout.sample_type = kernel.output_sample_type(layout.sample_type);
                layout
            }
        };

        let computable = match &border {
            Some(_) => source_bounds,
            None => map_source_to_dest(&source_bounds, &padding).clamped(),
        };
        let dest_region = layout.bounds.intersection(&computable);

        let op = AreaOp {
            padding,
            border,
            kernel,
            dest_region,
        };
        Ok(ImageNode::build(env, name, layout, vec![source], OperatorKind::Area(op)))
    }
}
