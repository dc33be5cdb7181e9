//! Untiled operators.
//!
//! Global transforms whose every output pixel may depend on every input
//! pixel. The node has a single tile covering its bounds, computed once from
//! the complete sources.

use crate::core::error::{TileError, TileResult};
use crate::core::raster::{Raster, TileBuffer};
use crate::core::types::{ImageLayout, Rectangle};
use crate::graph::environment::Environment;
use crate::graph::kernel::UntiledKernel;
use crate::graph::node::{ImageNode, OperatorKind};
use log::debug;
use std::sync::Arc;

/// Configuration of an untiled node.
pub struct UntiledOp {
    kernel: Arc<dyn UntiledKernel>,
}

impl UntiledOp {
    pub fn kernel(&self) -> &Arc<dyn UntiledKernel> {
        &self.kernel
    }

    pub(crate) fn compute_tile(&self, node: &ImageNode, tile_x: i32, tile_y: i32) -> TileResult<TileBuffer> {
        let layout = node.layout();
        let bounds = layout.bounds;
        debug!(
            "Computing untiled '{}' over {} from {} sources",
            node.name(),
            bounds,
            node.num_sources()
        );

        let sources = node
            .sources()
            .iter()
            .map(|source| source.get_data(&source.bounds()))
            .collect::<TileResult<Vec<Raster>>>()?;
        let refs: Vec<&Raster> = sources.iter().collect();

        let mut dest = Raster::new(bounds, layout.bands, layout.sample_type);
        self.kernel
            .compute_image(&refs, &mut dest, &bounds)
            .map_err(|e| TileError::computation_failed(node.id(), tile_x, tile_y, format!("{}: {e:#}", self.kernel.name())))?;
        Ok(TileBuffer::new(dest))
    }
}

impl ImageNode {
    /// Build an untiled node over one or more sources.
    ///
    /// The node covers `bounds`, or the first source's bounds by default,
    /// with a single tile anchored at the bounds origin.
    pub fn untiled(
        env: &Environment,
        name: impl Into<String>,
        sources: Vec<Arc<ImageNode>>,
        kernel: Arc<dyn UntiledKernel>,
        bounds: Option<Rectangle>,
    ) -> TileResult<Arc<ImageNode>> {
        let first = sources
            .first()
            .ok_or_else(|| TileError::invalid_argument("an untiled operator needs at least one source"))?;
        let bounds = bounds.unwrap_or_else(|| first.bounds());
        if bounds.is_empty() {
            return Err(TileError::invalid_argument(format!("untiled bounds {bounds} are empty")));
        }
        let source_layout = first.layout();
        let layout = ImageLayout::new(
            bounds,
            bounds.width,
            bounds.height,
            source_layout.bands,
            kernel.output_sample_type(source_layout.sample_type),
        )?;
        Ok(ImageNode::build(env, name, layout, sources, OperatorKind::Untiled(UntiledOp { kernel })))
    }
}
