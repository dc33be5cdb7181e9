//! Rank filters.

use crate::core::error::{TileError, TileResult};
use crate::core::raster::Raster;
use crate::core::types::{Padding, Rectangle};
use crate::filters::registry::{single_source, Category, OperatorInfo, OperatorRegistry};
use crate::graph::kernel::AreaKernel;
use crate::graph::node::ImageNode;
use anyhow::anyhow;
use std::sync::Arc;

/// Register rank operators.
pub fn register(registry: &mut OperatorRegistry) {
    registry.register(
        OperatorInfo::new("max_filter", "Maximum", Category::Area)
            .description("Replace each pixel by the largest value in its square window")
            .parameter("radius", "Window radius (default 1)")
            .parameter("border", "zero, copy, reflect or constant:<v>,... (default none)"),
        |env, sources, params| {
            let source = single_source("max_filter", sources)?;
            let kernel = MaxFilter::new(params.get_i32_at_least("radius", 1, 0)?)?;
            ImageNode::area(env, "max_filter", Arc::clone(source), Arc::new(kernel), params.border()?, None)
        },
    );
}

/// Maximum over a square window of side `2 * radius + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxFilter {
    radius: i32,
}

impl MaxFilter {
    pub fn new(radius: i32) -> TileResult<Self> {
        if radius < 0 {
            return Err(TileError::invalid_argument(format!("radius must be non-negative, got {radius}")));
        }
        Ok(Self { radius })
    }
}

impl AreaKernel for MaxFilter {
    fn name(&self) -> &str {
        "max_filter"
    }

    fn padding(&self) -> Padding {
        Padding {
            left: self.radius,
            right: self.radius,
            top: self.radius,
            bottom: self.radius,
        }
    }

    fn compute_rect(&self, sources: &[&Raster], dest: &mut Raster, dest_rect: &Rectangle) -> anyhow::Result<()> {
        let src = sources.first().ok_or_else(|| anyhow!("max filter needs a source"))?;
        let r = self.radius;
        for band in 0..dest.bands() {
            for y in dest_rect.y..dest_rect.max_y() {
                for x in dest_rect.x..dest_rect.max_x() {
                    let mut max = f64::NEG_INFINITY;
                    for sy in y - r..=y + r {
                        for sx in x - r..=x + r {
                            max = max.max(src.get(sx, sy, band));
                        }
                    }
                    dest.set(x, y, band, max);
                }
            }
        }
        Ok(())
    }
}
