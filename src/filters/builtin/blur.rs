//! Box blur.

use crate::core::error::{TileError, TileResult};
use crate::core::raster::Raster;
use crate::core::types::{Padding, Rectangle};
use crate::filters::registry::{single_source, Category, OperatorInfo, OperatorRegistry};
use crate::graph::kernel::AreaKernel;
use crate::graph::node::ImageNode;
use anyhow::anyhow;
use std::sync::Arc;

/// Register blur operators.
pub fn register(registry: &mut OperatorRegistry) {
    registry.register(
        OperatorInfo::new("box_blur", "Box Blur", Category::Area)
            .description("Replace each pixel by the mean of its window")
            .parameter("radius", "Radius in both directions (default 1)")
            .parameter("radius_x", "Horizontal radius (default radius)")
            .parameter("radius_y", "Vertical radius (default radius)")
            .parameter("border", "zero, copy, reflect or constant:<v>,... (default none)"),
        |env, sources, params| {
            let source = single_source("box_blur", sources)?;
            let radius = params.get_i32_at_least("radius", 1, 0)?;
            let kernel = BoxBlur::new(
                params.get_i32_at_least("radius_x", radius, 0)?,
                params.get_i32_at_least("radius_y", radius, 0)?,
            )?;
            ImageNode::area(env, "box_blur", Arc::clone(source), Arc::new(kernel), params.border()?, None)
        },
    );
}

/// Mean over a `(2 * radius_x + 1) x (2 * radius_y + 1)` window.
///
/// Computed separably: a horizontal pass over the padded rows, then a
/// vertical pass over those sums. Integer outputs are rounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxBlur {
    radius_x: i32,
    radius_y: i32,
}

impl BoxBlur {
    pub fn new(radius_x: i32, radius_y: i32) -> TileResult<Self> {
        if radius_x < 0 || radius_y < 0 {
            return Err(TileError::invalid_argument(format!(
                "blur radius must be non-negative, got {radius_x}x{radius_y}"
            )));
        }
        Ok(Self { radius_x, radius_y })
    }

    pub fn radius_x(&self) -> i32 {
        self.radius_x
    }

    pub fn radius_y(&self) -> i32 {
        self.radius_y
    }
}

impl AreaKernel for BoxBlur {
    fn name(&self) -> &str {
        "box_blur"
    }

    fn padding(&self) -> Padding {
        Padding {
            left: self.radius_x,
            right: self.radius_x,
            top: self.radius_y,
            bottom: self.radius_y,
        }
    }

    fn compute_rect(&self, sources: &[&Raster], dest: &mut Raster, dest_rect: &Rectangle) -> anyhow::Result<()> {
        let src = sources.first().ok_or_else(|| anyhow!("box blur needs a source"))?;
        let (rx, ry) = (self.radius_x, self.radius_y);
        let width = dest_rect.width as usize;
        let rows = (dest_rect.height + 2 * ry) as usize;
        let window = ((2 * rx + 1) * (2 * ry + 1)) as f64;
        let mut horizontal = vec![0.0; width * rows];

        for band in 0..dest.bands() {
            for (row, y) in (dest_rect.y - ry..dest_rect.max_y() + ry).enumerate() {
                for (col, x) in (dest_rect.x..dest_rect.max_x()).enumerate() {
                    horizontal[row * width + col] = (x - rx..=x + rx).map(|sx| src.get(sx, y, band)).sum();
                }
            }
            for (row, y) in (dest_rect.y..dest_rect.max_y()).enumerate() {
                for (col, x) in (dest_rect.x..dest_rect.max_x()).enumerate() {
                    let sum: f64 = (row..=row + 2 * ry as usize).map(|r| horizontal[r * width + col]).sum();
                    dest.set(x, y, band, sum / window);
                }
            }
        }
        Ok(())
    }
}
