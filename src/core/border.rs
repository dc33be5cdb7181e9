//! Border extension.
//!
//! Area operators near an image edge need pixels that do not exist. A
//! [`BorderPolicy`] synthesizes them from the source: a constant, the
//! nearest edge pixel, or a mirror image of the source plane.
//!
//! `extend` only ever writes the part of the raster lying outside the
//! source bounds. Callers copy the in-bounds pixels themselves.

use crate::core::error::{TileError, TileResult};
use crate::core::raster::{Raster, RasterSource};
use crate::core::types::Rectangle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How pixels outside a source's bounds are synthesized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BorderPolicy {
    /// Per-band constants; a single value applies to every band.
    Constant(Vec<f64>),
    /// Replicate the nearest edge pixel.
    Copy,
    /// Mirror the source across its edges, repeatedly.
    Reflect,
}

impl Default for BorderPolicy {
    fn default() -> Self {
        BorderPolicy::zero()
    }
}

impl BorderPolicy {
    /// Constant zero border.
    pub fn zero() -> Self {
        BorderPolicy::Constant(vec![0.0])
    }

    /// Fill the part of `raster` outside `source.bounds()`.
    pub fn extend(&self, raster: &mut Raster, source: &dyn RasterSource) -> TileResult<()> {
        let bounds = source.bounds();
        let rect = raster.rect();
        if rect.is_empty() || bounds.contains_rect(&rect) {
            return Ok(());
        }

        match self {
            BorderPolicy::Constant(constants) => extend_constant(raster, &bounds, constants),
            BorderPolicy::Copy => extend_copy(raster, source, &bounds),
            BorderPolicy::Reflect => extend_reflect(raster, source, &bounds),
        }
    }
}

/// Pieces of `rect` outside `bounds`, without overlap.
fn complement(rect: &Rectangle, bounds: &Rectangle) -> Vec<Rectangle> {
    let inner = rect.intersection(bounds);
    if inner.is_empty() {
        return vec![*rect];
    }
    let pieces = [
        Rectangle::new(rect.x, rect.y, rect.width, inner.y - rect.y),
        Rectangle::new(rect.x, inner.max_y(), rect.width, rect.max_y() - inner.max_y()),
        Rectangle::new(rect.x, inner.y, inner.x - rect.x, inner.height),
        Rectangle::new(inner.max_x(), inner.y, rect.max_x() - inner.max_x(), inner.height),
    ];
    pieces.into_iter().filter(|piece| !piece.is_empty()).collect()
}

fn extend_constant(raster: &mut Raster, bounds: &Rectangle, constants: &[f64]) -> TileResult<()> {
    if constants.len() != 1 && constants.len() < raster.bands() {
        return Err(TileError::unsupported(format!(
            "constant border has {} values for {} bands",
            constants.len(),
            raster.bands()
        )));
    }
    for piece in complement(&raster.rect(), bounds) {
        raster.fill(&piece, constants);
    }
    Ok(())
}

fn non_empty_source(bounds: &Rectangle) -> TileResult<()> {
    if bounds.is_empty() {
        return Err(TileError::invalid_argument(format!(
            "cannot extend from a source with empty bounds {bounds}"
        )));
    }
    Ok(())
}

fn extend_copy(raster: &mut Raster, source: &dyn RasterSource, bounds: &Rectangle) -> TileResult<()> {
    non_empty_source(bounds)?;
    let rect = raster.rect();

    // The source pixels any output pixel can map to: the raster clamped
    // onto the source. Far-away rasters collapse onto an edge or corner.
    let clamp_x = |x: i32| x.clamp(bounds.x, bounds.max_x() - 1);
    let clamp_y = |y: i32| y.clamp(bounds.y, bounds.max_y() - 1);
    let (x0, x1) = (clamp_x(rect.x), clamp_x(rect.max_x() - 1));
    let (y0, y1) = (clamp_y(rect.y), clamp_y(rect.max_y() - 1));
    let mut edge = Raster::new(Rectangle::new(x0, y0, x1 - x0 + 1, y1 - y0 + 1), raster.bands(), raster.sample_type());
    source.copy_into(&mut edge)?;

    let bands = raster.bands();
    for piece in complement(&rect, bounds) {
        for y in piece.y..piece.max_y() {
            let sy = clamp_y(y);
            for x in piece.x..piece.max_x() {
                let sx = clamp_x(x);
                for b in 0..bands {
                    raster.set(x, y, b, edge.get(sx, sy, b));
                }
            }
        }
    }
    Ok(())
}

fn extend_reflect(raster: &mut Raster, source: &dyn RasterSource, bounds: &Rectangle) -> TileResult<()> {
    non_empty_source(bounds)?;
    let rect = raster.rect();
    let (w, h) = (bounds.width, bounds.height);

    let tile_x0 = (rect.x - bounds.x).div_euclid(w);
    let tile_x1 = (rect.max_x() - 1 - bounds.x).div_euclid(w);
    let tile_y0 = (rect.y - bounds.y).div_euclid(h);
    let tile_y1 = (rect.max_y() - 1 - bounds.y).div_euclid(h);

    for j in tile_y0..=tile_y1 {
        for i in tile_x0..=tile_x1 {
            if i == 0 && j == 0 {
                continue;
            }
            let cell = Rectangle::new(bounds.x + i * w, bounds.y + j * h, w, h);
            let area = cell.intersection(&rect);
            if area.is_empty() {
                continue;
            }
            let (flip_x, flip_y) = (i.rem_euclid(2) == 1, j.rem_euclid(2) == 1);

            let src_x = if flip_x {
                bounds.x + w - (area.max_x() - cell.x)
            } else {
                bounds.x + (area.x - cell.x)
            };
            let src_y = if flip_y {
                bounds.y + h - (area.max_y() - cell.y)
            } else {
                bounds.y + (area.y - cell.y)
            };
            let src_rect = Rectangle::new(src_x, src_y, area.width, area.height);

            let mut mirrored = Raster::new(src_rect, raster.bands(), raster.sample_type());
            source.copy_into(&mut mirrored)?;
            if flip_x {
                mirrored.flip_x(&src_rect);
            }
            if flip_y {
                mirrored.flip_y(&src_rect);
            }
            raster.copy_from_translated(&mirrored, area.x - src_rect.x, area.y - src_rect.y);
        }
    }
    Ok(())
}

impl fmt::Display for BorderPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BorderPolicy::Constant(values) if values.len() == 1 && values[0] == 0.0 => write!(f, "zero"),
            BorderPolicy::Constant(values) => {
                let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "constant:{}", values.join(","))
            }
            BorderPolicy::Copy => write!(f, "copy"),
            BorderPolicy::Reflect => write!(f, "reflect"),
        }
    }
}

impl FromStr for BorderPolicy {
    type Err = TileError;

    /// Parse `zero`, `copy`, `reflect` or `constant:<v>[,<v>...]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "zero" => return Ok(BorderPolicy::zero()),
            "copy" => return Ok(BorderPolicy::Copy),
            "reflect" => return Ok(BorderPolicy::Reflect),
            _ => {}
        }
        let values = s
            .strip_prefix("constant:")
            .ok_or_else(|| TileError::invalid_argument(format!("unknown border policy '{s}'")))?;
        let constants = values
            .split(',')
            .map(|v| {
                v.trim()
                    .parse::<f64>()
                    .map_err(|e| TileError::invalid_argument(format!("bad border constant '{v}': {e}")))
            })
            .collect::<TileResult<Vec<f64>>>()?;
        Ok(BorderPolicy::Constant(constants))
    }
}
