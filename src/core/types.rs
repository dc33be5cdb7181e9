//! Value types shared by every layer: rectangles, tile addresses, padding,
//! sample types and the tile-grid layout of an image.

use crate::core::error::{TileError, TileResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// An integer rectangle on the pixel grid.
///
/// Width or height ≤ 0 means the rectangle is empty ("nothing to compute").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rectangle {
    /// Left edge (inclusive).
    pub x: i32,
    /// Top edge (inclusive).
    pub y: i32,
    /// Width in pixels.
    pub width: i32,
    /// Height in pixels.
    pub height: i32,
}

impl Rectangle {
    /// Create a new rectangle.
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// Get the right edge coordinate (exclusive).
    pub fn max_x(&self) -> i32 {
        self.x + self.width
    }

    /// Get the bottom edge coordinate (exclusive).
    pub fn max_y(&self) -> i32 {
        self.y + self.height
    }

    /// Whether this rectangle covers no pixels.
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Number of pixels covered (0 for empty rectangles).
    pub fn area(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.width as u64 * self.height as u64
        }
    }

    /// Same origin, negative sizes clamped to zero.
    pub fn clamped(&self) -> Self {
        Self::new(self.x, self.y, self.width.max(0), self.height.max(0))
    }

    /// The overlap of two rectangles. Empty overlaps keep a zero size.
    pub fn intersection(&self, other: &Rectangle) -> Rectangle {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.max_x().min(other.max_x());
        let y1 = self.max_y().min(other.max_y());
        Rectangle::new(x0, y0, (x1 - x0).max(0), (y1 - y0).max(0))
    }

    /// Smallest rectangle containing both. Empty inputs are ignored.
    pub fn union(&self, other: &Rectangle) -> Rectangle {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x0 = self.x.min(other.x);
        let y0 = self.y.min(other.y);
        let x1 = self.max_x().max(other.max_x());
        let y1 = self.max_y().max(other.max_y());
        Rectangle::new(x0, y0, x1 - x0, y1 - y0)
    }

    /// Whether the two rectangles share at least one pixel.
    pub fn intersects(&self, other: &Rectangle) -> bool {
        !self.intersection(other).is_empty()
    }

    /// Whether `other` lies entirely inside this rectangle.
    pub fn contains_rect(&self, other: &Rectangle) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.max_x() <= self.max_x()
            && other.max_y() <= self.max_y()
    }

    /// Whether the pixel `(x, y)` lies inside this rectangle.
    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.x && y >= self.y && x < self.max_x() && y < self.max_y()
    }
}

impl fmt::Display for Rectangle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {} {}x{}]", self.x, self.y, self.width, self.height)
    }
}

/// Identifies one tile of one image for the lifetime of that image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileAddress {
    /// Id of the owning image.
    pub owner_id: u64,
    /// Tile column.
    pub tile_x: i32,
    /// Tile row.
    pub tile_y: i32,
}

impl TileAddress {
    /// Create a new tile address.
    pub const fn new(owner_id: u64, tile_x: i32, tile_y: i32) -> Self {
        Self { owner_id, tile_x, tile_y }
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}({}, {})", self.owner_id, self.tile_x, self.tile_y)
    }
}

/// Extra source pixels an area operator needs around each destination pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Padding {
    /// Pixels needed to the left.
    pub left: i32,
    /// Pixels needed to the right.
    pub right: i32,
    /// Pixels needed above.
    pub top: i32,
    /// Pixels needed below.
    pub bottom: i32,
}

impl Padding {
    /// Create an asymmetric padding. Every side must be non-negative.
    pub fn new(left: i32, right: i32, top: i32, bottom: i32) -> TileResult<Self> {
        if left < 0 || right < 0 || top < 0 || bottom < 0 {
            return Err(TileError::invalid_argument(format!(
                "padding must be non-negative, got left={left} right={right} top={top} bottom={bottom}"
            )));
        }
        Ok(Self { left, right, top, bottom })
    }

    /// Same padding on all sides.
    pub fn symmetric(radius: u16) -> Self {
        let r = radius as i32;
        Self { left: r, right: r, top: r, bottom: r }
    }

    /// No padding: a point operator.
    pub const fn none() -> Self {
        Self { left: 0, right: 0, top: 0, bottom: 0 }
    }

    /// Whether any side is non-zero.
    pub fn needs_overlap(&self) -> bool {
        self.left > 0 || self.right > 0 || self.top > 0 || self.bottom > 0
    }

    /// Combine with another padding (take maximum of each side).
    pub fn combine(&self, other: &Padding) -> Padding {
        Padding {
            left: self.left.max(other.left),
            right: self.right.max(other.right),
            top: self.top.max(other.top),
            bottom: self.bottom.max(other.bottom),
        }
    }
}

/// Storage type of a single sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleType {
    /// Unsigned 8-bit.
    U8,
    /// Unsigned 16-bit.
    U16,
    /// Signed 16-bit.
    S16,
    /// Signed 32-bit.
    S32,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl SampleType {
    /// Size of one sample in bytes.
    pub fn bytes(&self) -> usize {
        match self {
            SampleType::U8 => 1,
            SampleType::U16 | SampleType::S16 => 2,
            SampleType::S32 | SampleType::F32 => 4,
            SampleType::F64 => 8,
        }
    }

    /// Whether samples are integers.
    pub fn is_integral(&self) -> bool {
        !matches!(self, SampleType::F32 | SampleType::F64)
    }

    /// Representable range of the type.
    pub fn range(&self) -> (f64, f64) {
        match self {
            SampleType::U8 => (0.0, u8::MAX as f64),
            SampleType::U16 => (0.0, u16::MAX as f64),
            SampleType::S16 => (i16::MIN as f64, i16::MAX as f64),
            SampleType::S32 => (i32::MIN as f64, i32::MAX as f64),
            SampleType::F32 => (f32::MIN as f64, f32::MAX as f64),
            SampleType::F64 => (f64::MIN, f64::MAX),
        }
    }
}

/// Position, tiling and sample format of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLayout {
    /// Pixel bounds of the image.
    pub bounds: Rectangle,
    /// Tile width in pixels.
    pub tile_width: i32,
    /// Tile height in pixels.
    pub tile_height: i32,
    /// X coordinate of the origin of tile column 0.
    pub tile_grid_x_offset: i32,
    /// Y coordinate of the origin of tile row 0.
    pub tile_grid_y_offset: i32,
    /// Samples per pixel.
    pub bands: usize,
    /// Sample storage type.
    pub sample_type: SampleType,
}

impl ImageLayout {
    /// Create a layout whose tile grid starts at the bounds origin.
    pub fn new(
        bounds: Rectangle,
        tile_width: i32,
        tile_height: i32,
        bands: usize,
        sample_type: SampleType,
    ) -> TileResult<Self> {
        let layout = Self {
            bounds,
            tile_width,
            tile_height,
            tile_grid_x_offset: bounds.x,
            tile_grid_y_offset: bounds.y,
            bands,
            sample_type,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Move the tile grid origin.
    pub fn with_grid_offset(mut self, x_offset: i32, y_offset: i32) -> Self {
        self.tile_grid_x_offset = x_offset;
        self.tile_grid_y_offset = y_offset;
        self
    }

    /// Check the structural invariants of the layout.
    pub fn validate(&self) -> TileResult<()> {
        if self.tile_width <= 0 || self.tile_height <= 0 {
            return Err(TileError::invalid_argument(format!(
                "tile size must be positive, got {}x{}",
                self.tile_width, self.tile_height
            )));
        }
        if self.bands == 0 {
            return Err(TileError::invalid_argument("an image needs at least one band"));
        }
        if self.bounds.width < 0 || self.bounds.height < 0 {
            return Err(TileError::invalid_argument(format!(
                "image bounds must have non-negative size, got {}",
                self.bounds
            )));
        }
        Ok(())
    }

    /// Tile column containing pixel column `x`.
    pub fn x_to_tile_x(&self, x: i32) -> i32 {
        (x - self.tile_grid_x_offset).div_euclid(self.tile_width)
    }

    /// Tile row containing pixel row `y`.
    pub fn y_to_tile_y(&self, y: i32) -> i32 {
        (y - self.tile_grid_y_offset).div_euclid(self.tile_height)
    }

    /// Left pixel column of tile column `tile_x`.
    pub fn tile_x_to_x(&self, tile_x: i32) -> i32 {
        tile_x * self.tile_width + self.tile_grid_x_offset
    }

    /// Top pixel row of tile row `tile_y`.
    pub fn tile_y_to_y(&self, tile_y: i32) -> i32 {
        tile_y * self.tile_height + self.tile_grid_y_offset
    }

    pub fn min_tile_x(&self) -> i32 {
        self.x_to_tile_x(self.bounds.x)
    }

    pub fn max_tile_x(&self) -> i32 {
        self.x_to_tile_x(self.bounds.max_x() - 1)
    }

    pub fn min_tile_y(&self) -> i32 {
        self.y_to_tile_y(self.bounds.y)
    }

    pub fn max_tile_y(&self) -> i32 {
        self.y_to_tile_y(self.bounds.max_y() - 1)
    }

    /// Number of tile columns (0 for empty images).
    pub fn num_x_tiles(&self) -> i32 {
        if self.bounds.is_empty() {
            0
        } else {
            self.max_tile_x() - self.min_tile_x() + 1
        }
    }

    /// Number of tile rows (0 for empty images).
    pub fn num_y_tiles(&self) -> i32 {
        if self.bounds.is_empty() {
            0
        } else {
            self.max_tile_y() - self.min_tile_y() + 1
        }
    }

    /// Whether `(tile_x, tile_y)` is a tile of this image.
    pub fn contains_tile(&self, tile_x: i32, tile_y: i32) -> bool {
        !self.bounds.is_empty()
            && tile_x >= self.min_tile_x()
            && tile_x <= self.max_tile_x()
            && tile_y >= self.min_tile_y()
            && tile_y <= self.max_tile_y()
    }

    /// Fail with `InvalidIndex` unless `(tile_x, tile_y)` is a tile of this image.
    pub fn check_tile(&self, tile_x: i32, tile_y: i32) -> TileResult<()> {
        if self.contains_tile(tile_x, tile_y) {
            Ok(())
        } else {
            Err(TileError::invalid_index(format!(
                "tile ({tile_x}, {tile_y}) outside grid x∈[{}, {}] y∈[{}, {}]",
                self.min_tile_x(),
                self.max_tile_x(),
                self.min_tile_y(),
                self.max_tile_y()
            )))
        }
    }

    /// Full grid cell of a tile; may extend past the image bounds.
    pub fn tile_cell(&self, tile_x: i32, tile_y: i32) -> Rectangle {
        Rectangle::new(
            self.tile_x_to_x(tile_x),
            self.tile_y_to_y(tile_y),
            self.tile_width,
            self.tile_height,
        )
    }

    /// Grid cell of a tile clipped to the image bounds.
    pub fn tile_rect(&self, tile_x: i32, tile_y: i32) -> Rectangle {
        self.tile_cell(tile_x, tile_y).intersection(&self.bounds)
    }

    /// Indices of every tile, row-major.
    pub fn all_tiles(&self) -> Vec<(i32, i32)> {
        self.tiles_intersecting(&self.bounds)
    }

    /// Indices of tiles overlapping `rect ∩ bounds`, row-major.
    pub fn tiles_intersecting(&self, rect: &Rectangle) -> Vec<(i32, i32)> {
        let clipped = rect.intersection(&self.bounds);
        if clipped.is_empty() {
            return Vec::new();
        }
        let (tx0, tx1) = (self.x_to_tile_x(clipped.x), self.x_to_tile_x(clipped.max_x() - 1));
        let (ty0, ty1) = (self.y_to_tile_y(clipped.y), self.y_to_tile_y(clipped.max_y() - 1));
        let mut tiles = Vec::with_capacity(((tx1 - tx0 + 1) * (ty1 - ty0 + 1)) as usize);
        for ty in ty0..=ty1 {
            for tx in tx0..=tx1 {
                tiles.push((tx, ty));
            }
        }
        tiles
    }

    /// Tile column boundaries strictly inside `rect`.
    pub fn x_splits(&self, rect: &Rectangle) -> BTreeSet<i32> {
        let mut splits = BTreeSet::new();
        if rect.is_empty() {
            return splits;
        }
        let mut tx = self.x_to_tile_x(rect.x) + 1;
        while self.tile_x_to_x(tx) < rect.max_x() {
            splits.insert(self.tile_x_to_x(tx));
            tx += 1;
        }
        splits
    }

    /// Tile row boundaries strictly inside `rect`.
    pub fn y_splits(&self, rect: &Rectangle) -> BTreeSet<i32> {
        let mut splits = BTreeSet::new();
        if rect.is_empty() {
            return splits;
        }
        let mut ty = self.y_to_tile_y(rect.y) + 1;
        while self.tile_y_to_y(ty) < rect.max_y() {
            splits.insert(self.tile_y_to_y(ty));
            ty += 1;
        }
        splits
    }

    /// Bytes of one full tile.
    pub fn tile_memory_size(&self) -> usize {
        self.tile_width as usize * self.tile_height as usize * self.bands * self.sample_type.bytes()
    }
}
