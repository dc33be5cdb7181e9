//! Leaf tile providers.
//!
//! A provider hands out ready-made tiles. Source nodes wrap one and serve
//! its tiles directly, without going through the cache.

use crate::core::error::{TileError, TileResult};
use crate::core::raster::{Raster, TileBuffer};
use crate::core::types::{ImageLayout, Rectangle};

/// Something that already has tiles: an in-memory image, a writable image
/// or a frozen snapshot of one.
pub trait TileProvider: Send + Sync {
    /// Layout of the provided image.
    fn layout(&self) -> ImageLayout;

    /// The tile at `(tile_x, tile_y)`, covering its full grid cell.
    fn tile(&self, tile_x: i32, tile_y: i32) -> TileResult<TileBuffer>;
}

/// An immutable in-memory image, pre-split into tiles.
#[derive(Debug, Clone)]
pub struct StaticImage {
    layout: ImageLayout,
    tiles: Vec<TileBuffer>,
}

impl StaticImage {
    /// Split `raster` into tiles of the given size. The tile grid starts at
    /// the raster origin; pixels of edge tiles beyond the raster are zero.
    pub fn new(raster: &Raster, tile_width: i32, tile_height: i32) -> TileResult<Self> {
        let bounds = raster.rect();
        if bounds.is_empty() {
            return Err(TileError::invalid_argument(format!("cannot tile an empty raster {bounds}")));
        }
        let layout = ImageLayout::new(bounds, tile_width, tile_height, raster.bands(), raster.sample_type())?;
        let tiles = layout
            .all_tiles()
            .into_iter()
            .map(|(tx, ty)| TileBuffer::new(raster.crop(&layout.tile_cell(tx, ty))))
            .collect();
        Ok(Self { layout, tiles })
    }

    /// The full image as one raster.
    pub fn to_raster(&self) -> Raster {
        let mut raster = Raster::new(self.layout.bounds, self.layout.bands, self.layout.sample_type);
        for tile in &self.tiles {
            raster.copy_from(tile);
        }
        raster
    }

    pub fn bounds(&self) -> Rectangle {
        self.layout.bounds
    }
}

impl TileProvider for StaticImage {
    fn layout(&self) -> ImageLayout {
        self.layout
    }

    fn tile(&self, tile_x: i32, tile_y: i32) -> TileResult<TileBuffer> {
        self.layout.check_tile(tile_x, tile_y)?;
        let columns = self.layout.num_x_tiles();
        let index = (tile_y - self.layout.min_tile_y()) * columns + (tile_x - self.layout.min_tile_x());
        self.tiles
            .get(index as usize)
            .cloned()
            .ok_or_else(|| TileError::invalid_index(format!("tile ({tile_x}, {tile_y}) not stored")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SampleType;

    #[test]
    fn test_static_image_tiles() {
        let raster = Raster::from_fn(Rectangle::new(0, 0, 10, 6), 1, SampleType::U8, |x, y, _| (x + y * 10) as f64);
        let image = StaticImage::new(&raster, 4, 4).unwrap();
        let layout = image.layout();
        assert_eq!((layout.num_x_tiles(), layout.num_y_tiles()), (3, 2));

        let tile = image.tile(2, 1).unwrap();
        assert_eq!(tile.rect(), Rectangle::new(8, 4, 4, 4));
        assert_eq!(tile.get(9, 5, 0), 59.0);
        assert_eq!(tile.get(11, 7, 0), 0.0);

        assert!(matches!(image.tile(3, 0), Err(TileError::InvalidIndex(_))));
        assert_eq!(image.to_raster(), raster);
    }

    #[test]
    fn test_empty_raster_rejected() {
        let raster = Raster::new(Rectangle::new(0, 0, 0, 5), 1, SampleType::U8);
        assert!(StaticImage::new(&raster, 4, 4).is_err());
    }
}
