//! Writable tiled images.
//!
//! Tiles are changed through [`WritableTile`] handles. Checking out a tile
//! nobody holds tells the observers the tile is about to change; dropping
//! the last handle publishes the new contents and tells them it was
//! released.
//!
//! Lock order: writer table, then observers, then tile table.

use crate::core::error::{TileError, TileResult};
use crate::core::raster::{Raster, TileBuffer};
use crate::core::types::{ImageLayout, Rectangle};
use crate::graph::source::TileProvider;
use log::trace;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Hears about tiles of a [`WritableTiledImage`] being checked out and
/// released.
///
/// Callbacks run with the image's writer table locked: they must not check
/// out tiles of the same image.
pub trait TileObserver: Send + Sync {
    /// Called once when the observer is attached, with the tiles currently
    /// checked out.
    fn attached(&self, _checked_out: &[(i32, i32)]) {}

    /// The tile is about to be modified for the first time since it was
    /// last released.
    fn on_tile_about_to_change(&self, tile_x: i32, tile_y: i32);

    /// The last writer of the tile let go of it.
    fn on_tile_released(&self, tile_x: i32, tile_y: i32);
}

struct Checkout {
    holders: usize,
    working: Arc<Mutex<Raster>>,
}

/// A tiled image whose tiles can be rewritten in place.
pub struct WritableTiledImage {
    layout: ImageLayout,
    tiles: RwLock<HashMap<(i32, i32), TileBuffer>>,
    writers: Mutex<HashMap<(i32, i32), Checkout>>,
    observers: RwLock<Vec<Weak<dyn TileObserver>>>,
}

impl WritableTiledImage {
    /// A zero-filled image.
    pub fn new(layout: ImageLayout) -> TileResult<Self> {
        layout.validate()?;
        let tiles = layout
            .all_tiles()
            .into_iter()
            .map(|(tx, ty)| {
                let cell = layout.tile_cell(tx, ty);
                ((tx, ty), TileBuffer::new(Raster::new(cell, layout.bands, layout.sample_type)))
            })
            .collect();
        Ok(Self::with_tiles(layout, tiles))
    }

    /// An image initialized from `raster`, tiled from its origin.
    pub fn from_raster(raster: &Raster, tile_width: i32, tile_height: i32) -> TileResult<Self> {
        let bounds = raster.rect();
        if bounds.is_empty() {
            return Err(TileError::invalid_argument(format!("cannot tile an empty raster {bounds}")));
        }
        let layout = ImageLayout::new(bounds, tile_width, tile_height, raster.bands(), raster.sample_type())?;
        let tiles = layout
            .all_tiles()
            .into_iter()
            .map(|(tx, ty)| ((tx, ty), TileBuffer::new(raster.crop(&layout.tile_cell(tx, ty)))))
            .collect();
        Ok(Self::with_tiles(layout, tiles))
    }

    fn with_tiles(layout: ImageLayout, tiles: HashMap<(i32, i32), TileBuffer>) -> Self {
        Self {
            layout,
            tiles: RwLock::new(tiles),
            writers: Mutex::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    /// The current published contents of a tile.
    pub fn tile(&self, tile_x: i32, tile_y: i32) -> TileResult<TileBuffer> {
        self.layout.check_tile(tile_x, tile_y)?;
        self.tiles
            .read()
            .get(&(tile_x, tile_y))
            .cloned()
            .ok_or_else(|| TileError::invalid_index(format!("tile ({tile_x}, {tile_y}) not stored")))
    }

    /// Attach an observer. It is held weakly and dropped once gone.
    pub fn add_observer(&self, observer: Weak<dyn TileObserver>) {
        let writers = self.writers.lock();
        if let Some(strong) = observer.upgrade() {
            let checked_out: Vec<(i32, i32)> = writers.keys().copied().collect();
            strong.attached(&checked_out);
        }
        self.observers.write().push(observer);
    }

    fn live_observers(&self) -> Vec<Arc<dyn TileObserver>> {
        let observers = self.observers.read();
        let live: Vec<_> = observers.iter().filter_map(Weak::upgrade).collect();
        if live.len() != observers.len() {
            drop(observers);
            self.observers.write().retain(|o| o.strong_count() > 0);
        }
        live
    }

    /// Tiles with at least one writer.
    pub fn checked_out_tiles(&self) -> Vec<(i32, i32)> {
        self.writers.lock().keys().copied().collect()
    }

    pub fn is_checked_out(&self, tile_x: i32, tile_y: i32) -> bool {
        self.writers.lock().contains_key(&(tile_x, tile_y))
    }

    /// Get write access to a tile. Several handles to one tile share the
    /// same working raster.
    pub fn checkout(&self, tile_x: i32, tile_y: i32) -> TileResult<WritableTile<'_>> {
        self.layout.check_tile(tile_x, tile_y)?;
        let mut writers = self.writers.lock();
        let working = match writers.get_mut(&(tile_x, tile_y)) {
            Some(checkout) => {
                checkout.holders += 1;
                Arc::clone(&checkout.working)
            }
            None => {
                for observer in self.live_observers() {
                    observer.on_tile_about_to_change(tile_x, tile_y);
                }
                let current = self.tile(tile_x, tile_y)?;
                let working = Arc::new(Mutex::new(current.to_raster()));
                writers.insert(
                    (tile_x, tile_y),
                    Checkout {
                        holders: 1,
                        working: Arc::clone(&working),
                    },
                );
                trace!("Tile ({tile_x}, {tile_y}) checked out");
                working
            }
        };
        Ok(WritableTile {
            image: self,
            tile_x,
            tile_y,
            working,
        })
    }

    fn publish(&self, tile_x: i32, tile_y: i32, raster: Raster) {
        self.tiles.write().insert((tile_x, tile_y), TileBuffer::new(raster));
    }

    fn release(&self, tile_x: i32, tile_y: i32) {
        let mut writers = self.writers.lock();
        let last = match writers.get_mut(&(tile_x, tile_y)) {
            Some(checkout) => {
                checkout.holders -= 1;
                checkout.holders == 0
            }
            None => false,
        };
        if last {
            writers.remove(&(tile_x, tile_y));
            for observer in self.live_observers() {
                observer.on_tile_released(tile_x, tile_y);
            }
            trace!("Tile ({tile_x}, {tile_y}) released");
        }
    }

    /// Write `data` into every tile it overlaps.
    pub fn set_data(&self, data: &Raster) -> TileResult<()> {
        for (tile_x, tile_y) in self.layout.tiles_intersecting(&data.rect()) {
            let tile = self.checkout(tile_x, tile_y)?;
            tile.with_raster(|raster| raster.copy_from(data));
        }
        Ok(())
    }

    /// Fill `region` with `values` (one per band, or one for all bands).
    pub fn fill(&self, region: &Rectangle, values: &[f64]) -> TileResult<()> {
        if values.len() != 1 && values.len() < self.layout.bands {
            return Err(TileError::unsupported(format!(
                "fill has {} values for {} bands",
                values.len(),
                self.layout.bands
            )));
        }
        for (tile_x, tile_y) in self.layout.tiles_intersecting(region) {
            let tile = self.checkout(tile_x, tile_y)?;
            tile.with_raster(|raster| raster.fill(region, values));
        }
        Ok(())
    }

    /// Published pixels of `rect`; pixels outside the bounds are zero.
    pub fn get_data(&self, rect: &Rectangle) -> TileResult<Raster> {
        let mut raster = Raster::new(*rect, self.layout.bands, self.layout.sample_type);
        for (tile_x, tile_y) in self.layout.tiles_intersecting(rect) {
            let tile = self.tile(tile_x, tile_y)?;
            raster.copy_from_clipped(&tile, &self.layout.bounds);
        }
        Ok(raster)
    }
}

impl TileProvider for WritableTiledImage {
    fn layout(&self) -> ImageLayout {
        self.layout
    }

    fn tile(&self, tile_x: i32, tile_y: i32) -> TileResult<TileBuffer> {
        WritableTiledImage::tile(self, tile_x, tile_y)
    }
}

impl std::fmt::Debug for WritableTiledImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritableTiledImage")
            .field("layout", &self.layout)
            .field("checked_out", &self.checked_out_tiles().len())
            .finish()
    }
}

/// Write access to one tile.
///
/// Changes become visible to readers on [`commit`](WritableTile::commit)
/// and when the handle is dropped.
pub struct WritableTile<'a> {
    image: &'a WritableTiledImage,
    tile_x: i32,
    tile_y: i32,
    working: Arc<Mutex<Raster>>,
}

impl WritableTile<'_> {
    pub fn tile_x(&self) -> i32 {
        self.tile_x
    }

    pub fn tile_y(&self) -> i32 {
        self.tile_y
    }

    /// The grid cell this tile covers.
    pub fn rect(&self) -> Rectangle {
        self.image.layout.tile_cell(self.tile_x, self.tile_y)
    }

    pub fn get(&self, x: i32, y: i32, band: usize) -> f64 {
        self.working.lock().get(x, y, band)
    }

    pub fn set(&self, x: i32, y: i32, band: usize, value: f64) {
        self.working.lock().set(x, y, band, value);
    }

    /// Run `f` on the working raster.
    pub fn with_raster<R>(&self, f: impl FnOnce(&mut Raster) -> R) -> R {
        f(&mut self.working.lock())
    }

    /// Publish the working raster without giving up the tile.
    pub fn commit(&self) {
        let raster = self.working.lock().clone();
        self.image.publish(self.tile_x, self.tile_y, raster);
    }
}

impl Drop for WritableTile<'_> {
    fn drop(&mut self) {
        self.commit();
        self.image.release(self.tile_x, self.tile_y);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SampleType;

    #[derive(Default)]
    struct Log {
        events: Mutex<Vec<String>>,
    }

    impl TileObserver for Log {
        fn attached(&self, checked_out: &[(i32, i32)]) {
            self.events.lock().push(format!("attached {}", checked_out.len()));
        }

        fn on_tile_about_to_change(&self, tile_x: i32, tile_y: i32) {
            self.events.lock().push(format!("change {tile_x},{tile_y}"));
        }

        fn on_tile_released(&self, tile_x: i32, tile_y: i32) {
            self.events.lock().push(format!("release {tile_x},{tile_y}"));
        }
    }

    fn image() -> WritableTiledImage {
        let layout = ImageLayout::new(Rectangle::new(0, 0, 8, 8), 4, 4, 1, SampleType::U8).unwrap();
        WritableTiledImage::new(layout).unwrap()
    }

    #[test]
    fn test_writes_publish_on_release() {
        let image = image();
        {
            let tile = image.checkout(1, 0).unwrap();
            tile.set(5, 1, 0, 9.0);
            assert_eq!(image.tile(1, 0).unwrap().get(5, 1, 0), 0.0);
            tile.commit();
            assert_eq!(image.tile(1, 0).unwrap().get(5, 1, 0), 9.0);
            tile.set(5, 2, 0, 7.0);
        }
        assert_eq!(image.tile(1, 0).unwrap().get(5, 2, 0), 7.0);
        assert!(image.checked_out_tiles().is_empty());
    }

    #[test]
    fn test_shared_checkout_notifies_once() {
        let image = image();
        let log = Arc::new(Log::default());
        let observer: Arc<dyn TileObserver> = log.clone();
        image.add_observer(Arc::downgrade(&observer));

        let first = image.checkout(0, 0).unwrap();
        let second = image.checkout(0, 0).unwrap();
        second.set(0, 0, 0, 3.0);
        assert_eq!(first.get(0, 0, 0), 3.0);
        drop(second);
        assert!(image.is_checked_out(0, 0));
        drop(first);

        assert_eq!(*log.events.lock(), vec!["attached 0", "change 0,0", "release 0,0"]);
    }

    #[test]
    fn test_dead_observers_are_pruned() {
        let image = image();
        let observer: Arc<dyn TileObserver> = Arc::new(Log::default());
        image.add_observer(Arc::downgrade(&observer));
        drop(observer);
        drop(image.checkout(0, 0).unwrap());
        assert!(image.observers.read().is_empty());
    }

    #[test]
    fn test_region_helpers() {
        let image = image();
        image.fill(&Rectangle::new(2, 2, 4, 4), &[5.0]).unwrap();
        let data = image.get_data(&Rectangle::new(0, 0, 8, 8)).unwrap();
        assert_eq!(data.get(2, 2, 0), 5.0);
        assert_eq!(data.get(5, 5, 0), 5.0);
        assert_eq!(data.get(6, 6, 0), 0.0);

        let patch = Raster::from_fn(Rectangle::new(3, 3, 2, 2), 1, SampleType::U8, |_, _, _| 1.0);
        image.set_data(&patch).unwrap();
        assert_eq!(image.get_data(&Rectangle::new(4, 4, 1, 1)).unwrap().get(4, 4, 0), 1.0);
        assert!(image.checkout(2, 0).is_err());
    }

    #[test]
    fn test_fill_rejects_short_band_values() {
        let layout = ImageLayout::new(Rectangle::new(0, 0, 8, 8), 4, 4, 3, SampleType::U8).unwrap();
        let image = WritableTiledImage::new(layout).unwrap();
        let err = image.fill(&Rectangle::new(0, 0, 8, 8), &[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, TileError::UnsupportedConfiguration(_)));
        assert!(image.checked_out_tiles().is_empty());

        image.fill(&Rectangle::new(0, 0, 2, 2), &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(image.get_data(&Rectangle::new(1, 1, 1, 1)).unwrap().get(1, 1, 2), 3.0);
    }

    #[test]
    fn test_from_raster() {
        let raster = Raster::from_fn(Rectangle::new(0, 0, 6, 5), 1, SampleType::U8, |x, y, _| (x + y) as f64);
        let image = WritableTiledImage::from_raster(&raster, 4, 4).unwrap();
        assert_eq!(image.get_data(&raster.rect()).unwrap(), raster);
        assert_eq!(TileProvider::layout(&image).num_x_tiles(), 2);
    }
}
