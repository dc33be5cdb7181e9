//! Frozen views of a writable image.
//!
//! Snapshots form a chain from oldest to newest. Only the newest one (the
//! tail) collects copies: before a tile is changed for the first time, its
//! current contents are saved in the tail. A snapshot reading a tile looks
//! in its own map, then in each newer snapshot, and finally falls back to the
//! live image, which has not changed that tile since.

use crate::core::error::{TileError, TileResult};
use crate::core::raster::TileBuffer;
use crate::core::types::ImageLayout;
use crate::graph::source::TileProvider;
use crate::snapshot::image::{TileObserver, WritableTiledImage};
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Identifies a snapshot within its coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId(u64);

impl SnapshotId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snapshot #{}", self.0)
    }
}

/// Changes to the snapshot chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotEvent {
    Created { id: SnapshotId },
    Disposed { id: SnapshotId },
}

pub type SnapshotSubscriber = Arc<dyn Fn(&SnapshotEvent) + Send + Sync>;

struct Link {
    tiles: HashMap<(i32, i32), TileBuffer>,
    older: Option<SnapshotId>,
    newer: Option<SnapshotId>,
}

#[derive(Default)]
struct Chain {
    links: HashMap<SnapshotId, Link>,
    tail: Option<SnapshotId>,
    active: HashSet<(i32, i32)>,
    next_id: u64,
}

/// Keeps the snapshots of one [`WritableTiledImage`].
pub struct SnapshotCoordinator {
    image: Arc<WritableTiledImage>,
    chain: Mutex<Chain>,
    subscribers: RwLock<Vec<(u64, SnapshotSubscriber)>>,
    next_subscription: AtomicU64,
}

impl SnapshotCoordinator {
    /// Attach a coordinator to `image`. Tiles already checked out count as
    /// active from the start.
    pub fn new(image: Arc<WritableTiledImage>) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            image: Arc::clone(&image),
            chain: Mutex::new(Chain::default()),
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        });
        let observer: Arc<dyn TileObserver> = coordinator.clone();
        image.add_observer(Arc::downgrade(&observer));
        coordinator
    }

    pub fn image(&self) -> &Arc<WritableTiledImage> {
        &self.image
    }

    /// Freeze the current contents of the image.
    pub fn create_snapshot(self: &Arc<Self>) -> TileResult<Snapshot> {
        let id = {
            let mut chain = self.chain.lock();
            let id = SnapshotId(chain.next_id);
            chain.next_id += 1;

            let mut tiles = HashMap::with_capacity(chain.active.len());
            for &(tile_x, tile_y) in &chain.active {
                tiles.insert((tile_x, tile_y), self.image.tile(tile_x, tile_y)?);
            }
            let older = chain.tail;
            if let Some(link) = older.and_then(|tail| chain.links.get_mut(&tail)) {
                link.newer = Some(id);
            }
            chain.links.insert(id, Link { tiles, older, newer: None });
            chain.tail = Some(id);
            debug!("Created {id} with {} active tile(s)", chain.active.len());
            id
        };
        self.notify(&SnapshotEvent::Created { id });
        Ok(Snapshot {
            id,
            layout: *self.image.layout(),
            coordinator: Arc::clone(self),
            disposed: AtomicBool::new(false),
        })
    }

    /// The tile as it was when `snapshot` was taken.
    pub fn get_tile(&self, snapshot: SnapshotId, tile_x: i32, tile_y: i32) -> TileResult<TileBuffer> {
        self.image.layout().check_tile(tile_x, tile_y)?;
        let chain = self.chain.lock();
        if !chain.links.contains_key(&snapshot) {
            return Err(TileError::invalid_argument(format!("{snapshot} has been disposed")));
        }
        let mut current = Some(snapshot);
        while let Some(link) = current.and_then(|id| chain.links.get(&id)) {
            if let Some(tile) = link.tiles.get(&(tile_x, tile_y)) {
                return Ok(tile.clone());
            }
            current = link.newer;
        }
        self.image.tile(tile_x, tile_y)
    }

    /// Drop a snapshot. Tiles its older neighbour still needs are handed
    /// down to it. Returns false if the snapshot was already gone.
    pub fn dispose(&self, snapshot: SnapshotId) -> bool {
        {
            let mut chain = self.chain.lock();
            let Some(link) = chain.links.remove(&snapshot) else {
                return false;
            };
            if let Some(older) = link.older.and_then(|id| chain.links.get_mut(&id)) {
                older.newer = link.newer;
                for (address, tile) in link.tiles {
                    older.tiles.entry(address).or_insert(tile);
                }
            }
            if let Some(newer) = link.newer.and_then(|id| chain.links.get_mut(&id)) {
                newer.older = link.older;
            }
            if chain.tail == Some(snapshot) {
                chain.tail = link.older;
            }
            debug!("Disposed {snapshot}, {} snapshot(s) remain", chain.links.len());
        }
        self.notify(&SnapshotEvent::Disposed { id: snapshot });
        true
    }

    /// Number of live snapshots.
    pub fn snapshot_count(&self) -> usize {
        self.chain.lock().links.len()
    }

    /// Tiles currently being written.
    pub fn active_tiles(&self) -> Vec<(i32, i32)> {
        self.chain.lock().active.iter().copied().collect()
    }

    pub fn subscribe(&self, subscriber: SnapshotSubscriber) -> u64 {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push((id, subscriber));
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    fn notify(&self, event: &SnapshotEvent) {
        let subscribers: Vec<SnapshotSubscriber> = self.subscribers.read().iter().map(|(_, s)| Arc::clone(s)).collect();
        for subscriber in subscribers {
            subscriber(event);
        }
    }
}

impl TileObserver for SnapshotCoordinator {
    fn attached(&self, checked_out: &[(i32, i32)]) {
        self.chain.lock().active.extend(checked_out.iter().copied());
    }

    fn on_tile_about_to_change(&self, tile_x: i32, tile_y: i32) {
        let mut chain = self.chain.lock();
        if let Some(tail) = chain.tail {
            let missing = chain
                .links
                .get(&tail)
                .is_some_and(|link| !link.tiles.contains_key(&(tile_x, tile_y)));
            if missing {
                match self.image.tile(tile_x, tile_y) {
                    Ok(tile) => {
                        if let Some(link) = chain.links.get_mut(&tail) {
                            link.tiles.insert((tile_x, tile_y), tile);
                        }
                    }
                    Err(e) => warn!("Could not preserve tile ({tile_x}, {tile_y}) for {tail}: {e}"),
                }
            }
        }
        chain.active.insert((tile_x, tile_y));
    }

    fn on_tile_released(&self, tile_x: i32, tile_y: i32) {
        self.chain.lock().active.remove(&(tile_x, tile_y));
    }
}

impl fmt::Debug for SnapshotCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotCoordinator")
            .field("image", &self.image)
            .field("snapshots", &self.snapshot_count())
            .finish()
    }
}

/// A frozen view of a [`WritableTiledImage`]. Disposed when dropped.
pub struct Snapshot {
    id: SnapshotId,
    layout: ImageLayout,
    coordinator: Arc<SnapshotCoordinator>,
    disposed: AtomicBool,
}

impl Snapshot {
    pub fn id(&self) -> SnapshotId {
        self.id
    }

    pub fn coordinator(&self) -> &Arc<SnapshotCoordinator> {
        &self.coordinator
    }

    /// Release the view early. Later reads fail.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.coordinator.dispose(self.id);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl TileProvider for Snapshot {
    fn layout(&self) -> ImageLayout {
        self.layout
    }

    fn tile(&self, tile_x: i32, tile_y: i32) -> TileResult<TileBuffer> {
        self.coordinator.get_tile(self.id, tile_x, tile_y)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EnvironmentConfig;
    use crate::core::types::{Rectangle, SampleType};
    use crate::graph::environment::Environment;
    use crate::graph::node::ImageNode;

    fn image() -> Arc<WritableTiledImage> {
        let layout = ImageLayout::new(Rectangle::new(0, 0, 8, 8), 4, 4, 1, SampleType::U8).unwrap();
        Arc::new(WritableTiledImage::new(layout).unwrap())
    }

    fn paint(image: &WritableTiledImage, value: f64) {
        image.fill(&Rectangle::new(0, 0, 4, 4), &[value]).unwrap();
    }

    fn value(provider: &dyn TileProvider) -> f64 {
        provider.tile(0, 0).unwrap().get(1, 1, 0)
    }

    #[test]
    fn test_temporal_isolation() {
        let image = image();
        let coordinator = SnapshotCoordinator::new(Arc::clone(&image));
        paint(&image, 1.0);
        let x = coordinator.create_snapshot().unwrap();
        paint(&image, 2.0);
        let y = coordinator.create_snapshot().unwrap();
        paint(&image, 3.0);
        let z = coordinator.create_snapshot().unwrap();

        assert_eq!(value(&x), 1.0);
        assert_eq!(value(&y), 2.0);
        assert_eq!(value(&z), 3.0);
        assert_eq!(value(image.as_ref()), 3.0);

        drop(y);
        assert_eq!(value(&x), 1.0);
        assert_eq!(value(&z), 3.0);

        paint(&image, 4.0);
        assert_eq!(value(&x), 1.0);
        assert_eq!(value(&z), 3.0);
        assert_eq!(coordinator.snapshot_count(), 2);
    }

    #[test]
    fn test_dispose_oldest_keeps_newer() {
        let image = image();
        let coordinator = SnapshotCoordinator::new(Arc::clone(&image));
        paint(&image, 1.0);
        let x = coordinator.create_snapshot().unwrap();
        paint(&image, 2.0);
        let y = coordinator.create_snapshot().unwrap();
        paint(&image, 3.0);

        x.dispose();
        x.dispose();
        assert!(coordinator.get_tile(x.id(), 0, 0).is_err());
        assert_eq!(value(&y), 2.0);

        drop(y);
        assert_eq!(coordinator.snapshot_count(), 0);
        // no tail left to collect copies
        paint(&image, 5.0);
        assert_eq!(value(image.as_ref()), 5.0);
    }

    #[test]
    fn test_dispose_hands_tiles_down() {
        let image = image();
        let coordinator = SnapshotCoordinator::new(Arc::clone(&image));
        paint(&image, 1.0);
        let a = coordinator.create_snapshot().unwrap();
        let b = coordinator.create_snapshot().unwrap();
        // the copy lands in b, a reads through it
        paint(&image, 2.0);
        assert_eq!(value(&a), 1.0);

        b.dispose();
        assert_eq!(value(&a), 1.0);
        paint(&image, 3.0);
        assert_eq!(value(&a), 1.0);
    }

    #[test]
    fn test_untouched_tiles_read_live() {
        let image = image();
        let coordinator = SnapshotCoordinator::new(Arc::clone(&image));
        let snapshot = coordinator.create_snapshot().unwrap();
        let live = image.tile(1, 1).unwrap();
        assert!(TileBuffer::ptr_eq(&snapshot.tile(1, 1).unwrap(), &live));
        assert!(snapshot.tile(2, 0).is_err());
    }

    #[test]
    fn test_tiles_checked_out_before_attach_are_active() {
        let image = image();
        let tile = image.checkout(0, 0).unwrap();
        tile.set(1, 1, 0, 7.0);
        tile.commit();

        let coordinator = SnapshotCoordinator::new(Arc::clone(&image));
        assert_eq!(coordinator.active_tiles(), vec![(0, 0)]);
        let snapshot = coordinator.create_snapshot().unwrap();

        tile.set(1, 1, 0, 8.0);
        drop(tile);
        assert_eq!(value(&snapshot), 7.0);
        assert_eq!(value(image.as_ref()), 8.0);
        assert!(coordinator.active_tiles().is_empty());
    }

    #[test]
    fn test_events() {
        let image = image();
        let coordinator = SnapshotCoordinator::new(image);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = coordinator.subscribe(Arc::new(move |event: &SnapshotEvent| sink.lock().push(*event)));

        let snapshot = coordinator.create_snapshot().unwrap();
        let id = snapshot.id();
        drop(snapshot);
        assert_eq!(*seen.lock(), vec![SnapshotEvent::Created { id }, SnapshotEvent::Disposed { id }]);

        assert!(coordinator.unsubscribe(subscription));
        drop(coordinator.create_snapshot().unwrap());
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_snapshot_feeds_a_graph() {
        let image = image();
        let coordinator = SnapshotCoordinator::new(Arc::clone(&image));
        paint(&image, 9.0);
        let snapshot = Arc::new(coordinator.create_snapshot().unwrap());
        paint(&image, 0.0);

        let env = Environment::new(EnvironmentConfig::default()).unwrap();
        let node = ImageNode::source(&env, "frozen", snapshot).unwrap();
        let data = node.get_data(&Rectangle::new(0, 0, 8, 8)).unwrap();
        assert_eq!(data.get(2, 3, 0), 9.0);
        assert_eq!(data.get(6, 6, 0), 0.0);
        assert_eq!(node.bounds(), Rectangle::new(0, 0, 8, 8));
    }
}
