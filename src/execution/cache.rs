//! Memory-bounded tile cache.
//!
//! Tiles are keyed by [`TileAddress`] and shared by reference. Lookups take
//! a read lock and record access through atomics, so concurrent readers never
//! block each other. Inserting past capacity runs memory control inline in
//! the adding thread, evicting unpinned tiles in comparator order until usage
//! drops to `capacity * threshold`.
//!
//! Recency is a logical clock stamped into each entry on access rather than
//! a linked LRU list, so `get` stays under the read lock and eviction order
//! is left to the pluggable [`TileComparator`].

use crate::core::config::{DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_THRESHOLD};
use crate::core::error::{TileError, TileResult};
use crate::core::raster::TileBuffer;
use crate::core::types::TileAddress;
use log::{debug, trace};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Snapshot of one entry, as seen by a [`TileComparator`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntryInfo {
    pub address: TileAddress,
    pub memory_cost: usize,
    /// Logical clock value of the last add or hit.
    pub last_access: u64,
    pub cost_hint: Option<f64>,
}

/// Eviction order: entries comparing `Less` are evicted first.
pub type TileComparator = Arc<dyn Fn(&CacheEntryInfo, &CacheEntryInfo) -> Ordering + Send + Sync>;

/// Diagnostic notifications about cache content changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    Add(TileAddress),
    Remove(TileAddress),
    RemoveByFlush(TileAddress),
    RemoveByMemoryControl(TileAddress),
    UpdateFromAdd(TileAddress),
    UpdateFromGet(TileAddress),
}

/// Callback receiving [`CacheEvent`]s.
pub type CacheObserver = Arc<dyn Fn(CacheEvent) + Send + Sync>;

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries evicted by memory control.
    pub evictions: u64,
    /// Number of tiles currently held.
    pub tile_count: usize,
    /// Bytes currently held.
    pub memory_used: usize,
}

impl CacheStats {
    /// Calculate hit ratio.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// A store of computed tiles shared by every node of an environment.
///
/// All removal operations are advisory: a tile may disappear at any time and
/// callers must be prepared to recompute it.
pub trait TileCache: Send + Sync {
    /// Insert or overwrite a tile.
    fn add(&self, address: TileAddress, tile: TileBuffer, cost_hint: Option<f64>);

    /// Insert several tiles.
    fn add_batch(&self, tiles: Vec<(TileAddress, TileBuffer)>, cost_hint: Option<f64>) {
        for (address, tile) in tiles {
            self.add(address, tile, cost_hint);
        }
    }

    /// Look up a tile.
    fn get(&self, address: &TileAddress) -> Option<TileBuffer>;

    /// Look up several tiles; the result lines up with `addresses`.
    fn get_batch(&self, addresses: &[TileAddress]) -> Vec<Option<TileBuffer>> {
        addresses.iter().map(|address| self.get(address)).collect()
    }

    /// Drop one tile.
    fn remove(&self, address: &TileAddress);

    /// Drop every tile of one image.
    fn remove_all(&self, owner_id: u64);

    /// Drop everything.
    fn flush(&self);

    /// Evict until usage is at or below `capacity * threshold`.
    fn memory_control(&self);

    /// Protect a tile from eviction. Returns false when it is not cached.
    fn pin(&self, address: &TileAddress) -> bool;

    /// Release one [`pin`](TileCache::pin).
    fn unpin(&self, address: &TileAddress);

    /// Change the capacity. Zero flushes the cache and disables caching.
    fn set_memory_capacity(&self, bytes: usize);

    fn memory_capacity(&self) -> usize;

    /// Change the eviction threshold; must lie in `[0, 1]`.
    fn set_memory_threshold(&self, threshold: f32) -> TileResult<()>;

    fn memory_threshold(&self) -> f32;

    /// Replace the eviction order. `None` restores least-recently-used.
    fn set_tile_comparator(&self, comparator: Option<TileComparator>);

    fn stats(&self) -> CacheStats;
}

struct CacheEntry {
    tile: TileBuffer,
    memory_cost: usize,
    last_access: AtomicU64,
    cost_hint: Option<f64>,
    pin_count: AtomicUsize,
}

impl CacheEntry {
    fn info(&self, address: TileAddress) -> CacheEntryInfo {
        CacheEntryInfo {
            address,
            memory_cost: self.memory_cost,
            last_access: self.last_access.load(AtomicOrdering::Relaxed),
            cost_hint: self.cost_hint,
        }
    }
}

struct CacheState {
    entries: HashMap<TileAddress, CacheEntry>,
    memory_used: usize,
    capacity: usize,
    threshold: f32,
}

/// The default in-memory [`TileCache`].
pub struct MemoryTileCache {
    state: RwLock<CacheState>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    comparator: RwLock<Option<TileComparator>>,
    observers: RwLock<Vec<CacheObserver>>,
}

impl MemoryTileCache {
    /// Create a cache holding up to `capacity` bytes.
    pub fn new(capacity: usize, threshold: f32) -> TileResult<Self> {
        check_threshold(threshold)?;
        Ok(Self::with_limits(capacity, threshold))
    }

    fn with_limits(capacity: usize, threshold: f32) -> Self {
        Self {
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                memory_used: 0,
                capacity,
                threshold,
            }),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            comparator: RwLock::new(None),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register a diagnostic observer.
    pub fn add_observer(&self, observer: CacheObserver) {
        self.observers.write().push(observer);
    }

    /// Whether a tile is cached, without touching statistics or recency.
    pub fn contains(&self, address: &TileAddress) -> bool {
        self.state.read().entries.contains_key(address)
    }

    /// Current pin count of a tile.
    pub fn pin_count(&self, address: &TileAddress) -> usize {
        self.state
            .read()
            .entries
            .get(address)
            .map(|entry| entry.pin_count.load(AtomicOrdering::Acquire))
            .unwrap_or(0)
    }

    pub fn memory_used(&self) -> usize {
        self.state.read().memory_used
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, AtomicOrdering::Relaxed)
    }

    fn notify(&self, events: &[CacheEvent]) {
        if events.is_empty() {
            return;
        }
        let observers = self.observers.read();
        for event in events {
            for observer in observers.iter() {
                observer(*event);
            }
        }
    }

    /// Evict under an already-held write lock. Returns the evicted addresses.
    fn control_locked(&self, state: &mut CacheState) -> Vec<TileAddress> {
        let target = (state.capacity as f64 * state.threshold as f64) as usize;
        if state.memory_used <= target {
            return Vec::new();
        }

        let mut candidates: Vec<CacheEntryInfo> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.pin_count.load(AtomicOrdering::Acquire) == 0)
            .map(|(address, entry)| entry.info(*address))
            .collect();
        match self.comparator.read().as_ref() {
            Some(comparator) => candidates.sort_by(|a, b| comparator(a, b)),
            None => candidates.sort_by_key(|info| info.last_access),
        }

        let mut evicted = Vec::new();
        for info in candidates {
            if state.memory_used <= target {
                break;
            }
            if let Some(entry) = state.entries.remove(&info.address) {
                state.memory_used = state.memory_used.saturating_sub(entry.memory_cost);
                evicted.push(info.address);
            }
        }
        self.evictions.fetch_add(evicted.len() as u64, AtomicOrdering::Relaxed);
        debug!(
            "Memory control evicted {} tiles, {} of {} bytes in use",
            evicted.len(),
            state.memory_used,
            state.capacity
        );
        evicted
    }
}

impl Default for MemoryTileCache {
    fn default() -> Self {
        Self::with_limits(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_THRESHOLD)
    }
}

fn check_threshold(threshold: f32) -> TileResult<()> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(TileError::invalid_argument(format!(
            "memory threshold must lie in [0, 1], got {threshold}"
        )));
    }
    Ok(())
}

impl TileCache for MemoryTileCache {
    fn add(&self, address: TileAddress, tile: TileBuffer, cost_hint: Option<f64>) {
        let memory_cost = tile.memory_size();
        let now = self.tick();
        let mut events = Vec::new();
        {
            let mut state = self.state.write();

            if let Some(entry) = state.entries.get_mut(&address) {
                let previous = entry.memory_cost;
                entry.tile = tile;
                entry.memory_cost = memory_cost;
                entry.cost_hint = cost_hint;
                entry.last_access.store(now, AtomicOrdering::Relaxed);
                state.memory_used = state.memory_used - previous + memory_cost;
                events.push(CacheEvent::UpdateFromAdd(address));
            } else {
                let limit = (state.capacity as f64 * state.threshold as f64) as usize;
                if state.memory_used + memory_cost > state.capacity && memory_cost > limit {
                    trace!("Refusing tile {address} of {memory_cost} bytes, cache capacity {}", state.capacity);
                    return;
                }
                state.entries.insert(
                    address,
                    CacheEntry {
                        tile,
                        memory_cost,
                        last_access: AtomicU64::new(now),
                        cost_hint,
                        pin_count: AtomicUsize::new(0),
                    },
                );
                state.memory_used += memory_cost;
                events.push(CacheEvent::Add(address));
            }

            if state.memory_used > state.capacity {
                let evicted = self.control_locked(&mut state);
                events.extend(evicted.into_iter().map(CacheEvent::RemoveByMemoryControl));
            }
        }
        self.notify(&events);
    }

    fn get(&self, address: &TileAddress) -> Option<TileBuffer> {
        let tile = {
            let state = self.state.read();
            state.entries.get(address).map(|entry| {
                entry.last_access.store(self.tick(), AtomicOrdering::Relaxed);
                entry.tile.clone()
            })
        };
        match tile {
            Some(tile) => {
                self.hits.fetch_add(1, AtomicOrdering::Relaxed);
                self.notify(&[CacheEvent::UpdateFromGet(*address)]);
                Some(tile)
            }
            None => {
                self.misses.fetch_add(1, AtomicOrdering::Relaxed);
                None
            }
        }
    }

    fn remove(&self, address: &TileAddress) {
        let removed = {
            let mut state = self.state.write();
            match state.entries.remove(address) {
                Some(entry) => {
                    state.memory_used = state.memory_used.saturating_sub(entry.memory_cost);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.notify(&[CacheEvent::Remove(*address)]);
        }
    }

    fn remove_all(&self, owner_id: u64) {
        let removed: Vec<CacheEvent> = {
            let mut state = self.state.write();
            let addresses: Vec<TileAddress> = state
                .entries
                .keys()
                .filter(|address| address.owner_id == owner_id)
                .copied()
                .collect();
            let mut freed = 0;
            for address in &addresses {
                if let Some(entry) = state.entries.remove(address) {
                    freed += entry.memory_cost;
                }
            }
            state.memory_used = state.memory_used.saturating_sub(freed);
            addresses.into_iter().map(CacheEvent::Remove).collect()
        };
        trace!("Removed {} cached tiles of image {owner_id}", removed.len());
        self.notify(&removed);
    }

    fn flush(&self) {
        let flushed: Vec<CacheEvent> = {
            let mut state = self.state.write();
            state.memory_used = 0;
            state.entries.drain().map(|(address, _)| CacheEvent::RemoveByFlush(address)).collect()
        };
        debug!("Flushed {} tiles", flushed.len());
        self.notify(&flushed);
    }

    fn memory_control(&self) {
        let evicted = {
            let mut state = self.state.write();
            self.control_locked(&mut state)
        };
        let events: Vec<CacheEvent> = evicted.into_iter().map(CacheEvent::RemoveByMemoryControl).collect();
        self.notify(&events);
    }

    fn pin(&self, address: &TileAddress) -> bool {
        match self.state.read().entries.get(address) {
            Some(entry) => {
                entry.pin_count.fetch_add(1, AtomicOrdering::AcqRel);
                true
            }
            None => false,
        }
    }

    fn unpin(&self, address: &TileAddress) {
        if let Some(entry) = self.state.read().entries.get(address) {
            let _ = entry
                .pin_count
                .fetch_update(AtomicOrdering::AcqRel, AtomicOrdering::Acquire, |n| n.checked_sub(1));
        }
    }

    fn set_memory_capacity(&self, bytes: usize) {
        if bytes == 0 {
            self.state.write().capacity = 0;
            self.flush();
            return;
        }
        let evicted = {
            let mut state = self.state.write();
            state.capacity = bytes;
            if state.memory_used > bytes {
                self.control_locked(&mut state)
            } else {
                Vec::new()
            }
        };
        let events: Vec<CacheEvent> = evicted.into_iter().map(CacheEvent::RemoveByMemoryControl).collect();
        self.notify(&events);
    }

    fn memory_capacity(&self) -> usize {
        self.state.read().capacity
    }

    fn set_memory_threshold(&self, threshold: f32) -> TileResult<()> {
        check_threshold(threshold)?;
        self.state.write().threshold = threshold;
        Ok(())
    }

    fn memory_threshold(&self) -> f32 {
        self.state.read().threshold
    }

    fn set_tile_comparator(&self, comparator: Option<TileComparator>) {
        *self.comparator.write() = comparator;
    }

    fn stats(&self) -> CacheStats {
        let state = self.state.read();
        CacheStats {
            hits: self.hits.load(AtomicOrdering::Relaxed),
            misses: self.misses.load(AtomicOrdering::Relaxed),
            evictions: self.evictions.load(AtomicOrdering::Relaxed),
            tile_count: state.entries.len(),
            memory_used: state.memory_used,
        }
    }
}

/// A cache that never holds anything.
#[derive(Debug, Default)]
pub struct NoopTileCache {
    misses: AtomicU64,
}

impl NoopTileCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TileCache for NoopTileCache {
    fn add(&self, _address: TileAddress, _tile: TileBuffer, _cost_hint: Option<f64>) {}

    fn get(&self, _address: &TileAddress) -> Option<TileBuffer> {
        self.misses.fetch_add(1, AtomicOrdering::Relaxed);
        None
    }

    fn remove(&self, _address: &TileAddress) {}

    fn remove_all(&self, _owner_id: u64) {}

    fn flush(&self) {}

    fn memory_control(&self) {}

    fn pin(&self, _address: &TileAddress) -> bool {
        false
    }

    fn unpin(&self, _address: &TileAddress) {}

    fn set_memory_capacity(&self, _bytes: usize) {}

    fn memory_capacity(&self) -> usize {
        0
    }

    fn set_memory_threshold(&self, threshold: f32) -> TileResult<()> {
        check_threshold(threshold)
    }

    fn memory_threshold(&self) -> f32 {
        0.0
    }

    fn set_tile_comparator(&self, _comparator: Option<TileComparator>) {}

    fn stats(&self) -> CacheStats {
        CacheStats {
            misses: self.misses.load(AtomicOrdering::Relaxed),
            ..CacheStats::default()
        }
    }
}

/// A shared cache handle.
pub type SharedTileCache = Arc<dyn TileCache>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::raster::Raster;
    use crate::core::types::{Rectangle, SampleType};
    use parking_lot::Mutex;

    /// A 10×10 single-band u8 tile: 100 bytes.
    fn tile(value: f64) -> TileBuffer {
        let mut raster = Raster::new(Rectangle::new(0, 0, 10, 10), 1, SampleType::U8);
        raster.fill(&raster.rect(), &[value]);
        TileBuffer::new(raster)
    }

    fn addr(x: i32) -> TileAddress {
        TileAddress::new(1, x, 0)
    }

    #[test]
    fn test_add_and_get() {
        let cache = MemoryTileCache::new(10_000, 0.75).unwrap();
        let original = tile(5.0);
        cache.add(addr(0), original.clone(), None);
        let fetched = cache.get(&addr(0)).unwrap();
        assert!(TileBuffer::ptr_eq(&original, &fetched));
        assert!(cache.get(&addr(1)).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.tile_count, 1);
        assert_eq!(stats.memory_used, 100);
        assert_eq!(stats.hit_ratio(), 0.5);
    }

    #[test]
    fn test_overwrite_keeps_accounting() {
        let cache = MemoryTileCache::new(10_000, 0.75).unwrap();
        cache.add(addr(0), tile(1.0), None);
        cache.add(addr(0), tile(2.0), Some(3.0));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.memory_used(), 100);
        assert_eq!(cache.get(&addr(0)).unwrap().get(0, 0, 0), 2.0);
    }

    #[test]
    fn test_eviction_drops_to_threshold_lru_first() {
        let cache = MemoryTileCache::new(1000, 0.5).unwrap();
        for x in 0..10 {
            cache.add(addr(x), tile(x as f64), None);
        }
        // touch the oldest so it survives
        assert!(cache.get(&addr(0)).is_some());
        cache.add(addr(10), tile(10.0), None);

        assert!(cache.memory_used() <= 500);
        assert!(cache.contains(&addr(0)));
        assert!(cache.contains(&addr(10)));
        assert!(!cache.contains(&addr(1)));
        assert_eq!(cache.stats().evictions, 6);
    }

    #[test]
    fn test_pinned_tiles_survive_memory_control() {
        let cache = MemoryTileCache::new(1000, 0.0).unwrap();
        for x in 0..10 {
            cache.add(addr(x), tile(0.0), None);
        }
        assert!(cache.pin(&addr(3)));
        assert!(!cache.pin(&addr(42)));
        cache.memory_control();
        assert!(cache.contains(&addr(3)));
        assert_eq!(cache.len(), 1);

        cache.unpin(&addr(3));
        cache.unpin(&addr(3));
        assert_eq!(cache.pin_count(&addr(3)), 0);
        cache.memory_control();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_oversized_tile_not_admitted() {
        let cache = MemoryTileCache::new(150, 0.5).unwrap();
        cache.add(addr(0), tile(0.0), None);
        assert!(cache.contains(&addr(0)));
        // 100 + 100 > 150 and 100 > 75
        cache.add(addr(1), tile(0.0), None);
        assert!(!cache.contains(&addr(1)));
        assert_eq!(cache.memory_used(), 100);
    }

    #[test]
    fn test_custom_comparator() {
        let cache = MemoryTileCache::new(1000, 0.5).unwrap();
        // evict the highest tile_x first
        cache.set_tile_comparator(Some(Arc::new(|a: &CacheEntryInfo, b: &CacheEntryInfo| {
            b.address.tile_x.cmp(&a.address.tile_x)
        })));
        for x in 0..10 {
            cache.add(addr(x), tile(0.0), None);
        }
        cache.add(addr(10), tile(0.0), None);
        assert!(cache.contains(&addr(0)));
        assert!(!cache.contains(&addr(10)));
    }

    #[test]
    fn test_remove_all_and_flush() {
        let cache = MemoryTileCache::new(10_000, 0.75).unwrap();
        cache.add(TileAddress::new(1, 0, 0), tile(0.0), None);
        cache.add(TileAddress::new(1, 1, 0), tile(0.0), None);
        cache.add(TileAddress::new(2, 0, 0), tile(0.0), None);
        cache.remove_all(1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.memory_used(), 100);
        cache.remove(&TileAddress::new(2, 0, 0));
        assert!(cache.is_empty());

        cache.add(addr(0), tile(0.0), None);
        cache.flush();
        assert!(cache.is_empty());
        assert_eq!(cache.memory_used(), 0);
    }

    #[test]
    fn test_zero_capacity_disables_caching() {
        let cache = MemoryTileCache::new(10_000, 0.75).unwrap();
        cache.add(addr(0), tile(0.0), None);
        cache.set_memory_capacity(0);
        assert!(cache.is_empty());
        cache.add(addr(1), tile(0.0), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_shrinking_capacity_evicts() {
        let cache = MemoryTileCache::new(10_000, 1.0).unwrap();
        for x in 0..10 {
            cache.add(addr(x), tile(0.0), None);
        }
        cache.set_memory_capacity(400);
        assert!(cache.memory_used() <= 400);
        assert_eq!(cache.memory_capacity(), 400);
    }

    #[test]
    fn test_threshold_validation() {
        let cache = MemoryTileCache::default();
        assert!(matches!(cache.set_memory_threshold(1.5), Err(TileError::InvalidArgument(_))));
        assert!(cache.set_memory_threshold(f32::NAN).is_err());
        assert!(cache.set_memory_threshold(0.25).is_ok());
        assert_eq!(cache.memory_threshold(), 0.25);
        assert!(MemoryTileCache::new(10, -0.1).is_err());
    }

    #[test]
    fn test_batch_positions() {
        let cache = MemoryTileCache::new(10_000, 0.75).unwrap();
        cache.add_batch(vec![(addr(0), tile(0.0)), (addr(2), tile(2.0))], None);
        let batch = cache.get_batch(&[addr(0), addr(1), addr(2)]);
        assert!(batch[0].is_some());
        assert!(batch[1].is_none());
        assert_eq!(batch[2].as_ref().unwrap().get(0, 0, 0), 2.0);
    }

    #[test]
    fn test_observer_events() {
        let cache = MemoryTileCache::new(10_000, 0.75).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        cache.add_observer(Arc::new(move |event: CacheEvent| sink.lock().push(event)));

        cache.add(addr(0), tile(0.0), None);
        cache.add(addr(0), tile(1.0), None);
        cache.get(&addr(0));
        cache.remove(&addr(0));

        assert_eq!(
            *seen.lock(),
            vec![
                CacheEvent::Add(addr(0)),
                CacheEvent::UpdateFromAdd(addr(0)),
                CacheEvent::UpdateFromGet(addr(0)),
                CacheEvent::Remove(addr(0)),
            ]
        );
    }

    #[test]
    fn test_concurrent_add_and_evict_keeps_tiles_whole() {
        let cache = Arc::new(MemoryTileCache::new(2_000, 0.5).unwrap());
        std::thread::scope(|scope| {
            for worker in 0..4 {
                let cache = Arc::clone(&cache);
                scope.spawn(move || {
                    for i in 0..200 {
                        let address = TileAddress::new(worker, i % 25, 0);
                        cache.add(address, tile(i as f64 % 200.0), None);
                        if let Some(found) = cache.get(&address) {
                            let first = found.get(0, 0, 0);
                            assert!(found.band_values(0).iter().all(|v| *v == first));
                        }
                    }
                });
            }
        });
        assert!(cache.memory_used() <= 2_000);
        assert_eq!(cache.memory_used(), cache.len() * 100);
    }

    #[test]
    fn test_noop_cache_always_misses() {
        let cache = NoopTileCache::new();
        cache.add(addr(0), tile(0.0), None);
        assert!(cache.get(&addr(0)).is_none());
        assert!(!cache.pin(&addr(0)));
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().tile_count, 0);
    }
}
