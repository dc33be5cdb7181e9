//! Image nodes.
//!
//! An [`ImageNode`] is one operator in a processing chain: it knows its
//! layout, its sources and how to compute any one of its tiles. Nodes are
//! immutable once built and shared as `Arc<ImageNode>`; a chain is simply a
//! node holding its sources.

use crate::core::border::BorderPolicy;
use crate::core::error::{TileError, TileResult};
use crate::core::geometry::GeometryMapper;
use crate::core::raster::{Raster, RasterSource, TileBuffer};
use crate::core::types::{ImageLayout, Rectangle};
use crate::graph::area::AreaOp;
use crate::graph::environment::Environment;
use crate::graph::source::TileProvider;
use crate::graph::statistics::StatisticsOp;
use crate::graph::untiled::UntiledOp;
use log::debug;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What a node computes.
pub enum OperatorKind {
    /// Tiles come ready-made from a provider and are never cached.
    Source(Arc<dyn TileProvider>),
    /// Each output pixel depends on a padded window of the source.
    Area(AreaOp),
    /// The whole output depends on the whole of every source.
    Untiled(UntiledOp),
    /// Passes source tiles through and computes statistics on demand.
    Statistics(StatisticsOp),
}

impl OperatorKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            OperatorKind::Source(_) => "source",
            OperatorKind::Area(_) => "area",
            OperatorKind::Untiled(_) => "untiled",
            OperatorKind::Statistics(_) => "statistics",
        }
    }
}

/// Notifications a node sends to its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    /// A tile was computed and committed to the cache.
    TileComputed { node_id: u64, tile_x: i32, tile_y: i32 },
    /// Previously computed tiles are no longer valid.
    RenderingInvalidated { node_id: u64 },
}

/// Handle returned by [`ImageNode::subscribe`].
pub type SubscriptionId = u64;

/// Callback receiving [`NodeEvent`]s.
pub type NodeSubscriber = Arc<dyn Fn(&NodeEvent) + Send + Sync>;

/// One operator in an image-processing chain.
pub struct ImageNode {
    id: u64,
    name: String,
    layout: ImageLayout,
    sources: Vec<Arc<ImageNode>>,
    kind: OperatorKind,
    env: Environment,
    subscribers: RwLock<Vec<(SubscriptionId, NodeSubscriber)>>,
    next_subscription: AtomicU64,
}

impl ImageNode {
    pub(crate) fn build(
        env: &Environment,
        name: impl Into<String>,
        layout: ImageLayout,
        sources: Vec<Arc<ImageNode>>,
        kind: OperatorKind,
    ) -> Arc<Self> {
        let node = Self {
            id: env.next_node_id(),
            name: name.into(),
            layout,
            sources,
            kind,
            env: env.clone(),
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        };
        debug!(
            "Created {} node '{}' #{} over {}",
            node.kind.kind_name(),
            node.name,
            node.id,
            node.layout.bounds
        );
        Arc::new(node)
    }

    /// Wrap a tile provider as a leaf node.
    pub fn source(env: &Environment, name: impl Into<String>, provider: Arc<dyn TileProvider>) -> TileResult<Arc<Self>> {
        let layout = provider.layout();
        layout.validate()?;
        Ok(Self::build(env, name, layout, Vec::new(), OperatorKind::Source(provider)))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    pub fn bounds(&self) -> Rectangle {
        self.layout.bounds
    }

    pub fn kind(&self) -> &OperatorKind {
        &self.kind
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn sources(&self) -> &[Arc<ImageNode>] {
        &self.sources
    }

    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    /// The source at `index`, or `InvalidIndex`.
    pub fn source_at(&self, index: usize) -> TileResult<&Arc<ImageNode>> {
        self.sources.get(index).ok_or_else(|| {
            TileError::invalid_index(format!(
                "source index {index} out of range for '{}' with {} sources",
                self.name,
                self.sources.len()
            ))
        })
    }

    /// Whether computed tiles are unique to this node and worth caching.
    /// Source and statistics nodes serve tiles that already exist elsewhere.
    pub fn caches_tiles(&self) -> bool {
        matches!(self.kind, OperatorKind::Area(_) | OperatorKind::Untiled(_))
    }

    /// How this node relates its pixels to those of source `source_index`.
    pub fn geometry_mapper(&self, source_index: usize) -> TileResult<GeometryMapper> {
        let source = self.source_at(source_index)?;
        Ok(match &self.kind {
            OperatorKind::Area(op) => GeometryMapper::Padded(op.padding()),
            OperatorKind::Untiled(_) => GeometryMapper::Whole {
                dest_bounds: self.layout.bounds,
                source_bounds: source.bounds(),
            },
            OperatorKind::Source(_) | OperatorKind::Statistics(_) => GeometryMapper::Identity,
        })
    }

    /// Source rectangle of source `source_index` needed to compute `dest`.
    pub fn map_dest_rect(&self, dest: Option<&Rectangle>, source_index: usize) -> TileResult<Rectangle> {
        let dest = dest.ok_or_else(|| TileError::invalid_argument("destination rectangle is required"))?;
        Ok(self.geometry_mapper(source_index)?.dest_to_source(dest))
    }

    /// Destination rectangle influenced by `source` of source `source_index`.
    pub fn map_source_rect(&self, source: Option<&Rectangle>, source_index: usize) -> TileResult<Rectangle> {
        let source = source.ok_or_else(|| TileError::invalid_argument("source rectangle is required"))?;
        Ok(self.geometry_mapper(source_index)?.source_to_dest(source).clamped())
    }

    /// Tiles of source `source_index` that tile `(tile_x, tile_y)` reads.
    pub fn tile_dependencies(&self, tile_x: i32, tile_y: i32, source_index: usize) -> TileResult<Vec<(i32, i32)>> {
        self.layout.check_tile(tile_x, tile_y)?;
        let source = self.source_at(source_index)?;
        let needed = self.map_dest_rect(Some(&self.layout.tile_rect(tile_x, tile_y)), source_index)?;
        Ok(source.layout().tiles_intersecting(&needed))
    }

    /// Compute one tile, bypassing the scheduler. Use [`get_tile`](Self::get_tile).
    pub(crate) fn compute_tile(&self, tile_x: i32, tile_y: i32) -> TileResult<TileBuffer> {
        match &self.kind {
            OperatorKind::Source(provider) => provider.tile(tile_x, tile_y),
            OperatorKind::Area(op) => op.compute_tile(self, tile_x, tile_y),
            OperatorKind::Untiled(op) => op.compute_tile(self, tile_x, tile_y),
            OperatorKind::Statistics(_) => self.source_at(0)?.get_tile(tile_x, tile_y),
        }
    }

    /// One tile, computed at most once and shared through the cache.
    pub fn get_tile(&self, tile_x: i32, tile_y: i32) -> TileResult<TileBuffer> {
        self.env.scheduler().schedule_tile(self, tile_x, tile_y)
    }

    /// Several tiles; results line up with `tiles`.
    pub fn get_tiles(&self, tiles: &[(i32, i32)]) -> Vec<TileResult<TileBuffer>> {
        self.env.scheduler().schedule_tiles(self, tiles)
    }

    /// Pixels of `rect`, cobbled from tiles. Pixels outside the bounds are zero.
    pub fn get_data(&self, rect: &Rectangle) -> TileResult<Raster> {
        let mut raster = Raster::new(*rect, self.layout.bands, self.layout.sample_type);
        self.copy_into(&mut raster)?;
        Ok(raster)
    }

    /// Pixels of `rect`, with the part outside the bounds synthesized by `border`.
    pub fn get_extended_data(&self, rect: &Rectangle, border: &BorderPolicy) -> TileResult<Raster> {
        let mut raster = self.get_data(rect)?;
        border.extend(&mut raster, self)?;
        Ok(raster)
    }

    /// The whole image as one raster.
    pub fn render(&self) -> TileResult<Raster> {
        self.get_data(&self.layout.bounds)
    }

    /// Drop every cached tile of this node and tell subscribers.
    pub fn invalidate(&self) {
        self.env.cache().remove_all(self.id);
        if let OperatorKind::Statistics(op) = &self.kind {
            op.clear();
        }
        debug!("Invalidated node '{}' #{}", self.name, self.id);
        self.notify(&NodeEvent::RenderingInvalidated { node_id: self.id });
    }

    /// Register a callback for this node's events.
    pub fn subscribe(&self, subscriber: NodeSubscriber) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push((id, subscriber));
        id
    }

    /// Remove a callback. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub(crate) fn notify(&self, event: &NodeEvent) {
        let subscribers: Vec<NodeSubscriber> = self.subscribers.read().iter().map(|(_, s)| Arc::clone(s)).collect();
        for subscriber in subscribers {
            subscriber(event);
        }
    }
}

impl RasterSource for ImageNode {
    fn bounds(&self) -> Rectangle {
        self.layout.bounds
    }

    fn copy_into(&self, raster: &mut Raster) -> TileResult<()> {
        let bounds = self.layout.bounds;
        let tiles = self.layout.tiles_intersecting(&raster.rect());
        for result in self.get_tiles(&tiles) {
            let tile = result?;
            raster.copy_from_clipped(&tile, &bounds);
        }
        Ok(())
    }
}

impl fmt::Debug for ImageNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind.kind_name())
            .field("layout", &self.layout)
            .field("sources", &self.sources.iter().map(|s| s.id).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EnvironmentConfig;
    use crate::core::types::SampleType;
    use crate::graph::source::StaticImage;
    use parking_lot::Mutex;

    fn env() -> Environment {
        Environment::new(EnvironmentConfig::default().with_tile_size(4, 4)).unwrap()
    }

    fn ramp_node(env: &Environment) -> Arc<ImageNode> {
        let raster = Raster::from_fn(Rectangle::new(0, 0, 10, 10), 1, SampleType::U8, |x, y, _| (x + y * 10) as f64);
        let image = StaticImage::new(&raster, 4, 4).unwrap();
        ImageNode::source(env, "ramp", Arc::new(image)).unwrap()
    }

    #[test]
    fn test_get_data_cobbles_tiles() {
        let env = env();
        let node = ramp_node(&env);
        let data = node.get_data(&Rectangle::new(2, 2, 6, 6)).unwrap();
        assert_eq!(data.get(2, 2, 0), 22.0);
        assert_eq!(data.get(7, 7, 0), 77.0);

        let outside = node.get_data(&Rectangle::new(8, 8, 4, 4)).unwrap();
        assert_eq!(outside.get(9, 9, 0), 99.0);
        assert_eq!(outside.get(11, 11, 0), 0.0);
    }

    #[test]
    fn test_get_extended_data() {
        let env = env();
        let node = ramp_node(&env);
        let data = node.get_extended_data(&Rectangle::new(-1, -1, 2, 2), &BorderPolicy::Copy).unwrap();
        assert_eq!(data.get(-1, -1, 0), 0.0);
        assert_eq!(data.get(0, -1, 0), 0.0);
        let reflected = node.get_extended_data(&Rectangle::new(10, 0, 1, 1), &BorderPolicy::Reflect).unwrap();
        assert_eq!(reflected.get(10, 0, 0), 9.0);
    }

    #[test]
    fn test_source_nodes_do_not_cache() {
        let env = env();
        let node = ramp_node(&env);
        assert!(!node.caches_tiles());
        node.get_tile(0, 0).unwrap();
        assert_eq!(env.cache().stats().tile_count, 0);
    }

    #[test]
    fn test_map_rect_errors() {
        let env = env();
        let node = ramp_node(&env);
        assert!(matches!(node.map_dest_rect(None, 0), Err(TileError::InvalidArgument(_))));
        assert!(matches!(
            node.map_dest_rect(Some(&Rectangle::new(0, 0, 1, 1)), 0),
            Err(TileError::InvalidIndex(_))
        ));
        assert!(matches!(node.get_tile(5, 0), Err(TileError::InvalidIndex(_))));
    }

    #[test]
    fn test_subscriptions() {
        let env = env();
        let node = ramp_node(&env);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = node.subscribe(Arc::new(move |event: &NodeEvent| sink.lock().push(*event)));

        node.invalidate();
        assert!(node.unsubscribe(id));
        assert!(!node.unsubscribe(id));
        node.invalidate();

        assert_eq!(*seen.lock(), vec![NodeEvent::RenderingInvalidated { node_id: node.id() }]);
    }
}
