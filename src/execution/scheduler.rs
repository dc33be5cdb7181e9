//! Tile scheduling.
//!
//! The scheduler guarantees that each tile of each node is computed at most
//! once at a time, however many threads ask for it. The first requester
//! claims the address and computes on its own thread; later requesters park
//! on the claim until the result is published, then share it.
//!
//! Blocking requests always compute on the calling thread, so nested source
//! requests never wait for pool capacity. Asynchronous and prefetch requests
//! are queued on two worker pools fed by channels.

use crate::core::error::{TileError, TileResult};
use crate::core::raster::TileBuffer;
use crate::core::types::TileAddress;
use crate::execution::cache::TileCache;
use crate::execution::request::{TileComputationListener, TileRequest};
use crate::graph::node::{ImageNode, NodeEvent};
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, info, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

thread_local! {
    /// Addresses the current thread is computing, innermost last.
    static COMPUTING: RefCell<Vec<TileAddress>> = const { RefCell::new(Vec::new()) };
}

/// Scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tiles computed by this scheduler.
    pub computed: u64,
    /// Requests answered from the cache.
    pub cache_hits: u64,
    /// Requests that waited on another thread's computation.
    pub coalesced: u64,
    /// Computations that failed.
    pub failed: u64,
}

/// A claim on one address; waiters park on `ready`.
struct InFlight {
    result: Mutex<Option<TileResult<TileBuffer>>>,
    ready: Condvar,
}

impl InFlight {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn wait(&self) -> TileResult<TileBuffer> {
        let mut result = self.result.lock();
        loop {
            if let Some(result) = result.as_ref() {
                return result.clone();
            }
            self.ready.wait(&mut result);
        }
    }
}

enum Claim {
    Owner(Arc<InFlight>),
    Waiter(Arc<InFlight>),
}

/// State shared between the scheduler handle and its worker threads.
pub(crate) struct SchedulerInner {
    cache: Arc<dyn TileCache>,
    in_progress: Mutex<HashMap<TileAddress, Arc<InFlight>>>,
    computed: AtomicU64,
    cache_hits: AtomicU64,
    coalesced: AtomicU64,
    failed: AtomicU64,
}

/// Releases a claim. Publishing an error if the owner unwinds keeps waiters
/// from parking forever.
struct ClaimGuard<'a> {
    inner: &'a SchedulerInner,
    address: TileAddress,
    flight: Arc<InFlight>,
    published: bool,
}

impl ClaimGuard<'_> {
    fn publish(&mut self, result: TileResult<TileBuffer>) {
        if self.published {
            return;
        }
        self.published = true;
        {
            let mut slot = self.flight.result.lock();
            *slot = Some(result);
            self.flight.ready.notify_all();
        }
        self.inner.in_progress.lock().remove(&self.address);
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        COMPUTING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|a| *a == self.address) {
                stack.remove(pos);
            }
        });
        if !self.published {
            warn!("Computation of tile {} aborted", self.address);
            self.inner.failed.fetch_add(1, Ordering::Relaxed);
            let address = self.address;
            self.publish(Err(TileError::computation_failed(
                address.owner_id,
                address.tile_x,
                address.tile_y,
                "computation panicked",
            )));
        }
    }
}

impl SchedulerInner {
    fn schedule_tile(&self, node: &ImageNode, tile_x: i32, tile_y: i32) -> TileResult<TileBuffer> {
        node.layout().check_tile(tile_x, tile_y)?;

        if !node.caches_tiles() {
            return node.compute_tile(tile_x, tile_y);
        }

        let address = TileAddress::new(node.id(), tile_x, tile_y);
        if let Some(tile) = self.cache.get(&address) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(tile);
        }

        if COMPUTING.with(|stack| stack.borrow().contains(&address)) {
            return Err(TileError::invalid_argument(format!(
                "cyclic dependency: tile {address} of '{}' requested while computing it",
                node.name()
            )));
        }

        let claim = {
            let mut in_progress = self.in_progress.lock();
            // the owner caches before releasing its claim, so a second look
            // under the lock cannot miss a just-finished tile
            if let Some(tile) = self.cache.get(&address) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(tile);
            }
            match in_progress.get(&address) {
                Some(flight) => Claim::Waiter(Arc::clone(flight)),
                None => {
                    let flight = Arc::new(InFlight::new());
                    in_progress.insert(address, Arc::clone(&flight));
                    Claim::Owner(flight)
                }
            }
        };

        match claim {
            Claim::Waiter(flight) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                trace!("Waiting on in-flight tile {address}");
                flight.wait()
            }
            Claim::Owner(flight) => {
                trace!("Computing tile {address} of '{}'", node.name());
                COMPUTING.with(|stack| stack.borrow_mut().push(address));
                let mut guard = ClaimGuard {
                    inner: self,
                    address,
                    flight,
                    published: false,
                };

                let result = node.compute_tile(tile_x, tile_y);
                match &result {
                    Ok(tile) => {
                        self.cache.add(address, tile.clone(), None);
                        self.computed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(error) => {
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        debug!("Tile {address} failed: {error}");
                    }
                }
                guard.publish(result.clone());
                drop(guard);

                if result.is_ok() {
                    node.notify(&NodeEvent::TileComputed {
                        node_id: node.id(),
                        tile_x,
                        tile_y,
                    });
                }
                result
            }
        }
    }

    /// Run one tile of an asynchronous request on the current thread.
    fn run_request_tile(&self, request: &TileRequest, tile_x: i32, tile_y: i32) {
        if !request.start(tile_x, tile_y) {
            return;
        }
        let node = Arc::clone(request.node());
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.schedule_tile(&node, tile_x, tile_y)))
            .unwrap_or_else(|_| Err(TileError::computation_failed(node.id(), tile_x, tile_y, "computation panicked")));
        // keep the tile resident while listeners look at it
        let address = TileAddress::new(node.id(), tile_x, tile_y);
        let pinned = result.is_ok() && node.caches_tiles() && self.cache.pin(&address);
        request.finish(tile_x, tile_y, &result);
        if pinned {
            self.cache.unpin(&address);
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Job(Job),
    Terminate,
}

/// A resizable set of threads draining one job channel.
struct WorkerPool {
    name: &'static str,
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    size: usize,
    spawned: usize,
}

impl WorkerPool {
    fn new(name: &'static str, size: usize) -> Self {
        let (sender, receiver) = channel::unbounded();
        let mut pool = Self {
            name,
            sender,
            receiver,
            size: 0,
            spawned: 0,
        };
        pool.resize(size);
        pool
    }

    fn resize(&mut self, size: usize) {
        while self.size < size {
            let receiver = self.receiver.clone();
            let name = format!("{}-{}", self.name, self.spawned);
            let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
                for message in receiver.iter() {
                    match message {
                        Message::Job(job) => {
                            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                                warn!("Job on worker {name} panicked");
                            }
                        }
                        Message::Terminate => break,
                    }
                }
                trace!("Worker {name} exiting");
            });
            match spawned {
                Ok(_) => {
                    self.size += 1;
                    self.spawned += 1;
                }
                Err(e) => {
                    warn!("Failed to spawn {} worker: {e}", self.name);
                    break;
                }
            }
        }
        while self.size > size {
            // queued behind pending jobs, so shrinking never drops work
            if self.sender.send(Message::Terminate).is_err() {
                break;
            }
            self.size -= 1;
        }
    }

    fn submit(&self, job: Job) -> bool {
        self.sender.send(Message::Job(job)).is_ok()
    }
}

/// Computes tiles on demand, at most once per address at a time.
pub struct TileScheduler {
    inner: Arc<SchedulerInner>,
    workers: Mutex<WorkerPool>,
    prefetchers: Mutex<WorkerPool>,
}

impl TileScheduler {
    /// Create a scheduler backed by `cache` with the given pool sizes.
    pub fn new(cache: Arc<dyn TileCache>, parallelism: i32, prefetch_parallelism: i32) -> TileResult<Self> {
        let parallelism = check_parallelism("parallelism", parallelism)?;
        let prefetch_parallelism = check_parallelism("prefetch parallelism", prefetch_parallelism)?;
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                cache,
                in_progress: Mutex::new(HashMap::new()),
                computed: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
            workers: Mutex::new(WorkerPool::new("tile-worker", parallelism)),
            prefetchers: Mutex::new(WorkerPool::new("tile-prefetch", prefetch_parallelism)),
        })
    }

    /// The cache this scheduler stores tiles in.
    pub fn cache(&self) -> &Arc<dyn TileCache> {
        &self.inner.cache
    }

    /// Compute or fetch one tile, blocking until it is available.
    pub fn schedule_tile(&self, node: &ImageNode, tile_x: i32, tile_y: i32) -> TileResult<TileBuffer> {
        self.inner.schedule_tile(node, tile_x, tile_y)
    }

    /// Compute or fetch several tiles. Results line up with `tiles`; one
    /// failure does not affect the others. Computed tiles stay pinned in the
    /// cache until the whole batch is assembled.
    pub fn schedule_tiles(&self, node: &ImageNode, tiles: &[(i32, i32)]) -> Vec<TileResult<TileBuffer>> {
        let cache = &self.inner.cache;
        let mut pinned = Vec::new();
        let results = tiles
            .iter()
            .map(|&(tile_x, tile_y)| {
                let result = self.inner.schedule_tile(node, tile_x, tile_y);
                if result.is_ok() && node.caches_tiles() {
                    let address = TileAddress::new(node.id(), tile_x, tile_y);
                    if cache.pin(&address) {
                        pinned.push(address);
                    }
                }
                result
            })
            .collect();
        for address in &pinned {
            cache.unpin(address);
        }
        results
    }

    /// Queue tiles for computation on the worker pool and return at once.
    ///
    /// Listeners are told about every tile on the worker thread that
    /// finished it. With a parallelism of zero the request runs on its own
    /// detached thread.
    pub fn schedule_tiles_async(
        &self,
        node: Arc<ImageNode>,
        tiles: &[(i32, i32)],
        listeners: Vec<Arc<dyn TileComputationListener>>,
    ) -> TileResult<Arc<TileRequest>> {
        for &(tile_x, tile_y) in tiles {
            node.layout().check_tile(tile_x, tile_y)?;
        }
        let request = Arc::new(TileRequest::new(node, tiles, listeners));
        debug!(
            "Request {} queued {} tiles of '{}'",
            request.id(),
            request.tile_indices().len(),
            request.node().name()
        );

        let workers = self.workers.lock();
        if workers.size == 0 {
            let inner = Arc::clone(&self.inner);
            let job_request = Arc::clone(&request);
            let spawned = thread::Builder::new()
                .name(format!("tile-request-{}", request.id()))
                .spawn(move || {
                    for &(tile_x, tile_y) in job_request.tile_indices() {
                        inner.run_request_tile(&job_request, tile_x, tile_y);
                    }
                });
            if let Err(e) = spawned {
                return Err(TileError::unsupported(format!("cannot spawn request thread: {e}")));
            }
            return Ok(request);
        }

        for &(tile_x, tile_y) in request.tile_indices() {
            let inner = Arc::clone(&self.inner);
            let job_request = Arc::clone(&request);
            workers.submit(Box::new(move || inner.run_request_tile(&job_request, tile_x, tile_y)));
        }
        Ok(request)
    }

    /// Cancel pending tiles of a request. Tiles already being computed
    /// finish normally.
    pub fn cancel_tiles(&self, request: &TileRequest, tiles: Option<&[(i32, i32)]>) -> usize {
        let cancelled = request.cancel(tiles);
        debug!("Cancelled {cancelled} tiles of request {}", request.id());
        cancelled
    }

    /// Warm the cache in the background. Errors are logged and dropped.
    pub fn prefetch_tiles(&self, node: Arc<ImageNode>, tiles: &[(i32, i32)]) {
        let prefetchers = self.prefetchers.lock();
        if prefetchers.size == 0 {
            trace!("Prefetch disabled, ignoring {} tiles", tiles.len());
            return;
        }
        for &(tile_x, tile_y) in tiles {
            let inner = Arc::clone(&self.inner);
            let node = Arc::clone(&node);
            prefetchers.submit(Box::new(move || {
                if let Err(error) = inner.schedule_tile(&node, tile_x, tile_y) {
                    debug!("Prefetch of ({tile_x}, {tile_y}) on '{}' failed: {error}", node.name());
                }
            }));
        }
    }

    /// Resize the asynchronous worker pool.
    pub fn set_parallelism(&self, parallelism: i32) -> TileResult<()> {
        let size = check_parallelism("parallelism", parallelism)?;
        self.workers.lock().resize(size);
        info!("Tile worker pool resized to {size}");
        Ok(())
    }

    pub fn parallelism(&self) -> i32 {
        self.workers.lock().size as i32
    }

    /// Resize the prefetch pool.
    pub fn set_prefetch_parallelism(&self, parallelism: i32) -> TileResult<()> {
        let size = check_parallelism("prefetch parallelism", parallelism)?;
        self.prefetchers.lock().resize(size);
        info!("Prefetch pool resized to {size}");
        Ok(())
    }

    pub fn prefetch_parallelism(&self) -> i32 {
        self.prefetchers.lock().size as i32
    }

    /// Number of addresses currently claimed.
    pub fn in_flight(&self) -> usize {
        self.inner.in_progress.lock().len()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            computed: self.inner.computed.load(Ordering::Relaxed),
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            coalesced: self.inner.coalesced.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }
}

fn check_parallelism(what: &str, value: i32) -> TileResult<usize> {
    if value < 0 {
        return Err(TileError::invalid_argument(format!("{what} must not be negative, got {value}")));
    }
    Ok(value as usize)
}

impl std::fmt::Debug for TileScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileScheduler")
            .field("parallelism", &self.parallelism())
            .field("prefetch_parallelism", &self.prefetch_parallelism())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EnvironmentConfig;
    use crate::core::raster::Raster;
    use crate::core::types::{Padding, Rectangle, SampleType};
    use crate::execution::cache::MemoryTileCache;
    use crate::execution::request::TileStatus;
    use crate::graph::environment::Environment;
    use crate::graph::kernel::AreaKernel;
    use crate::graph::source::StaticImage;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{OnceLock, Weak};
    use std::time::{Duration, Instant};

    const ALL_TILES: [(i32, i32); 4] = [(0, 0), (1, 0), (0, 1), (1, 1)];

    /// Copies its source, with knobs for slowness and failure.
    #[derive(Default)]
    struct Scripted {
        calls: AtomicUsize,
        delay: Option<Duration>,
        fail_at: Option<(i32, i32)>,
        explode: bool,
        gate: Option<Receiver<()>>,
    }

    impl AreaKernel for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn padding(&self) -> Padding {
            Padding::none()
        }

        fn compute_rect(&self, sources: &[&Raster], dest: &mut Raster, dest_rect: &Rectangle) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
            if self.explode {
                panic!("kernel exploded");
            }
            if let Some(gate) = &self.gate {
                if (dest_rect.x, dest_rect.y) == (0, 0) {
                    gate.recv()?;
                }
            }
            if self.fail_at == Some((dest_rect.x, dest_rect.y)) {
                anyhow::bail!("refusing {dest_rect}");
            }
            dest.copy_from(sources[0]);
            Ok(())
        }
    }

    /// Requests the tile it is computing.
    struct SelfReferencing {
        node: OnceLock<Weak<ImageNode>>,
    }

    impl AreaKernel for SelfReferencing {
        fn name(&self) -> &str {
            "self_referencing"
        }

        fn padding(&self) -> Padding {
            Padding::none()
        }

        fn compute_rect(&self, _: &[&Raster], _: &mut Raster, dest_rect: &Rectangle) -> anyhow::Result<()> {
            let node = self
                .node
                .get()
                .and_then(Weak::upgrade)
                .ok_or_else(|| anyhow::anyhow!("node not bound"))?;
            let layout = node.layout();
            node.get_tile(layout.x_to_tile_x(dest_rect.x), layout.y_to_tile_y(dest_rect.y))?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        computed: Mutex<Vec<(i32, i32)>>,
        cancelled: Mutex<Vec<(i32, i32)>>,
        failed: Mutex<Vec<TileError>>,
    }

    impl TileComputationListener for Recorder {
        fn tile_computed(&self, _: &TileRequest, tile_x: i32, tile_y: i32, _: &TileBuffer) {
            self.computed.lock().push((tile_x, tile_y));
        }

        fn tile_cancelled(&self, _: &TileRequest, tile_x: i32, tile_y: i32) {
            self.cancelled.lock().push((tile_x, tile_y));
        }

        fn tile_computation_failure(&self, _: &TileRequest, _: i32, _: i32, error: &TileError) {
            self.failed.lock().push(error.clone());
        }
    }

    struct PanickingListener;

    impl TileComputationListener for PanickingListener {
        fn tile_computed(&self, _: &TileRequest, _: i32, _: i32, _: &TileBuffer) {
            panic!("listener failed");
        }
    }

    /// Records the pin count of each tile while it is being reported.
    struct PinWatcher {
        cache: Arc<MemoryTileCache>,
        node_id: u64,
        pins: Mutex<Vec<usize>>,
    }

    impl TileComputationListener for PinWatcher {
        fn tile_computed(&self, _: &TileRequest, tile_x: i32, tile_y: i32, _: &TileBuffer) {
            let pins = self.cache.pin_count(&TileAddress::new(self.node_id, tile_x, tile_y));
            self.pins.lock().push(pins);
        }
    }

    fn env_with(config: EnvironmentConfig) -> Environment {
        Environment::new(config.with_tile_size(4, 4)).unwrap()
    }

    fn graph(env: &Environment, kernel: Arc<dyn AreaKernel>) -> Arc<ImageNode> {
        let raster = Raster::from_fn(Rectangle::new(0, 0, 8, 8), 1, SampleType::U8, |x, y, _| (x + 8 * y) as f64);
        let source = ImageNode::source(env, "ramp", Arc::new(StaticImage::new(&raster, 4, 4).unwrap())).unwrap();
        ImageNode::area(env, "scripted", source, kernel, None, None).unwrap()
    }

    fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_concurrent_requests_compute_once() {
        let env = env_with(EnvironmentConfig::default());
        let kernel = Arc::new(Scripted {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let node = graph(&env, Arc::clone(&kernel) as Arc<dyn AreaKernel>);

        let tiles: Vec<TileBuffer> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8).map(|_| scope.spawn(|| node.get_tile(1, 1).unwrap())).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(kernel.calls.load(Ordering::SeqCst), 1);
        assert!(tiles.iter().all(|t| TileBuffer::ptr_eq(t, &tiles[0])));
        assert_eq!(tiles[0].get(5, 5, 0), 45.0);
        let stats = env.scheduler().stats();
        assert_eq!(stats.computed, 1);
        assert_eq!(stats.coalesced + stats.cache_hits, 7);
        assert_eq!(env.scheduler().in_flight(), 0);
    }

    #[test]
    fn test_failures_are_isolated_and_not_cached() {
        let env = env_with(EnvironmentConfig::default());
        let kernel = Arc::new(Scripted {
            fail_at: Some((0, 0)),
            ..Default::default()
        });
        let node = graph(&env, Arc::clone(&kernel) as Arc<dyn AreaKernel>);

        let results = node.get_tiles(&[(0, 0), (1, 0)]);
        assert!(matches!(
            &results[0],
            Err(TileError::ComputationFailed { tile_x: 0, tile_y: 0, .. })
        ));
        assert!(results[1].is_ok());
        assert_eq!(env.cache().stats().tile_count, 1);

        assert!(node.get_tile(0, 0).is_err());
        assert_eq!(kernel.calls.load(Ordering::SeqCst), 3);
        assert_eq!(env.scheduler().stats().failed, 2);
        assert_eq!(env.scheduler().in_flight(), 0);
    }

    #[test]
    fn test_waiters_share_a_failure() {
        let env = env_with(EnvironmentConfig::default());
        let kernel = Arc::new(Scripted {
            delay: Some(Duration::from_millis(50)),
            fail_at: Some((4, 4)),
            ..Default::default()
        });
        let node = graph(&env, Arc::clone(&kernel) as Arc<dyn AreaKernel>);

        thread::scope(|scope| {
            let handles: Vec<_> = (0..4).map(|_| scope.spawn(|| node.get_tile(1, 1))).collect();
            for handle in handles {
                assert!(handle.join().unwrap().is_err());
            }
        });
        assert!(kernel.calls.load(Ordering::SeqCst) <= 4);
        assert_eq!(env.scheduler().in_flight(), 0);
    }

    #[test]
    fn test_cyclic_request_is_rejected() {
        let env = env_with(EnvironmentConfig::default());
        let kernel = Arc::new(SelfReferencing { node: OnceLock::new() });
        let node = graph(&env, Arc::clone(&kernel) as Arc<dyn AreaKernel>);
        let _ = kernel.node.set(Arc::downgrade(&node));

        match node.get_tile(0, 0) {
            Err(TileError::ComputationFailed { message, .. }) => assert!(message.contains("cyclic dependency")),
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(env.scheduler().in_flight(), 0);
    }

    #[test]
    fn test_tile_computed_event_fires_once() {
        let env = env_with(EnvironmentConfig::default());
        let node = graph(&env, Arc::new(Scripted::default()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        node.subscribe(Arc::new(move |event: &NodeEvent| sink.lock().push(*event)));

        node.get_tile(1, 0).unwrap();
        node.get_tile(1, 0).unwrap();
        assert_eq!(
            *events.lock(),
            vec![NodeEvent::TileComputed {
                node_id: node.id(),
                tile_x: 1,
                tile_y: 0
            }]
        );
    }

    #[test]
    fn test_async_request_notifies_listeners() {
        let env = env_with(EnvironmentConfig::default().with_parallelism(2));
        let node = graph(&env, Arc::new(Scripted::default()));
        let recorder = Arc::new(Recorder::default());

        let request = env
            .scheduler()
            .schedule_tiles_async(Arc::clone(&node), &ALL_TILES, vec![recorder.clone() as Arc<dyn TileComputationListener>])
            .unwrap();
        assert!(request.wait_timeout(Duration::from_secs(10)));

        assert!(request.is_complete());
        let mut computed = recorder.computed.lock().clone();
        computed.sort();
        assert_eq!(computed, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
        for (tile_x, tile_y) in ALL_TILES {
            assert_eq!(request.status(tile_x, tile_y), Some(TileStatus::Computed));
        }
        assert_eq!(request.status(5, 5), None);
        assert_eq!(env.cache().stats().tile_count, 4);
    }

    #[test]
    fn test_async_rejects_bad_indices() {
        let env = env_with(EnvironmentConfig::default());
        let node = graph(&env, Arc::new(Scripted::default()));
        let result = env.scheduler().schedule_tiles_async(node, &[(0, 0), (9, 9)], Vec::new());
        assert!(matches!(result, Err(TileError::InvalidIndex(_))));
    }

    #[test]
    fn test_async_failure_reported_to_listener() {
        let env = env_with(EnvironmentConfig::default());
        let node = graph(
            &env,
            Arc::new(Scripted {
                fail_at: Some((4, 0)),
                ..Default::default()
            }),
        );
        let recorder = Arc::new(Recorder::default());
        let request = env
            .scheduler()
            .schedule_tiles_async(node, &[(0, 0), (1, 0)], vec![recorder.clone() as Arc<dyn TileComputationListener>])
            .unwrap();
        request.wait();

        assert_eq!(request.status(1, 0), Some(TileStatus::Failed));
        assert_eq!(request.status(0, 0), Some(TileStatus::Computed));
        assert_eq!(recorder.failed.lock().len(), 1);
        assert_eq!(request.summary().get(&TileStatus::Failed), Some(&1));
    }

    #[test]
    fn test_cancel_pending_tiles() {
        let env = env_with(EnvironmentConfig::default().with_parallelism(1));
        let (open, gate) = channel::unbounded();
        let node = graph(
            &env,
            Arc::new(Scripted {
                gate: Some(gate),
                ..Default::default()
            }),
        );
        let recorder = Arc::new(Recorder::default());
        let request = env
            .scheduler()
            .schedule_tiles_async(node, &[(0, 0), (1, 0), (0, 1)], vec![recorder.clone() as Arc<dyn TileComputationListener>])
            .unwrap();

        wait_for("first tile to start", || request.status(0, 0) == Some(TileStatus::Processing));
        assert_eq!(env.scheduler().cancel_tiles(&request, None), 2);
        assert!(!request.is_complete());
        open.send(()).unwrap();
        assert!(request.wait_timeout(Duration::from_secs(10)));

        assert_eq!(request.status(0, 0), Some(TileStatus::Computed));
        assert_eq!(request.status(1, 0), Some(TileStatus::Cancelled));
        assert_eq!(request.status(0, 1), Some(TileStatus::Cancelled));
        assert_eq!(recorder.cancelled.lock().len(), 2);
        assert_eq!(recorder.computed.lock().len(), 1);
        assert_eq!(env.scheduler().cancel_tiles(&request, None), 0);
    }

    #[test]
    fn test_zero_parallelism_uses_request_thread() {
        let env = env_with(EnvironmentConfig::default().with_parallelism(0));
        assert_eq!(env.scheduler().parallelism(), 0);
        let node = graph(&env, Arc::new(Scripted::default()));
        let request = env.scheduler().schedule_tiles_async(node, &ALL_TILES, Vec::new()).unwrap();
        assert!(request.wait_timeout(Duration::from_secs(10)));
        assert_eq!(request.summary().get(&TileStatus::Computed), Some(&4));
    }

    #[test]
    fn test_prefetch_warms_cache() {
        let env = env_with(EnvironmentConfig::default().with_prefetch_parallelism(1));
        let kernel = Arc::new(Scripted::default());
        let node = graph(&env, Arc::clone(&kernel) as Arc<dyn AreaKernel>);

        env.scheduler().prefetch_tiles(Arc::clone(&node), &ALL_TILES);
        wait_for("prefetched tiles", || env.cache().stats().tile_count == 4);
        node.render().unwrap();
        assert_eq!(kernel.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_prefetch_disabled_is_noop() {
        let env = env_with(EnvironmentConfig::default().with_prefetch_parallelism(0));
        let kernel = Arc::new(Scripted::default());
        let node = graph(&env, Arc::clone(&kernel) as Arc<dyn AreaKernel>);
        env.scheduler().prefetch_tiles(node, &ALL_TILES);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(kernel.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_resize_pools() {
        let env = env_with(EnvironmentConfig::default());
        let scheduler = env.scheduler();
        assert!(matches!(scheduler.set_parallelism(-1), Err(TileError::InvalidArgument(_))));
        assert!(matches!(scheduler.set_prefetch_parallelism(-3), Err(TileError::InvalidArgument(_))));

        scheduler.set_parallelism(4).unwrap();
        assert_eq!(scheduler.parallelism(), 4);
        scheduler.set_parallelism(1).unwrap();
        assert_eq!(scheduler.parallelism(), 1);
        scheduler.set_prefetch_parallelism(0).unwrap();
        assert_eq!(scheduler.prefetch_parallelism(), 0);

        let node = graph(&env, Arc::new(Scripted::default()));
        let request = scheduler.schedule_tiles_async(node, &ALL_TILES, Vec::new()).unwrap();
        assert!(request.wait_timeout(Duration::from_secs(10)));
    }

    #[test]
    fn test_panicking_kernel_releases_claim() {
        let env = env_with(EnvironmentConfig::default());
        let kernel = Arc::new(Scripted {
            explode: true,
            ..Default::default()
        });
        let node = graph(&env, Arc::clone(&kernel) as Arc<dyn AreaKernel>);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| node.get_tile(0, 0)));
        assert!(outcome.is_err());
        assert_eq!(env.scheduler().in_flight(), 0);
        assert_eq!(env.scheduler().stats().failed, 1);

        let request = env.scheduler().schedule_tiles_async(Arc::clone(&node), &[(1, 1)], Vec::new()).unwrap();
        assert!(request.wait_timeout(Duration::from_secs(10)));
        assert_eq!(request.status(1, 1), Some(TileStatus::Failed));
        assert_eq!(kernel.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_listener_keeps_workers_alive() {
        let env = env_with(EnvironmentConfig::default().with_parallelism(1));
        let node = graph(&env, Arc::new(Scripted::default()));
        let recorder = Arc::new(Recorder::default());
        let listeners: Vec<Arc<dyn TileComputationListener>> = vec![Arc::new(PanickingListener), recorder.clone()];

        let request = env
            .scheduler()
            .schedule_tiles_async(Arc::clone(&node), &[(0, 0), (1, 0)], listeners)
            .unwrap();
        assert!(request.wait_timeout(Duration::from_secs(10)));
        assert_eq!(recorder.computed.lock().len(), 2);
        assert_eq!(request.summary().get(&TileStatus::Computed), Some(&2));

        let next = env.scheduler().schedule_tiles_async(node, &[(1, 1)], Vec::new()).unwrap();
        assert!(next.wait_timeout(Duration::from_secs(10)));
        assert_eq!(next.status(1, 1), Some(TileStatus::Computed));
        assert_eq!(env.scheduler().parallelism(), 1);
    }

    #[test]
    fn test_async_tiles_pinned_while_reported() {
        let cache = Arc::new(MemoryTileCache::new(1 << 20, 0.75).unwrap());
        let config = EnvironmentConfig::default().with_tile_size(4, 4).with_parallelism(2);
        let env = Environment::with_cache(config, cache.clone() as Arc<dyn TileCache>).unwrap();
        let node = graph(&env, Arc::new(Scripted::default()));
        let watcher = Arc::new(PinWatcher {
            cache: Arc::clone(&cache),
            node_id: node.id(),
            pins: Mutex::new(Vec::new()),
        });

        let request = env
            .scheduler()
            .schedule_tiles_async(Arc::clone(&node), &ALL_TILES, vec![watcher.clone() as Arc<dyn TileComputationListener>])
            .unwrap();
        assert!(request.wait_timeout(Duration::from_secs(10)));

        assert_eq!(*watcher.pins.lock(), vec![1; 4]);
        for (tile_x, tile_y) in ALL_TILES {
            assert_eq!(cache.pin_count(&TileAddress::new(node.id(), tile_x, tile_y)), 0);
        }
    }
}
