//! Progress tracking for asynchronous tile requests.

use crate::core::error::TileError;
use crate::core::raster::TileBuffer;
use crate::execution::request::{TileComputationListener, TileRequest};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A progress update event.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    /// A tile was computed.
    TileCompleted {
        request_id: u64,
        tile_x: i32,
        tile_y: i32,
        index: usize,
        total: usize,
    },
    /// A tile failed.
    TileFailed {
        request_id: u64,
        tile_x: i32,
        tile_y: i32,
        message: String,
    },
    /// A tile was cancelled before it started.
    TileCancelled {
        request_id: u64,
        tile_x: i32,
        tile_y: i32,
    },
    /// Overall progress percentage.
    Progress {
        percent: f32,
        elapsed_ms: u64,
        estimated_remaining_ms: Option<u64>,
    },
    /// Every tile reached a terminal state.
    Completed {
        total_duration_ms: u64,
        tiles_computed: usize,
        tiles_failed: usize,
        tiles_cancelled: usize,
    },
}

/// Callback type for progress updates.
pub type ProgressCallback = Box<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Listener that counts tile outcomes and reports progress.
pub struct ProgressTracker {
    /// Total number of tiles expected.
    total_tiles: usize,
    computed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    start_time: Instant,
    callback: Option<ProgressCallback>,
    /// Milliseconds since start at which each tile finished.
    finish_times: Mutex<Vec<u64>>,
}

impl ProgressTracker {
    /// Create a tracker expecting `total_tiles` outcomes.
    pub fn new(total_tiles: usize) -> Self {
        Self {
            total_tiles,
            computed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            start_time: Instant::now(),
            callback: None,
            finish_times: Mutex::new(Vec::new()),
        }
    }

    /// Create a progress tracker wrapped in Arc for sharing.
    pub fn new_shared(total_tiles: usize) -> Arc<Self> {
        Arc::new(Self::new(total_tiles))
    }

    /// Set a callback for progress updates.
    pub fn with_callback(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn computed(&self) -> usize {
        self.computed.load(Ordering::Relaxed) as usize
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed) as usize
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::Relaxed) as usize
    }

    fn finished(&self) -> usize {
        self.computed() + self.failed() + self.cancelled()
    }

    /// Get current progress percentage.
    pub fn progress_percent(&self) -> f32 {
        if self.total_tiles == 0 {
            return 100.0;
        }
        (self.finished() as f32 / self.total_tiles as f32) * 100.0
    }

    /// Estimate remaining time in milliseconds from the average pace so far.
    pub fn estimated_remaining_ms(&self) -> Option<u64> {
        let times = self.finish_times.lock();
        let last = *times.last()?;
        let avg_time = last / times.len() as u64;
        let remaining = self.total_tiles.saturating_sub(self.finished());
        Some(avg_time * remaining as u64)
    }

    fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    fn send_update(&self, update: ProgressUpdate) {
        if let Some(ref callback) = self.callback {
            callback(update);
        }
    }

    fn record(&self) {
        let elapsed = self.elapsed_ms();
        self.finish_times.lock().push(elapsed);

        self.send_update(ProgressUpdate::Progress {
            percent: self.progress_percent(),
            elapsed_ms: elapsed,
            estimated_remaining_ms: self.estimated_remaining_ms(),
        });

        if self.finished() == self.total_tiles {
            self.send_update(ProgressUpdate::Completed {
                total_duration_ms: elapsed,
                tiles_computed: self.computed(),
                tiles_failed: self.failed(),
                tiles_cancelled: self.cancelled(),
            });
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(0)
    }
}

impl TileComputationListener for ProgressTracker {
    fn tile_computed(&self, request: &TileRequest, tile_x: i32, tile_y: i32, _tile: &TileBuffer) {
        let index = self.computed.fetch_add(1, Ordering::Relaxed) as usize + 1;
        self.send_update(ProgressUpdate::TileCompleted {
            request_id: request.id(),
            tile_x,
            tile_y,
            index,
            total: self.total_tiles,
        });
        self.record();
    }

    fn tile_cancelled(&self, request: &TileRequest, tile_x: i32, tile_y: i32) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        self.send_update(ProgressUpdate::TileCancelled {
            request_id: request.id(),
            tile_x,
            tile_y,
        });
        self.record();
    }

    fn tile_computation_failure(&self, request: &TileRequest, tile_x: i32, tile_y: i32, error: &TileError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.send_update(ProgressUpdate::TileFailed {
            request_id: request.id(),
            tile_x,
            tile_y,
            message: error.to_string(),
        });
        self.record();
    }
}
