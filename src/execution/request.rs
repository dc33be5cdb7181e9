//! Asynchronous tile requests.
//!
//! A [`TileRequest`] tracks the tiles of one `schedule_tiles_async` call from
//! submission until every tile is computed, failed or cancelled. Listeners
//! hear about each tile on the worker thread that finished it.

use crate::core::error::TileError;
use crate::core::raster::TileBuffer;
use crate::graph::node::ImageNode;
use log::warn;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of one tile within a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileStatus {
    /// Queued, not yet picked up by a worker.
    Pending,
    /// A worker is computing the tile.
    Processing,
    /// Computed successfully.
    Computed,
    /// Cancelled before computation started.
    Cancelled,
    /// Computation failed.
    Failed,
}

impl TileStatus {
    /// Whether the tile will not change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TileStatus::Computed | TileStatus::Cancelled | TileStatus::Failed)
    }
}

/// Receives per-tile outcomes of an asynchronous request.
///
/// Every method has an empty default, so listeners only implement what they
/// care about. Calls arrive on worker threads.
pub trait TileComputationListener: Send + Sync {
    fn tile_computed(&self, _request: &TileRequest, _tile_x: i32, _tile_y: i32, _tile: &TileBuffer) {}

    fn tile_cancelled(&self, _request: &TileRequest, _tile_x: i32, _tile_y: i32) {}

    fn tile_computation_failure(&self, _request: &TileRequest, _tile_x: i32, _tile_y: i32, _error: &TileError) {}
}

struct RequestState {
    statuses: HashMap<(i32, i32), TileStatus>,
    /// Tiles whose listeners have not all been called yet.
    outstanding: usize,
}

/// Handle to an in-flight asynchronous request.
pub struct TileRequest {
    id: u64,
    node: Arc<ImageNode>,
    tiles: Vec<(i32, i32)>,
    listeners: Vec<Arc<dyn TileComputationListener>>,
    state: Mutex<RequestState>,
    done: Condvar,
}

impl TileRequest {
    pub(crate) fn new(
        node: Arc<ImageNode>,
        tiles: &[(i32, i32)],
        listeners: Vec<Arc<dyn TileComputationListener>>,
    ) -> Self {
        let mut unique = Vec::with_capacity(tiles.len());
        let mut statuses = HashMap::with_capacity(tiles.len());
        for &tile in tiles {
            if statuses.insert(tile, TileStatus::Pending).is_none() {
                unique.push(tile);
            }
        }
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            node,
            tiles: unique.clone(),
            listeners,
            state: Mutex::new(RequestState {
                statuses,
                outstanding: unique.len(),
            }),
            done: Condvar::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The node whose tiles are requested.
    pub fn node(&self) -> &Arc<ImageNode> {
        &self.node
    }

    /// Requested tiles in submission order, duplicates removed.
    pub fn tile_indices(&self) -> &[(i32, i32)] {
        &self.tiles
    }

    /// Status of one tile, or `None` if it is not part of this request.
    pub fn status(&self, tile_x: i32, tile_y: i32) -> Option<TileStatus> {
        self.state.lock().statuses.get(&(tile_x, tile_y)).copied()
    }

    /// Whether every tile has reached a terminal status and been reported.
    pub fn is_complete(&self) -> bool {
        self.state.lock().outstanding == 0
    }

    /// Block until the request is complete.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while state.outstanding > 0 {
            self.done.wait(&mut state);
        }
    }

    /// Block until the request is complete or `timeout` elapses. Returns
    /// whether it completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.outstanding > 0 {
            if self.done.wait_until(&mut state, deadline).timed_out() {
                return state.outstanding == 0;
            }
        }
        true
    }

    /// Count tiles per status.
    pub fn summary(&self) -> HashMap<TileStatus, usize> {
        let mut counts = HashMap::new();
        for status in self.state.lock().statuses.values() {
            *counts.entry(*status).or_insert(0) += 1;
        }
        counts
    }

    /// Cancel pending tiles: all of them, or only those listed. Tiles already
    /// being processed finish normally. Returns how many were cancelled.
    pub fn cancel(&self, tiles: Option<&[(i32, i32)]>) -> usize {
        let cancelled: Vec<(i32, i32)> = {
            let mut state = self.state.lock();
            let targets: Vec<(i32, i32)> = match tiles {
                Some(tiles) => tiles.to_vec(),
                None => self.tiles.clone(),
            };
            targets
                .into_iter()
                .filter(|tile| match state.statuses.get_mut(tile) {
                    Some(status) if *status == TileStatus::Pending => {
                        *status = TileStatus::Cancelled;
                        true
                    }
                    _ => false,
                })
                .collect()
        };

        for &(tile_x, tile_y) in &cancelled {
            self.notify(tile_x, tile_y, |listener| listener.tile_cancelled(self, tile_x, tile_y));
        }
        self.settle(cancelled.len());
        cancelled.len()
    }

    /// Move a tile from pending to processing. False if it was cancelled or
    /// already taken.
    pub(crate) fn start(&self, tile_x: i32, tile_y: i32) -> bool {
        let mut state = self.state.lock();
        match state.statuses.get_mut(&(tile_x, tile_y)) {
            Some(status) if *status == TileStatus::Pending => {
                *status = TileStatus::Processing;
                true
            }
            _ => false,
        }
    }

    /// Record the outcome of a processing tile and tell the listeners.
    pub(crate) fn finish(&self, tile_x: i32, tile_y: i32, result: &Result<TileBuffer, TileError>) {
        {
            let mut state = self.state.lock();
            if let Some(status) = state.statuses.get_mut(&(tile_x, tile_y)) {
                *status = if result.is_ok() { TileStatus::Computed } else { TileStatus::Failed };
            }
        }
        self.notify(tile_x, tile_y, |listener| match result {
            Ok(tile) => listener.tile_computed(self, tile_x, tile_y, tile),
            Err(error) => listener.tile_computation_failure(self, tile_x, tile_y, error),
        });
        self.settle(1);
    }

    /// Call every listener; a panicking listener is logged and skipped.
    fn notify(&self, tile_x: i32, tile_y: i32, call: impl Fn(&dyn TileComputationListener)) {
        for listener in &self.listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| call(listener.as_ref()))).is_err() {
                warn!("Listener of request {} panicked on tile ({tile_x}, {tile_y})", self.id);
            }
        }
    }

    fn settle(&self, reported: usize) {
        if reported == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(reported);
        if state.outstanding == 0 {
            self.done.notify_all();
        }
    }
}

impl std::fmt::Debug for TileRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileRequest")
            .field("id", &self.id)
            .field("node", &self.node.id())
            .field("tiles", &self.tiles.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
