//! Statistics operators.
//!
//! A statistics node is transparent for pixel data: its tiles are the
//! source's tiles. It additionally computes named statistics over a region
//! of interest on first request and keeps them until the node is
//! invalidated.

use crate::core::error::{TileError, TileResult};
use crate::core::types::{ImageLayout, Rectangle};
use crate::graph::environment::Environment;
use crate::graph::kernel::StatisticsKernel;
use crate::graph::node::{ImageNode, OperatorKind};
use log::{debug, trace};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Regular grid of sampled pixels.
///
/// Pixel `(x, y)` is sampled when `x - x_start` is a multiple of `x_period`
/// and `y - y_start` a multiple of `y_period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sampling {
    pub x_start: i32,
    pub y_start: i32,
    pub x_period: i32,
    pub y_period: i32,
}

impl Sampling {
    pub fn new(x_start: i32, y_start: i32, x_period: i32, y_period: i32) -> TileResult<Self> {
        if x_period <= 0 || y_period <= 0 {
            return Err(TileError::invalid_argument(format!(
                "sampling periods must be positive, got {x_period}x{y_period}"
            )));
        }
        Ok(Self {
            x_start,
            y_start,
            x_period,
            y_period,
        })
    }

    /// Every pixel of the image.
    pub fn every_pixel() -> Self {
        Self {
            x_start: 0,
            y_start: 0,
            x_period: 1,
            y_period: 1,
        }
    }

    /// First sampled column at or after `x`.
    pub fn first_x(&self, x: i32) -> i32 {
        x + (self.x_period - (x - self.x_start).rem_euclid(self.x_period)) % self.x_period
    }

    /// First sampled row at or after `y`.
    pub fn first_y(&self, y: i32) -> i32 {
        y + (self.y_period - (y - self.y_start).rem_euclid(self.y_period)) % self.y_period
    }

    /// Sampled pixels of `region`, row by row.
    pub fn positions(&self, region: &Rectangle) -> impl Iterator<Item = (i32, i32)> + '_ {
        let region = *region;
        let xs = (self.first_x(region.x)..region.max_x()).step_by(self.x_period as usize);
        (self.first_y(region.y)..region.max_y())
            .step_by(self.y_period as usize)
            .flat_map(move |y| xs.clone().map(move |x| (x, y)))
    }

    /// Number of sampled pixels in `region`.
    pub fn count(&self, region: &Rectangle) -> u64 {
        let span = |first: i32, end: i32, period: i32| -> u64 {
            if first >= end {
                0
            } else {
                ((end - first - 1) / period + 1) as u64
            }
        };
        span(self.first_x(region.x), region.max_x(), self.x_period)
            * span(self.first_y(region.y), region.max_y(), self.y_period)
    }
}

impl Default for Sampling {
    fn default() -> Self {
        Self::every_pixel()
    }
}

/// Result of one statistic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatisticValue {
    /// Per-band mean.
    Mean { values: Vec<f64>, count: u64 },
    /// Per-band minimum and maximum.
    Extrema { min: Vec<f64>, max: Vec<f64> },
    /// Per-band counts over `bins` equal bins spanning `[low, high)`.
    Histogram {
        bins: usize,
        low: f64,
        high: f64,
        counts: Vec<Vec<u64>>,
    },
}

type Slot = Arc<Mutex<Option<StatisticValue>>>;

/// Configuration and memoized results of a statistics node.
pub struct StatisticsOp {
    roi: Rectangle,
    sampling: Sampling,
    kernel: Arc<dyn StatisticsKernel>,
    results: Mutex<HashMap<String, Slot>>,
}

impl StatisticsOp {
    pub fn roi(&self) -> Rectangle {
        self.roi
    }

    pub fn sampling(&self) -> Sampling {
        self.sampling
    }

    pub fn kernel(&self) -> &Arc<dyn StatisticsKernel> {
        &self.kernel
    }

    /// Forget every computed statistic.
    pub(crate) fn clear(&self) {
        self.results.lock().clear();
    }

    fn slot(&self, name: &str) -> Slot {
        let mut results = self.results.lock();
        Arc::clone(results.entry(name.to_string()).or_default())
    }

    /// Whether the sampling grid provably misses every pixel of `tile`.
    ///
    /// Only tiles starting at or after the sampling start are skipped, and
    /// only in a direction whose period exceeds the tile size.
    fn misses_tile(&self, layout: &ImageLayout, tile: &Rectangle) -> bool {
        let s = &self.sampling;
        let misses = |origin: i32, extent: i32, tile_size: i32, start: i32, period: i32| {
            if period <= tile_size || origin < start {
                return false;
            }
            let offset = (period - (origin - start) % period) % period;
            offset >= extent
        };
        misses(tile.x, tile.width, layout.tile_width, s.x_start, s.x_period)
            || misses(tile.y, tile.height, layout.tile_height, s.y_start, s.y_period)
    }

    fn compute(&self, node: &ImageNode, name: &str) -> TileResult<Option<StatisticValue>> {
        let source = node.source_at(0)?;
        let layout = source.layout();
        let Some(mut accumulator) = self.kernel.create_accumulator(name, layout.bands) else {
            return Ok(None);
        };

        let mut visited = 0usize;
        for (tile_x, tile_y) in layout.tiles_intersecting(&self.roi) {
            let region = layout.tile_rect(tile_x, tile_y).intersection(&self.roi);
            if region.is_empty() || self.misses_tile(layout, &region) {
                trace!("Statistic '{name}' skips tile ({tile_x}, {tile_y})");
                continue;
            }
            let tile = source.get_tile(tile_x, tile_y)?;
            accumulator
                .accumulate(&tile, &region, &self.sampling)
                .map_err(|e| TileError::computation_failed(node.id(), tile_x, tile_y, format!("{name}: {e:#}")))?;
            visited += 1;
        }
        debug!(
            "Computed statistic '{name}' of '{}' over {} from {visited} tiles",
            node.name(),
            self.roi
        );
        Ok(Some(accumulator.finish()))
    }

    pub(crate) fn statistic(&self, node: &ImageNode, name: &str) -> TileResult<Option<StatisticValue>> {
        if !self.kernel.statistics_names().iter().any(|n| n == name) {
            return Ok(None);
        }
        let slot = self.slot(name);
        let mut value = slot.lock();
        if let Some(value) = value.as_ref() {
            return Ok(Some(value.clone()));
        }
        let computed = self.compute(node, name)?;
        value.clone_from(&computed);
        Ok(computed)
    }
}

impl ImageNode {
    /// Build a statistics node over `source`.
    ///
    /// The region of interest defaults to the source bounds and is clipped
    /// to them.
    pub fn statistics(
        env: &Environment,
        name: impl Into<String>,
        source: Arc<ImageNode>,
        kernel: Arc<dyn StatisticsKernel>,
        roi: Option<Rectangle>,
        sampling: Sampling,
    ) -> TileResult<Arc<ImageNode>> {
        let sampling = Sampling::new(sampling.x_start, sampling.y_start, sampling.x_period, sampling.y_period)?;
        let bounds = source.bounds();
        let roi = match roi {
            Some(roi) => {
                let clipped = roi.intersection(&bounds);
                if clipped.is_empty() {
                    return Err(TileError::invalid_argument(format!(
                        "region of interest {roi} does not intersect source bounds {bounds}"
                    )));
                }
                clipped
            }
            None => bounds,
        };
        let layout = *source.layout();
        let op = StatisticsOp {
            roi,
            sampling,
            kernel,
            results: Mutex::new(HashMap::new()),
        };
        Ok(ImageNode::build(env, name, layout, vec![source], OperatorKind::Statistics(op)))
    }

    /// The named statistic, computed on first request.
    ///
    /// Returns `Ok(None)` for names the kernel does not know. Fails with
    /// `InvalidArgument` on nodes that are not statistics nodes.
    pub fn statistic(&self, name: &str) -> TileResult<Option<StatisticValue>> {
        match self.kind() {
            OperatorKind::Statistics(op) => op.statistic(self, name),
            other => Err(TileError::invalid_argument(format!(
                "'{}' is a {} node and has no statistics",
                self.name(),
                other.kind_name()
            ))),
        }
    }

    /// Names of the statistics this node can compute. Empty for other kinds.
    pub fn statistics_names(&self) -> Vec<String> {
        match self.kind() {
            OperatorKind::Statistics(op) => op.kernel.statistics_names(),
            _ => Vec::new(),
        }
    }
}
