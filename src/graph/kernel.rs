//! Pixel-math contracts.
//!
//! Nodes own the tiling, padding and caching; kernels only turn source
//! pixels into destination pixels. Kernels report failures through
//! `anyhow`, and the owning node wraps them into a tile error naming the
//! tile that failed.

use crate::core::raster::Raster;
use crate::core::types::{Padding, Rectangle, SampleType};
use crate::graph::statistics::{Sampling, StatisticValue};

/// A kernel whose output pixel depends on a bounded window of input pixels.
pub trait AreaKernel: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Source pixels needed around each destination pixel.
    fn padding(&self) -> Padding;

    /// Sample type of the output for a given source sample type.
    fn output_sample_type(&self, source: SampleType) -> SampleType {
        source
    }

    /// Fill `dest_rect` of `dest`.
    ///
    /// Each source raster covers at least `dest_rect` grown by
    /// [`padding`](AreaKernel::padding).
    fn compute_rect(&self, sources: &[&Raster], dest: &mut Raster, dest_rect: &Rectangle) -> anyhow::Result<()>;
}

/// A kernel that needs every source pixel to produce any output pixel.
pub trait UntiledKernel: Send + Sync {
    fn name(&self) -> &str;

    fn output_sample_type(&self, source: SampleType) -> SampleType {
        source
    }

    /// Fill `dest_rect` of `dest` from complete source images.
    fn compute_image(&self, sources: &[&Raster], dest: &mut Raster, dest_rect: &Rectangle) -> anyhow::Result<()>;
}

/// Produces the accumulators behind a statistics node.
pub trait StatisticsKernel: Send + Sync {
    fn name(&self) -> &str;

    /// Names of the statistics this kernel can compute.
    fn statistics_names(&self) -> Vec<String>;

    /// A fresh accumulator for `name`, or `None` if the name is unknown.
    fn create_accumulator(&self, name: &str, bands: usize) -> Option<Box<dyn StatisticAccumulator>>;
}

/// Running state of one statistic over the sampled pixels of many tiles.
pub trait StatisticAccumulator: Send {
    /// Fold in the sampled pixels of `raster` lying inside `region`.
    fn accumulate(&mut self, raster: &Raster, region: &Rectangle, sampling: &Sampling) -> anyhow::Result<()>;

    /// The final value.
    fn finish(self: Box<Self>) -> StatisticValue;
}
