//! Reference statistics: mean, extrema and histogram.

use crate::core::error::{TileError, TileResult};
use crate::core::raster::Raster;
use crate::core::types::Rectangle;
use crate::filters::registry::{single_source, Category, OperatorInfo, OperatorRegistry};
use crate::graph::kernel::{StatisticAccumulator, StatisticsKernel};
use crate::graph::node::ImageNode;
use crate::graph::statistics::{Sampling, StatisticValue};
use std::sync::Arc;

pub const MEAN: &str = "mean";
pub const EXTREMA: &str = "extrema";
pub const HISTOGRAM: &str = "histogram";

/// Register the statistics operator.
pub fn register(registry: &mut OperatorRegistry) {
    registry.register(
        OperatorInfo::new("statistics", "Statistics", Category::Statistics)
            .description("Mean, extrema and histogram over a sampled region of interest")
            .parameter("roi", "Region of interest as x,y,w,h (default source bounds)")
            .parameter("start_x", "First sampled column (default 0)")
            .parameter("start_y", "First sampled row (default 0)")
            .parameter("period_x", "Column sampling period (default period or 1)")
            .parameter("period_y", "Row sampling period (default period or 1)")
            .parameter("bins", "Histogram bins (default 256)")
            .parameter("low", "Histogram lower bound, inclusive (default 0)")
            .parameter("high", "Histogram upper bound, exclusive (default 256)"),
        |env, sources, params| {
            let source = single_source("statistics", sources)?;
            let period = params.get_i32_at_least("period", 1, 1)?;
            let sampling = Sampling::new(
                params.get_i32_at_least("start_x", 0, i32::MIN)?,
                params.get_i32_at_least("start_y", 0, i32::MIN)?,
                params.get_i32_at_least("period_x", period, 1)?,
                params.get_i32_at_least("period_y", period, 1)?,
            )?;
            let histogram = HistogramSpec::new(
                params.get_i64("bins", 256)?.try_into().unwrap_or(0),
                params.get_f64("low", 0.0)?,
                params.get_f64("high", 256.0)?,
            )?;
            let kernel = ReferenceStatistics::new(histogram);
            ImageNode::statistics(env, "statistics", Arc::clone(source), Arc::new(kernel), params.get_rect("roi")?, sampling)
        },
    );
}

/// Histogram layout: `bins` equal bins covering `[low, high)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramSpec {
    bins: usize,
    low: f64,
    high: f64,
}

impl HistogramSpec {
    pub fn new(bins: usize, low: f64, high: f64) -> TileResult<Self> {
        if bins == 0 {
            return Err(TileError::invalid_argument("histogram needs at least one bin"));
        }
        if !(low < high) {
            return Err(TileError::invalid_argument(format!(
                "histogram bounds must satisfy low < high, got {low}..{high}"
            )));
        }
        Ok(Self { bins, low, high })
    }

    /// Bin of `value`, or `None` outside `[low, high)`.
    pub fn bin(&self, value: f64) -> Option<usize> {
        if value < self.low || value >= self.high {
            return None;
        }
        let bin = ((value - self.low) * self.bins as f64 / (self.high - self.low)) as usize;
        Some(bin.min(self.bins - 1))
    }
}

impl Default for HistogramSpec {
    fn default() -> Self {
        Self {
            bins: 256,
            low: 0.0,
            high: 256.0,
        }
    }
}

/// The three reference statistics.
#[derive(Debug, Clone, Default)]
pub struct ReferenceStatistics {
    histogram: HistogramSpec,
}

impl ReferenceStatistics {
    pub fn new(histogram: HistogramSpec) -> Self {
        Self { histogram }
    }
}

impl StatisticsKernel for ReferenceStatistics {
    fn name(&self) -> &str {
        "statistics"
    }

    fn statistics_names(&self) -> Vec<String> {
        vec![MEAN.to_string(), EXTREMA.to_string(), HISTOGRAM.to_string()]
    }

    fn create_accumulator(&self, name: &str, bands: usize) -> Option<Box<dyn StatisticAccumulator>> {
        match name {
            MEAN => Some(Box::new(Mean {
                sums: vec![0.0; bands],
                count: 0,
            })),
            EXTREMA => Some(Box::new(Extrema {
                min: vec![f64::INFINITY; bands],
                max: vec![f64::NEG_INFINITY; bands],
            })),
            HISTOGRAM => Some(Box::new(Histogram {
                spec: self.histogram,
                counts: vec![vec![0; self.histogram.bins]; bands],
            })),
            _ => None,
        }
    }
}

/// Visit the sampled pixels of `region`, band by band.
fn for_each_sample(raster: &Raster, region: &Rectangle, sampling: &Sampling, mut f: impl FnMut(usize, f64)) {
    let region = region.intersection(&raster.rect());
    for (x, y) in sampling.positions(&region) {
        for band in 0..raster.bands() {
            f(band, raster.get(x, y, band));
        }
    }
}

struct Mean {
    sums: Vec<f64>,
    count: u64,
}

impl StatisticAccumulator for Mean {
    fn accumulate(&mut self, raster: &Raster, region: &Rectangle, sampling: &Sampling) -> anyhow::Result<()> {
        let sums = &mut self.sums;
        for_each_sample(raster, region, sampling, |band, value| {
            if let Some(sum) = sums.get_mut(band) {
                *sum += value;
            }
        });
        self.count += sampling.count(&region.intersection(&raster.rect()));
        Ok(())
    }

    /// An empty sample set reports zero means with a zero count.
    fn finish(self: Box<Self>) -> StatisticValue {
        let count = self.count;
        let values = self
            .sums
            .iter()
            .map(|sum| if count == 0 { 0.0 } else { sum / count as f64 })
            .collect();
        StatisticValue::Mean { values, count }
    }
}

struct Extrema {
    min: Vec<f64>,
    max: Vec<f64>,
}

impl StatisticAccumulator for Extrema {
    fn accumulate(&mut self, raster: &Raster, region: &Rectangle, sampling: &Sampling) -> anyhow::Result<()> {
        let (min, max) = (&mut self.min, &mut self.max);
        for_each_sample(raster, region, sampling, |band, value| {
            if band < min.len() {
                min[band] = min[band].min(value);
                max[band] = max[band].max(value);
            }
        });
        Ok(())
    }

    fn finish(self: Box<Self>) -> StatisticValue {
        StatisticValue::Extrema {
            min: self.min,
            max: self.max,
        }
    }
}

struct Histogram {
    spec: HistogramSpec,
    counts: Vec<Vec<u64>>,
}

impl StatisticAccumulator for Histogram {
    fn accumulate(&mut self, raster: &Raster, region: &Rectangle, sampling: &Sampling) -> anyhow::Result<()> {
        let (spec, counts) = (&self.spec, &mut self.counts);
        for_each_sample(raster, region, sampling, |band, value| {
            if let (Some(bin), Some(band_counts)) = (spec.bin(value), counts.get_mut(band)) {
                band_counts[bin] += 1;
            }
        });
        Ok(())
    }

    fn finish(self: Box<Self>) -> StatisticValue {
        StatisticValue::Histogram {
            bins: self.spec.bins,
            low: self.spec.low,
            high: self.spec.high,
            counts: self.counts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EnvironmentConfig;
    use crate::core::types::SampleType;
    use crate::filters::registry::OperatorParams;
    use crate::graph::environment::Environment;
    use crate::graph::source::StaticImage;

    fn gradient(env: &Environment) -> Arc<ImageNode> {
        // band 0 = x, band 1 = 10 * y
        let raster = Raster::from_fn(Rectangle::new(0, 0, 10, 10), 2, SampleType::U8, |x, y, b| {
            if b == 0 { x as f64 } else { 10.0 * y as f64 }
        });
        ImageNode::source(env, "gradient", Arc::new(StaticImage::new(&raster, 4, 4).unwrap())).unwrap()
    }

    fn stats_node(env: &Environment, roi: Option<Rectangle>, sampling: Sampling, spec: HistogramSpec) -> Arc<ImageNode> {
        ImageNode::statistics(env, "stats", gradient(env), Arc::new(ReferenceStatistics::new(spec)), roi, sampling).unwrap()
    }

    #[test]
    fn test_mean_and_extrema() {
        let env = Environment::new(EnvironmentConfig::default()).unwrap();
        let node = stats_node(&env, None, Sampling::every_pixel(), HistogramSpec::default());
        assert_eq!(
            node.statistic(MEAN).unwrap(),
            Some(StatisticValue::Mean {
                values: vec![4.5, 45.0],
                count: 100
            })
        );
        assert_eq!(
            node.statistic(EXTREMA).unwrap(),
            Some(StatisticValue::Extrema {
                min: vec![0.0, 0.0],
                max: vec![9.0, 90.0]
            })
        );
    }

    #[test]
    fn test_sampled_roi() {
        let env = Environment::new(EnvironmentConfig::default()).unwrap();
        let sampling = Sampling::new(1, 0, 3, 5).unwrap();
        let node = stats_node(&env, Some(Rectangle::new(0, 0, 10, 10)), sampling, HistogramSpec::default());
        // columns 1, 4, 7 and rows 0, 5
        assert_eq!(
            node.statistic(MEAN).unwrap(),
            Some(StatisticValue::Mean {
                values: vec![4.0, 25.0],
                count: 6
            })
        );
    }

    #[test]
    fn test_histogram_bins() {
        let env = Environment::new(EnvironmentConfig::default()).unwrap();
        let spec = HistogramSpec::new(5, 0.0, 10.0).unwrap();
        let node = stats_node(&env, Some(Rectangle::new(0, 0, 10, 1)), Sampling::every_pixel(), spec);
        match node.statistic(HISTOGRAM).unwrap() {
            Some(StatisticValue::Histogram { bins, counts, .. }) => {
                assert_eq!(bins, 5);
                assert_eq!(counts[0], vec![2, 2, 2, 2, 2]);
                // band 1 is zero on row 0
                assert_eq!(counts[1], vec![10, 0, 0, 0, 0]);
            }
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn test_histogram_spec_validation() {
        assert!(HistogramSpec::new(0, 0.0, 1.0).is_err());
        assert!(HistogramSpec::new(4, 1.0, 1.0).is_err());
        let spec = HistogramSpec::new(4, 0.0, 1.0).unwrap();
        assert_eq!(spec.bin(0.99), Some(3));
        assert_eq!(spec.bin(1.0), None);
        assert_eq!(spec.bin(-0.1), None);
    }

    #[test]
    fn test_registry_factory() {
        let env = Environment::new(EnvironmentConfig::default()).unwrap();
        let registry = OperatorRegistry::with_builtins();
        let params = OperatorParams::parse("roi=0,0,4,4,period=2,bins=4,high=8").unwrap();
        let node = registry.create("statistics", &env, &[gradient(&env)], &params).unwrap();
        assert_eq!(node.statistics_names(), vec!["mean", "extrema", "histogram"]);
        assert_eq!(
            node.statistic(EXTREMA).unwrap(),
            Some(StatisticValue::Extrema {
                min: vec![0.0, 0.0],
                max: vec![2.0, 20.0]
            })
        );

        let bad = OperatorParams::parse("period_x=0").unwrap();
        assert!(registry.create("statistics", &env, &[gradient(&env)], &bad).is_err());
    }

    #[test]
    fn test_value_serializes_tagged() {
        let value = StatisticValue::Extrema {
            min: vec![1.0],
            max: vec![2.0],
        };
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["kind"], "extrema");
        assert_eq!(serde_json::from_value::<StatisticValue>(json).unwrap(), value);
    }
}
