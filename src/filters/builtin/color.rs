//! Tone operators: inversion and contrast stretch.

use crate::core::raster::Raster;
use crate::core::types::{Padding, Rectangle, SampleType};
use crate::filters::registry::{single_source, Category, OperatorInfo, OperatorRegistry};
use crate::graph::kernel::{AreaKernel, UntiledKernel};
use crate::graph::node::ImageNode;
use anyhow::anyhow;
use std::sync::Arc;

/// Register tone operators.
pub fn register(registry: &mut OperatorRegistry) {
    registry.register(
        OperatorInfo::new("invert", "Invert", Category::Area)
            .description("Mirror every sample within its type's range"),
        |env, sources, _params| {
            let source = single_source("invert", sources)?;
            ImageNode::area(env, "invert", Arc::clone(source), Arc::new(Invert), None, None)
        },
    );
    registry.register(
        OperatorInfo::new("normalize", "Normalize", Category::Untiled)
            .description("Stretch each band's value range to the full sample range")
            .parameter("bounds", "Output bounds as x,y,w,h (default first source bounds)"),
        |env, sources, params| {
            ImageNode::untiled(env, "normalize", sources.to_vec(), Arc::new(Normalize), params.get_rect("bounds")?)
        },
    );
}

/// Output range used for a sample type: the full range for integers,
/// `0..1` for floats.
fn target_range(sample_type: SampleType) -> (f64, f64) {
    if sample_type.is_integral() {
        sample_type.range()
    } else {
        (0.0, 1.0)
    }
}

/// Point operator: integers become `max - v`, floats `-v`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Invert;

impl AreaKernel for Invert {
    fn name(&self) -> &str {
        "invert"
    }

    fn padding(&self) -> Padding {
        Padding::none()
    }

    fn compute_rect(&self, sources: &[&Raster], dest: &mut Raster, dest_rect: &Rectangle) -> anyhow::Result<()> {
        let src = sources.first().ok_or_else(|| anyhow!("invert needs a source"))?;
        let sample_type = src.sample_type();
        let (_, max) = sample_type.range();
        for y in dest_rect.y..dest_rect.max_y() {
            for x in dest_rect.x..dest_rect.max_x() {
                for band in 0..dest.bands() {
                    let value = src.get(x, y, band);
                    let inverted = if sample_type.is_integral() { max - value } else { -value };
                    dest.set(x, y, band, inverted);
                }
            }
        }
        Ok(())
    }
}

/// Linear stretch of each band of the first source from its own
/// `min..max` to the target range of the output type.
///
/// A constant band maps to the low end of the range.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalize;

impl UntiledKernel for Normalize {
    fn name(&self) -> &str {
        "normalize"
    }

    fn compute_image(&self, sources: &[&Raster], dest: &mut Raster, dest_rect: &Rectangle) -> anyhow::Result<()> {
        let src = sources.first().ok_or_else(|| anyhow!("normalize needs a source"))?;
        let (low, high) = target_range(dest.sample_type());
        let region = dest_rect.intersection(&src.rect());

        for band in 0..dest.bands() {
            let (min, max) = region_extrema(src, &region, band);
            let scale = if max > min { (high - low) / (max - min) } else { 0.0 };
            for y in region.y..region.max_y() {
                for x in region.x..region.max_x() {
                    dest.set(x, y, band, low + (src.get(x, y, band) - min) * scale);
                }
            }
        }
        Ok(())
    }
}

fn region_extrema(raster: &Raster, region: &Rectangle, band: usize) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for y in region.y..region.max_y() {
        for x in region.x..region.max_x() {
            let value = raster.get(x, y, band);
            min = min.min(value);
            max = max.max(value);
        }
    }
    (min, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EnvironmentConfig;
    use crate::filters::registry::OperatorParams;
    use crate::graph::environment::Environment;
    use crate::graph::source::StaticImage;

    fn node(env: &Environment, sample_type: SampleType, f: impl Fn(i32, i32) -> f64) -> Arc<ImageNode> {
        let raster = Raster::from_fn(Rectangle::new(0, 0, 6, 6), 1, sample_type, |x, y, _| f(x, y));
        ImageNode::source(env, "input", Arc::new(StaticImage::new(&raster, 4, 4).unwrap())).unwrap()
    }

    #[test]
    fn test_invert_by_type() {
        let env = Environment::new(EnvironmentConfig::default()).unwrap();
        let bytes = ImageNode::area(&env, "inv", node(&env, SampleType::U8, |x, _| x as f64 * 10.0), Arc::new(Invert), None, None).unwrap();
        let out = bytes.render().unwrap();
        assert_eq!(out.get(0, 0, 0), 255.0);
        assert_eq!(out.get(5, 3, 0), 205.0);

        let floats = ImageNode::area(&env, "inv", node(&env, SampleType::F32, |_, y| y as f64 * 0.5), Arc::new(Invert), None, None).unwrap();
        assert_eq!(floats.render().unwrap().get(1, 4, 0), -2.0);
    }

    #[test]
    fn test_normalize_stretches_range() {
        let env = Environment::new(EnvironmentConfig::default()).unwrap();
        let input = node(&env, SampleType::U8, |x, _| 100.0 + x as f64 * 10.0);
        let out = ImageNode::untiled(&env, "norm", vec![input], Arc::new(Normalize), None)
            .unwrap()
            .render()
            .unwrap();
        assert_eq!(out.get(0, 2, 0), 0.0);
        assert_eq!(out.get(5, 2, 0), 255.0);
        assert_eq!(out.get(1, 0, 0), 51.0);
    }

    #[test]
    fn test_normalize_floats_and_constant() {
        let env = Environment::new(EnvironmentConfig::default()).unwrap();
        let floats = node(&env, SampleType::F64, |x, y| (x * y) as f64 - 5.0);
        let out = ImageNode::untiled(&env, "norm", vec![floats], Arc::new(Normalize), None)
            .unwrap()
            .render()
            .unwrap();
        let close = |a: f64, b: f64| (a - b).abs() < 1e-9;
        assert!(close(out.get(0, 0, 0), 0.0));
        assert!(close(out.get(1, 5, 0), 0.2));
        assert!(close(out.get(5, 5, 0), 1.0));

        let flat = node(&env, SampleType::U8, |_, _| 42.0);
        let out = ImageNode::untiled(&env, "norm", vec![flat], Arc::new(Normalize), None)
            .unwrap()
            .render()
            .unwrap();
        assert_eq!(out.get(3, 3, 0), 0.0);
    }

    #[test]
    fn test_registry_builds_both() {
        let env = Environment::new(EnvironmentConfig::default()).unwrap();
        let registry = OperatorRegistry::with_builtins();
        let input = node(&env, SampleType::U8, |_, _| 1.0);
        let invert = registry.create("invert", &env, &[Arc::clone(&input)], &OperatorParams::new()).unwrap();
        assert_eq!(invert.render().unwrap().get(2, 2, 0), 254.0);

        let params = OperatorParams::parse("bounds=0,0,3,3").unwrap();
        let normalize = registry.create("normalize", &env, &[input], &params).unwrap();
        assert_eq!(normalize.bounds(), Rectangle::new(0, 0, 3, 3));
        assert!(registry.create("normalize", &env, &[], &OperatorParams::new()).is_err());
    }
}
