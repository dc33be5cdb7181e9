//! Bridge between image files and rasters.
//!
//! Decoded images become 8-bit rasters with one band per channel; rasters
//! of any sample type can be written back as 8-bit images.

use crate::core::error::{TileError, TilegraphError, TilegraphResult};
use crate::core::raster::{Raster, Samples};
use crate::core::types::{Rectangle, SampleType};
use image::{DynamicImage, ImageBuffer};
use log::debug;
use std::path::Path;

/// Convert a decoded image to a raster anchored at the origin.
///
/// Gray images keep one band (two with alpha), color images get three or
/// four bands.
pub fn raster_from_image(image: &DynamicImage) -> TilegraphResult<Raster> {
    let rect = Rectangle::new(0, 0, image.width() as i32, image.height() as i32);
    let (bands, data) = match image.color().channel_count() {
        1 => (1, image.to_luma8().into_raw()),
        2 => (2, image.to_luma_alpha8().into_raw()),
        3 => (3, image.to_rgb8().into_raw()),
        _ => (4, image.to_rgba8().into_raw()),
    };
    Ok(Raster::from_samples(rect, bands, Samples::U8(data))?)
}

/// Convert a raster to an 8-bit image.
///
/// Float samples are taken to lie in `0..1`; other integer types are
/// scaled down from their full range.
pub fn image_from_raster(raster: &Raster) -> TilegraphResult<DynamicImage> {
    let rect = raster.rect();
    let (width, height) = (rect.width as u32, rect.height as u32);
    let data: Vec<u8> = match raster.samples() {
        Samples::U8(data) => data.clone(),
        _ => {
            let scale = match raster.sample_type() {
                SampleType::F32 | SampleType::F64 => 255.0,
                other => 255.0 / other.range().1,
            };
            let mut data = Vec::with_capacity(rect.area() as usize * raster.bands());
            for y in rect.y..rect.max_y() {
                for x in rect.x..rect.max_x() {
                    for band in 0..raster.bands() {
                        data.push((raster.get(x, y, band) * scale).round().clamp(0.0, 255.0) as u8);
                    }
                }
            }
            data
        }
    };

    let mismatch = || TilegraphError::Other(format!("raster {rect} does not fit an image buffer"));
    let image = match raster.bands() {
        1 => DynamicImage::ImageLuma8(ImageBuffer::from_raw(width, height, data).ok_or_else(mismatch)?),
        2 => DynamicImage::ImageLumaA8(ImageBuffer::from_raw(width, height, data).ok_or_else(mismatch)?),
        3 => DynamicImage::ImageRgb8(ImageBuffer::from_raw(width, height, data).ok_or_else(mismatch)?),
        4 => DynamicImage::ImageRgba8(ImageBuffer::from_raw(width, height, data).ok_or_else(mismatch)?),
        bands => {
            return Err(TileError::unsupported(format!("cannot encode a raster with {bands} bands as an image")).into());
        }
    };
    Ok(image)
}

/// Decode an image file into a raster.
pub fn load_raster(path: impl AsRef<Path>) -> TilegraphResult<Raster> {
    let path = path.as_ref();
    let image = image::open(path)?;
    debug!("Loaded {} ({}x{})", path.display(), image.width(), image.height());
    raster_from_image(&image)
}

/// Encode a raster to an image file; the format follows the extension.
pub fn save_raster(raster: &Raster, path: impl AsRef<Path>) -> TilegraphResult<()> {
    let path = path.as_ref();
    image_from_raster(raster)?.save(path)?;
    debug!("Saved {} to {}", raster.rect(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gray_round_trip_through_file() {
        let raster = Raster::from_fn(Rectangle::new(0, 0, 5, 3), 1, SampleType::U8, |x, y, _| (x * 40 + y) as f64);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gray.png");
        save_raster(&raster, &path).unwrap();
        let loaded = load_raster(&path).unwrap();
        assert_eq!(loaded, raster);
    }

    #[test]
    fn test_rgba_image_has_four_bands() {
        let image = DynamicImage::ImageRgba8(ImageBuffer::from_pixel(2, 2, image::Rgba([1, 2, 3, 4])));
        let raster = raster_from_image(&image).unwrap();
        assert_eq!(raster.bands(), 4);
        assert_eq!(raster.get(1, 1, 2), 3.0);
    }

    #[test]
    fn test_float_raster_scaled() {
        let raster = Raster::from_fn(Rectangle::new(0, 0, 2, 1), 1, SampleType::F32, |x, _, _| x as f64);
        let image = image_from_raster(&raster).unwrap();
        assert_eq!(image.to_luma8().into_raw(), vec![0, 255]);
    }

    #[test]
    fn test_too_many_bands_rejected() {
        let raster = Raster::new(Rectangle::new(0, 0, 1, 1), 5, SampleType::U8);
        assert!(matches!(image_from_raster(&raster), Err(TilegraphError::Tile(_))));
    }
}
