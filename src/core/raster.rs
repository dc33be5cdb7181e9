//! Typed pixel storage.
//!
//! A [`Raster`] is an owned, writable, pixel-interleaved block of samples
//! covering a [`Rectangle`] in absolute image coordinates. Once a tile has
//! been computed it is frozen into a [`TileBuffer`], a cheap-to-clone shared
//! handle that is never mutated again.

use crate::core::error::{TileError, TileResult};
use crate::core::types::{Rectangle, SampleType};
use std::ops::Deref;
use std::sync::Arc;

/// A numeric sample type that can live in a [`Raster`].
pub trait Sample: Copy + Default + Send + Sync + PartialEq + 'static {
    /// The matching runtime tag.
    const TYPE: SampleType;

    /// Widen to `f64` without loss.
    fn to_f64(self) -> f64;

    /// Narrow from `f64`. Integer types round and saturate; NaN maps to zero.
    fn from_f64(value: f64) -> Self;
}

macro_rules! int_sample {
    ($t:ty, $tag:ident) => {
        impl Sample for $t {
            const TYPE: SampleType = SampleType::$tag;

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(value: f64) -> Self {
                // `as` saturates at the type bounds and maps NaN to 0
                value.round() as $t
            }
        }
    };
}

int_sample!(u8, U8);
int_sample!(u16, U16);
int_sample!(i16, S16);
int_sample!(i32, S32);

impl Sample for f32 {
    const TYPE: SampleType = SampleType::F32;

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl Sample for f64 {
    const TYPE: SampleType = SampleType::F64;

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        value
    }
}

/// Sample storage, one variant per [`SampleType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Samples {
    U8(Vec<u8>),
    U16(Vec<u16>),
    S16(Vec<i16>),
    S32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

/// Run `$body` with `$v` bound to the typed sample vector of `$samples`.
///
/// Works for both shared and mutable borrows, depending on how `$samples`
/// is passed in.
#[macro_export]
macro_rules! with_samples {
    ($samples:expr, $v:ident => $body:expr) => {
        match $samples {
            $crate::core::raster::Samples::U8($v) => $body,
            $crate::core::raster::Samples::U16($v) => $body,
            $crate::core::raster::Samples::S16($v) => $body,
            $crate::core::raster::Samples::S32($v) => $body,
            $crate::core::raster::Samples::F32($v) => $body,
            $crate::core::raster::Samples::F64($v) => $body,
        }
    };
}

impl Samples {
    /// Zero-filled storage of the given type.
    pub fn zeroed(sample_type: SampleType, len: usize) -> Self {
        match sample_type {
            SampleType::U8 => Samples::U8(vec![0; len]),
            SampleType::U16 => Samples::U16(vec![0; len]),
            SampleType::S16 => Samples::S16(vec![0; len]),
            SampleType::S32 => Samples::S32(vec![0; len]),
            SampleType::F32 => Samples::F32(vec![0.0; len]),
            SampleType::F64 => Samples::F64(vec![0.0; len]),
        }
    }

    pub fn sample_type(&self) -> SampleType {
        match self {
            Samples::U8(_) => SampleType::U8,
            Samples::U16(_) => SampleType::U16,
            Samples::S16(_) => SampleType::S16,
            Samples::S32(_) => SampleType::S32,
            Samples::F32(_) => SampleType::F32,
            Samples::F64(_) => SampleType::F64,
        }
    }

    pub fn len(&self) -> usize {
        with_samples!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn get(&self, index: usize) -> f64 {
        with_samples!(self, v => v[index].to_f64())
    }

    #[inline]
    fn set(&mut self, index: usize, value: f64) {
        with_samples!(self, v => v[index] = Sample::from_f64(value))
    }
}

/// Owned, writable pixel data over a rectangle of the image plane.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    rect: Rectangle,
    bands: usize,
    samples: Samples,
}

impl Raster {
    /// Create a zero-filled raster. Negative sizes are clamped to zero.
    pub fn new(rect: Rectangle, bands: usize, sample_type: SampleType) -> Self {
        let rect = rect.clamped();
        let len = rect.area() as usize * bands;
        Self {
            rect,
            bands,
            samples: Samples::zeroed(sample_type, len),
        }
    }

    /// Wrap existing samples. The sample count must match `rect` and `bands`.
    pub fn from_samples(rect: Rectangle, bands: usize, samples: Samples) -> TileResult<Self> {
        let rect = rect.clamped();
        let expected = rect.area() as usize * bands;
        if samples.len() != expected {
            return Err(TileError::invalid_argument(format!(
                "raster {} with {} bands needs {} samples, got {}",
                rect,
                bands,
                expected,
                samples.len()
            )));
        }
        Ok(Self { rect, bands, samples })
    }

    /// Build a raster by evaluating `f(x, y, band)` at every sample.
    pub fn from_fn(
        rect: Rectangle,
        bands: usize,
        sample_type: SampleType,
        mut f: impl FnMut(i32, i32, usize) -> f64,
    ) -> Self {
        let mut raster = Self::new(rect, bands, sample_type);
        let rect = raster.rect;
        for y in rect.y..rect.max_y() {
            for x in rect.x..rect.max_x() {
                for b in 0..bands {
                    raster.set(x, y, b, f(x, y, b));
                }
            }
        }
        raster
    }

    /// Area covered, in absolute coordinates.
    pub fn rect(&self) -> Rectangle {
        self.rect
    }

    pub fn bands(&self) -> usize {
        self.bands
    }

    pub fn sample_type(&self) -> SampleType {
        self.samples.sample_type()
    }

    pub fn samples(&self) -> &Samples {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut Samples {
        &mut self.samples
    }

    /// Bytes held by the sample storage.
    pub fn memory_size(&self) -> usize {
        self.samples.len() * self.sample_type().bytes()
    }

    #[inline]
    fn index(&self, x: i32, y: i32, band: usize) -> usize {
        (((y - self.rect.y) as usize * self.rect.width as usize) + (x - self.rect.x) as usize) * self.bands + band
    }

    /// Read one sample.
    ///
    /// # Panics
    ///
    /// Panics when `(x, y)` lies outside the raster or `band` is out of range.
    #[inline]
    pub fn get(&self, x: i32, y: i32, band: usize) -> f64 {
        assert!(self.rect.contains_point(x, y) && band < self.bands, "sample ({x}, {y}, {band}) outside {}", self.rect);
        self.samples.get(self.index(x, y, band))
    }

    /// Read one sample, or `None` outside the raster.
    pub fn get_checked(&self, x: i32, y: i32, band: usize) -> Option<f64> {
        if self.rect.contains_point(x, y) && band < self.bands {
            Some(self.samples.get(self.index(x, y, band)))
        } else {
            None
        }
    }

    /// Write one sample, saturating to the sample range.
    ///
    /// # Panics
    ///
    /// Panics when `(x, y)` lies outside the raster or `band` is out of range.
    #[inline]
    pub fn set(&mut self, x: i32, y: i32, band: usize, value: f64) {
        assert!(self.rect.contains_point(x, y) && band < self.bands, "sample ({x}, {y}, {band}) outside {}", self.rect);
        let index = self.index(x, y, band);
        self.samples.set(index, value);
    }

    /// Fill `region ∩ rect` with per-band values. A single value applies to
    /// every band. Fewer values than bands (other than one) leaves the
    /// raster untouched.
    pub fn fill(&mut self, region: &Rectangle, values: &[f64]) {
        let region = region.intersection(&self.rect);
        if region.is_empty() || values.is_empty() || (values.len() != 1 && values.len() < self.bands) {
            return;
        }
        let bands = self.bands;
        for y in region.y..region.max_y() {
            for x in region.x..region.max_x() {
                let base = self.index(x, y, 0);
                for b in 0..bands {
                    let value = if values.len() == 1 { values[0] } else { values[b] };
                    self.samples.set(base + b, value);
                }
            }
        }
    }

    /// Copy the overlapping area of `source` into this raster.
    pub fn copy_from(&mut self, source: &Raster) {
        self.copy_from_translated(source, 0, 0);
    }

    /// Copy `source` shifted by `(dx, dy)`: the sample at `(x, y)` in the
    /// source lands at `(x + dx, y + dy)` here. Bands beyond the smaller of
    /// the two band counts are left untouched.
    pub fn copy_from_translated(&mut self, source: &Raster, dx: i32, dy: i32) {
        self.copy_shifted(source, dx, dy, None);
    }

    /// Copy the overlapping area of `source`, restricted to `clip`.
    pub fn copy_from_clipped(&mut self, source: &Raster, clip: &Rectangle) {
        self.copy_shifted(source, 0, 0, Some(clip));
    }

    fn copy_shifted(&mut self, source: &Raster, dx: i32, dy: i32, clip: Option<&Rectangle>) {
        let shifted = Rectangle::new(source.rect.x + dx, source.rect.y + dy, source.rect.width, source.rect.height);
        let mut region = shifted.intersection(&self.rect);
        if let Some(clip) = clip {
            region = region.intersection(clip);
        }
        if region.is_empty() {
            return;
        }

        if self.bands == source.bands {
            let row_len = region.width as usize * self.bands;
            let offsets: Vec<(usize, usize)> = (region.y..region.max_y())
                .map(|y| (self.index(region.x, y, 0), source.index(region.x - dx, y - dy, 0)))
                .collect();
            let copied = match (&mut self.samples, &source.samples) {
                (Samples::U8(d), Samples::U8(s)) => copy_slices(d, s, &offsets, row_len),
                (Samples::U16(d), Samples::U16(s)) => copy_slices(d, s, &offsets, row_len),
                (Samples::S16(d), Samples::S16(s)) => copy_slices(d, s, &offsets, row_len),
                (Samples::S32(d), Samples::S32(s)) => copy_slices(d, s, &offsets, row_len),
                (Samples::F32(d), Samples::F32(s)) => copy_slices(d, s, &offsets, row_len),
                (Samples::F64(d), Samples::F64(s)) => copy_slices(d, s, &offsets, row_len),
                _ => false,
            };
            if copied {
                return;
            }
        }

        let bands = self.bands.min(source.bands);
        for y in region.y..region.max_y() {
            for x in region.x..region.max_x() {
                for b in 0..bands {
                    let value = source.samples.get(source.index(x - dx, y - dy, b));
                    let index = self.index(x, y, b);
                    self.samples.set(index, value);
                }
            }
        }
    }

    /// Mirror `region ∩ rect` left to right, in place.
    pub fn flip_x(&mut self, region: &Rectangle) {
        let region = region.intersection(&self.rect);
        if region.is_empty() {
            return;
        }
        let bands = self.bands;
        for y in region.y..region.max_y() {
            let (mut left, mut right) = (region.x, region.max_x() - 1);
            while left < right {
                for b in 0..bands {
                    let (i, j) = (self.index(left, y, b), self.index(right, y, b));
                    with_samples!(&mut self.samples, v => v.swap(i, j));
                }
                left += 1;
                right -= 1;
            }
        }
    }

    /// Mirror `region ∩ rect` top to bottom, in place.
    pub fn flip_y(&mut self, region: &Rectangle) {
        let region = region.intersection(&self.rect);
        if region.is_empty() {
            return;
        }
        let row_len = region.width as usize * self.bands;
        let (mut top, mut bottom) = (region.y, region.max_y() - 1);
        while top < bottom {
            let (i, j) = (self.index(region.x, top, 0), self.index(region.x, bottom, 0));
            with_samples!(&mut self.samples, v => swap_runs(v, i, j, row_len));
            top += 1;
            bottom -= 1;
        }
    }

    /// A new raster over `region`, with samples copied from this one where
    /// they overlap and zero elsewhere.
    pub fn crop(&self, region: &Rectangle) -> Raster {
        let mut cropped = Raster::new(*region, self.bands, self.sample_type());
        cropped.copy_from(self);
        cropped
    }

    /// Same samples, relocated so the top-left corner sits at `(x, y)`.
    pub fn relocated(mut self, x: i32, y: i32) -> Raster {
        self.rect.x = x;
        self.rect.y = y;
        self
    }

    /// Every sample of one band, row-major, widened to `f64`.
    pub fn band_values(&self, band: usize) -> Vec<f64> {
        if band >= self.bands {
            return Vec::new();
        }
        with_samples!(&self.samples, v => v
            .iter()
            .skip(band)
            .step_by(self.bands)
            .map(|s| s.to_f64())
            .collect())
    }
}

fn copy_slices<T: Copy>(dst: &mut [T], src: &[T], offsets: &[(usize, usize)], row_len: usize) -> bool {
    for &(d, s) in offsets {
        dst[d..d + row_len].copy_from_slice(&src[s..s + row_len]);
    }
    true
}

fn swap_runs<T>(v: &mut [T], i: usize, j: usize, len: usize) {
    let (lo, hi) = if i < j { (i, j) } else { (j, i) };
    let (head, tail) = v.split_at_mut(hi);
    head[lo..lo + len].swap_with_slice(&mut tail[..len]);
}

/// Anything that can fill a raster with its own pixels.
///
/// Implemented by graph nodes and by plain rasters, so border extension
/// works the same way against either.
pub trait RasterSource {
    /// Pixel bounds of the source.
    fn bounds(&self) -> Rectangle;

    /// Copy the source's pixels into the part of `raster` they overlap.
    fn copy_into(&self, raster: &mut Raster) -> TileResult<()>;
}

impl RasterSource for Raster {
    fn bounds(&self) -> Rectangle {
        self.rect
    }

    fn copy_into(&self, raster: &mut Raster) -> TileResult<()> {
        raster.copy_from(self);
        Ok(())
    }
}

/// A computed tile: shared and immutable.
///
/// Cloning is a reference-count bump. The pixels are released when the last
/// holder (cache, snapshot or caller) drops its handle.
#[derive(Debug, Clone)]
pub struct TileBuffer(Arc<Raster>);

impl TileBuffer {
    /// Freeze a raster into a shareable tile.
    pub fn new(raster: Raster) -> Self {
        TileBuffer(Arc::new(raster))
    }

    /// Whether two handles share the same pixels.
    pub fn ptr_eq(a: &TileBuffer, b: &TileBuffer) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// A private, writable copy of the pixels.
    pub fn to_raster(&self) -> Raster {
        (*self.0).clone()
    }

    /// Number of live handles to these pixels.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl Deref for TileBuffer {
    type Target = Raster;

    fn deref(&self) -> &Raster {
        &self.0
    }
}

impl From<Raster> for TileBuffer {
    fn from(raster: Raster) -> Self {
        TileBuffer::new(raster)
    }
}

impl RasterSource for TileBuffer {
    fn bounds(&self) -> Rectangle {
        self.0.rect()
    }

    fn copy_into(&self, raster: &mut Raster) -> TileResult<()> {
        raster.copy_from(&self.0);
        Ok(())
    }
}
