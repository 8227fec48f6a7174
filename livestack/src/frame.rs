//! In-memory representation of a single exposure and of composite pixel data.
//!
//! Pixels are stored planar: all samples of plane 0, then plane 1, and so on. A mono
//! exposure has one plane, a debayered exposure has three (R, G, B).

use std::fmt;

/// Image dimensions: width, height, and number of planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageDimensions {
    /// Image width in pixels
    pub width: usize,
    /// Image height in pixels
    pub height: usize,
    /// Number of planes (1 for mono, 3 for RGB)
    pub planes: usize,
}

impl ImageDimensions {
    pub fn new(width: usize, height: usize, planes: usize) -> Self {
        assert!(width > 0, "Width must be positive");
        assert!(height > 0, "Height must be positive");
        assert!(planes > 0, "Planes must be positive");
        Self {
            width,
            height,
            planes,
        }
    }

    /// Number of samples in one plane (width * height).
    pub fn plane_len(&self) -> usize {
        self.width * self.height
    }

    /// Total number of samples (width * height * planes).
    pub fn sample_count(&self) -> usize {
        self.plane_len() * self.planes
    }

    pub fn is_mono(&self) -> bool {
        self.planes == 1
    }

    pub fn is_rgb(&self) -> bool {
        self.planes == 3
    }
}

impl fmt::Display for ImageDimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.planes)
    }
}

/// Planar f32 pixel data. Normalized buffers hold values in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct PixelBuffer {
    dims: ImageDimensions,
    data: Vec<f32>,
}

impl PixelBuffer {
    /// # Panics
    /// Panics if `data.len()` does not match `dims.sample_count()`.
    pub fn new(dims: ImageDimensions, data: Vec<f32>) -> Self {
        assert_eq!(
            data.len(),
            dims.sample_count(),
            "Pixel count {} doesn't match dimensions {}",
            data.len(),
            dims
        );
        Self { dims, data }
    }

    pub fn filled(dims: ImageDimensions, value: f32) -> Self {
        Self {
            dims,
            data: vec![value; dims.sample_count()],
        }
    }

    pub fn dims(&self) -> ImageDimensions {
        self.dims
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn plane(&self, index: usize) -> &[f32] {
        let len = self.dims.plane_len();
        &self.data[index * len..(index + 1) * len]
    }

    pub fn planes(&self) -> std::slice::ChunksExact<'_, f32> {
        self.data.chunks_exact(self.dims.plane_len())
    }

    pub fn planes_mut(&mut self) -> std::slice::ChunksExactMut<'_, f32> {
        let len = self.dims.plane_len();
        self.data.chunks_exact_mut(len)
    }

    /// Mean over all samples, accumulated in f64.
    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.data.iter().map(|&v| v as f64).sum();
        sum / self.data.len() as f64
    }

    pub fn max(&self) -> f32 {
        self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    /// True when every sample lies in [0, 1].
    pub fn is_normalized(&self) -> bool {
        self.data.iter().all(|v| (0.0..=1.0).contains(v))
    }

    pub fn clamp_unit(&mut self) {
        for v in self.data.iter_mut() {
            *v = if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        }
    }
}

/// Acquisition metadata read from an exposure's header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameMetadata {
    /// Camera/instrument name (INSTRUME)
    pub camera: String,
    /// Exposure time in seconds (EXPTIME)
    pub exposure: f64,
    /// Sensor gain (GAIN)
    pub gain: i64,
    /// Sensor temperature in degrees Celsius (CCD-TEMP)
    pub temperature: f64,
    /// Declared image type, e.g. "Light Frame" (IMAGETYP)
    pub image_type: String,
    /// Target name (OBJECT)
    pub target: Option<String>,
    /// Optical filter name (FILTER)
    pub filter: Option<String>,
    /// Colour filter array layout, e.g. "RGGB" (BAYERPAT)
    pub bayer_pattern: Option<String>,
    /// Number of exposures averaged into this image (SUBCOUNT)
    pub sample_count: Option<u32>,
}

/// A decoded exposure or composite: metadata plus pixels.
#[derive(Debug, Clone)]
pub struct Frame {
    pub metadata: FrameMetadata,
    pub pixels: PixelBuffer,
}
