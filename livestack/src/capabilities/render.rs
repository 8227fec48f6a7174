//! Display rendering of composites: crop, auto-stretch, downscale, PNG.
//!
//! Mono composites become 16-bit grayscale PNGs. Three-plane composites become 8-bit RGB
//! PNGs with a saturation boost.

use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use image::{DynamicImage, ImageBuffer, ImageFormat, Luma, Rgb};
use rayon::prelude::*;
use thiserror::Error;

use super::Renderer;
use crate::broadcast::Artifact;
use crate::frame::{ImageDimensions, PixelBuffer};
use crate::keyer::CompositeKey;
use crate::store::write_atomic;

/// Pixels removed from each border before stretching.
pub const CROP_BORDER: usize = 64;
/// Border crop applies only when both axes exceed this.
const CROP_MIN_SIZE: usize = 256;
/// Block size of the mean downscale.
pub const DOWNSCALE_FACTOR: usize = 4;
/// Downscale applies only when both axes are at least this after cropping.
const DOWNSCALE_MIN_SIZE: usize = 512;

/// Target median of the stretched image.
const TARGET_BACKGROUND: f32 = 0.25;
/// Shadow clipping point, in mean absolute deviations from the median.
const SHADOWS_CLIP: f32 = -1.25;
/// Colour saturation factor for RGB output.
const SATURATION: f32 = 1.6;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("cannot render {0} planes, expected 1 or 3")]
    UnsupportedPlanes(usize),

    #[error("PNG encoding failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("image buffer does not match {0}")]
    Layout(ImageDimensions),

    #[error("Failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Renders composites to `<output_dir>/<key>.png`, overwriting the previous render.
#[derive(Debug, Clone)]
pub struct PngRenderer {
    output_dir: PathBuf,
}

impl PngRenderer {
    pub const CONTENT_TYPE: &'static str = "image/png";

    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn path_for(&self, key: &CompositeKey) -> PathBuf {
        self.output_dir.join(format!("{}.png", key.file_stem()))
    }
}

impl Renderer for PngRenderer {
    fn render(&self, key: &CompositeKey, pixels: &PixelBuffer) -> Result<Artifact, RenderError> {
        let dims = pixels.dims();
        if !(dims.is_mono() || dims.is_rgb()) {
            return Err(RenderError::UnsupportedPlanes(dims.planes));
        }

        let display = display_image(pixels);
        let png = encode_png(&display)?;

        let path = self.path_for(key);
        fs::create_dir_all(&self.output_dir)
            .and_then(|_| write_atomic(&path, &png))
            .map_err(|source| RenderError::Write {
                path: path.clone(),
                source,
            })?;

        Ok(Artifact {
            key: key.clone(),
            content_type: Self::CONTENT_TYPE,
            path,
            data: Bytes::from(png),
        })
    }
}

/// Crop, stretch and downscale every plane independently.
fn display_image(pixels: &PixelBuffer) -> PixelBuffer {
    let dims = pixels.dims();
    let mut planes: Vec<(Vec<f32>, usize, usize)> = pixels
        .planes()
        .map(|plane| crop(plane, dims.width, dims.height))
        .collect();

    planes.par_iter_mut().for_each(|(plane, width, height)| {
        auto_stretch(plane);
        if *width >= DOWNSCALE_MIN_SIZE && *height >= DOWNSCALE_MIN_SIZE {
            let (scaled, w, h) = downscale_mean(plane, *width, *height, DOWNSCALE_FACTOR);
            *plane = scaled;
            *width = w;
            *height = h;
        }
        for v in plane.iter_mut() {
            *v = v.clamp(0.0, 1.0);
        }
    });

    let (width, height) = (planes[0].1, planes[0].2);
    let data = planes.into_iter().flat_map(|(plane, _, _)| plane).collect();
    PixelBuffer::new(ImageDimensions::new(width, height, dims.planes), data)
}

fn crop(plane: &[f32], width: usize, height: usize) -> (Vec<f32>, usize, usize) {
    if width <= CROP_MIN_SIZE || height <= CROP_MIN_SIZE {
        return (plane.to_vec(), width, height);
    }
    let out_w = width - 2 * CROP_BORDER;
    let out_h = height - 2 * CROP_BORDER;
    let mut out = Vec::with_capacity(out_w * out_h);
    for y in CROP_BORDER..CROP_BORDER + out_h {
        let start = y * width + CROP_BORDER;
        out.extend_from_slice(&plane[start..start + out_w]);
    }
    (out, out_w, out_h)
}

/// Mean of each `factor x factor` block. Partial blocks at the edges are dropped.
fn downscale_mean(plane: &[f32], width: usize, height: usize, factor: usize) -> (Vec<f32>, usize, usize) {
    let out_w = width / factor;
    let out_h = height / factor;
    let inv = 1.0 / (factor * factor) as f32;
    let mut out = vec![0.0f32; out_w * out_h];
    out.par_chunks_mut(out_w).enumerate().for_each(|(oy, row)| {
        for (ox, v) in row.iter_mut().enumerate() {
            let mut sum = 0.0f32;
            for y in oy * factor..(oy + 1) * factor {
                let start = y * width + ox * factor;
                sum += plane[start..start + factor].iter().sum::<f32>();
            }
            *v = sum * inv;
        }
    });
    (out, out_w, out_h)
}

/// Midtones transfer stretch: normalize by the maximum, clip shadows below
/// `median + SHADOWS_CLIP * mean_abs_dev`, then map the median to [`TARGET_BACKGROUND`].
pub(crate) fn auto_stretch(plane: &mut [f32]) {
    let max = plane.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !(max.is_finite() && max > 0.0) {
        plane.fill(0.0);
        return;
    }
    plane.iter_mut().for_each(|v| *v /= max);

    let median = median(plane);
    let avg_dev = plane.iter().map(|v| (v - median).abs() as f64).sum::<f64>() / plane.len() as f64;
    let c0 = (median + SHADOWS_CLIP * avg_dev as f32).clamp(0.0, 1.0);
    if c0 >= 1.0 {
        return;
    }
    let m = mtf(TARGET_BACKGROUND, median - c0);

    plane.par_iter_mut().for_each(|v| {
        *v = if *v < c0 { 0.0 } else { mtf(m, (*v - c0) / (1.0 - c0)) };
    });
}

/// Midtones transfer function with balance `m`.
fn mtf(m: f32, x: f32) -> f32 {
    if x == 0.0 {
        0.0
    } else if x == m {
        0.5
    } else if x == 1.0 {
        1.0
    } else {
        (m - 1.0) * x / ((2.0 * m - 1.0) * x - m)
    }
}

fn median(values: &[f32]) -> f32 {
    let mut sorted = values.to_vec();
    let mid = sorted.len() / 2;
    let (_, upper, _) = sorted.select_nth_unstable_by(mid, f32::total_cmp);
    let upper = *upper;
    if sorted.len() % 2 == 1 {
        upper
    } else {
        let lower = sorted[..mid].iter().copied().fold(f32::NEG_INFINITY, f32::max);
        (lower + upper) * 0.5
    }
}

fn encode_png(display: &PixelBuffer) -> Result<Vec<u8>, RenderError> {
    let dims = display.dims();
    let (width, height) = (dims.width as u32, dims.height as u32);

    let image = if dims.is_mono() {
        let samples: Vec<u16> = display
            .data()
            .iter()
            .map(|&v| (v * u16::MAX as f32) as u16)
            .collect();
        let buffer = ImageBuffer::<Luma<u16>, _>::from_raw(width, height, samples)
            .ok_or(RenderError::Layout(dims))?;
        DynamicImage::ImageLuma16(buffer)
    } else {
        let plane_len = dims.plane_len();
        let data = display.data();
        let mut samples = Vec::with_capacity(plane_len * 3);
        for i in 0..plane_len {
            let rgb = saturate([data[i], data[plane_len + i], data[2 * plane_len + i]]);
            samples.extend(rgb.iter().map(|&v| (v * u8::MAX as f32) as u8));
        }
        let buffer = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, samples)
            .ok_or(RenderError::Layout(dims))?;
        DynamicImage::ImageRgb8(buffer)
    };

    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// Pushes a pixel away from its luma by [`SATURATION`].
fn saturate([r, g, b]: [f32; 3]) -> [f32; 3] {
    let luma = 0.299 * r + 0.587 * g + 0.114 * b;
    [r, g, b].map(|c| (luma + SATURATION * (c - luma)).clamp(0.0, 1.0))
}
