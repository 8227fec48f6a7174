//! Calibration and accumulation arithmetic on normalized pixel buffers.
//!
//! Every operation keeps values in [0, 1].

use rayon::prelude::*;
use thiserror::Error;

use crate::frame::{ImageDimensions, PixelBuffer};

/// Sigma of the smoothing applied to DARK and FLAT contributions.
pub const SMOOTHING_SIGMA: f32 = 1.0;

/// Kernel radius in multiples of sigma.
const TRUNCATE: f32 = 4.0;

#[derive(Debug, Error, PartialEq)]
pub enum CalibrationError {
    #[error("{stage}: frame is {frame}, calibration is {calibration}")]
    ShapeMismatch {
        stage: &'static str,
        frame: ImageDimensions,
        calibration: ImageDimensions,
    },
}

/// What [`divide_flat`] did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlatDivision {
    Applied,
    /// The flat's mean was not positive; the frame is unchanged.
    Skipped { mean: f64 },
}

/// `frame = clamp(frame - dark, 0, 1)`.
pub fn subtract_dark(frame: &mut PixelBuffer, dark: &PixelBuffer) -> Result<(), CalibrationError> {
    ensure_same_shape("dark subtraction", frame, dark)?;

    frame
        .data_mut()
        .par_iter_mut()
        .zip(dark.data().par_iter())
        .for_each(|(l, d)| *l = (*l - d).clamp(0.0, 1.0));
    Ok(())
}

/// `frame = clamp(frame / (flat / mean(flat)), 0, 1)`. A `0/0` sample becomes 0.
pub fn divide_flat(frame: &mut PixelBuffer, flat: &PixelBuffer) -> Result<FlatDivision, CalibrationError> {
    ensure_same_shape("flat division", frame, flat)?;

    let sum: f64 = flat.data().par_iter().map(|&f| f as f64).sum();
    let mean = sum / flat.data().len() as f64;
    if mean.is_nan() || mean <= 0.0 {
        return Ok(FlatDivision::Skipped { mean });
    }
    let inv_mean = (1.0 / mean) as f32;

    frame
        .data_mut()
        .par_iter_mut()
        .zip(flat.data().par_iter())
        .for_each(|(l, f)| {
            let corrected = *l / (f * inv_mean);
            *l = if corrected.is_nan() {
                0.0
            } else {
                corrected.clamp(0.0, 1.0)
            };
        });
    Ok(FlatDivision::Applied)
}

/// Separable Gaussian blur of every plane, with edge samples replicated outwards.
pub fn gaussian_smooth(buffer: &PixelBuffer, sigma: f32) -> PixelBuffer {
    if sigma.is_nan() || sigma <= 0.0 {
        return buffer.clone();
    }

    let kernel = gaussian_kernel(sigma);
    let dims = buffer.dims();
    let mut out = PixelBuffer::filled(dims, 0.0);
    for (src, dst) in buffer.planes().zip(out.planes_mut()) {
        smooth_plane(src, dst, dims.width, dims.height, &kernel);
    }
    out
}

/// Running mean update: `(n * accumulated + contribution) / (n + 1)`, clamped to [0, 1].
///
/// With no accumulated buffer (or `count == 0`) the result is the contribution itself.
pub fn merge(
    accumulated: Option<&PixelBuffer>,
    count: u32,
    contribution: &PixelBuffer,
) -> Result<PixelBuffer, CalibrationError> {
    let Some(accumulated) = accumulated.filter(|_| count > 0) else {
        let mut first = contribution.clone();
        first.clamp_unit();
        return Ok(first);
    };
    ensure_same_shape("merge", contribution, accumulated)?;

    let n = count as f64;
    let inv = 1.0 / (n + 1.0);
    let data: Vec<f32> = accumulated
        .data()
        .par_iter()
        .zip(contribution.data().par_iter())
        .map(|(&a, &b)| {
            let merged = ((n * a as f64 + b as f64) * inv) as f32;
            if merged.is_nan() {
                0.0
            } else {
                merged.clamp(0.0, 1.0)
            }
        })
        .collect();

    Ok(PixelBuffer::new(accumulated.dims(), data))
}

fn ensure_same_shape(
    stage: &'static str,
    frame: &PixelBuffer,
    calibration: &PixelBuffer,
) -> Result<(), CalibrationError> {
    if frame.dims() == calibration.dims() {
        Ok(())
    } else {
        Err(CalibrationError::ShapeMismatch {
            stage,
            frame: frame.dims(),
            calibration: calibration.dims(),
        })
    }
}

fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (TRUNCATE * sigma + 0.5) as isize;
    let weights: Vec<f32> = (-radius..=radius)
        .map(|i| {
            let x = i as f32 / sigma;
            (-0.5 * x * x).exp()
        })
        .collect();
    let total: f32 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

fn smooth_plane(src: &[f32], dst: &mut [f32], width: usize, height: usize, kernel: &[f32]) {
    let radius = kernel.len() / 2;

    let mut horizontal = vec![0.0f32; src.len()];
    horizontal
        .par_chunks_mut(width)
        .zip(src.par_chunks(width))
        .for_each(|(row, src_row)| {
            for (x, out) in row.iter_mut().enumerate() {
                *out = kernel
                    .iter()
                    .enumerate()
                    .map(|(k, w)| {
                        let sx = (x + k).saturating_sub(radius).min(width - 1);
                        w * src_row[sx]
                    })
                    .sum();
            }
        });

    dst.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
        row.fill(0.0);
        for (k, w) in kernel.iter().enumerate() {
            let sy = (y + k).saturating_sub(radius).min(height - 1);
            let src_row = &horizontal[sy * width..(sy + 1) * width];
            for (out, v) in row.iter_mut().zip(src_row) {
                *out += w * v;
            }
        }
    });
}
