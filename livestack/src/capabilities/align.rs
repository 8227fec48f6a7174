//! Translation-only registration by phase correlation.
//!
//! The shift is estimated on plane 0 from a centred window of at most
//! [`MAX_CORRELATION_SIZE`] pixels per axis, then applied to every plane with zero fill.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use thiserror::Error;

use super::Aligner;
use crate::frame::{ImageDimensions, PixelBuffer};

/// Largest correlation window side, in pixels.
pub const MAX_CORRELATION_SIZE: usize = 1024;

/// Below this energy a windowed plane is considered featureless.
const MIN_ENERGY: f64 = 1e-12;

#[derive(Debug, Error, PartialEq)]
pub enum AlignError {
    #[error("candidate is {candidate}, reference is {reference}")]
    ShapeMismatch {
        candidate: ImageDimensions,
        reference: ImageDimensions,
    },

    #[error("no coherent translation found (correlation peak {peak:.4} below {min_peak:.4})")]
    NoSolution { peak: f64, min_peak: f64 },
}

/// Estimated integer translation: `candidate(x, y) == reference(x - dx, y - dy)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Translation {
    pub dx: isize,
    pub dy: isize,
    pub peak: f64,
}

#[derive(Debug, Clone)]
pub struct PhaseCorrelationAligner {
    /// Minimum correlation peak value to accept.
    pub min_peak: f64,
}

impl Default for PhaseCorrelationAligner {
    fn default() -> Self {
        Self { min_peak: 0.05 }
    }
}

impl Aligner for PhaseCorrelationAligner {
    fn register(&self, candidate: &PixelBuffer, reference: &PixelBuffer) -> Result<PixelBuffer, AlignError> {
        if candidate.dims() != reference.dims() {
            return Err(AlignError::ShapeMismatch {
                candidate: candidate.dims(),
                reference: reference.dims(),
            });
        }

        let Some(translation) = self.estimate(candidate, reference)? else {
            log::debug!("featureless frame, registering with identity");
            return Ok(candidate.clone());
        };
        log::info!(
            "registered with shift ({}, {}), peak {:.3}",
            translation.dx,
            translation.dy,
            translation.peak
        );

        Ok(shift(candidate, -translation.dx, -translation.dy))
    }
}

impl PhaseCorrelationAligner {
    /// Translation of `candidate` relative to `reference` from plane 0. `None` when either
    /// plane has no structure to correlate.
    pub fn estimate(
        &self,
        candidate: &PixelBuffer,
        reference: &PixelBuffer,
    ) -> Result<Option<Translation>, AlignError> {
        let dims = reference.dims();
        let window = Window::centred(dims);
        let correlator = Correlator::new(window.size);

        let Some(ref_fft) = correlator.forward(reference.plane(0), dims.width, &window) else {
            return Ok(None);
        };
        let Some(cand_fft) = correlator.forward(candidate.plane(0), dims.width, &window) else {
            return Ok(None);
        };

        // F_cand * conj(F_ref) / |..| peaks at the candidate's offset
        let cross_power: Vec<Complex<f32>> = cand_fft
            .iter()
            .zip(ref_fft.iter())
            .map(|(&c, &r)| {
                let product = c * r.conj();
                let magnitude = product.norm();
                if magnitude > 1e-10 {
                    product / magnitude
                } else {
                    Complex::new(0.0, 0.0)
                }
            })
            .collect();

        let surface = correlator.inverse(cross_power);
        let (peak_x, peak_y, peak) = find_peak(&surface, window.size);
        if peak < self.min_peak {
            return Err(AlignError::NoSolution {
                peak,
                min_peak: self.min_peak,
            });
        }

        Ok(Some(Translation {
            dx: wrap(peak_x, window.size),
            dy: wrap(peak_y, window.size),
            peak,
        }))
    }
}

/// Square region of the plane that is correlated.
struct Window {
    size: usize,
    x0: usize,
    y0: usize,
    width: usize,
    height: usize,
}

impl Window {
    fn centred(dims: ImageDimensions) -> Self {
        let width = dims.width.min(MAX_CORRELATION_SIZE);
        let height = dims.height.min(MAX_CORRELATION_SIZE);
        Self {
            size: width.max(height).next_power_of_two(),
            x0: (dims.width - width) / 2,
            y0: (dims.height - height) / 2,
            width,
            height,
        }
    }
}

struct Correlator {
    size: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    hann: Vec<f32>,
}

impl Correlator {
    fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            size,
            forward: planner.plan_fft_forward(size),
            inverse: planner.plan_fft_inverse(size),
            hann: hann_window(size),
        }
    }

    /// Mean-subtracted, windowed, zero-padded 2D FFT. `None` for a featureless region.
    fn forward(&self, plane: &[f32], stride: usize, window: &Window) -> Option<Vec<Complex<f32>>> {
        let n = self.size;
        let mut sum = 0.0f64;
        for y in 0..window.height {
            let row = (window.y0 + y) * stride + window.x0;
            sum += plane[row..row + window.width].iter().map(|&v| v as f64).sum::<f64>();
        }
        let mean = (sum / (window.width * window.height) as f64) as f32;

        let mut data = vec![Complex::new(0.0f32, 0.0); n * n];
        let mut energy = 0.0f64;
        for y in 0..window.height {
            let row = (window.y0 + y) * stride + window.x0;
            for x in 0..window.width {
                let v = (plane[row + x] - mean) * self.hann[x] * self.hann[y];
                energy += (v as f64) * (v as f64);
                data[y * n + x] = Complex::new(v, 0.0);
            }
        }
        if energy < MIN_ENERGY {
            return None;
        }

        self.fft_2d(&mut data, &self.forward);
        Some(data)
    }

    fn inverse(&self, mut data: Vec<Complex<f32>>) -> Vec<f32> {
        self.fft_2d(&mut data, &self.inverse);
        let norm = 1.0 / (self.size * self.size) as f32;
        data.iter().map(|c| c.re * norm).collect()
    }

    /// Row-column decomposition.
    fn fft_2d(&self, data: &mut [Complex<f32>], fft: &Arc<dyn Fft<f32>>) {
        let n = self.size;
        for row in data.chunks_exact_mut(n) {
            fft.process(row);
        }
        transpose_inplace(data, n);
        for row in data.chunks_exact_mut(n) {
            fft.process(row);
        }
        transpose_inplace(data, n);
    }
}

fn hann_window(size: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    (0..size)
        .map(|i| {
            let x = i as f32 / size as f32;
            0.5 * (1.0 - (2.0 * PI * x).cos())
        })
        .collect()
}

fn transpose_inplace(data: &mut [Complex<f32>], n: usize) {
    for i in 0..n {
        for j in (i + 1)..n {
            data.swap(i * n + j, j * n + i);
        }
    }
}

fn find_peak(surface: &[f32], n: usize) -> (usize, usize, f64) {
    let (index, value) = surface
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best });
    (index % n, index / n, value as f64)
}

/// Maps a peak position in [0, n) to a signed shift.
fn wrap(position: usize, n: usize) -> isize {
    if position > n / 2 {
        position as isize - n as isize
    } else {
        position as isize
    }
}

/// `out(x, y) = input(x - dx, y - dy)`, zero where the source falls outside.
fn shift(input: &PixelBuffer, dx: isize, dy: isize) -> PixelBuffer {
    let dims = input.dims();
    let mut out = PixelBuffer::filled(dims, 0.0);
    for (src, dst) in input.planes().zip(out.planes_mut()) {
        for y in 0..dims.height {
            let Some(sy) = y.checked_add_signed(-dy).filter(|&sy| sy < dims.height) else {
                continue;
            };
            for x in 0..dims.width {
                if let Some(sx) = x.checked_add_signed(-dx).filter(|&sx| sx < dims.width) {
                    dst[y * dims.width + x] = src[sy * dims.width + sx];
                }
            }
        }
    }
    out
}
