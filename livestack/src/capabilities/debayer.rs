//! Bilinear demosaicing of Bayer CFA mosaics into planar RGB.

use rayon::prelude::*;
use thiserror::Error;

use super::Debayer;
use crate::frame::{ImageDimensions, PixelBuffer};

#[derive(Debug, Error, PartialEq)]
pub enum DebayerError {
    #[error("expected a single-plane mosaic, got {0} planes")]
    NotMosaic(usize),

    #[error("mosaic {0} is smaller than one 2x2 pattern cell")]
    TooSmall(ImageDimensions),
}

/// Bayer CFA (Color Filter Array) pattern.
/// Represents the 2x2 pattern of color filters on the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfaPattern {
    /// RGGB: Red at (0,0), Green at (0,1) and (1,0), Blue at (1,1)
    Rggb,
    /// BGGR: Blue at (0,0), Green at (0,1) and (1,0), Red at (1,1)
    Bggr,
    /// GRBG: Green at (0,0), Red at (0,1), Blue at (1,0), Green at (1,1)
    Grbg,
    /// GBRG: Green at (0,0), Blue at (0,1), Red at (1,0), Green at (1,1)
    Gbrg,
}

impl CfaPattern {
    /// Parses a BAYERPAT header value, ignoring case and surrounding whitespace.
    pub fn from_bayerpat(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "RGGB" => Some(CfaPattern::Rggb),
            "BGGR" => Some(CfaPattern::Bggr),
            "GRBG" => Some(CfaPattern::Grbg),
            "GBRG" => Some(CfaPattern::Gbrg),
            _ => None,
        }
    }

    /// Get color index at position (y, x) in the Bayer pattern.
    /// Returns: 0=Red, 1=Green, 2=Blue
    #[inline(always)]
    pub fn color_at(&self, y: usize, x: usize) -> usize {
        let row = y & 1;
        let col = x & 1;
        self.pattern_2x2()[(row << 1) | col]
    }

    /// Check if red is on the same row as a green pixel at position (y, x).
    /// Used to determine interpolation direction for green pixels.
    #[inline(always)]
    pub fn red_in_row(&self, y: usize) -> bool {
        match self {
            CfaPattern::Rggb | CfaPattern::Grbg => (y & 1) == 0,
            CfaPattern::Bggr | CfaPattern::Gbrg => (y & 1) == 1,
        }
    }

    /// Get the 2x2 color pattern as [row0_col0, row0_col1, row1_col0, row1_col1].
    #[inline(always)]
    pub fn pattern_2x2(&self) -> [usize; 4] {
        match self {
            CfaPattern::Rggb => [0, 1, 1, 2],
            CfaPattern::Bggr => [2, 1, 1, 0],
            CfaPattern::Grbg => [1, 0, 2, 1],
            CfaPattern::Gbrg => [1, 2, 0, 1],
        }
    }
}

/// Bilinear interpolation of the two missing colours at every photosite, followed by
/// normalization of the result by its maximum.
#[derive(Debug, Clone, Copy, Default)]
pub struct BilinearDebayer;

impl Debayer for BilinearDebayer {
    fn debayer(&self, mosaic: &PixelBuffer, pattern: CfaPattern) -> Result<PixelBuffer, DebayerError> {
        let dims = mosaic.dims();
        if !dims.is_mono() {
            return Err(DebayerError::NotMosaic(dims.planes));
        }
        if dims.width < 2 || dims.height < 2 {
            return Err(DebayerError::TooSmall(dims));
        }

        let mosaic = Mosaic {
            data: mosaic.data(),
            width: dims.width,
            height: dims.height,
        };
        let out_dims = ImageDimensions::new(dims.width, dims.height, 3);
        let mut rgb = PixelBuffer::filled(out_dims, 0.0);
        let plane_len = out_dims.plane_len();

        let (red, rest) = rgb.data_mut().split_at_mut(plane_len);
        let (green, blue) = rest.split_at_mut(plane_len);
        red.par_chunks_mut(dims.width)
            .zip(green.par_chunks_mut(dims.width))
            .zip(blue.par_chunks_mut(dims.width))
            .enumerate()
            .for_each(|(y, ((r_row, g_row), b_row))| {
                for x in 0..dims.width {
                    let [r, g, b] = mosaic.interpolate(pattern, x, y);
                    r_row[x] = r;
                    g_row[x] = g;
                    b_row[x] = b;
                }
            });

        let max = rgb.max();
        if max > 0.0 && max.is_finite() {
            let inv_max = 1.0 / max;
            rgb.data_mut().par_iter_mut().for_each(|v| *v *= inv_max);
        }
        Ok(rgb)
    }
}

struct Mosaic<'a> {
    data: &'a [f32],
    width: usize,
    height: usize,
}

impl Mosaic<'_> {
    fn interpolate(&self, pattern: CfaPattern, x: usize, y: usize) -> [f32; 3] {
        let value = self.data[y * self.width + x];
        match pattern.color_at(y, x) {
            0 => [value, self.cross(x, y), self.diagonal(x, y)],
            2 => [self.diagonal(x, y), self.cross(x, y), value],
            _ => {
                let (horizontal, vertical) = (self.horizontal(x, y), self.vertical(x, y));
                if pattern.red_in_row(y) {
                    [horizontal, value, vertical]
                } else {
                    [vertical, value, horizontal]
                }
            }
        }
    }

    /// Interpolate from horizontal neighbors, mirroring at the edges.
    fn horizontal(&self, x: usize, y: usize) -> f32 {
        let idx = y * self.width + x;
        let left = if x > 0 { self.data[idx - 1] } else { self.data[idx + 1] };
        let right = if x + 1 < self.width {
            self.data[idx + 1]
        } else {
            self.data[idx - 1]
        };
        (left + right) * 0.5
    }

    /// Interpolate from vertical neighbors, mirroring at the edges.
    fn vertical(&self, x: usize, y: usize) -> f32 {
        let idx = y * self.width + x;
        let top = if y > 0 {
            self.data[idx - self.width]
        } else {
            self.data[idx + self.width]
        };
        let bottom = if y + 1 < self.height {
            self.data[idx + self.width]
        } else {
            self.data[idx - self.width]
        };
        (top + bottom) * 0.5
    }

    /// Mean of the in-bounds 4-neighbours.
    fn cross(&self, x: usize, y: usize) -> f32 {
        let offsets = [(-1, 0), (1, 0), (0, -1), (0, 1)];
        self.mean_of(x, y, &offsets)
    }

    /// Mean of the in-bounds diagonal neighbours.
    fn diagonal(&self, x: usize, y: usize) -> f32 {
        let offsets = [(-1, -1), (1, -1), (-1, 1), (1, 1)];
        self.mean_of(x, y, &offsets)
    }

    fn mean_of(&self, x: usize, y: usize, offsets: &[(isize, isize)]) -> f32 {
        let mut sum = 0.0f32;
        let mut count = 0;
        for &(dx, dy) in offsets {
            let (Some(nx), Some(ny)) = (x.checked_add_signed(dx), y.checked_add_signed(dy)) else {
                continue;
            };
            if nx < self.width && ny < self.height {
                sum += self.data[ny * self.width + nx];
                count += 1;
            }
        }
        if count > 0 {
            sum / count as f32
        } else {
            self.data[y * self.width + x]
        }
    }
}
