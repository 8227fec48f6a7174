//! FITS primary HDU codec for 2D (mono) and 3D (planar) images, backed by cfitsio.
//!
//! cfitsio applies `BZERO`/`BSCALE`; integer data is then normalized to [0,1] by the full
//! range of its image type. Float data passes through, with NaN/Inf (FITS nulls)
//! replaced by 0. Composites are written as 32-bit float.

#[cfg(test)]
mod tests;

use std::fs;
use std::io;
use std::path::Path;

use fitsio::hdu::{FitsHdu, HduInfo};
use fitsio::headers::ReadsKey;
use fitsio::images::{ImageDescription, ImageType};
use fitsio::FitsFile;
use rayon::prelude::*;

use crate::capabilities::{CodecError, FrameCodec};
use crate::frame::{Frame, FrameMetadata, ImageDimensions, PixelBuffer};

/// Value an integer sample of `image_type` maps to 1.0. `None` for float types.
pub fn normalization_max(image_type: &ImageType) -> Option<f64> {
    match image_type {
        ImageType::UnsignedByte | ImageType::Byte => Some(u8::MAX as f64),
        ImageType::Short | ImageType::UnsignedShort => Some(u16::MAX as f64),
        ImageType::Long | ImageType::UnsignedLong => Some(u32::MAX as f64),
        ImageType::LongLong => Some(u64::MAX as f64),
        ImageType::Float | ImageType::Double => None,
    }
}

/// Reads and writes single-HDU FITS files.
#[derive(Debug, Clone, Copy, Default)]
pub struct FitsCodec;

impl FitsCodec {
    pub const EXTENSION: &'static str = "fits";
}

impl FrameCodec for FitsCodec {
    fn extension(&self) -> &str {
        Self::EXTENSION
    }

    fn read(&self, path: &Path) -> Result<Frame, CodecError> {
        let mut fptr = FitsFile::open(path)?;
        let hdu = fptr.primary_hdu()?;

        let (shape, image_type) = match &hdu.info {
            HduInfo::ImageInfo { shape, image_type } => (shape.clone(), image_type.clone()),
            HduInfo::TableInfo { .. } | HduInfo::AnyInfo => return Err(CodecError::NotAnImage),
        };
        let dims = image_dimensions(&shape)?;

        let raw: Vec<f32> = hdu.read_image(&mut fptr)?;
        if raw.len() != dims.sample_count() {
            return Err(CodecError::PixelCount {
                expected: dims.sample_count(),
                actual: raw.len(),
            });
        }
        let pixels = normalize(raw, &image_type);
        let metadata = read_metadata(&hdu, &mut fptr)?;

        Ok(Frame {
            metadata,
            pixels: PixelBuffer::new(dims, pixels),
        })
    }

    fn write(&self, frame: &Frame, path: &Path) -> Result<(), CodecError> {
        check_finite(&frame.metadata)?;

        // cfitsio refuses to create over an existing file
        match fs::remove_file(path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
            _ => {}
        }

        let dims = frame.pixels.dims();
        let shape = [dims.planes, dims.height, dims.width];
        let description = ImageDescription {
            data_type: ImageType::Float,
            dimensions: if dims.is_mono() { &shape[1..] } else { &shape[..] },
        };
        let mut fptr = FitsFile::create(path)
            .with_custom_primary(&description)
            .open()?;
        let hdu = fptr.primary_hdu()?;

        hdu.write_image(&mut fptr, frame.pixels.data())?;
        write_metadata(&hdu, &mut fptr, &frame.metadata)?;

        Ok(())
    }
}

/// `shape` is in reverse NAXIS order: `[height, width]` or `[planes, height, width]`.
fn image_dimensions(shape: &[usize]) -> Result<ImageDimensions, CodecError> {
    if shape.contains(&0) {
        return Err(CodecError::InvalidValue {
            key: "NAXIS",
            reason: format!("{shape:?} has an empty axis"),
        });
    }
    match *shape {
        [height, width] => Ok(ImageDimensions::new(width, height, 1)),
        [planes, height, width] => Ok(ImageDimensions::new(width, height, planes)),
        _ => Err(CodecError::UnsupportedDimensions(shape.len())),
    }
}

fn normalize(mut pixels: Vec<f32>, image_type: &ImageType) -> Vec<f32> {
    match normalization_max(image_type) {
        Some(max) => {
            let inv_max = 1.0 / max;
            pixels
                .par_iter_mut()
                .for_each(|p| *p = (*p as f64 * inv_max).clamp(0.0, 1.0) as f32);
        }
        None => pixels.par_iter_mut().for_each(|p| {
            if !p.is_finite() {
                *p = 0.0;
            }
        }),
    }
    pixels
}

fn read_key_optional<T: ReadsKey>(hdu: &FitsHdu, fptr: &mut FitsFile, key: &str) -> Option<T> {
    hdu.read_key(fptr, key).ok()
}

fn read_text(hdu: &FitsHdu, fptr: &mut FitsFile, key: &str) -> Option<String> {
    read_key_optional::<String>(hdu, fptr, key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_finite(hdu: &FitsHdu, fptr: &mut FitsFile, key: &'static str) -> Result<Option<f64>, CodecError> {
    match read_key_optional::<f64>(hdu, fptr, key) {
        Some(value) if value.is_finite() => Ok(Some(value)),
        Some(value) => Err(CodecError::InvalidValue {
            key,
            reason: format!("{value} is not finite"),
        }),
        None => Ok(None),
    }
}

fn read_metadata(hdu: &FitsHdu, fptr: &mut FitsFile) -> Result<FrameMetadata, CodecError> {
    let camera = read_text(hdu, fptr, "INSTRUME").ok_or(CodecError::MissingKey("INSTRUME"))?;
    let exposure = read_finite(hdu, fptr, "EXPTIME")?.ok_or(CodecError::MissingKey("EXPTIME"))?;
    let temperature = match read_finite(hdu, fptr, "CCD-TEMP")? {
        Some(value) => value,
        None => read_finite(hdu, fptr, "CCDTEMP")?.ok_or(CodecError::MissingKey("CCD-TEMP"))?,
    };
    let image_type = read_text(hdu, fptr, "IMAGETYP")
        .or_else(|| read_text(hdu, fptr, "FRAME"))
        .ok_or(CodecError::MissingKey("IMAGETYP"))?;

    Ok(FrameMetadata {
        camera,
        exposure,
        gain: read_key_optional::<f64>(hdu, fptr, "GAIN")
            .filter(|gain| gain.is_finite())
            .map_or(0, |gain| gain.round() as i64),
        temperature,
        image_type,
        target: read_text(hdu, fptr, "OBJECT"),
        filter: read_text(hdu, fptr, "FILTER"),
        bayer_pattern: read_text(hdu, fptr, "BAYERPAT"),
        sample_count: read_key_optional::<i64>(hdu, fptr, "SUBCOUNT")
            .and_then(|count| u32::try_from(count).ok()),
    })
}

fn check_finite(metadata: &FrameMetadata) -> Result<(), CodecError> {
    for (key, value) in [
        ("EXPTIME", metadata.exposure),
        ("CCD-TEMP", metadata.temperature),
    ] {
        if !value.is_finite() {
            return Err(CodecError::InvalidValue {
                key,
                reason: format!("{value} is not finite"),
            });
        }
    }
    Ok(())
}

fn write_metadata(hdu: &FitsHdu, fptr: &mut FitsFile, metadata: &FrameMetadata) -> Result<(), CodecError> {
    hdu.write_key(fptr, "INSTRUME", metadata.camera.clone())?;
    hdu.write_key(fptr, "IMAGETYP", metadata.image_type.clone())?;
    hdu.write_key(fptr, "EXPTIME", metadata.exposure)?;
    hdu.write_key(fptr, "GAIN", metadata.gain)?;
    hdu.write_key(fptr, "CCD-TEMP", metadata.temperature)?;

    let optional = [
        ("OBJECT", &metadata.target),
        ("FILTER", &metadata.filter),
        ("BAYERPAT", &metadata.bayer_pattern),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            hdu.write_key(fptr, key, value.clone())?;
        }
    }
    if let Some(count) = metadata.sample_count {
        hdu.write_key(fptr, "SUBCOUNT", count as i64)?;
    }

    Ok(())
}
