//! Frame builders shared by unit tests.

use std::path::{Path, PathBuf};

use crate::capabilities::FrameCodec;
use crate::fits::FitsCodec;
use crate::frame::{Frame, FrameMetadata, ImageDimensions, PixelBuffer};
use crate::keyer::classify;
use crate::store::Composite;

pub(crate) const SMALL: ImageDimensions = ImageDimensions {
    width: 16,
    height: 12,
    planes: 1,
};

pub(crate) fn dark_metadata() -> FrameMetadata {
    FrameMetadata {
        camera: "CamA".to_string(),
        exposure: 30.0,
        gain: 100,
        temperature: -10.0,
        image_type: "Dark Frame".to_string(),
        ..FrameMetadata::default()
    }
}

pub(crate) fn flat_metadata() -> FrameMetadata {
    FrameMetadata {
        image_type: "Flat Frame".to_string(),
        ..dark_metadata()
    }
}

pub(crate) fn light_metadata(target: &str) -> FrameMetadata {
    FrameMetadata {
        image_type: "Light Frame".to_string(),
        target: Some(target.to_string()),
        ..dark_metadata()
    }
}

pub(crate) fn constant_frame(metadata: FrameMetadata, dims: ImageDimensions, value: f32) -> Frame {
    Frame {
        metadata,
        pixels: PixelBuffer::filled(dims, value),
    }
}

pub(crate) fn composite(metadata: &FrameMetadata, pixels: PixelBuffer, count: u32) -> Composite {
    let classification = classify(metadata).expect("test metadata classifies");
    Composite {
        key: classification.key.expect("test metadata has a key"),
        setup: classification.setup,
        pixels,
        count,
    }
}

/// Writes `frame` as a float FITS file named `name` into `dir`.
pub(crate) fn write_frame(dir: &Path, name: &str, frame: &Frame) -> PathBuf {
    let path = dir.join(name);
    FitsCodec.write(frame, &path).expect("test frame written");
    path
}

pub(crate) fn assert_all_close(pixels: &PixelBuffer, expected: f32) {
    for (i, value) in pixels.data().iter().enumerate() {
        assert!(
            (value - expected).abs() < 1e-5,
            "sample {i}: {value} != {expected}"
        );
    }
}
