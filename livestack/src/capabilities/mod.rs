//! Interfaces of the external collaborators the pipeline drives: frame codec, debayering,
//! geometric registration and display rendering. Each ships with one concrete adapter.

pub mod align;
pub mod debayer;
pub mod render;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::broadcast::Artifact;
use crate::frame::{Frame, PixelBuffer};
use crate::keyer::CompositeKey;

pub use align::{AlignError, PhaseCorrelationAligner};
pub use debayer::{BilinearDebayer, CfaPattern, DebayerError};
pub use render::{PngRenderer, RenderError};

/// Errors reading or writing a frame file.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Fits(#[from] fitsio::errors::Error),

    #[error("primary HDU is not an image")]
    NotAnImage,

    #[error("missing required header keyword {0}")]
    MissingKey(&'static str),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("unsupported dimensionality: NAXIS = {0}, expected 2 or 3")]
    UnsupportedDimensions(usize),

    #[error("pixel count mismatch: header declares {expected}, data holds {actual}")]
    PixelCount { expected: usize, actual: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reads and writes frames as files.
pub trait FrameCodec: Send + Sync {
    /// File extension (without the dot) of written frames.
    fn extension(&self) -> &str;

    fn read(&self, path: &Path) -> Result<Frame, CodecError>;

    /// Writes `frame` to `path`, replacing any file already there.
    fn write(&self, frame: &Frame, path: &Path) -> Result<(), CodecError>;
}

/// Converts a single-plane colour filter array mosaic into planar RGB.
pub trait Debayer: Send {
    fn debayer(&self, mosaic: &PixelBuffer, pattern: CfaPattern) -> Result<PixelBuffer, DebayerError>;
}

/// Geometric registration of a frame onto a reference.
pub trait Aligner: Send {
    /// Returns `candidate` transformed onto `reference`'s geometry, same shape as the input.
    fn register(&self, candidate: &PixelBuffer, reference: &PixelBuffer) -> Result<PixelBuffer, AlignError>;
}

/// Produces a display artifact for a composite.
pub trait Renderer: Send {
    fn render(&self, key: &CompositeKey, pixels: &PixelBuffer) -> Result<Artifact, RenderError>;
}

/// The set of collaborators one pipeline uses.
pub struct Capabilities {
    pub debayer: Box<dyn Debayer>,
    pub aligner: Box<dyn Aligner>,
    pub renderer: Box<dyn Renderer>,
}

impl Capabilities {
    /// Bilinear debayer, phase-correlation aligner and PNG renderer writing into `output_dir`.
    pub fn standard(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            debayer: Box::new(BilinearDebayer),
            aligner: Box::new(PhaseCorrelationAligner::default()),
            renderer: Box::new(PngRenderer::new(output_dir)),
        }
    }
}
