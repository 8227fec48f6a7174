//! Per-frame orchestration: admission, decode, classification, calibration, alignment,
//! merge, persistence and publication.
//!
//! A [`Pipeline`] is driven by exactly one thread (see [`worker`]), which serializes every
//! read-modify-persist of a composite.

pub mod worker;


use std::fs;
use std::path::{Path, PathBuf};

use common::StageTimer;
use thiserror::Error;

use crate::broadcast::Broadcaster;
use crate::calibration::{self, CalibrationError, FlatDivision, SMOOTHING_SIGMA};
use crate::capabilities::{AlignError, Capabilities, CfaPattern, DebayerError, RenderError};
use crate::frame::{Frame, PixelBuffer};
use crate::keyer::{classify, Classification, CompositeKey, KeyError, Role};
use crate::store::{Composite, CompositeStore, StoreError};

pub use worker::{Stacker, StackerOptions, SubmitError, Submitter};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error("alignment failed: {0}")]
    Align(#[from] AlignError),

    #[error("debayer failed: {0}")]
    Debayer(#[from] DebayerError),

    #[error("render failed: {0}")]
    Render(#[from] RenderError),

    #[error("pipeline pass panicked: {0}")]
    Panicked(String),
}

impl PipelineError {
    /// Errors that must stop the worker: persisted state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Store(
                StoreError::Write { .. } | StoreError::Encode { .. } | StoreError::LedgerWrite { .. }
            )
        )
    }
}

/// Why a frame was admitted but not merged.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    Unreadable(String),
    Undecodable(String),
    Unkeyable(KeyError),
    UnknownRole(String),
    /// The source name cannot be written to the ledger.
    Unrecordable(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Unreadable(err) => write!(f, "unreadable: {err}"),
            SkipReason::Undecodable(err) => write!(f, "undecodable: {err}"),
            SkipReason::Unkeyable(err) => write!(f, "{err}"),
            SkipReason::UnknownRole(declared) => write!(f, "unknown image type {declared:?}"),
            SkipReason::Unrecordable(source_id) => {
                write!(f, "name {source_id:?} cannot be recorded as processed")
            }
        }
    }
}

/// A stage that was skipped while processing a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    MissingDark(CompositeKey),
    MissingFlat(CompositeKey),
    DegenerateFlat { key: CompositeKey, mean: f64 },
    /// First frame of its key: merged unaligned and becomes the reference.
    NoReference,
    UnsupportedBayerPattern(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeReport {
    pub key: CompositeKey,
    pub role: Role,
    /// Sample count after the merge.
    pub count: u32,
    pub notices: Vec<Notice>,
    /// Display artifact written for LIGHT composites.
    pub artifact: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    AlreadyProcessed,
    Skipped(SkipReason),
    Merged(MergeReport),
}

pub struct Pipeline {
    store: CompositeStore,
    capabilities: Capabilities,
    broadcaster: Broadcaster,
}

impl Pipeline {
    pub fn new(store: CompositeStore, capabilities: Capabilities, broadcaster: Broadcaster) -> Self {
        Self {
            store,
            capabilities,
            broadcaster,
        }
    }

    pub fn store(&self) -> &CompositeStore {
        &self.store
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Runs one frame through every stage.
    ///
    /// The source is recorded in the ledger before anything else happens, so a frame that
    /// fails later is never retried. Only [`PipelineError::is_fatal`] errors leave the
    /// store in a state that needs attention.
    pub fn process(&mut self, source: &Path) -> Result<Outcome, PipelineError> {
        let source_id = source.to_string_lossy();
        if self.store.is_processed(&source_id) {
            log::info!("{} already processed, skipping", source.display());
            return Ok(Outcome::AlreadyProcessed);
        }
        match self.store.mark_processed(&source_id) {
            Ok(()) => {}
            Err(StoreError::InvalidSourceId(source_id)) => {
                let reason = SkipReason::Unrecordable(source_id);
                log::warn!("skipping {}: {reason}", source.display());
                return Ok(Outcome::Skipped(reason));
            }
            Err(err) => return Err(err.into()),
        }

        let _timer = StageTimer::new(format!("processing {}", source.display()));

        let frame = match self.read_frame(source) {
            Ok(frame) => frame,
            Err(reason) => {
                log::warn!("skipping {}: {reason}", source.display());
                return Ok(Outcome::Skipped(reason));
            }
        };

        let classification = match classify(&frame.metadata) {
            Ok(classification) => classification,
            Err(err) => {
                log::warn!("skipping {}: {err}", source.display());
                return Ok(Outcome::Skipped(SkipReason::Unkeyable(err)));
            }
        };
        let role = classification.role();
        let Some(key) = classification.key.clone() else {
            let declared = frame.metadata.image_type;
            log::warn!(
                "skipping {}: unknown image type {declared:?}",
                source.display()
            );
            return Ok(Outcome::Skipped(SkipReason::UnknownRole(declared)));
        };
        log::info!("{} is a {role} frame for {key}", source.display());

        let existing = self.store.load(&key);
        let mut notices = Vec::new();

        // a calibration composite's first frame is stored as is
        let contribution = match role {
            Role::Dark if existing.is_some() => smooth(&frame.pixels),
            Role::Dark => frame.pixels,
            Role::Flat => {
                let mut pixels = frame.pixels;
                self.subtract_dark(&mut pixels, classification.dark_key.as_ref(), &mut notices)?;
                if existing.is_some() {
                    smooth(&pixels)
                } else {
                    pixels
                }
            }
            Role::Light => self.calibrate_light(frame, &classification, existing.as_ref(), &mut notices)?,
            Role::Unknown => {
                return Ok(Outcome::Skipped(SkipReason::UnknownRole(
                    frame.metadata.image_type,
                )))
            }
        };

        let (accumulated, count) = match &existing {
            Some(composite) => (Some(&composite.pixels), composite.count),
            None => (None, 0),
        };
        let merged = {
            let _timer = StageTimer::new("merge");
            calibration::merge(accumulated, count, &contribution)?
        };
        debug_assert!(merged.is_normalized(), "merge left [0, 1]");

        let composite = Composite {
            key: key.clone(),
            setup: classification.setup,
            pixels: merged,
            count: count.saturating_add(1),
        };
        {
            let _timer = StageTimer::new("save");
            self.store.save(&composite)?;
        }
        log::info!("{key} now holds {} frames", composite.count);

        let artifact = match role {
            Role::Light => Some(self.publish(&composite)?),
            Role::Dark | Role::Flat | Role::Unknown => None,
        };

        Ok(Outcome::Merged(MergeReport {
            key,
            role,
            count: composite.count,
            notices,
            artifact,
        }))
    }

    fn read_frame(&self, source: &Path) -> Result<Frame, SkipReason> {
        let metadata = fs::metadata(source).map_err(|err| SkipReason::Unreadable(err.to_string()))?;
        if !metadata.is_file() {
            return Err(SkipReason::Unreadable("not a regular file".to_string()));
        }
        let mut frame = self
            .store
            .codec()
            .read(source)
            .map_err(|err| SkipReason::Undecodable(err.to_string()))?;
        frame.pixels.clamp_unit();
        Ok(frame)
    }

    fn calibrate_light(
        &self,
        frame: Frame,
        classification: &Classification,
        reference: Option<&Composite>,
        notices: &mut Vec<Notice>,
    ) -> Result<PixelBuffer, PipelineError> {
        let mut pixels = frame.pixels;
        self.subtract_dark(&mut pixels, classification.dark_key.as_ref(), notices)?;
        self.divide_flat(&mut pixels, classification.flat_key.as_ref(), notices)?;

        if let Some(declared) = frame.metadata.bayer_pattern.as_deref() {
            match CfaPattern::from_bayerpat(declared) {
                Some(pattern) => {
                    let _timer = StageTimer::new("debayer");
                    pixels = self.capabilities.debayer.debayer(&pixels, pattern)?;
                    debug_assert!(pixels.is_normalized(), "debayer left [0, 1]");
                }
                None => {
                    log::warn!("unsupported bayer pattern {declared:?}, leaving frame as mosaic");
                    notices.push(Notice::UnsupportedBayerPattern(declared.to_string()));
                }
            }
        }

        match reference {
            Some(reference) => {
                let _timer = StageTimer::new("align");
                pixels = self.capabilities.aligner.register(&pixels, &reference.pixels)?;
                debug_assert!(pixels.is_normalized(), "alignment left [0, 1]");
            }
            None => {
                log::info!("no reference composite yet, frame becomes the reference");
                notices.push(Notice::NoReference);
            }
        }

        Ok(pixels)
    }

    fn subtract_dark(
        &self,
        pixels: &mut PixelBuffer,
        dark_key: Option<&CompositeKey>,
        notices: &mut Vec<Notice>,
    ) -> Result<(), PipelineError> {
        let Some(dark_key) = dark_key else {
            return Ok(());
        };
        match self.store.load(dark_key) {
            Some(dark) => {
                let _timer = StageTimer::new("dark subtraction");
                calibration::subtract_dark(pixels, &dark.pixels)?;
                debug_assert!(pixels.is_normalized(), "dark subtraction left [0, 1]");
            }
            None => {
                log::info!("no dark composite {dark_key}, skipping dark subtraction");
                notices.push(Notice::MissingDark(dark_key.clone()));
            }
        }
        Ok(())
    }

    fn divide_flat(
        &self,
        pixels: &mut PixelBuffer,
        flat_key: Option<&CompositeKey>,
        notices: &mut Vec<Notice>,
    ) -> Result<(), PipelineError> {
        let Some(flat_key) = flat_key else {
            return Ok(());
        };
        let Some(flat) = self.store.load(flat_key) else {
            log::info!("no flat composite {flat_key}, skipping flat division");
            notices.push(Notice::MissingFlat(flat_key.clone()));
            return Ok(());
        };

        let _timer = StageTimer::new("flat division");
        match calibration::divide_flat(pixels, &flat.pixels)? {
            FlatDivision::Applied => {
                debug_assert!(pixels.is_normalized(), "flat division left [0, 1]");
            }
            FlatDivision::Skipped { mean } => {
                log::warn!("flat composite {flat_key} has mean {mean}, skipping flat division");
                notices.push(Notice::DegenerateFlat {
                    key: flat_key.clone(),
                    mean,
                });
            }
        }
        Ok(())
    }

    /// Renders a LIGHT composite and hands the artifact to the broadcaster.
    fn publish(&self, composite: &Composite) -> Result<PathBuf, PipelineError> {
        let artifact = {
            let _timer = StageTimer::new("render");
            self.capabilities
                .renderer
                .render(&composite.key, &composite.pixels)?
        };
        let path = artifact.path.clone();
        let delivered = self.broadcaster.publish_artifact(artifact);
        log::debug!("published {} to {delivered} subscribers", composite.key);
        Ok(path)
    }
}

fn smooth(pixels: &PixelBuffer) -> PixelBuffer {
    let _timer = StageTimer::new("smoothing");
    calibration::gaussian_smooth(pixels, SMOOTHING_SIGMA)
}
