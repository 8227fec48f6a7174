//! Durable keyed persistence of composites plus the admission ledger.
//!
//! Each composite lives in its own file `<key>.<ext>` inside the storage directory. Saves
//! go through a synced temporary file and a rename, so a crash mid-write leaves the
//! previous version in place.

mod ledger;

#[cfg(test)]
mod tests;

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::capabilities::{CodecError, FrameCodec};
use crate::frame::{Frame, PixelBuffer};
use crate::keyer::{classify, CompositeKey, Setup};

pub use ledger::Ledger;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to create storage directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write composite {key}: {source}")]
    Encode {
        key: CompositeKey,
        #[source]
        source: CodecError,
    },

    #[error("Failed to write composite '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read ledger '{path}': {source}")]
    LedgerRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to append to ledger '{path}': {source}")]
    LedgerWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Source identifier {0:?} cannot be recorded in the ledger")]
    InvalidSourceId(String),
}

/// Running accumulator for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct Composite {
    pub key: CompositeKey,
    pub setup: Setup,
    pub pixels: PixelBuffer,
    /// Number of frames merged so far.
    pub count: u32,
}

impl Composite {
    /// Rebuilds a composite from a decoded file. `None` when the file's metadata does not
    /// classify to a keyed role.
    pub fn from_frame(frame: Frame) -> Option<Self> {
        let classification = classify(&frame.metadata).ok()?;
        let key = classification.key?;
        Some(Self {
            key,
            setup: classification.setup,
            count: frame.metadata.sample_count.unwrap_or(1),
            pixels: frame.pixels,
        })
    }

    pub fn to_frame(&self) -> Frame {
        Frame {
            metadata: self.setup.to_metadata(self.count),
            pixels: self.pixels.clone(),
        }
    }
}

pub struct CompositeStore {
    dir: PathBuf,
    codec: Arc<dyn FrameCodec>,
    ledger: Ledger,
}

impl CompositeStore {
    /// Opens (creating if needed) the storage directory and loads its ledger.
    pub fn open(dir: impl Into<PathBuf>, codec: Arc<dyn FrameCodec>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        let ledger = Ledger::open(&dir)?;

        Ok(Self { dir, codec, ledger })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn codec(&self) -> &dyn FrameCodec {
        self.codec.as_ref()
    }

    /// File holding the composite for `key`.
    pub fn path_for(&self, key: &CompositeKey) -> PathBuf {
        self.dir
            .join(format!("{}.{}", key.file_stem(), self.codec.extension()))
    }

    pub fn exists(&self, key: &CompositeKey) -> bool {
        self.path_for(key).is_file()
    }

    /// Loads the composite for `key`. Missing or unreadable files are absent.
    pub fn load(&self, key: &CompositeKey) -> Option<Composite> {
        let path = self.path_for(key);
        if !path.is_file() {
            return None;
        }

        let frame = match self.codec.read(&path) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("Failed to read composite {}: {err}", path.display());
                return None;
            }
        };

        match Composite::from_frame(frame) {
            Some(composite) if &composite.key == key => Some(composite),
            Some(composite) => {
                log::warn!(
                    "Composite {} holds key {} instead of {key}",
                    path.display(),
                    composite.key
                );
                None
            }
            None => {
                log::warn!("Composite {} has no usable setup", path.display());
                None
            }
        }
    }

    /// Persists `composite`, replacing any previous version atomically.
    pub fn save(&self, composite: &Composite) -> Result<(), StoreError> {
        let path = self.path_for(&composite.key);
        let tmp = tmp_path(&path);
        let write_err = |source: io::Error| StoreError::Write {
            path: path.clone(),
            source,
        };

        match fs::remove_file(&tmp) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(write_err(err)),
            _ => {}
        }

        let result = self
            .codec
            .write(&composite.to_frame(), &tmp)
            .map_err(|source| StoreError::Encode {
                key: composite.key.clone(),
                source,
            })
            .and_then(|()| sync_and_replace(&tmp, &path).map_err(write_err));
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result?;

        log::debug!(
            "saved composite {} ({} frames) to {}",
            composite.key,
            composite.count,
            path.display()
        );
        Ok(())
    }

    pub fn is_processed(&self, source_id: &str) -> bool {
        self.ledger.contains(source_id)
    }

    /// Records `source_id` durably. A no-op if already recorded.
    pub fn mark_processed(&mut self, source_id: &str) -> Result<(), StoreError> {
        self.ledger.append(source_id)?;
        Ok(())
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    PathBuf::from(tmp_name)
}

fn sync_and_replace(tmp: &Path, path: &Path) -> io::Result<()> {
    File::open(tmp)?.sync_all()?;
    fs::rename(tmp, path)
}

/// Writes `bytes` to `<path>.tmp`, syncs it and renames it over `path`. The temporary
/// file is removed if any step fails.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = tmp_path(path);

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
