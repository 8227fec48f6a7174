//! File utility functions for listing and filtering files.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Supported FITS file extensions.
pub const FITS_EXTENSIONS: &[&str] = &["fit", "fits"];

/// Returns true when `path` ends in one of `extensions`.
/// Extensions are given without the dot and matched case-insensitively.
pub fn has_extension<S: AsRef<str>>(path: &Path, extensions: &[S]) -> bool {
    let Some(ext) = path.extension().and_then(|s| s.to_str()) else {
        return false;
    };
    extensions
        .iter()
        .any(|candidate| candidate.as_ref().eq_ignore_ascii_case(ext))
}

/// Returns paths to all regular files below `dir` (recursively) matching the given
/// extensions, sorted by path. A missing directory yields an empty list and unreadable
/// entries are skipped.
pub fn files_with_extensions_recursive<S: AsRef<str>>(dir: &Path, extensions: &[S]) -> Vec<PathBuf> {
    if !dir.exists() {
        return Vec::new();
    }

    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                log::debug!("skipping unreadable entry below {}: {err}", dir.display());
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| has_extension(path, extensions))
        .collect();

    files.sort();
    files
}
