use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use hashbrown::HashSet;

use super::StoreError;

/// Append-only record of admitted source identifiers, one per line.
///
/// The whole file is loaded on open; every append is synced to disk before it becomes
/// visible in the in-memory set.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    entries: HashSet<String>,
}

impl Ledger {
    pub const FILE_NAME: &'static str = "processed.txt";

    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(Self::FILE_NAME);
        let entries = match fs::read_to_string(&path) {
            Ok(contents) => contents
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => HashSet::new(),
            Err(source) => return Err(StoreError::LedgerRead { path, source }),
        };

        log::debug!(
            "loaded {} ledger entries from {}",
            entries.len(),
            path.display()
        );
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.entries.contains(source_id)
    }

    /// Records `source_id`. Returns `false` without touching the file when it is already
    /// present.
    pub fn append(&mut self, source_id: &str) -> Result<bool, StoreError> {
        if source_id.trim().is_empty() || source_id.contains(['\n', '\r']) {
            return Err(StoreError::InvalidSourceId(source_id.to_string()));
        }
        if self.entries.contains(source_id) {
            return Ok(false);
        }

        let write = || -> io::Result<()> {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            writeln!(file, "{source_id}")?;
            file.flush()?;
            file.sync_data()
        };
        write().map_err(|source| StoreError::LedgerWrite {
            path: self.path.clone(),
            source,
        })?;

        self.entries.insert(source_id.to_string());
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
