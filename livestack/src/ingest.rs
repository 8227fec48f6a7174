//! Input directory watcher: backlog listing at startup plus a polling feed of new files.
//!
//! A new file is delivered once it has been visible for the settle delay, giving the
//! capture software time to finish writing it. Each path is delivered at most once.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use common::file_utils::files_with_extensions_recursive;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    /// Extensions to pick up, without the dot, matched case-insensitively.
    pub extensions: Vec<String>,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            extensions: vec!["fits".to_string()],
            poll_interval: Duration::from_secs(1),
            settle_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
pub struct Watcher {
    dir: PathBuf,
    options: WatcherOptions,
    known: HashSet<PathBuf>,
    /// Files seen but not yet settled, with the time they were first seen.
    pending: HashMap<PathBuf, Instant>,
}

impl Watcher {
    /// Scans `dir`, returns the backlog in path order and starts polling for new files.
    /// Settled new files are handed to `sink` from the watcher thread.
    pub fn start<F>(
        dir: impl Into<PathBuf>,
        options: WatcherOptions,
        sink: F,
    ) -> io::Result<(Vec<PathBuf>, WatcherHandle)>
    where
        F: Fn(PathBuf) + Send + 'static,
    {
        let (watcher, backlog) = Self::new(dir.into(), options)?;
        log::info!(
            "watching {} ({} files in backlog)",
            watcher.dir.display(),
            backlog.len()
        );

        let stop = Arc::new(AtomicBool::new(false));
        let thread = thread::Builder::new()
            .name("livestack-watcher".to_string())
            .spawn({
                let stop = stop.clone();
                move || watcher.run(&stop, sink)
            })?;

        Ok((
            backlog,
            WatcherHandle {
                stop,
                thread: Mutex::new(Some(thread)),
            },
        ))
    }

    fn new(dir: PathBuf, options: WatcherOptions) -> io::Result<(Self, Vec<PathBuf>)> {
        if !dir.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("input directory {} does not exist", dir.display()),
            ));
        }

        let backlog = files_with_extensions_recursive(&dir, &options.extensions);
        let watcher = Self {
            known: backlog.iter().cloned().collect(),
            pending: HashMap::new(),
            dir,
            options,
        };
        Ok((watcher, backlog))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn run<F: Fn(PathBuf)>(mut self, stop: &AtomicBool, sink: F) {
        while !stop.load(Ordering::Acquire) {
            thread::park_timeout(self.options.poll_interval);
            if stop.load(Ordering::Acquire) {
                break;
            }
            for path in self.poll(Instant::now()) {
                sink(path);
            }
        }
        log::debug!("watcher for {} stopped", self.dir.display());
    }

    /// One rescan. Returns the files that settled by `now`, in path order.
    fn poll(&mut self, now: Instant) -> Vec<PathBuf> {
        let current: HashSet<PathBuf> = files_with_extensions_recursive(&self.dir, &self.options.extensions)
            .into_iter()
            .collect();

        for path in &current {
            if !self.known.contains(path) && !self.pending.contains_key(path) {
                log::info!("file created: {}", path.display());
                self.pending.insert(path.clone(), now);
            }
        }
        self.pending.retain(|path, _| {
            let present = current.contains(path);
            if !present {
                log::info!("{} disappeared before settling", path.display());
            }
            present
        });

        let settle_delay = self.options.settle_delay;
        let mut settled: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) >= settle_delay)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &settled {
            self.pending.remove(path);
            self.known.insert(path.clone());
        }
        settled.sort();
        settled
    }
}

/// Stops the watcher thread when asked or dropped.
#[derive(Debug)]
pub struct WatcherHandle {
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WatcherHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        thread.thread().unpark();
        if thread.join().is_err() {
            log::error!("watcher thread panicked");
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
