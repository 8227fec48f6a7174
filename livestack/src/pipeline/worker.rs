//! The single worker thread that drains the frame queue through a [`Pipeline`].

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

use super::{Pipeline, PipelineError};

#[derive(Debug, Clone)]
pub struct StackerOptions {
    /// How often an idle worker checks its stop flag.
    pub poll_interval: Duration,
    /// Queue depth above which a warning is logged.
    pub high_water_mark: usize,
}

impl Default for StackerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            high_water_mark: 500,
        }
    }
}

#[derive(Debug, Error)]
#[error("stacker worker has stopped, cannot queue {}", .0.display())]
pub struct SubmitError(pub PathBuf);

#[derive(Debug)]
struct Shared {
    stop: AtomicBool,
    /// Queued plus in-flight items.
    depth: AtomicUsize,
    processed: AtomicUsize,
    above_high_water: AtomicBool,
    high_water_mark: usize,
}

impl Shared {
    fn item_queued(&self) -> usize {
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        if depth > self.high_water_mark && !self.above_high_water.swap(true, Ordering::AcqRel) {
            log::warn!(
                "queue depth {depth} exceeds high-water mark {}",
                self.high_water_mark
            );
        }
        depth
    }

    fn item_rejected(&self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }

    fn item_done(&self) -> usize {
        self.processed.fetch_add(1, Ordering::AcqRel);
        let remaining = self.depth.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining < self.high_water_mark {
            self.above_high_water.store(false, Ordering::Release);
        }
        remaining
    }
}

/// Cloneable producer handle. Never blocks.
#[derive(Debug, Clone)]
pub struct Submitter {
    tx: Sender<PathBuf>,
    shared: Arc<Shared>,
}

impl Submitter {
    /// Queues `path`. Fails only once the worker has exited.
    pub fn submit(&self, path: PathBuf) -> Result<(), SubmitError> {
        self.shared.item_queued();
        self.tx.send(path).map_err(|mpsc::SendError(path)| {
            self.shared.item_rejected();
            SubmitError(path)
        })
    }
}

/// Handle to the worker thread. Dropping it stops the worker.
#[derive(Debug)]
pub struct Stacker {
    submitter: Submitter,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<Result<(), PipelineError>>>>,
}

impl Stacker {
    pub fn start(pipeline: Pipeline, options: StackerOptions) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            depth: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
            above_high_water: AtomicBool::new(false),
            high_water_mark: options.high_water_mark,
        });

        let handle = thread::Builder::new()
            .name("livestack-worker".to_string())
            .spawn({
                let shared = shared.clone();
                move || worker_loop(pipeline, rx, &shared, options.poll_interval)
            })?;

        Ok(Self {
            submitter: Submitter {
                tx,
                shared: shared.clone(),
            },
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn submitter(&self) -> Submitter {
        self.submitter.clone()
    }

    pub fn submit(&self, path: PathBuf) -> Result<(), SubmitError> {
        self.submitter.submit(path)
    }

    /// Items queued or in flight.
    pub fn queue_depth(&self) -> usize {
        self.shared.depth.load(Ordering::Acquire)
    }

    /// Items the worker has finished, whatever their outcome.
    pub fn processed_count(&self) -> usize {
        self.shared.processed.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// Polls until the queue is empty or the worker exited. Returns whether the queue drained.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.queue_depth() == 0 {
                return true;
            }
            if self.is_finished() || Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Asks the worker to exit after its in-flight item and waits for it. The first call
    /// returns the worker's fatal error, if any; later calls return `Ok`.
    pub fn stop(&self) -> Result<(), PipelineError> {
        self.shared.stop.store(true, Ordering::Release);
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };
        match handle.join() {
            Ok(result) => result,
            Err(payload) => Err(PipelineError::Panicked(panic_message(payload.as_ref()))),
        }
    }
}

impl Drop for Stacker {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("stacker worker ended with error: {err}");
        }
    }
}

fn worker_loop(
    mut pipeline: Pipeline,
    rx: Receiver<PathBuf>,
    shared: &Shared,
    poll_interval: Duration,
) -> Result<(), PipelineError> {
    log::info!("stacker worker started");

    while !shared.stop.load(Ordering::Acquire) {
        let path = match rx.recv_timeout(poll_interval) {
            Ok(path) => path,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| pipeline.process(&path)))
            .unwrap_or_else(|payload| Err(PipelineError::Panicked(panic_message(payload.as_ref()))));
        let remaining = shared.item_done();

        match result {
            Ok(outcome) => log::debug!("{}: {outcome:?}", path.display()),
            Err(err) if err.is_fatal() => {
                log::error!("fatal error processing {}: {err}", path.display());
                return Err(err);
            }
            Err(err) => log::error!("abandoned {}: {err}", path.display()),
        }
        log::info!("{remaining} items remaining");
    }

    log::info!("stacker worker stopped");
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
