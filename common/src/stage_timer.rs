use std::time::{Duration, Instant};

/// Scope guard that logs `start <label>` when created and `done <label> in <ms>ms` when dropped.
#[derive(Debug)]
pub struct StageTimer {
    label: String,
    started: Instant,
}

impl StageTimer {
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        log::info!("start {label}");
        Self {
            label,
            started: Instant::now(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        let ms = self.elapsed().as_secs_f64() * 1000.0;
        log::info!("done {} in {ms:.3}ms", self.label);
    }
}
