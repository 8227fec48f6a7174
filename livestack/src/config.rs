//! Daemon configuration: optional YAML file, then environment overrides, then validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::ingest::WatcherOptions;
use crate::pipeline::StackerOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub input_dir: Option<PathBuf>,
    pub storage_dir: PathBuf,
    pub output_dir: PathBuf,
    pub bind: String,
    pub log_level: String,
    pub log_dir: PathBuf,
    pub stream_log_level: String,
    pub extensions: Vec<String>,
    pub settle_delay_secs: u64,
    pub watch_poll_interval_ms: u64,
    pub worker_poll_interval_ms: u64,
    pub queue_high_water_mark: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_dir: None,
            storage_dir: PathBuf::from("storage"),
            output_dir: PathBuf::from("output"),
            bind: "0.0.0.0:5678".to_string(),
            log_level: "info".to_string(),
            log_dir: PathBuf::from("logs"),
            stream_log_level: "info".to_string(),
            extensions: vec!["fits".to_string()],
            settle_delay_secs: 10,
            watch_poll_interval_ms: 1000,
            worker_poll_interval_ms: 1000,
            queue_high_water_mark: 500,
        }
    }
}

impl Config {
    /// Reads `path` if given, applies environment overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_yml::from_str(&yaml).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Overrides fields from `INPUT_FOLDER`, `STORAGE_FOLDER`, `OUTPUT_FOLDER`,
    /// `LIVESTACK_BIND` and `LIVESTACK_LOG`. Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(dir) = var("INPUT_FOLDER") {
            self.input_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = var("STORAGE_FOLDER") {
            self.storage_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("OUTPUT_FOLDER") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(bind) = var("LIVESTACK_BIND") {
            self.bind = bind;
        }
        if let Some(level) = var("LIVESTACK_LOG") {
            self.log_level = level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_dir.is_none() {
            bail!("input directory is not configured (set input_dir or INPUT_FOLDER)");
        }
        if self.extensions.is_empty() {
            bail!("at least one input extension is required");
        }
        if self.watch_poll_interval_ms == 0 || self.worker_poll_interval_ms == 0 {
            bail!("poll intervals must be greater than zero");
        }
        self.stream_level()?;
        Ok(())
    }

    pub fn input_dir(&self) -> Result<&Path> {
        self.input_dir
            .as_deref()
            .ok_or_else(|| anyhow!("input directory is not configured"))
    }

    pub fn stream_level(&self) -> Result<LevelFilter> {
        self.stream_log_level
            .parse()
            .map_err(|_| anyhow!("invalid stream_log_level {:?}", self.stream_log_level))
    }

    pub fn watcher_options(&self) -> WatcherOptions {
        WatcherOptions {
            extensions: self.extensions.clone(),
            poll_interval: Duration::from_millis(self.watch_poll_interval_ms),
            settle_delay: Duration::from_secs(self.settle_delay_secs),
        }
    }

    pub fn stacker_options(&self) -> StackerOptions {
        StackerOptions {
            poll_interval: Duration::from_millis(self.worker_poll_interval_ms),
            high_water_mark: self.queue_high_water_mark,
        }
    }
}
