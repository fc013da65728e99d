use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, UploadError};

const ENV_WORKER_THREADS: &str = "BLOBSTREAM_WORKER_THREADS";
const ENV_RECEIVE_WEIGHT: &str = "BLOBSTREAM_RECEIVE_WEIGHT";
const ENV_REPLACE_SCENE: &str = "BLOBSTREAM_REPLACE_SCENE";

/// Tunable settings of the upload pipeline.
///
/// - `worker_threads` bounds the pool running loaders, so the event loop
///   never parses data itself.
/// - `receive_weight` is the share of the overall progress given to
///   receiving bytes; loading gets the rest, split evenly between files.
/// - `progress_interval_ms` throttles progress notifications.
/// - `lock_retry_ms` is the period at which a load retries acquiring the
///   scene, checking for cancellation in between.
///
/// Use one of the presets (`interactive`, `batch`) or the default, and
/// override from a JSON file or the environment as needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    pub worker_threads: usize,
    pub receive_weight: f64,
    pub progress_interval_ms: u64,
    pub lock_retry_ms: u64,
    pub replace_scene: bool,
    pub point_radius: f32,
    pub max_declared_bytes: Option<u64>,
}

impl Default for PipelineConfig {
    /// Returns the balanced preset:
    /// - 4 workers
    /// - receiving and loading weigh half each
    /// - progress at most every 10 ms
    fn default() -> Self {
        Self {
            worker_threads: 4,
            receive_weight: 0.5,
            progress_interval_ms: 10,
            lock_retry_ms: 100,
            replace_scene: true,
            point_radius: 1.0,
            max_declared_bytes: None,
        }
    }
}

impl PipelineConfig {
    /// Preset for a single interactive user:
    /// - 2 workers
    /// - progress at most every 5 ms
    pub fn interactive() -> Self {
        Self {
            worker_threads: 2,
            progress_interval_ms: 5,
            ..Self::default()
        }
    }

    /// Preset for scripted bulk loading:
    /// - 8 workers
    /// - progress at most every 100 ms
    pub fn batch() -> Self {
        Self {
            worker_threads: 8,
            progress_interval_ms: 100,
            ..Self::default()
        }
    }

    /// Read a JSON configuration file; missing fields keep their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&bytes)?;
        log::debug!(
            "config: loaded {} from {}",
            serde_json::to_string(&config)?,
            path.as_ref().display()
        );
        config.validate()?;
        Ok(config)
    }

    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(value) = std::env::var(ENV_WORKER_THREADS) {
            self.worker_threads = parse_env(ENV_WORKER_THREADS, &value)?;
        }
        if let Ok(value) = std::env::var(ENV_RECEIVE_WEIGHT) {
            self.receive_weight = parse_env(ENV_RECEIVE_WEIGHT, &value)?;
        }
        if let Ok(value) = std::env::var(ENV_REPLACE_SCENE) {
            self.replace_scene = parse_env(ENV_REPLACE_SCENE, &value)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(UploadError::Config(
                "workerThreads must be at least 1".to_owned(),
            ));
        }
        if !(0.0..1.0).contains(&self.receive_weight) {
            return Err(UploadError::Config(format!(
                "receiveWeight must be in [0, 1), got {}",
                self.receive_weight
            )));
        }
        if self.point_radius <= 0.0 {
            return Err(UploadError::Config(
                "pointRadius must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms.max(1))
    }

    /// Progress share of loading one of `count` files.
    pub fn load_weight(&self, count: usize) -> f64 {
        (1.0 - self.receive_weight) / count.max(1) as f64
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        UploadError::Config(format!("invalid value '{}' for {}", value, name))
    })
}
