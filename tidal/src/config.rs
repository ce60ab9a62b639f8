//! Runtime configuration.
//!
//! Values come from defaults, an optional JSON file and `TIDAL_*`
//! environment variables (a `.env` file is honoured), in that order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::exec::ExecutorConfig;
use crate::pipeline::StageKind;
use crate::{Error, Result};

/// Default concurrent invocations per stage kind.
pub const DEFAULT_STAGE_LIMIT: usize = 3;

/// The pool-wide cap on chunk encoding whose slots decay over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayingCapConfig {
    pub limit: usize,
    /// Slots freed per second. Zero frees a slot as soon as its unit ends.
    pub slot_decay_per_second: f64,
}

impl Default for DecayingCapConfig {
    fn default() -> Self {
        Self {
            limit: 4,
            slot_decay_per_second: 1.0,
        }
    }
}

/// Externally administered capacity values, read once at pool construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    pub max_workers: usize,
    pub queue_capacity: usize,
    /// Stage kinds missing here use [`DEFAULT_STAGE_LIMIT`].
    pub stage_limits: HashMap<StageKind, usize>,
    pub global_encode: DecayingCapConfig,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            queue_capacity: 256,
            stage_limits: HashMap::new(),
            global_encode: DecayingCapConfig::default(),
        }
    }
}

impl CapacityConfig {
    pub fn stage_limit(&self, stage: StageKind) -> usize {
        self.stage_limits
            .get(&stage)
            .copied()
            .unwrap_or(DEFAULT_STAGE_LIMIT)
    }
}

fn default_process_timeout_secs() -> u64 {
    3600
}

fn default_probe_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    100
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TidalConfig {
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,
    #[serde(default)]
    pub ffprobe_path: Option<PathBuf>,
    #[serde(default = "default_process_timeout_secs")]
    pub process_timeout_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub progress_poll_interval_ms: u64,
    /// Directory for progress side-channel and report files.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// Overrides the per-job default of `<source dir>/output`.
    #[serde(default)]
    pub output_root: Option<PathBuf>,
    #[serde(default)]
    pub capacity: CapacityConfig,
    #[serde(default)]
    pub log_filter: Option<String>,
    #[serde(default)]
    pub log_json: bool,
}

impl Default for TidalConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            ffprobe_path: None,
            process_timeout_secs: default_process_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            progress_poll_interval_ms: default_poll_interval_ms(),
            temp_dir: None,
            output_root: None,
            capacity: CapacityConfig::default(),
            log_filter: None,
            log_json: false,
        }
    }
}

impl TidalConfig {
    /// Defaults overridden by `TIDAL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TIDAL_FFMPEG_PATH") {
            self.ffmpeg_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("TIDAL_FFPROBE_PATH") {
            self.ffprobe_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("TIDAL_PROCESS_TIMEOUT_SECS") {
            self.process_timeout_secs = parse_var("TIDAL_PROCESS_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("TIDAL_MAX_WORKERS") {
            self.capacity.max_workers = parse_var("TIDAL_MAX_WORKERS", &v)?;
        }
        if let Some(v) = lookup("TIDAL_OUTPUT_ROOT") {
            self.output_root = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("TIDAL_LOG_FILTER") {
            self.log_filter = Some(v);
        }
        if let Some(v) = lookup("TIDAL_LOG_JSON") {
            self.log_json = parse_var("TIDAL_LOG_JSON", &v)?;
        }
        if let Some(v) = lookup("TIDAL_ENCODE_LIMIT") {
            let limit = parse_var("TIDAL_ENCODE_LIMIT", &v)?;
            self.capacity
                .stage_limits
                .insert(StageKind::ChunkEncode, limit);
        }
        if let Some(v) = lookup("TIDAL_GLOBAL_ENCODE_LIMIT") {
            self.capacity.global_encode.limit = parse_var("TIDAL_GLOBAL_ENCODE_LIMIT", &v)?;
        }
        if let Some(v) = lookup("TIDAL_GLOBAL_ENCODE_DECAY") {
            self.capacity.global_encode.slot_decay_per_second =
                parse_var("TIDAL_GLOBAL_ENCODE_DECAY", &v)?;
        }
        Ok(())
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }

    /// Executor configuration for the encoder.
    pub fn ffmpeg_executor(&self) -> ExecutorConfig {
        self.executor(ExecutorConfig::ffmpeg(), self.ffmpeg_path.as_ref())
            .with_timeout(self.process_timeout())
    }

    /// Executor configuration for the prober.
    pub fn ffprobe_executor(&self) -> ExecutorConfig {
        self.executor(ExecutorConfig::ffprobe(), self.ffprobe_path.as_ref())
            .with_timeout(Duration::from_secs(self.probe_timeout_secs))
    }

    fn executor(&self, mut base: ExecutorConfig, explicit: Option<&PathBuf>) -> ExecutorConfig {
        base.executable = explicit.cloned();
        base.prober = self.ffprobe_path.clone();
        base.probe_timeout = Duration::from_secs(self.probe_timeout_secs);
        base.poll_interval = Duration::from_millis(self.progress_poll_interval_ms.max(1));
        base.temp_dir = self.temp_dir.clone();
        base
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::validation(format!("invalid value for {name}: {value:?}")))
}
