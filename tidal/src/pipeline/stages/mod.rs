//! Stage implementations. Each stage is one external tool invocation plus
//! the checks that its artifacts exist.

pub mod audio;
pub mod concat;
pub mod encode;
pub mod mux;
pub mod probe;
pub mod quality;
pub mod segment;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

use crate::config::TidalConfig;
use crate::exec::{EventBus, ProcessExecutor};
use crate::{Error, Result};

/// The executors every stage runs through, sharing one event bus.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub ffmpeg: Arc<ProcessExecutor>,
    pub ffprobe: Arc<ProcessExecutor>,
}

impl Toolchain {
    pub fn new(ffmpeg: ProcessExecutor, ffprobe: ProcessExecutor) -> Self {
        let ffprobe = ffprobe.with_events(ffmpeg.events().clone());
        Self {
            ffmpeg: Arc::new(ffmpeg),
            ffprobe: Arc::new(ffprobe),
        }
    }

    pub fn from_config(config: &TidalConfig) -> Result<Self> {
        Ok(Self::new(
            ProcessExecutor::new(config.ffmpeg_executor())?,
            ProcessExecutor::new(config.ffprobe_executor())?,
        ))
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.ffmpeg.events()
    }

    /// A scoped temporary file, removed when dropped.
    pub(crate) fn temp_file(&self, prefix: &str, suffix: &str) -> Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix).suffix(suffix);
        let file = match &self.ffmpeg.config().temp_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        Ok(file)
    }
}

pub(crate) fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Absolute form of `path`; existing files are canonicalised.
pub(crate) fn make_absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }

    if let Ok(abs) = std::fs::canonicalize(path) {
        return abs;
    }

    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

/// Fail with `NotFound` unless `path` exists after a stage claimed success.
pub(crate) async fn ensure_output(path: &Path) -> Result<()> {
    match tokio::fs::try_exists(path).await {
        Ok(true) => Ok(()),
        _ => Err(Error::not_found(format!(
            "expected output {} is missing",
            path.display()
        ))),
    }
}
