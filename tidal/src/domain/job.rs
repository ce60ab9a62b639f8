//! Transcode job request.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::media::{CodecConfig, Container, Resolution};
use crate::{Error, Result};

fn default_segment_duration() -> u32 {
    10
}

/// One transcode request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInput {
    pub source_path: PathBuf,
    /// Root under which the job directory is created. Defaults to
    /// `<source dir>/output`.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Target resolutions in processing order. `None` encodes once at the
    /// source resolution.
    #[serde(default)]
    pub resolutions: Option<Vec<Resolution>>,
    #[serde(default)]
    pub codec: CodecConfig,
    /// Chunk length in seconds.
    #[serde(default = "default_segment_duration")]
    pub segment_duration: u32,
    #[serde(default)]
    pub container: Container,
}

impl JobInput {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            output_dir: None,
            resolutions: None,
            codec: CodecConfig::default(),
            segment_duration: default_segment_duration(),
            container: Container::default(),
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_resolutions(mut self, resolutions: Vec<Resolution>) -> Self {
        self.resolutions = Some(resolutions);
        self
    }

    pub fn with_codec(mut self, codec: CodecConfig) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_segment_duration(mut self, secs: u32) -> Self {
        self.segment_duration = secs;
        self
    }

    pub fn with_container(mut self, container: Container) -> Self {
        self.container = container;
        self
    }

    /// Check every invariant of the request. Runs once, before any stage.
    pub fn validate(&self) -> Result<()> {
        if !self.source_path.exists() {
            return Err(Error::validation(format!(
                "source file does not exist: {}",
                self.source_path.display()
            )));
        }
        if self.segment_duration == 0 {
            return Err(Error::validation("segment duration must be positive"));
        }
        if let Some(resolutions) = &self.resolutions {
            if resolutions.is_empty() {
                return Err(Error::validation(
                    "resolution list must not be empty when given",
                ));
            }
            let mut labels = std::collections::HashSet::new();
            for res in resolutions {
                if !labels.insert(res.label()) {
                    return Err(Error::validation(format!(
                        "duplicate resolution label '{}'",
                        res.label()
                    )));
                }
            }
        }
        self.codec.validate()
    }

    /// Root directory for the job's working tree.
    pub fn output_root(&self) -> PathBuf {
        match &self.output_dir {
            Some(dir) => dir.clone(),
            None => self
                .source_path
                .parent()
                .map(|p| p.join("output"))
                .unwrap_or_else(|| PathBuf::from("output")),
        }
    }

    pub fn source_stem(&self) -> String {
        self.source_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "source".to_string())
    }
}
