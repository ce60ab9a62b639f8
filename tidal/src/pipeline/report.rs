//! Job results and the sinks that publish them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::ser::Serializer;
use serde::Serialize;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::domain::{ProbeResult, QualityRating, QualityResult};

/// Outcome of a completed job.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_id: String,
    /// Final output per resolution label, in requested order.
    #[serde(serialize_with = "ordered_map")]
    pub outputs: Vec<(String, PathBuf)>,
    pub quality: QualityResult,
    pub rating: QualityRating,
    pub work_dir: PathBuf,
    pub probe: ProbeResult,
    pub completed_at: DateTime<Utc>,
}

fn ordered_map<S: Serializer>(
    outputs: &[(String, PathBuf)],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_map(outputs.iter().map(|(label, path)| (label, path)))
}

impl JobResult {
    pub fn output(&self, label: &str) -> Option<&Path> {
        self.outputs
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, p)| p.as_path())
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|(l, _)| l.as_str())
    }

    /// Human-readable multi-line summary.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Job {}", self.job_id);
        let _ = writeln!(
            out,
            "  Source: {}x{} {}, {:.2}s, {:.3} fps, audio: {}",
            self.probe.width,
            self.probe.height,
            self.probe.video_codec,
            self.probe.duration,
            self.probe.frame_rate,
            self.probe.audio_codec.as_deref().unwrap_or("none")
        );
        for (label, path) in &self.outputs {
            let _ = writeln!(out, "  {label}: {}", path.display());
        }
        let _ = writeln!(
            out,
            "  Quality: {:.2} mean, {:.2} min, {:.2} max, {:.2} harmonic ({})",
            self.quality.mean,
            self.quality.min,
            self.quality.max,
            self.quality.harmonic_mean,
            self.rating
        );
        let _ = write!(out, "  Work dir: {}", self.work_dir.display());
        out
    }
}

/// Receives completed jobs. Failures are logged by the caller and never
/// fail the job.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn publish(&self, result: &JobResult) -> anyhow::Result<()>;
}

/// Discards every report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReportSink;

#[async_trait]
impl ReportSink for NoopReportSink {
    async fn publish(&self, _result: &JobResult) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Logs the summary of every report.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReportSink;

#[async_trait]
impl ReportSink for TracingReportSink {
    async fn publish(&self, result: &JobResult) -> anyhow::Result<()> {
        for line in result.summary().lines() {
            info!(job_id = %result.job_id, "{}", line);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result() -> JobResult {
        let quality = QualityResult {
            mean: 93.2,
            min: 85.0,
            max: 99.0,
            harmonic_mean: 93.0,
        };
        JobResult {
            job_id: "ab12cd34".into(),
            outputs: vec![
                ("720p".into(), PathBuf::from("/w/final/final_720p.mp4")),
                ("480p".into(), PathBuf::from("/w/final/final_480p.mp4")),
            ],
            rating: quality.rating(),
            quality,
            work_dir: PathBuf::from("/w"),
            probe: ProbeResult {
                duration: 2.0,
                width: 1280,
                height: 720,
                video_codec: "h264".into(),
                audio_codec: Some("aac".into()),
                frame_rate: 25.0,
                bitrate: Some(1_000_000),
            },
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_outputs_serialize_as_ordered_map() {
        let json = serde_json::to_string(&result()).unwrap();
        let first = json.find("\"720p\"").unwrap();
        let second = json.find("\"480p\"").unwrap();
        assert!(first < second);

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["outputs"]["480p"], "/w/final/final_480p.mp4");
        assert_eq!(value["rating"], "Good");
    }

    #[test]
    fn test_summary_mentions_outputs_and_rating() {
        let result = result();
        let summary = result.summary();
        assert!(summary.contains("720p: /w/final/final_720p.mp4"));
        assert!(summary.contains("(Good)"));
        assert_eq!(result.output("480p"), Some(Path::new("/w/final/final_480p.mp4")));
        assert_eq!(result.labels().collect::<Vec<_>>(), vec!["720p", "480p"]);
    }

    #[tokio::test]
    async fn test_sinks_accept_reports() {
        let result = result();
        NoopReportSink.publish(&result).await.unwrap();
        TracingReportSink.publish(&result).await.unwrap();
    }
}
