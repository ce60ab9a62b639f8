//! Perceptual quality scores.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Qualitative bracket of a mean quality score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum QualityRating {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityRating {
    /// Lower bounds are inclusive: 95.0 is `Excellent`, 80.0 `Good`, 60.0 `Fair`.
    pub fn from_score(score: f64) -> Self {
        if score >= 95.0 {
            Self::Excellent
        } else if score >= 80.0 {
            Self::Good
        } else if score >= 60.0 {
            Self::Fair
        } else {
            Self::Poor
        }
    }
}

/// Pooled quality metric of one output against its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityResult {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub harmonic_mean: f64,
}

impl QualityResult {
    pub fn rating(&self) -> QualityRating {
        QualityRating::from_score(self.mean)
    }

    /// Parse a libvmaf JSON log (`pooled_metrics.vmaf`).
    pub fn from_vmaf_json(json: &str) -> Result<Self> {
        let report: VmafReport = serde_json::from_str(json)?;
        let pooled = report
            .pooled_metrics
            .and_then(|m| m.vmaf)
            .ok_or_else(|| Error::not_found("quality report has no pooled vmaf metrics"))?;

        Ok(Self {
            mean: pooled.mean.unwrap_or(0.0),
            min: pooled.min.unwrap_or(0.0),
            max: pooled.max.unwrap_or(0.0),
            harmonic_mean: pooled.harmonic_mean.unwrap_or(0.0),
        })
    }
}

#[derive(Debug, Deserialize)]
struct VmafReport {
    pooled_metrics: Option<PooledMetrics>,
}

#[derive(Debug, Deserialize)]
struct PooledMetrics {
    vmaf: Option<PooledScore>,
}

#[derive(Debug, Deserialize)]
struct PooledScore {
    min: Option<f64>,
    max: Option<f64>,
    mean: Option<f64>,
    harmonic_mean: Option<f64>,
}
