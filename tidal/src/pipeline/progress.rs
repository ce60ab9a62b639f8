use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::stage::StageKind;
use crate::exec::{ProgressCallback, ProgressEvent};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage: StageKind,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

impl StageProgress {
    pub fn new(stage: StageKind) -> Self {
        Self {
            stage,
            updated_at: Utc::now(),
            label: None,
            chunk: None,
            percent: None,
            frame: None,
            speed: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = Some(chunk);
        self
    }

    fn apply(&mut self, event: &ProgressEvent) {
        self.percent = event.percent;
        self.frame = event.frame;
        self.speed = event.speed;
    }
}

#[derive(Debug, Clone)]
pub struct StageProgressUpdate {
    pub job_id: String,
    pub progress: StageProgress,
}

/// Forwards stage progress to an observer without ever blocking a stage.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: String,
    tx: mpsc::Sender<StageProgressUpdate>,
}

impl ProgressReporter {
    pub fn new(job_id: impl Into<String>, tx: mpsc::Sender<StageProgressUpdate>) -> Self {
        Self {
            job_id: job_id.into(),
            tx,
        }
    }

    pub fn noop(job_id: impl Into<String>) -> Self {
        let (tx, _rx) = mpsc::channel::<StageProgressUpdate>(1);
        Self::new(job_id, tx)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Same observer, different job.
    pub fn for_job(&self, job_id: impl Into<String>) -> Self {
        Self::new(job_id, self.tx.clone())
    }

    pub fn report(&self, mut progress: StageProgress) {
        progress.updated_at = Utc::now();
        let _ = self.tx.try_send(StageProgressUpdate {
            job_id: self.job_id.clone(),
            progress,
        });
    }

    /// An executor callback that reports each sample under `template`.
    pub fn callback(&self, template: StageProgress) -> ProgressCallback {
        let reporter = self.clone();
        Arc::new(move |event: &ProgressEvent| {
            let mut progress = template.clone();
            progress.apply(event);
            reporter.report(progress);
        })
    }
}
