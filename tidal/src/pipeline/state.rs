//! Per-job lifecycle state machine.

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use super::stage::StageKind;
use crate::{Error, Result};

/// Lifecycle state of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, strum::Display)]
#[serde(tag = "state", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Submitted,
    Probing,
    Segmenting,
    #[strum(to_string = "encoding({label})")]
    Encoding { label: String },
    Muxing,
    Scoring,
    Completed,
    #[strum(to_string = "failed")]
    Failed {
        stage: Option<StageKind>,
        reason: String,
    },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }

    /// Whether `next` may follow `self`.
    pub fn can_transition_to(&self, next: &JobState) -> bool {
        use JobState::*;

        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed { .. })
                | (Submitted, Probing)
                | (Probing, Segmenting)
                | (Segmenting, Encoding { .. })
                | (Encoding { .. }, Encoding { .. })
                | (Encoding { .. }, Muxing)
                | (Encoding { .. }, Scoring)
                | (Muxing, Scoring)
                | (Scoring, Completed)
        )
    }
}

/// Publishes a job's state to any number of observers.
#[derive(Debug)]
pub struct JobStateTracker {
    job_id: String,
    tx: watch::Sender<JobState>,
}

impl JobStateTracker {
    pub fn new(job_id: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(JobState::Submitted);
        Self {
            job_id: job_id.into(),
            tx,
        }
    }

    pub fn current(&self) -> JobState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.tx.subscribe()
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn transition(&self, next: JobState) -> Result<()> {
        let current = self.current();
        if !current.can_transition_to(&next) {
            return Err(Error::Other(format!(
                "illegal job state transition {current} -> {next}"
            )));
        }
        debug!(job_id = %self.job_id, "Job state {} -> {}", current, next);
        self.tx.send_replace(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoding(label: &str) -> JobState {
        JobState::Encoding {
            label: label.to_string(),
        }
    }

    #[test]
    fn test_happy_path_with_audio() {
        let tracker = JobStateTracker::new("j");
        for state in [
            JobState::Probing,
            JobState::Segmenting,
            encoding("1080p"),
            encoding("720p"),
            JobState::Muxing,
            JobState::Scoring,
            JobState::Completed,
        ] {
            tracker.transition(state).unwrap();
        }
        assert!(tracker.current().is_terminal());
    }

    #[test]
    fn test_mux_may_be_skipped() {
        assert!(encoding("720p").can_transition_to(&JobState::Scoring));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let tracker = JobStateTracker::new("j");
        assert!(tracker.transition(JobState::Scoring).is_err());
        assert_eq!(tracker.current(), JobState::Submitted);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let failed = JobState::Failed {
            stage: Some(StageKind::Probe),
            reason: "boom".into(),
        };
        assert!(!failed.can_transition_to(&JobState::Probing));
        assert!(!JobState::Completed.can_transition_to(&failed));
    }

    #[tokio::test]
    async fn test_observers_see_updates() {
        let tracker = JobStateTracker::new("j");
        let mut rx = tracker.subscribe();
        tracker.transition(JobState::Probing).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), JobState::Probing);
        assert_eq!(encoding("720p").to_string(), "encoding(720p)");
    }
}
