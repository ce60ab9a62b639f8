//! Stage kinds and their retry policies.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::Result;

/// One kind of pipeline work.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StageKind {
    Probe,
    Segment,
    ChunkEncode,
    Concatenate,
    AudioTranscode,
    Mux,
    QualityScore,
}

impl StageKind {
    /// Default retry policy of this stage.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::ChunkEncode => RetryPolicy::new(2, Duration::from_secs(10)),
            Self::QualityScore => RetryPolicy::new(1, Duration::from_secs(10)),
            _ => RetryPolicy::new(2, Duration::from_secs(5)),
        }
    }
}

/// Whole-stage retry: a failed attempt re-runs the entire invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first.
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }

    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries + 1
    }
}

/// Run `attempt` until it succeeds, fails with a non-retryable error or
/// exhausts `policy`.
pub async fn run_with_retry<T, F, Fut>(stage: StageKind, policy: RetryPolicy, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut failures = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && failures < policy.retries => {
                failures += 1;
                warn!(
                    %stage,
                    "Attempt {}/{} failed, retrying in {:?}: {}",
                    failures,
                    policy.max_attempts(),
                    policy.delay,
                    e
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
