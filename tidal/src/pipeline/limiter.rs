//! Process-wide capacity caps shared by every job.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::IntoEnumIterator;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use super::stage::StageKind;
use crate::config::{CapacityConfig, DecayingCapConfig};
use crate::{Error, Result};

/// A cap whose occupied slots drain over time instead of on release.
///
/// With a zero decay rate it degrades to a plain counting cap released by
/// dropping the permit.
#[derive(Debug, Clone)]
pub struct DecayingCap {
    inner: Arc<DecayingInner>,
}

#[derive(Debug)]
struct DecayingInner {
    limit: f64,
    decay_per_second: f64,
    state: Mutex<DecayingState>,
    released: Notify,
}

#[derive(Debug)]
struct DecayingState {
    level: f64,
    updated: Instant,
}

impl DecayingInner {
    fn drain(&self, state: &mut DecayingState) {
        if self.decay_per_second > 0.0 {
            let now = Instant::now();
            let elapsed = now.duration_since(state.updated).as_secs_f64();
            state.level = (state.level - elapsed * self.decay_per_second).max(0.0);
            state.updated = now;
        }
    }
}

/// Held while a slot of a [`DecayingCap`] is in use.
#[derive(Debug)]
pub struct DecayingPermit {
    inner: Arc<DecayingInner>,
}

impl Drop for DecayingPermit {
    fn drop(&mut self) {
        if self.inner.decay_per_second > 0.0 {
            return;
        }
        let mut state = self.inner.state.lock();
        state.level = (state.level - 1.0).max(0.0);
        drop(state);
        self.inner.released.notify_waiters();
    }
}

impl DecayingCap {
    pub fn new(config: &DecayingCapConfig) -> Self {
        Self {
            inner: Arc::new(DecayingInner {
                limit: config.limit.max(1) as f64,
                decay_per_second: config.slot_decay_per_second.max(0.0),
                state: Mutex::new(DecayingState {
                    level: 0.0,
                    updated: Instant::now(),
                }),
                released: Notify::new(),
            }),
        }
    }

    /// Wait until a slot is free and occupy it.
    pub async fn acquire(&self) -> DecayingPermit {
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);

            let wait = {
                let mut state = self.inner.state.lock();
                self.inner.drain(&mut state);
                if state.level + 1.0 <= self.inner.limit {
                    state.level += 1.0;
                    return DecayingPermit {
                        inner: self.inner.clone(),
                    };
                }
                if self.inner.decay_per_second > 0.0 {
                    let excess = state.level + 1.0 - self.inner.limit;
                    Some(Duration::from_secs_f64(excess / self.inner.decay_per_second))
                } else {
                    notified.as_mut().enable();
                    None
                }
            };

            match wait {
                Some(delay) => {
                    trace!("Decaying cap full, waiting {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
                None => notified.await,
            }
        }
    }

    /// Currently occupied slots, after decay.
    pub fn occupied(&self) -> f64 {
        let mut state = self.inner.state.lock();
        self.inner.drain(&mut state);
        state.level
    }
}

/// Admission to one stage invocation; capacity is returned on drop.
#[derive(Debug)]
pub struct CapacityPermit {
    _stage: OwnedSemaphorePermit,
    _global: Option<DecayingPermit>,
}

/// Per-stage-kind caps plus the decaying cap on chunk encoding.
///
/// Built once from externally administered limits and shared by every
/// worker pool in the process.
#[derive(Debug)]
pub struct CapacityLimiter {
    stages: HashMap<StageKind, Arc<Semaphore>>,
    global_encode: DecayingCap,
}

impl CapacityLimiter {
    pub fn new(config: &CapacityConfig) -> Self {
        let stages = StageKind::iter()
            .map(|stage| {
                let limit = config.stage_limit(stage).max(1);
                (stage, Arc::new(Semaphore::new(limit)))
            })
            .collect();

        Self {
            stages,
            global_encode: DecayingCap::new(&config.global_encode),
        }
    }

    /// Wait for both caps that apply to `stage`.
    pub async fn acquire(&self, stage: StageKind) -> Result<CapacityPermit> {
        let semaphore = self
            .stages
            .get(&stage)
            .cloned()
            .ok_or_else(|| Error::Other(format!("no capacity configured for {stage}")))?;
        let stage_permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| Error::Other(format!("capacity for {stage} was closed")))?;

        let global = match stage {
            StageKind::ChunkEncode => Some(self.global_encode.acquire().await),
            _ => None,
        };

        Ok(CapacityPermit {
            _stage: stage_permit,
            _global: global,
        })
    }

    pub fn available(&self, stage: StageKind) -> usize {
        self.stages
            .get(&stage)
            .map_or(0, |s| s.available_permits())
    }

    pub fn global_encode(&self) -> &DecayingCap {
        &self.global_encode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(limit: usize, rate: f64) -> DecayingCap {
        DecayingCap::new(&DecayingCapConfig {
            limit,
            slot_decay_per_second: rate,
        })
    }

    #[tokio::test]
    async fn test_zero_rate_cap_releases_on_drop() {
        let cap = cap(1, 0.0);
        let permit = cap.acquire().await;
        assert_eq!(cap.occupied(), 1.0);

        let waiter = {
            let cap = cap.clone();
            tokio::spawn(async move {
                let _p = cap.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_decaying_cap_ignores_release() {
        let cap = cap(2, 10.0);
        drop(cap.acquire().await);
        drop(cap.acquire().await);
        // Slots drain at 10/s, not on drop.
        assert!(cap.occupied() > 1.0);

        let start = Instant::now();
        let _p = cap.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_stage_cap_queues_excess() {
        let mut config = CapacityConfig::default();
        config.stage_limits.insert(StageKind::Mux, 1);
        let limiter = Arc::new(CapacityLimiter::new(&config));

        let first = limiter.acquire(StageKind::Mux).await.unwrap();
        assert_eq!(limiter.available(StageKind::Mux), 0);

        let second = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(StageKind::Mux).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_only_chunk_encode_uses_global_cap() {
        let limiter = CapacityLimiter::new(&CapacityConfig::default());
        let _probe = limiter.acquire(StageKind::Probe).await.unwrap();
        assert_eq!(limiter.global_encode().occupied(), 0.0);
        let _encode = limiter.acquire(StageKind::ChunkEncode).await.unwrap();
        assert!(limiter.global_encode().occupied() > 0.0);
    }
}
