//! Worker pool servicing stage invocations from a bounded queue.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use strum::IntoEnumIterator;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::limiter::CapacityLimiter;
use super::stage::{RetryPolicy, StageKind, run_with_retry};
use crate::config::CapacityConfig;
use crate::{Error, Result};

type Unit = BoxFuture<'static, ()>;

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent workers.
    pub max_workers: usize,
    /// Units that may wait in the queue before `submit` applies backpressure.
    pub queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            queue_capacity: 256,
        }
    }
}

impl From<&CapacityConfig> for WorkerPoolConfig {
    fn from(config: &CapacityConfig) -> Self {
        Self {
            max_workers: config.max_workers,
            queue_capacity: config.queue_capacity,
        }
    }
}

/// Result of one submitted unit, awaited at an explicit join point.
#[derive(Debug)]
pub struct UnitHandle<T> {
    stage: StageKind,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> UnitHandle<T> {
    pub fn stage(&self) -> StageKind {
        self.stage
    }

    /// Wait for the unit to finish.
    pub async fn join(self) -> Result<T> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(Error::Other(format!("{} unit was cancelled", self.stage))))
    }
}

/// A fixed set of workers pulling units from a bounded queue.
///
/// Every unit passes the shared [`CapacityLimiter`] before each attempt
/// and is wrapped in its stage's retry policy.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    limiter: Arc<CapacityLimiter>,
    retry_policies: HashMap<StageKind, RetryPolicy>,
    sender: mpsc::Sender<Unit>,
    active_workers: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool and start its workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: WorkerPoolConfig, limiter: Arc<CapacityLimiter>) -> Self {
        let max_workers = config.max_workers.max(1);
        let (sender, receiver) = mpsc::channel::<Unit>(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let cancellation_token = CancellationToken::new();
        let active_workers = Arc::new(AtomicUsize::new(0));

        info!("Starting worker pool with {} workers", max_workers);

        let mut join_set = JoinSet::new();
        for i in 0..max_workers {
            let receiver = receiver.clone();
            let cancellation_token = cancellation_token.clone();
            let active_workers = active_workers.clone();

            join_set.spawn(async move {
                debug!("Worker {} started", i);
                loop {
                    let unit = tokio::select! {
                        _ = cancellation_token.cancelled() => break,
                        unit = async { receiver.lock().await.recv().await } => unit,
                    };
                    let Some(unit) = unit else { break };

                    active_workers.fetch_add(1, Ordering::SeqCst);
                    tokio::select! {
                        _ = cancellation_token.cancelled() => {
                            active_workers.fetch_sub(1, Ordering::SeqCst);
                            break;
                        }
                        _ = unit => {}
                    }
                    active_workers.fetch_sub(1, Ordering::SeqCst);
                }
                debug!("Worker {} shutting down", i);
            });
        }

        let retry_policies = StageKind::iter()
            .map(|stage| (stage, stage.retry_policy()))
            .collect();

        Self {
            config,
            limiter,
            retry_policies,
            sender,
            active_workers,
            cancellation_token,
            tasks: parking_lot::Mutex::new(Some(join_set)),
        }
    }

    /// Override the retry policy of one stage kind.
    pub fn with_retry_policy(mut self, stage: StageKind, policy: RetryPolicy) -> Self {
        self.retry_policies.insert(stage, policy);
        self
    }

    pub fn retry_policy(&self, stage: StageKind) -> RetryPolicy {
        self.retry_policies
            .get(&stage)
            .copied()
            .unwrap_or_else(|| stage.retry_policy())
    }

    /// Queue one stage invocation.
    ///
    /// `attempt` is called once per attempt. Waits while the queue is full.
    pub async fn submit<T, F, Fut>(&self, stage: StageKind, attempt: F) -> Result<UnitHandle<T>>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let limiter = self.limiter.clone();
        let policy = self.retry_policy(stage);
        let attempt = Arc::new(attempt);

        let unit: Unit = Box::pin(async move {
            let result = run_with_retry(stage, policy, || {
                let limiter = limiter.clone();
                let attempt = attempt.clone();
                async move {
                    let _permit = limiter.acquire(stage).await?;
                    attempt().await
                }
            })
            .await;
            let _ = tx.send(result);
        });

        if self.cancellation_token.is_cancelled() {
            return Err(Error::Other("worker pool is shut down".to_string()));
        }
        self.sender
            .send(unit)
            .await
            .map_err(|_| Error::Other("worker pool is shut down".to_string()))?;

        Ok(UnitHandle { stage, rx })
    }

    /// Stop all workers. Queued and in-flight units are dropped and their
    /// handles resolve to an error.
    pub async fn shutdown(&self) {
        info!("Stopping worker pool");
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("Worker pool stopped");
    }

    /// Get the number of workers currently running a unit.
    pub fn active_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers.max(1)
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }

    pub fn limiter(&self) -> &Arc<CapacityLimiter> {
        &self.limiter
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn pool(max_workers: usize) -> WorkerPool {
        let limiter = Arc::new(CapacityLimiter::new(&CapacityConfig::default()));
        WorkerPool::new(
            WorkerPoolConfig {
                max_workers,
                queue_capacity: 16,
            },
            limiter,
        )
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.queue_capacity, 256);
    }

    #[tokio::test]
    async fn test_submit_and_join() {
        let pool = pool(2);
        let handle = pool
            .submit(StageKind::Probe, || async { Ok(21 * 2) })
            .await
            .unwrap();
        assert_eq!(handle.stage(), StageKind::Probe);
        assert_eq!(handle.join().await.unwrap(), 42);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_units_are_retried_per_policy() {
        let pool = pool(1).with_retry_policy(
            StageKind::ChunkEncode,
            RetryPolicy::new(2, Duration::ZERO),
        );
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let handle = pool
            .submit(StageKind::ChunkEncode, move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::not_found("encoded chunk"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        handle.join().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_units_run_concurrently() {
        let pool = pool(3);
        let start = std::time::Instant::now();
        let mut handles = Vec::new();
        for _ in 0..3 {
            handles.push(
                pool.submit(StageKind::Probe, || async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                })
                .await
                .unwrap(),
            );
        }
        for handle in handles {
            handle.join().await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(550));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_units() {
        let pool = pool(1);
        pool.shutdown().await;
        assert!(!pool.is_running());
        let result = pool.submit(StageKind::Mux, || async { Ok(()) }).await;
        assert!(result.is_err());
    }
}
