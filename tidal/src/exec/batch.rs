//! Bounded-concurrency conversion of many inputs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::executor::{ExecutionOutput, ProcessExecutor, ProgressCallback};
use crate::{Error, Result};

/// Ordered `(option, value)` pairs for [`convert_args`].
pub type ConvertOptions = Vec<(String, String)>;

/// Build `-y -i <input> [-<key> <value>].. <output>`.
///
/// Keys beginning with `codec` map to `-c`, keeping any stream specifier
/// (`codec:v` becomes `-c:v`).
pub fn convert_args(input: &Path, output: &Path, options: &[(String, String)]) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
    ];

    for (key, value) in options {
        let flag = match key.strip_prefix("codec") {
            Some(rest) if rest.is_empty() || rest.starts_with(':') => format!("-c{rest}"),
            _ => format!("-{key}"),
        };
        args.extend([flag, value.clone()]);
    }

    args.push(output.to_string_lossy().into_owned());
    args
}

impl ProcessExecutor {
    /// Convert `input` into `output` with the given options.
    pub async fn convert(
        &self,
        input: &Path,
        output: &Path,
        options: &[(String, String)],
        on_progress: Option<ProgressCallback>,
    ) -> Result<ExecutionOutput> {
        let args = convert_args(input, output, options);
        self.execute(&args, Some(input), on_progress).await
    }
}

/// One conversion of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJob {
    pub input: PathBuf,
    pub output: PathBuf,
}

impl BatchJob {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }
}

/// Outcome of one batch job. Failures are captured, never propagated.
#[derive(Debug)]
pub struct BatchOutcome {
    pub job: BatchJob,
    pub result: Result<ExecutionOutput>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs conversions with at most `max_concurrent` in flight.
#[derive(Debug, Clone)]
pub struct BatchRunner {
    executor: Arc<ProcessExecutor>,
    max_concurrent: usize,
}

impl BatchRunner {
    pub fn new(executor: Arc<ProcessExecutor>, max_concurrent: usize) -> Self {
        Self {
            executor,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Run every job, returning one outcome per job in input order.
    pub async fn run(&self, jobs: Vec<BatchJob>, options: ConvertOptions) -> Vec<BatchOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let options = Arc::new(options);
        let mut join_set = JoinSet::new();

        for (index, job) in jobs.iter().cloned().enumerate() {
            let semaphore = semaphore.clone();
            let executor = self.executor.clone();
            let options = options.clone();

            join_set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        debug!("Batch job {} starting: {}", index, job.input.display());
                        executor.convert(&job.input, &job.output, &options, None).await
                    }
                    Err(_) => Err(Error::Other("batch semaphore closed".to_string())),
                };
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<ExecutionOutput>>> =
            jobs.iter().map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!("Batch task failed to complete: {}", e),
            }
        }

        jobs.into_iter()
            .zip(results)
            .map(|(job, result)| BatchOutcome {
                job,
                result: result
                    .unwrap_or_else(|| Err(Error::Other("batch task aborted".to_string()))),
            })
            .collect()
    }
}
