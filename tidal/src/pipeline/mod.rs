//! Pipeline orchestration.
//!
//! A job is probed, split into chunks, encoded per resolution with chunks
//! running in parallel on the [`WorkerPool`], joined back together, muxed with
//! its audio and finally scored against the source.

mod limiter;
mod orchestrator;
mod progress;
mod report;
mod stage;
pub mod stages;
mod state;
mod worker_pool;

pub use limiter::{CapacityLimiter, CapacityPermit, DecayingCap, DecayingPermit};
pub use orchestrator::{JobHandle, Pipeline, job_work_dir};
pub use progress::{ProgressReporter, StageProgress, StageProgressUpdate};
pub use report::{JobResult, NoopReportSink, ReportSink, TracingReportSink};
pub use stage::{RetryPolicy, StageKind, run_with_retry};
pub use stages::Toolchain;
pub use state::{JobState, JobStateTracker};
pub use worker_pool::{UnitHandle, WorkerPool, WorkerPoolConfig};
