//! Process execution engine.
//!
//! Every encoder and prober invocation goes through [`ProcessExecutor`]:
//! arguments are validated, the executable is resolved from trusted
//! locations, a deadline is enforced and progress is decoded from ffmpeg's
//! `-progress` side-channel.

mod args;
mod batch;
mod events;
mod executor;
mod progress;

pub use args::{SHELL_METACHARACTERS, validate_arguments};
pub use batch::{BatchJob, BatchOutcome, BatchRunner, ConvertOptions, convert_args};
pub use events::{EventBus, EventKind, ExecutionEvent, Listener};
pub use executor::{ExecutionOutput, ExecutorConfig, ProcessExecutor, ProgressCallback};
pub use progress::{ProgressEvent, ProgressReader, parse_progress_line};
