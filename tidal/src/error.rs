//! Crate-wide error types.

use thiserror::Error;

use crate::pipeline::StageKind;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Number of trailing stderr bytes shown when a tool fails.
const STDERR_TAIL_BYTES: usize = 500;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Security,
    Timeout,
    Process,
    Validation,
    NotFound,
    Domain,
    Io,
    Serialization,
    Other,
}

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Unsafe invocation arguments or executable path.
    #[error("Security error: {0}")]
    Security(String),

    /// An external tool exceeded its deadline and was killed.
    #[error("Process timed out after {timeout_secs}s: {command}")]
    Timeout { timeout_secs: f64, command: String },

    /// An external tool exited unsuccessfully.
    #[error("{program} failed with exit code {}: {}", exit_code_display(.exit_code), stderr_tail(.stderr))]
    Process {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    /// An artifact that should exist is missing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The input is structurally unusable.
    #[error("Domain error: {0}")]
    Domain(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn security(msg: impl Into<String>) -> Self {
        Self::Security(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn domain(msg: impl Into<String>) -> Self {
        Self::Domain(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Security(_) => ErrorKind::Security,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Process { .. } => ErrorKind::Process,
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Domain(_) => ErrorKind::Domain,
            Self::Io(_) => ErrorKind::Io,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Other(_) => ErrorKind::Other,
        }
    }

    /// Whether a stage failing with this error may be run again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::Process | ErrorKind::NotFound | ErrorKind::Io
        )
    }

    /// The last few hundred bytes of a failed tool's stderr.
    pub fn stderr_tail(&self) -> Option<&str> {
        match self {
            Self::Process { stderr, .. } => Some(stderr_tail(stderr)),
            _ => None,
        }
    }
}

fn exit_code_display(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "none (terminated by signal)".to_string())
}

fn stderr_tail(stderr: &str) -> &str {
    let trimmed = stderr.trim_end();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed;
    }
    let mut start = trimmed.len() - STDERR_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}

/// A job that ended in the `Failed` state.
#[derive(Error, Debug)]
#[error("job {job_id} failed during {}: [{}] {error}", stage_display(.stage), error_kind(.error))]
pub struct JobFailure {
    pub job_id: String,
    /// `None` when the job was rejected before any stage ran.
    pub stage: Option<StageKind>,
    #[source]
    pub error: Error,
}

fn error_kind(error: &Error) -> ErrorKind {
    error.kind()
}

fn stage_display(stage: &Option<StageKind>) -> String {
    stage
        .map(|s| s.to_string())
        .unwrap_or_else(|| "validation".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(
            Error::Timeout {
                timeout_secs: 1.0,
                command: "ffmpeg".into()
            }
            .is_retryable()
        );
        assert!(Error::not_found("out.mkv").is_retryable());
        assert!(!Error::security("bad").is_retryable());
        assert!(!Error::validation("bad").is_retryable());
        assert!(!Error::domain("no chunks").is_retryable());
    }

    #[test]
    fn test_process_error_shows_stderr_tail() {
        let stderr = format!("{}END", "x".repeat(2_000));
        let err = Error::Process {
            program: "ffmpeg".into(),
            exit_code: Some(1),
            stderr,
        };
        let tail = err.stderr_tail().unwrap();
        assert_eq!(tail.len(), STDERR_TAIL_BYTES);
        assert!(tail.ends_with("END"));
        assert!(err.to_string().starts_with("ffmpeg failed with exit code 1"));
    }

    #[test]
    fn test_job_failure_display() {
        let failure = JobFailure {
            job_id: "abcd1234".into(),
            stage: Some(StageKind::Concatenate),
            error: Error::domain("no chunks to concatenate"),
        };
        let msg = failure.to_string();
        assert!(msg.contains("abcd1234"));
        assert!(msg.contains("concatenate"));
        assert!(msg.contains("[domain]"));
    }

    #[test]
    fn test_kind_display_is_snake_case() {
        assert_eq!(ErrorKind::NotFound.to_string(), "not_found");
    }
}
