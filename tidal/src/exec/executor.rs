//! Sandboxed invocation of external media tools.

use std::io::Read;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use process_utils::{ResolveError, resolve_executable, std_command, tokio_command};
use serde::Deserialize;
use tempfile::NamedTempFile;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::args::validate_arguments;
use super::events::{EventBus, EventKind, ExecutionEvent};
use super::progress::{ProgressEvent, ProgressReader, parse_progress_line};
use crate::{Error, Result};

/// Invoked with every decoded progress sample.
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// How often the blocking wait loop checks the child.
const WAIT_STEP: Duration = Duration::from_millis(20);

/// Configuration of a [`ProcessExecutor`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Tool name looked up when `executable` is not set.
    pub tool: String,
    pub executable: Option<PathBuf>,
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Where side-channel files are created; the system temp dir when unset.
    pub temp_dir: Option<PathBuf>,
    /// Explicit prober used for duration lookups.
    pub prober: Option<PathBuf>,
    pub probe_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            tool: "ffmpeg".to_string(),
            executable: None,
            timeout: Duration::from_secs(3600),
            poll_interval: Duration::from_millis(100),
            temp_dir: None,
            prober: None,
            probe_timeout: Duration::from_secs(30),
        }
    }
}

impl ExecutorConfig {
    /// Configuration for the encoder.
    pub fn ffmpeg() -> Self {
        Self::default()
    }

    /// Configuration for the prober.
    pub fn ffprobe() -> Self {
        Self {
            tool: "ffprobe".to_string(),
            timeout: Duration::from_secs(30),
            ..Self::default()
        }
    }

    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn with_prober(mut self, path: impl Into<PathBuf>) -> Self {
        self.prober = Some(path.into());
        self
    }
}

/// Captured result of a successful invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub command_line: Vec<String>,
}

/// Runs one external tool with argument validation, a deadline and
/// side-channel progress decoding.
#[derive(Debug)]
pub struct ProcessExecutor {
    program: PathBuf,
    prober: Option<PathBuf>,
    config: ExecutorConfig,
    events: Arc<EventBus>,
}

impl ProcessExecutor {
    /// Create a new executor, resolving the tool's executable.
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        let program = resolve_executable(&config.tool, config.executable.as_deref())
            .map_err(resolve_error)?;

        // Duration lookups are best effort.
        let prober = match resolve_executable("ffprobe", config.prober.as_deref()) {
            Ok(path) => Some(path),
            Err(e) => {
                debug!("No prober available for duration lookups: {}", e);
                None
            }
        };

        debug!(program = %program.display(), "Resolved {} executable", config.tool);

        Ok(Self {
            program,
            prober,
            config,
            events: Arc::new(EventBus::new()),
        })
    }

    /// Share an existing event bus instead of the executor's own.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Register a lifecycle listener.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&ExecutionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.on(kind, listener);
    }

    /// Run the tool to completion on the current thread.
    ///
    /// `duration_source` is probed for a total duration so samples carry a
    /// percentage; it is only consulted when `on_progress` is set.
    pub fn execute_blocking(
        &self,
        args: &[String],
        duration_source: Option<&Path>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<ExecutionOutput> {
        let args = validate_arguments(args)?;
        let total_duration = match (&on_progress, duration_source) {
            (Some(_), Some(source)) => self.media_duration_blocking(source),
            _ => None,
        };
        let side_channel = self.side_channel(on_progress.is_some())?;
        let command_line = self.command_line(&args, side_channel.as_ref());

        info!("Executing {}", command_line.join(" "));
        self.events.emit(&ExecutionEvent::Started {
            command_line: command_line.clone(),
        });

        let mut child = match std_command(&self.program)
            .args(&command_line[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return Err(self.fail(&command_line, Error::Io(e))),
        };

        let stdout_reader = child.stdout.take().map(spawn_pipe_reader);
        let stderr_reader = child.stderr.take().map(spawn_pipe_reader);

        let stop = AtomicBool::new(false);
        let waited = std::thread::scope(|scope| {
            if let (Some(file), Some(callback)) = (&side_channel, &on_progress) {
                let path = file.path();
                let stop = &stop;
                scope.spawn(move || {
                    let mut reader = ProgressReader::new(path);
                    while !stop.load(Ordering::Acquire) {
                        std::thread::sleep(self.config.poll_interval);
                        self.drain_progress(&mut reader, total_duration, callback);
                    }
                    self.drain_progress(&mut reader, total_duration, callback);
                });
            }

            let waited = self.wait_with_deadline(&mut child);
            stop.store(true, Ordering::Release);
            waited
        });

        let stdout = join_pipe_reader(stdout_reader);
        let stderr = join_pipe_reader(stderr_reader);

        match waited {
            Ok(Some(status)) => self.finish(command_line, status, stdout, stderr),
            Ok(None) => Err(self.terminate(&command_line)),
            Err(e) => Err(self.fail(&command_line, Error::Io(e))),
        }
    }

    /// Run the tool to completion without occupying the calling task's thread.
    pub async fn execute(
        &self,
        args: &[String],
        duration_source: Option<&Path>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<ExecutionOutput> {
        let args = validate_arguments(args)?;
        let total_duration = match (&on_progress, duration_source) {
            (Some(_), Some(source)) => self.media_duration(source).await,
            _ => None,
        };
        let side_channel = self.side_channel(on_progress.is_some())?;
        let command_line = self.command_line(&args, side_channel.as_ref());

        info!("Executing {}", command_line.join(" "));
        self.events.emit(&ExecutionEvent::Started {
            command_line: command_line.clone(),
        });

        let mut command = tokio_command(&self.program);
        command
            .args(&command_line[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return Err(self.fail(&command_line, Error::Io(e))),
        };

        let stdout_task = child.stdout.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf).await;
                buf
            })
        });
        let stderr_task = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf).await;
                buf
            })
        });

        let stop = CancellationToken::new();
        let poller = match (&side_channel, &on_progress) {
            (Some(file), Some(callback)) => {
                let path = file.path().to_path_buf();
                let callback = callback.clone();
                let events = self.events.clone();
                let interval = self.config.poll_interval;
                let stop = stop.clone();
                Some(tokio::spawn(async move {
                    let mut reader = ProgressReader::new(path);
                    loop {
                        tokio::select! {
                            _ = stop.cancelled() => break,
                            _ = tokio::time::sleep(interval) => {
                                drain_progress(&mut reader, total_duration, &callback, &events);
                            }
                        }
                    }
                    drain_progress(&mut reader, total_duration, &callback, &events);
                }))
            }
            _ => None,
        };

        let waited = tokio::time::timeout(self.config.timeout, child.wait()).await;

        stop.cancel();
        if let Some(poller) = poller {
            let _ = poller.await;
        }

        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(self.fail(&command_line, Error::Io(e))),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed out process: {}", e);
                }
                return Err(self.terminate(&command_line));
            }
        };

        let stdout = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };

        self.finish(
            command_line,
            status,
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        )
    }

    /// Container duration of `input` in seconds, or `None` when it cannot be
    /// determined.
    pub fn media_duration_blocking(&self, input: &Path) -> Option<f64> {
        let prober = self.prober.as_ref()?;
        let args = duration_probe_args(input)?;

        let mut child = std_command(prober)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .ok()?;
        let stdout_reader = child.stdout.take().map(spawn_pipe_reader);

        let deadline = Instant::now() + self.config.probe_timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    debug!("Duration probe timed out for {}", input.display());
                    return None;
                }
                Ok(None) => std::thread::sleep(WAIT_STEP),
                Err(_) => return None,
            }
        };

        let stdout = join_pipe_reader(stdout_reader);
        if !status.success() {
            return None;
        }
        parse_format_duration(&stdout)
    }

    /// Async counterpart of [`ProcessExecutor::media_duration_blocking`].
    pub async fn media_duration(&self, input: &Path) -> Option<f64> {
        let prober = self.prober.as_ref()?;
        let args = duration_probe_args(input)?;

        let output = tokio_command(prober)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(self.config.probe_timeout, output).await {
            Ok(Ok(output)) if output.status.success() => output,
            _ => {
                debug!("Duration probe failed for {}", input.display());
                return None;
            }
        };

        parse_format_duration(&String::from_utf8_lossy(&output.stdout))
    }

    fn side_channel(&self, wanted: bool) -> Result<Option<NamedTempFile>> {
        if !wanted {
            return Ok(None);
        }
        let mut builder = tempfile::Builder::new();
        builder.prefix("tidal_").suffix(".progress");
        let file = match &self.config.temp_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        Ok(Some(file))
    }

    fn command_line(&self, args: &[String], side_channel: Option<&NamedTempFile>) -> Vec<String> {
        let mut command_line = vec![self.program.to_string_lossy().into_owned()];
        if let Some(file) = side_channel {
            command_line.extend([
                "-progress".to_string(),
                file.path().to_string_lossy().into_owned(),
                "-nostats".to_string(),
            ]);
        }
        command_line.extend(args.iter().cloned());
        command_line
    }

    /// `Ok(None)` when the deadline passed and the child was killed.
    fn wait_with_deadline(
        &self,
        child: &mut std::process::Child,
    ) -> std::io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                if let Err(e) = child.kill() {
                    warn!("Failed to kill timed out process: {}", e);
                }
                let _ = child.wait();
                return Ok(None);
            }
            std::thread::sleep(WAIT_STEP);
        }
    }

    fn drain_progress(
        &self,
        reader: &mut ProgressReader,
        total_duration: Option<f64>,
        callback: &ProgressCallback,
    ) {
        drain_progress(reader, total_duration, callback, &self.events);
    }

    fn finish(
        &self,
        command_line: Vec<String>,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    ) -> Result<ExecutionOutput> {
        if !status.success() {
            let error = Error::Process {
                program: self.config.tool.clone(),
                exit_code: status.code(),
                stderr,
            };
            return Err(self.fail(&command_line, error));
        }

        let exit_code = status.code().unwrap_or(0);
        debug!(exit_code, "{} completed", self.config.tool);
        self.events.emit(&ExecutionEvent::Completed {
            command_line: command_line.clone(),
            exit_code,
        });

        Ok(ExecutionOutput {
            exit_code,
            stdout,
            stderr,
            command_line,
        })
    }

    fn terminate(&self, command_line: &[String]) -> Error {
        let timeout_secs = self.config.timeout.as_secs_f64();
        warn!("{} exceeded {}s deadline, killed", self.config.tool, timeout_secs);
        self.events.emit(&ExecutionEvent::Terminated {
            command_line: command_line.to_vec(),
            timeout_secs,
        });
        self.fail(
            command_line,
            Error::Timeout {
                timeout_secs,
                command: command_line.join(" "),
            },
        )
    }

    fn fail(&self, command_line: &[String], error: Error) -> Error {
        self.events.emit(&ExecutionEvent::Error {
            command_line: command_line.to_vec(),
            kind: error.kind(),
            message: error.to_string(),
        });
        error
    }
}

/// Decode newly appended side-channel lines and deliver the samples that
/// carry a position.
fn drain_progress(
    reader: &mut ProgressReader,
    total_duration: Option<f64>,
    callback: &ProgressCallback,
    events: &EventBus,
) {
    let lines = match reader.read_new_lines() {
        Ok(lines) => lines,
        Err(e) => {
            debug!("Progress side-channel not readable yet: {}", e);
            return;
        }
    };

    for sample in lines
        .iter()
        .filter_map(|line| parse_progress_line(line, total_duration))
        .filter(ProgressEvent::has_position)
    {
        if catch_unwind(AssertUnwindSafe(|| callback(&sample))).is_err() {
            warn!("Progress callback panicked");
        }
        events.emit(&ExecutionEvent::Progress(sample));
    }
}

fn resolve_error(e: ResolveError) -> Error {
    match e {
        ResolveError::InvalidPath(_) => Error::security(e.to_string()),
        ResolveError::NotFound(_) => Error::Other(e.to_string()),
    }
}

fn duration_probe_args(input: &Path) -> Option<Vec<String>> {
    let input = input.to_string_lossy();
    validate_arguments([
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_format",
        input.as_ref(),
    ])
    .ok()
}

fn parse_format_duration(stdout: &str) -> Option<f64> {
    #[derive(Deserialize)]
    struct Probe {
        format: Format,
    }
    #[derive(Deserialize)]
    struct Format {
        duration: Option<String>,
    }

    let probe: Probe = serde_json::from_str(stdout).ok()?;
    probe
        .format
        .duration?
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d > 0.0)
}

fn spawn_pipe_reader<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join_pipe_reader(handle: Option<std::thread::JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}
