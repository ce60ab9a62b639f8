//! Drives one job through probe, segment, encode, mux and score.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use super::limiter::CapacityLimiter;
use super::progress::{ProgressReporter, StageProgressUpdate};
use super::report::{JobResult, NoopReportSink, ReportSink};
use super::stage::StageKind;
use super::stages::encode::ChunkEncodeRequest;
use super::stages::quality::FrameSize;
use super::stages::{Toolchain, audio, concat, encode, mux, probe, quality, segment};
use super::state::{JobState, JobStateTracker};
use super::worker_pool::{WorkerPool, WorkerPoolConfig};
use crate::config::TidalConfig;
use crate::domain::{EncodedChunk, JobInput, ProbeResult, Resolution};
use crate::error::JobFailure;
use crate::{Error, Result};

/// One resolution to produce. `resolution` is `None` when the target matches
/// the source frame size, which is encoded without scaling.
#[derive(Debug, Clone)]
struct Target {
    label: String,
    resolution: Option<Resolution>,
}

impl Target {
    fn frame_size(&self, probe: &ProbeResult) -> FrameSize {
        match &self.resolution {
            Some(r) => FrameSize::new(r.width(), r.height()),
            None => FrameSize::new(probe.width, probe.height),
        }
    }
}

fn resolve_targets(input: &JobInput, probe: &ProbeResult) -> Vec<Target> {
    match &input.resolutions {
        Some(resolutions) => resolutions
            .iter()
            .map(|r| Target {
                label: r.label().to_string(),
                resolution: (!r.same_dimensions(probe.width, probe.height)).then(|| r.clone()),
            })
            .collect(),
        None => vec![Target {
            label: probe.resolution_label(),
            resolution: None,
        }],
    }
}

/// A job running in the background.
#[derive(Debug)]
pub struct JobHandle {
    pub job_id: String,
    state: watch::Receiver<JobState>,
    task: JoinHandle<std::result::Result<JobResult, JobFailure>>,
}

impl JobHandle {
    pub fn state(&self) -> watch::Receiver<JobState> {
        self.state.clone()
    }

    pub async fn wait(self) -> std::result::Result<JobResult, JobFailure> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(JobFailure {
                job_id: self.job_id,
                stage: None,
                error: Error::Other(format!("job task aborted: {e}")),
            }),
        }
    }
}

/// The transcoding pipeline.
///
/// Cheap to clone; clones share the worker pool, the capacity caps and the
/// sinks, so concurrent jobs compete for the same capacity.
#[derive(Clone)]
pub struct Pipeline {
    tools: Toolchain,
    pool: Arc<WorkerPool>,
    reporter: ProgressReporter,
    sink: Arc<dyn ReportSink>,
    output_root: Option<PathBuf>,
}

impl Pipeline {
    pub fn new(tools: Toolchain, pool: Arc<WorkerPool>) -> Self {
        Self {
            tools,
            pool,
            reporter: ProgressReporter::noop(""),
            sink: Arc::new(NoopReportSink),
            output_root: None,
        }
    }

    /// Build executors, capacity caps and the worker pool from `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_config(config: &TidalConfig) -> Result<Self> {
        let tools = Toolchain::from_config(config)?;
        let limiter = Arc::new(CapacityLimiter::new(&config.capacity));
        let pool = Arc::new(WorkerPool::new(
            WorkerPoolConfig::from(&config.capacity),
            limiter,
        ));

        let mut pipeline = Self::new(tools, pool);
        pipeline.output_root = config.output_root.clone();
        Ok(pipeline)
    }

    pub fn with_progress(mut self, tx: mpsc::Sender<StageProgressUpdate>) -> Self {
        self.reporter = ProgressReporter::new("", tx);
        self
    }

    pub fn with_report_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = Some(root.into());
        self
    }

    pub fn tools(&self) -> &Toolchain {
        &self.tools
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Run `input` to completion.
    pub async fn run(&self, input: JobInput) -> std::result::Result<JobResult, JobFailure> {
        let job_id = new_job_id();
        let tracker = JobStateTracker::new(job_id.clone());
        self.run_job(input, job_id, &tracker).await
    }

    /// Run `input` in the background, observable through its state channel.
    pub fn spawn(&self, input: JobInput) -> JobHandle {
        let job_id = new_job_id();
        let tracker = JobStateTracker::new(job_id.clone());
        let state = tracker.subscribe();
        let pipeline = self.clone();
        let id = job_id.clone();
        let task = tokio::spawn(async move { pipeline.run_job(input, id, &tracker).await });

        JobHandle {
            job_id,
            state,
            task,
        }
    }

    async fn run_job(
        &self,
        input: JobInput,
        job_id: String,
        tracker: &JobStateTracker,
    ) -> std::result::Result<JobResult, JobFailure> {
        let fail = |stage: Option<StageKind>, error: Error| {
            warn!(
                job_id = %job_id,
                stage = %stage.map_or("validation", |s| s.into()),
                "Job failed: {}",
                error
            );
            transition(
                tracker,
                JobState::Failed {
                    stage,
                    reason: error.to_string(),
                },
            );
            JobFailure {
                job_id: job_id.clone(),
                stage,
                error,
            }
        };

        input.validate().map_err(|e| fail(None, e))?;

        let root = match (&input.output_dir, &self.output_root) {
            (None, Some(root)) => root.clone(),
            _ => input.output_root(),
        };
        let work_dir = job_work_dir(&root, &input, &job_id);
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| fail(None, e.into()))?;

        info!(
            job_id = %job_id,
            "Starting job for {} in {}",
            input.source_path.display(),
            work_dir.display()
        );
        let reporter = self.reporter.for_job(job_id.clone());

        // Probe
        transition(tracker, JobState::Probing);
        let probe = {
            let tools = self.tools.clone();
            let source = input.source_path.clone();
            self.run_stage(StageKind::Probe, move || {
                let tools = tools.clone();
                let source = source.clone();
                async move { probe::probe(&tools, &source).await }
            })
            .await
            .map_err(|e| fail(Some(StageKind::Probe), e))?
        };

        let targets = resolve_targets(&input, &probe);

        // Segment
        transition(tracker, JobState::Segmenting);
        let segments = {
            let tools = self.tools.clone();
            let source = input.source_path.clone();
            let work_dir = work_dir.clone();
            let segment_duration = input.segment_duration;
            let has_audio = probe.has_audio();
            let reporter = reporter.clone();
            self.run_stage(StageKind::Segment, move || {
                let tools = tools.clone();
                let source = source.clone();
                let work_dir = work_dir.clone();
                let reporter = reporter.clone();
                async move {
                    segment::segment(
                        &tools,
                        &source,
                        &work_dir,
                        segment_duration,
                        has_audio,
                        &reporter,
                    )
                    .await
                }
            })
            .await
            .map_err(|e| fail(Some(StageKind::Segment), e))?
        };

        // Audio overlaps with video encoding.
        let audio_handle = match &segments.audio_path {
            Some(audio_path) => {
                let tools = self.tools.clone();
                let audio_path = audio_path.clone();
                let work_dir = work_dir.clone();
                let codec = input.codec.clone();
                let reporter = reporter.clone();
                let handle = self
                    .pool
                    .submit(StageKind::AudioTranscode, move || {
                        let tools = tools.clone();
                        let audio_path = audio_path.clone();
                        let work_dir = work_dir.clone();
                        let codec = codec.clone();
                        let reporter = reporter.clone();
                        async move {
                            audio::transcode_audio(&tools, &audio_path, &work_dir, &codec, &reporter)
                                .await
                        }
                    })
                    .await
                    .map_err(|e| fail(Some(StageKind::AudioTranscode), e))?;
                Some(handle)
            }
            None => None,
        };

        // Encode each resolution in order, chunks in parallel.
        let mut videos: Vec<(Target, PathBuf)> = Vec::with_capacity(targets.len());
        for target in &targets {
            transition(
                tracker,
                JobState::Encoding {
                    label: target.label.clone(),
                },
            );

            let mut handles = Vec::with_capacity(segments.chunk_count());
            for (index, chunk) in segments.chunk_paths().iter().enumerate() {
                let request = Arc::new(ChunkEncodeRequest {
                    chunk: chunk.clone(),
                    index,
                    label: target.label.clone(),
                    target: target.resolution.clone(),
                    codec: input.codec.clone(),
                    work_dir: work_dir.clone(),
                });
                let tools = self.tools.clone();
                let reporter = reporter.clone();
                let handle = self
                    .pool
                    .submit(StageKind::ChunkEncode, move || {
                        let tools = tools.clone();
                        let request = request.clone();
                        let reporter = reporter.clone();
                        async move { encode::encode_chunk(&tools, &request, &reporter).await }
                    })
                    .await
                    .map_err(|e| fail(Some(StageKind::ChunkEncode), e))?;
                handles.push(handle);
            }

            let mut encoded: Vec<EncodedChunk> = Vec::with_capacity(handles.len());
            for handle in handles {
                encoded.push(
                    handle
                        .join()
                        .await
                        .map_err(|e| fail(Some(StageKind::ChunkEncode), e))?,
                );
            }
            info!(
                job_id = %job_id,
                label = %target.label,
                "Encoded {} chunks",
                encoded.len()
            );

            let video = {
                let tools = self.tools.clone();
                let label = target.label.clone();
                let container = input.container;
                let work_dir = work_dir.clone();
                let reporter = reporter.clone();
                let encoded = Arc::new(encoded);
                self.run_stage(StageKind::Concatenate, move || {
                    let tools = tools.clone();
                    let label = label.clone();
                    let work_dir = work_dir.clone();
                    let reporter = reporter.clone();
                    let encoded = encoded.clone();
                    async move {
                        concat::concatenate(
                            &tools, &encoded, &label, container, &work_dir, &reporter,
                        )
                        .await
                    }
                })
                .await
                .map_err(|e| fail(Some(StageKind::Concatenate), e))?
            };
            videos.push((target.clone(), video));
        }

        // Join the audio branch, then mux.
        let audio = match audio_handle {
            Some(handle) => Some(
                handle
                    .join()
                    .await
                    .map_err(|e| fail(Some(StageKind::AudioTranscode), e))?,
            ),
            None => None,
        };

        let outputs: Vec<(Target, PathBuf)> = match audio {
            Some(audio) => {
                transition(tracker, JobState::Muxing);
                let mut muxed = Vec::with_capacity(videos.len());
                for (target, video) in videos {
                    let tools = self.tools.clone();
                    let label = target.label.clone();
                    let container = input.container;
                    let work_dir = work_dir.clone();
                    let reporter = reporter.clone();
                    let audio = audio.clone();
                    let final_path = self
                        .run_stage(StageKind::Mux, move || {
                            let tools = tools.clone();
                            let video = video.clone();
                            let audio = audio.clone();
                            let label = label.clone();
                            let work_dir = work_dir.clone();
                            let reporter = reporter.clone();
                            async move {
                                mux::mux(
                                    &tools, &video, &audio, &label, container, &work_dir,
                                    &reporter,
                                )
                                .await
                            }
                        })
                        .await
                        .map_err(|e| fail(Some(StageKind::Mux), e))?;
                    muxed.push((target, final_path));
                }
                muxed
            }
            None => {
                info!(job_id = %job_id, "Source has no audio, skipping mux");
                videos
            }
        };

        // Score the primary resolution only.
        transition(tracker, JobState::Scoring);
        let (primary, primary_path) = outputs
            .first()
            .cloned()
            .ok_or_else(|| fail(Some(StageKind::QualityScore), Error::domain("no outputs to score")))?;
        let quality = {
            let tools = self.tools.clone();
            let reference = input.source_path.clone();
            let reference_size = FrameSize::new(probe.width, probe.height);
            let distorted_size = primary.frame_size(&probe);
            let reporter = reporter.clone();
            self.run_stage(StageKind::QualityScore, move || {
                let tools = tools.clone();
                let reference = reference.clone();
                let distorted = primary_path.clone();
                let reporter = reporter.clone();
                async move {
                    quality::score(
                        &tools,
                        &reference,
                        reference_size,
                        &distorted,
                        distorted_size,
                        &reporter,
                    )
                    .await
                }
            })
            .await
            .map_err(|e| fail(Some(StageKind::QualityScore), e))?
        };

        transition(tracker, JobState::Completed);

        let result = JobResult {
            job_id: job_id.clone(),
            outputs: outputs
                .into_iter()
                .map(|(target, path)| (target.label, path))
                .collect(),
            rating: quality.rating(),
            quality,
            work_dir,
            probe,
            completed_at: chrono::Utc::now(),
        };

        info!(
            job_id = %job_id,
            "Job completed: {} output(s), quality {:.2} ({})",
            result.outputs.len(),
            result.quality.mean,
            result.rating
        );

        if let Err(e) = self.sink.publish(&result).await {
            warn!(job_id = %job_id, "Report sink failed: {:#}", e);
        }

        Ok(result)
    }

    /// Submit one unit and wait for it.
    async fn run_stage<T, F, Fut>(&self, stage: StageKind, attempt: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        self.pool.submit(stage, attempt).await?.join().await
    }
}

fn new_job_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn transition(tracker: &JobStateTracker, next: JobState) {
    if let Err(e) = tracker.transition(next) {
        warn!("{}", e);
    }
}

/// Working directory of a job, for callers that know its id.
pub fn job_work_dir(root: &Path, input: &JobInput, job_id: &str) -> PathBuf {
    root.join(format!("tidal_{}_{}", input.source_stem(), job_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CodecConfig;

    fn probe() -> ProbeResult {
        ProbeResult {
            duration: 2.0,
            width: 1920,
            height: 1080,
            video_codec: "h264".into(),
            audio_codec: None,
            frame_rate: 30.0,
            bitrate: None,
        }
    }

    #[test]
    fn test_implicit_target_uses_source_resolution() {
        let input = JobInput::new("/in.mp4");
        let targets = resolve_targets(&input, &probe());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].label, "1080p");
        assert!(targets[0].resolution.is_none());
        assert_eq!(targets[0].frame_size(&probe()), FrameSize::new(1920, 1080));
    }

    #[test]
    fn test_explicit_targets_keep_order() {
        let input = JobInput::new("/in.mp4").with_resolutions(vec![
            Resolution::new(1280, 720, "720p").unwrap(),
            Resolution::new(640, 360, "360p").unwrap(),
        ]);
        let targets = resolve_targets(&input, &probe());
        let labels: Vec<_> = targets.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(labels, vec!["720p", "360p"]);
        assert_eq!(targets[1].frame_size(&probe()), FrameSize::new(640, 360));
    }

    #[test]
    fn test_explicit_target_at_source_size_is_not_scaled() {
        let input = JobInput::new("/in.mp4").with_resolutions(vec![
            Resolution::new(1920, 1080, "full").unwrap(),
            Resolution::new(1280, 720, "720p").unwrap(),
        ]);
        let targets = resolve_targets(&input, &probe());
        assert_eq!(targets[0].label, "full");
        assert!(targets[0].resolution.is_none());
        assert_eq!(targets[0].frame_size(&probe()), FrameSize::new(1920, 1080));
        assert!(targets[1].resolution.is_some());

        let args = encode::encode_args(
            Path::new("/w/chunks/chunk_0000.mkv"),
            Path::new("/w/encoded_full/encoded_full_0000.mkv"),
            targets[0].resolution.as_ref(),
            &CodecConfig::default(),
        );
        assert!(!args.iter().any(|a| a.starts_with("scale=")));
    }

    #[test]
    fn test_job_ids_are_short_hex() {
        let id = new_job_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_job_work_dir_layout() {
        let input = JobInput::new("/media/clip.mp4").with_codec(CodecConfig::default());
        assert_eq!(
            job_work_dir(Path::new("/out"), &input, "ab12cd34"),
            PathBuf::from("/out/tidal_clip_ab12cd34")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invalid_input_fails_before_any_stage() {
        let limiter = Arc::new(CapacityLimiter::new(&crate::config::CapacityConfig::default()));
        let pool = Arc::new(WorkerPool::new(WorkerPoolConfig::default(), limiter));
        let dir = tempfile::TempDir::new().unwrap();
        let tools = super::super::stages::tests_support::fake_toolchain(&dir, "exit 1");
        let pipeline = Pipeline::new(tools, pool);

        let handle = pipeline.spawn(JobInput::new(dir.path().join("missing.mp4")));
        let state = handle.state();
        let failure = handle.wait().await.unwrap_err();

        assert!(failure.stage.is_none());
        assert!(matches!(failure.error, Error::Validation(_)));
        assert!(matches!(*state.borrow(), JobState::Failed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_failure_is_reported_with_stage() {
        let limiter = Arc::new(CapacityLimiter::new(&crate::config::CapacityConfig::default()));
        let pool = Arc::new(
            WorkerPool::new(WorkerPoolConfig::default(), limiter)
                .with_retry_policy(StageKind::Probe, super::super::stage::RetryPolicy::none()),
        );
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("clip.mp4");
        std::fs::write(&source, b"not really a video").unwrap();
        let tools =
            super::super::stages::tests_support::fake_toolchain(&dir, "echo 'moov atom not found' >&2\nexit 1");
        let pipeline = Pipeline::new(tools, pool).with_output_root(dir.path().join("out"));

        let failure = pipeline.run(JobInput::new(&source)).await.unwrap_err();
        assert_eq!(failure.stage, Some(StageKind::Probe));
        assert!(matches!(failure.error, Error::Process { .. }));
        assert!(failure.to_string().contains("moov atom not found"));
    }

    #[test]
    fn test_late_failure_does_not_leave_terminal_state() {
        let tracker = JobStateTracker::new("ab12cd34");
        for next in [
            JobState::Probing,
            JobState::Segmenting,
            JobState::Encoding { label: "720p".into() },
            JobState::Scoring,
            JobState::Completed,
        ] {
            transition(&tracker, next);
        }
        transition(
            &tracker,
            JobState::Failed {
                stage: Some(StageKind::QualityScore),
                reason: "late".into(),
            },
        );
        assert_eq!(tracker.current(), JobState::Completed);
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use crate::pipeline::stage::RetryPolicy;
        use crate::pipeline::stages::tests_support::media_toolchain;
        use strum::IntoEnumIterator;
        use tempfile::TempDir;

        fn pipeline(dir: &TempDir, tools: Toolchain) -> Pipeline {
            let limiter = Arc::new(CapacityLimiter::new(&crate::config::CapacityConfig::default()));
            let pool = StageKind::iter().fold(
                WorkerPool::new(WorkerPoolConfig::default(), limiter),
                |pool, stage| pool.with_retry_policy(stage, RetryPolicy::none()),
            );
            Pipeline::new(tools, Arc::new(pool)).with_output_root(dir.path().join("out"))
        }

        fn source(dir: &TempDir) -> PathBuf {
            let path = dir.path().join("clip.mp4");
            std::fs::write(&path, b"source").unwrap();
            path
        }

        fn scored_inputs(dir: &TempDir) -> Vec<String> {
            std::fs::read_to_string(dir.path().join("vmaf_calls.log"))
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }

        #[tokio::test]
        async fn test_job_with_audio_muxes_every_label_and_scores_the_first() {
            let dir = TempDir::new().unwrap();
            let source = source(&dir);
            let pipeline = pipeline(&dir, media_toolchain(&dir, true, None));

            let input = JobInput::new(&source).with_resolutions(vec![
                Resolution::new(320, 240, "full").unwrap(),
                Resolution::new(160, 120, "small").unwrap(),
            ]);
            let handle = pipeline.spawn(input);
            let state = handle.state();
            let result = handle.wait().await.unwrap();

            assert_eq!(*state.borrow(), JobState::Completed);
            assert_eq!(result.labels().collect::<Vec<_>>(), vec!["full", "small"]);
            for label in ["full", "small"] {
                let expected = result.work_dir.join("final").join(format!("final_{label}.mp4"));
                assert_eq!(result.output(label), Some(expected.as_path()));
                assert!(expected.exists());
                for index in 0..2 {
                    let chunk = result
                        .work_dir
                        .join(format!("encoded_{label}"))
                        .join(format!("encoded_{label}_{index:04}.mkv"));
                    assert!(chunk.exists(), "{} missing", chunk.display());
                }
            }
            assert!(result.work_dir.join("audio_transcoded.m4a").exists());

            let scored = scored_inputs(&dir);
            assert_eq!(scored.len(), 1, "scored {scored:?}");
            assert!(scored[0].ends_with("final_full.mp4"));
            assert_eq!(result.quality.mean, 93.5);
            assert_eq!(result.rating, result.quality.rating());
        }

        #[tokio::test]
        async fn test_job_without_audio_has_no_final_dir() {
            let dir = TempDir::new().unwrap();
            let source = source(&dir);
            let pipeline = pipeline(&dir, media_toolchain(&dir, false, None));

            let result = pipeline.run(JobInput::new(&source)).await.unwrap();

            assert_eq!(result.labels().collect::<Vec<_>>(), vec!["240p"]);
            assert_eq!(
                result.output("240p"),
                Some(result.work_dir.join("video_240p.mp4").as_path())
            );
            assert!(!result.work_dir.join("final").exists());
            assert!(!result.work_dir.join("audio").exists());
            assert_eq!(scored_inputs(&dir).len(), 1);
        }

        #[tokio::test]
        async fn test_failed_chunk_fails_job_in_encode_stage() {
            let dir = TempDir::new().unwrap();
            let source = source(&dir);
            let pipeline = pipeline(&dir, media_toolchain(&dir, true, Some(1)));

            let handle = pipeline.spawn(JobInput::new(&source));
            let state = handle.state();
            let failure = handle.wait().await.unwrap_err();

            assert_eq!(failure.stage, Some(StageKind::ChunkEncode));
            assert!(matches!(failure.error, Error::Process { .. }));
            assert!(matches!(
                &*state.borrow(),
                JobState::Failed {
                    stage: Some(StageKind::ChunkEncode),
                    ..
                }
            ));
            assert!(scored_inputs(&dir).is_empty());
        }
    }
}
