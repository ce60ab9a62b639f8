use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tidal::config::TidalConfig;
use tidal::domain::{CodecConfig, Container, JobInput, Resolution};
use tidal::logging::init_logging;
use tidal::pipeline::{Pipeline, StageProgressUpdate, TracingReportSink, stages};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; TIDAL_* environment variables still apply on top
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Transcode a source video and score the result
    Transcode(TranscodeArgs),
    /// Print the media properties of a source video
    Probe {
        /// Source video
        source: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct TranscodeArgs {
    /// Source video
    source: PathBuf,

    /// Output directory, defaults to `<source dir>/output`
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Target resolution as WxH or WxH:label, may be repeated
    #[arg(short, long = "resolution", value_parser = parse_resolution)]
    resolutions: Vec<Resolution>,

    /// Constant Rate Factor (0-51)
    #[arg(long)]
    crf: Option<i32>,

    /// Encoder preset
    #[arg(long)]
    preset: Option<String>,

    #[arg(long)]
    video_codec: Option<String>,

    #[arg(long)]
    audio_codec: Option<String>,

    #[arg(long)]
    audio_bitrate: Option<String>,

    /// Chunk length in seconds
    #[arg(long, default_value_t = 10)]
    segment_duration: u32,

    /// Output container (mp4, mkv, webm, mov)
    #[arg(long, default_value = "mp4")]
    container: Container,
}

fn parse_resolution(s: &str) -> Result<Resolution, String> {
    Resolution::parse(s).map_err(|e| e.to_string())
}

impl TranscodeArgs {
    fn into_job(self) -> JobInput {
        let mut codec = CodecConfig::default();
        if let Some(crf) = self.crf {
            codec.crf = crf;
        }
        if let Some(preset) = self.preset {
            codec.video_preset = preset;
        }
        if let Some(video_codec) = self.video_codec {
            codec.video_codec = video_codec;
        }
        if let Some(audio_codec) = self.audio_codec {
            codec.audio_codec = audio_codec;
        }
        if let Some(audio_bitrate) = self.audio_bitrate {
            codec.audio_bitrate = audio_bitrate;
        }

        let mut job = JobInput::new(self.source)
            .with_codec(codec)
            .with_segment_duration(self.segment_duration)
            .with_container(self.container);
        if let Some(dir) = self.output_dir {
            job = job.with_output_dir(dir);
        }
        if !self.resolutions.is_empty() {
            job = job.with_resolutions(self.resolutions);
        }
        job
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<TidalConfig> {
    let Some(path) = path else {
        return Ok(TidalConfig::from_env()?);
    };

    dotenvy::dotenv().ok();
    let mut config = TidalConfig::from_json_file(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    config.apply_env(|key| std::env::var(key).ok())?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;
    init_logging(config.log_filter.as_deref(), config.log_json || args.json_logs);

    match args.command {
        Commands::Probe { source } => {
            let pipeline = Pipeline::from_config(&config)?;
            let probe = stages::probe::probe(pipeline.tools(), &source)
                .await
                .with_context(|| format!("Failed to probe {}", source.display()))?;
            println!("{}", serde_json::to_string_pretty(&probe)?);
        }
        Commands::Transcode(transcode) => {
            let (tx, mut rx) = mpsc::channel::<StageProgressUpdate>(64);
            let pipeline = Pipeline::from_config(&config)?
                .with_progress(tx)
                .with_report_sink(Arc::new(TracingReportSink));

            let progress = tokio::spawn(async move {
                while let Some(update) = rx.recv().await {
                    let p = &update.progress;
                    debug!(
                        job_id = %update.job_id,
                        stage = %p.stage,
                        label = ?p.label,
                        chunk = ?p.chunk,
                        percent = ?p.percent,
                        "progress"
                    );
                }
            });

            let handle = pipeline.spawn(transcode.into_job());
            let mut state = handle.state();
            let job_id = handle.job_id.clone();
            let states = tokio::spawn(async move {
                while state.changed().await.is_ok() {
                    let current = state.borrow_and_update().to_string();
                    info!(job_id = %job_id, state = %current, "Job state changed");
                }
            });

            let outcome = handle.wait().await;
            states.abort();
            drop(pipeline);
            progress.abort();

            match outcome {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                Err(failure) => {
                    error!(job_id = %failure.job_id, "{}", failure);
                    return Err(failure.into());
                }
            }
        }
    }

    Ok(())
}
