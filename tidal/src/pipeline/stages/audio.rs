use std::path::{Path, PathBuf};
use tracing::info;

use super::{Toolchain, ensure_output, path_arg};
use crate::domain::{CodecConfig, audio_extension};
use crate::pipeline::progress::{ProgressReporter, StageProgress};
use crate::pipeline::stage::StageKind;
use crate::Result;

pub fn transcoded_audio_path(work_dir: &Path, codec: &CodecConfig) -> PathBuf {
    work_dir.join(format!(
        "audio_transcoded.{}",
        audio_extension(&codec.audio_codec)
    ))
}

pub fn audio_args(input: &Path, output: &Path, codec: &CodecConfig) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-i".to_string(), path_arg(input)];
    args.push("-vn".to_string());
    args.extend(["-c:a".to_string(), codec.audio_codec.clone()]);
    args.extend(["-b:a".to_string(), codec.audio_bitrate.clone()]);
    args.push(path_arg(output));
    args
}

/// Re-encode the extracted audio side-stream with the job's audio codec.
pub async fn transcode_audio(
    tools: &Toolchain,
    audio: &Path,
    work_dir: &Path,
    codec: &CodecConfig,
    reporter: &ProgressReporter,
) -> Result<PathBuf> {
    let output = transcoded_audio_path(work_dir, codec);
    let args = audio_args(audio, &output, codec);
    let callback = reporter.callback(StageProgress::new(StageKind::AudioTranscode));

    tools.ffmpeg.execute(&args, Some(audio), Some(callback)).await?;
    ensure_output(&output).await?;

    info!("Transcoded audio to {}", output.display());
    Ok(output)
}
