use std::path::{Path, PathBuf};
use tracing::info;

use super::{Toolchain, ensure_output, path_arg};
use crate::domain::Container;
use crate::pipeline::progress::{ProgressReporter, StageProgress};
use crate::pipeline::stage::StageKind;
use crate::Result;

pub fn final_path(work_dir: &Path, label: &str, container: Container) -> PathBuf {
    work_dir
        .join("final")
        .join(format!("final_{label}.{}", container.extension()))
}

pub fn mux_args(video: &Path, audio: &Path, output: &Path, container: Container) -> Vec<String> {
    let mut args = vec!["-y".to_string()];
    args.extend(["-i".to_string(), path_arg(video)]);
    args.extend(["-i".to_string(), path_arg(audio)]);
    args.extend(["-map".to_string(), "0:v:0".to_string()]);
    args.extend(["-map".to_string(), "1:a:0".to_string()]);
    args.extend(["-c:v".to_string(), "copy".to_string()]);
    args.extend(["-c:a".to_string(), "copy".to_string()]);
    args.push("-shortest".to_string());

    if container.supports_faststart() {
        args.extend(["-movflags".to_string(), "+faststart".to_string()]);
    }

    args.push(path_arg(output));
    args
}

/// Combine one resolution's video with the shared audio track.
pub async fn mux(
    tools: &Toolchain,
    video: &Path,
    audio: &Path,
    label: &str,
    container: Container,
    work_dir: &Path,
    reporter: &ProgressReporter,
) -> Result<PathBuf> {
    let output = final_path(work_dir, label, container);
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let args = mux_args(video, audio, &output, container);
    let callback = reporter.callback(StageProgress::new(StageKind::Mux).with_label(label));
    tools.ffmpeg.execute(&args, Some(video), Some(callback)).await?;
    ensure_output(&output).await?;

    info!(label, "Muxed {}", output.display());
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_path() {
        assert_eq!(
            final_path(Path::new("/w"), "720p", Container::Mkv),
            PathBuf::from("/w/final/final_720p.mkv")
        );
    }

    #[test]
    fn test_build_args_faststart_only_for_mp4_family() {
        let mp4 = mux_args(
            Path::new("/w/video_720p.mp4"),
            Path::new("/w/audio_transcoded.m4a"),
            Path::new("/w/final/final_720p.mp4"),
            Container::Mp4,
        );
        assert!(mp4.contains(&"-shortest".to_string()));
        assert!(mp4.contains(&"+faststart".to_string()));

        let mkv = mux_args(
            Path::new("/w/video_720p.mkv"),
            Path::new("/w/audio_transcoded.m4a"),
            Path::new("/w/final/final_720p.mkv"),
            Container::Mkv,
        );
        assert!(!mkv.contains(&"-movflags".to_string()));
        assert_eq!(mkv.last().unwrap(), "/w/final/final_720p.mkv");
    }
}
