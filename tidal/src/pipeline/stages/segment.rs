//! Splitting the source into video-only chunks plus one audio side-stream.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{Toolchain, ensure_output, path_arg};
use crate::domain::{CHUNK_INDEX_WIDTH, SegmentResult};
use crate::pipeline::progress::{ProgressReporter, StageProgress};
use crate::pipeline::stage::StageKind;
use crate::{Error, Result};

const CHUNK_PREFIX: &str = "chunk_";
const CHUNK_EXTENSION: &str = "mkv";

pub fn chunks_dir(work_dir: &Path) -> PathBuf {
    work_dir.join("chunks")
}

pub fn source_audio_path(work_dir: &Path) -> PathBuf {
    work_dir.join("audio").join("source_audio.mka")
}

/// One invocation with two outputs: the segment muxer for video and, when
/// requested, a stream-copied audio file.
pub fn segment_args(
    source: &Path,
    chunks_dir: &Path,
    audio_output: Option<&Path>,
    segment_duration: u32,
) -> Vec<String> {
    let pattern = chunks_dir.join(format!(
        "{CHUNK_PREFIX}%0{CHUNK_INDEX_WIDTH}d.{CHUNK_EXTENSION}"
    ));

    let mut args = vec!["-y".to_string(), "-i".to_string(), path_arg(source)];

    args.extend(["-map".to_string(), "0:v:0".to_string(), "-an".to_string()]);
    args.extend(["-c:v".to_string(), "copy".to_string()]);
    args.extend(["-f".to_string(), "segment".to_string()]);
    args.extend(["-segment_time".to_string(), segment_duration.to_string()]);
    args.extend(["-reset_timestamps".to_string(), "1".to_string()]);
    args.push(path_arg(&pattern));

    if let Some(audio) = audio_output {
        args.extend(["-map".to_string(), "0:a:0".to_string(), "-vn".to_string()]);
        args.extend(["-c:a".to_string(), "copy".to_string()]);
        args.push(path_arg(audio));
    }

    args
}

/// Chunk files in `dir`, in index order.
pub async fn list_chunks(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut chunks = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_chunk = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(CHUNK_PREFIX))
            && path.extension().and_then(|e| e.to_str()) == Some(CHUNK_EXTENSION);
        if is_chunk {
            chunks.push(path);
        }
    }
    chunks.sort();
    Ok(chunks)
}

/// Split `source` into chunks of roughly `segment_duration` seconds.
pub async fn segment(
    tools: &Toolchain,
    source: &Path,
    work_dir: &Path,
    segment_duration: u32,
    has_audio: bool,
    reporter: &ProgressReporter,
) -> Result<SegmentResult> {
    let chunks_dir = chunks_dir(work_dir);
    // Chunks left by an earlier attempt would be picked up again.
    if tokio::fs::try_exists(&chunks_dir).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(&chunks_dir).await?;
    }
    tokio::fs::create_dir_all(&chunks_dir).await?;

    let audio_path = if has_audio {
        let path = source_audio_path(work_dir);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Some(path)
    } else {
        None
    };

    let args = segment_args(source, &chunks_dir, audio_path.as_deref(), segment_duration);
    let callback = reporter.callback(StageProgress::new(StageKind::Segment));
    tools.ffmpeg.execute(&args, Some(source), Some(callback)).await?;

    let chunks = list_chunks(&chunks_dir).await?;
    if chunks.is_empty() {
        return Err(Error::not_found(format!(
            "segmentation produced no chunks in {}",
            chunks_dir.display()
        )));
    }
    if let Some(audio) = &audio_path {
        ensure_output(audio).await?;
    }

    debug!("Chunks: {:?}", chunks);
    info!(
        "Segmented {} into {} chunks{}",
        source.display(),
        chunks.len(),
        if audio_path.is_some() { " with audio" } else { "" }
    );

    Ok(SegmentResult::new(chunks, audio_path, work_dir.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args_without_audio() {
        let args = segment_args(Path::new("/in.mp4"), Path::new("/w/chunks"), None, 10);
        assert_eq!(args.last().unwrap(), "/w/chunks/chunk_%04d.mkv");
        assert!(args.contains(&"-an".to_string()));
        assert!(args.contains(&"-segment_time".to_string()));
        assert!(args.contains(&"10".to_string()));
        assert!(!args.contains(&"0:a:0".to_string()));
    }

    #[test]
    fn test_build_args_with_audio() {
        let audio = source_audio_path(Path::new("/w"));
        let args = segment_args(Path::new("/in.mp4"), Path::new("/w/chunks"), Some(&audio), 1);
        let audio_map = args.iter().position(|a| a == "0:a:0").unwrap();
        let video_out = args.iter().position(|a| a.ends_with("chunk_%04d.mkv")).unwrap();
        // The audio output follows the chunk pattern.
        assert!(audio_map > video_out);
        assert!(args.contains(&"-vn".to_string()));
        assert_eq!(args.last().unwrap(), "/w/audio/source_audio.mka");
    }

    #[tokio::test]
    async fn test_list_chunks_filters_and_sorts() {
        let dir = tempfile::TempDir::new().unwrap();
        for name in ["chunk_0002.mkv", "chunk_0000.mkv", "chunk_0001.mkv", "notes.txt", "chunk_0003.tmp"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let chunks = list_chunks(dir.path()).await.unwrap();
        let names: Vec<_> = chunks
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["chunk_0000.mkv", "chunk_0001.mkv", "chunk_0002.mkv"]);
    }
}
