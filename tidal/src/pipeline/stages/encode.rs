//! Encoding one chunk at one target resolution.

use std::path::{Path, PathBuf};
use tracing::debug;

use super::{Toolchain, ensure_output, path_arg};
use crate::domain::{CodecConfig, EncodedChunk, Resolution, encoded_chunk_file_name};
use crate::pipeline::progress::{ProgressReporter, StageProgress};
use crate::pipeline::stage::StageKind;
use crate::Result;

/// Everything a chunk-encode unit needs.
#[derive(Debug, Clone)]
pub struct ChunkEncodeRequest {
    pub chunk: PathBuf,
    pub index: usize,
    pub label: String,
    /// `None` encodes at source resolution without scaling.
    pub target: Option<Resolution>,
    pub codec: CodecConfig,
    pub work_dir: PathBuf,
}

impl ChunkEncodeRequest {
    pub fn output_dir(&self) -> PathBuf {
        encoded_dir(&self.work_dir, &self.label)
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_dir()
            .join(encoded_chunk_file_name(&self.label, self.index))
    }
}

pub fn encoded_dir(work_dir: &Path, label: &str) -> PathBuf {
    work_dir.join(format!("encoded_{label}"))
}

pub fn encode_args(
    chunk: &Path,
    output: &Path,
    target: Option<&Resolution>,
    codec: &CodecConfig,
) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-i".to_string(), path_arg(chunk)];

    args.extend(["-c:v".to_string(), codec.video_codec.clone()]);
    args.extend(["-preset".to_string(), codec.video_preset.clone()]);
    args.extend(["-crf".to_string(), codec.crf.to_string()]);
    args.extend(["-pix_fmt".to_string(), codec.pixel_format.clone()]);

    if let Some(target) = target {
        args.extend([
            "-vf".to_string(),
            format!("scale={}:{}", target.width(), target.height()),
        ]);
    }

    args.push("-an".to_string());
    args.push(path_arg(output));
    args
}

pub async fn encode_chunk(
    tools: &Toolchain,
    request: &ChunkEncodeRequest,
    reporter: &ProgressReporter,
) -> Result<EncodedChunk> {
    let output = request.output_path();
    tokio::fs::create_dir_all(request.output_dir()).await?;

    let args = encode_args(
        &request.chunk,
        &output,
        request.target.as_ref(),
        &request.codec,
    );
    let callback = reporter.callback(
        StageProgress::new(StageKind::ChunkEncode)
            .with_label(request.label.clone())
            .with_chunk(request.index),
    );
    tools
        .ffmpeg
        .execute(&args, Some(&request.chunk), Some(callback))
        .await?;
    ensure_output(&output).await?;

    debug!(
        label = %request.label,
        chunk = request.index,
        "Encoded {}",
        output.display()
    );

    Ok(EncodedChunk::new(request.label.clone(), request.index, output))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(target: Option<Resolution>) -> ChunkEncodeRequest {
        ChunkEncodeRequest {
            chunk: PathBuf::from("/w/chunks/chunk_0003.mkv"),
            index: 3,
            label: "720p".to_string(),
            target,
            codec: CodecConfig::default(),
            work_dir: PathBuf::from("/w"),
        }
    }

    #[test]
    fn test_output_path_is_padded() {
        assert_eq!(
            request(None).output_path(),
            PathBuf::from("/w/encoded_720p/encoded_720p_0003.mkv")
        );
    }

    #[test]
    fn test_build_args_at_source_resolution() {
        let req = request(None);
        let args = encode_args(&req.chunk, &req.output_path(), None, &req.codec);
        assert!(!args.contains(&"-vf".to_string()));
        assert!(args.contains(&"libx264".to_string()));
        assert!(args.contains(&"-crf".to_string()));
        assert!(args.contains(&"23".to_string()));
        assert!(args.contains(&"yuv420p".to_string()));
        assert!(args.contains(&"-an".to_string()));
    }

    #[test]
    fn test_build_args_with_scaling() {
        let target = Resolution::new(1280, 720, "720p").unwrap();
        let req = request(Some(target.clone()));
        let args = encode_args(&req.chunk, &req.output_path(), Some(&target), &req.codec);
        let vf = args.iter().position(|a| a == "-vf").unwrap();
        assert_eq!(args[vf + 1], "scale=1280:720");
    }
}
