//! Perceptual quality scoring with libvmaf.

use std::path::Path;
use tracing::{debug, info};

use super::{Toolchain, path_arg};
use crate::domain::QualityResult;
use crate::pipeline::progress::{ProgressReporter, StageProgress};
use crate::pipeline::stage::StageKind;
use crate::{Error, Result};

const VMAF_THREADS: u32 = 4;

/// Frame size of one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Filter graph comparing input 0 (distorted) against input 1 (reference).
///
/// Both inputs are rebased to a zero start timestamp so frames pair up even
/// when the source starts at a nonzero PTS.
pub fn vmaf_filter_graph(log_path: &Path) -> String {
    format!(
        "[0:v]setpts=PTS-STARTPTS[distorted];\
         [1:v]setpts=PTS-STARTPTS[reference];\
         [distorted][reference]libvmaf=log_path={}:log_fmt=json:n_threads={}",
        path_arg(log_path),
        VMAF_THREADS
    )
}

/// The distorted input comes first, the reference second. The graph is read
/// from `graph_script`, since its `;` separators never pass argument
/// validation.
pub fn vmaf_args(distorted: &Path, reference: &Path, graph_script: &Path) -> Vec<String> {
    let mut args = Vec::new();
    args.extend(["-i".to_string(), path_arg(distorted)]);
    args.extend(["-i".to_string(), path_arg(reference)]);
    args.extend(["-filter_complex_script".to_string(), path_arg(graph_script)]);
    args.extend(["-f".to_string(), "null".to_string(), "-".to_string()]);
    args
}

/// Lossless rescale of the distorted input to the reference frame size.
pub fn upscale_args(distorted: &Path, size: FrameSize, output: &Path) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-i".to_string(), path_arg(distorted)];
    args.extend([
        "-vf".to_string(),
        format!("scale={}:{}:flags=bicubic", size.width, size.height),
    ]);
    args.extend(["-c:v".to_string(), "ffv1".to_string()]);
    args.push("-an".to_string());
    args.push(path_arg(output));
    args
}

/// Score `distorted` against `reference`.
///
/// Inputs of different frame sizes are compared after upscaling the
/// distorted one. Temporary files are removed on every path.
pub async fn score(
    tools: &Toolchain,
    reference: &Path,
    reference_size: FrameSize,
    distorted: &Path,
    distorted_size: FrameSize,
    reporter: &ProgressReporter,
) -> Result<QualityResult> {
    for path in [reference, distorted] {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(Error::not_found(format!(
                "quality input {} does not exist",
                path.display()
            )));
        }
    }

    let upscaled = if reference_size != distorted_size {
        let file = tools.temp_file("tidal_upscaled_", ".mkv")?;
        debug!(
            "Upscaling {}x{} output to {}x{} for scoring",
            distorted_size.width, distorted_size.height, reference_size.width, reference_size.height
        );
        let args = upscale_args(distorted, reference_size, file.path());
        tools.ffmpeg.execute(&args, None, None).await?;
        Some(file)
    } else {
        None
    };
    let distorted = upscaled.as_ref().map_or(distorted, |f| f.path());

    let log_file = tools.temp_file("tidal_vmaf_", ".json")?;
    let graph_file = tools.temp_file("tidal_vmaf_graph_", ".txt")?;
    tokio::fs::write(graph_file.path(), vmaf_filter_graph(log_file.path())).await?;
    let args = vmaf_args(distorted, reference, graph_file.path());
    let callback = reporter.callback(StageProgress::new(StageKind::QualityScore));
    tools
        .ffmpeg
        .execute(&args, Some(reference), Some(callback))
        .await?;

    let report = tokio::fs::read_to_string(log_file.path()).await?;
    if report.trim().is_empty() {
        return Err(Error::not_found("quality report is empty"));
    }
    let result = QualityResult::from_vmaf_json(&report)?;

    info!(
        "Quality score: mean {:.2}, min {:.2}, max {:.2} ({})",
        result.mean,
        result.min,
        result.max,
        result.rating()
    );
    Ok(result)
}
