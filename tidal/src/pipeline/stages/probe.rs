//! Source inspection.

use std::path::Path;
use tracing::info;

use super::{Toolchain, path_arg};
use crate::domain::ProbeResult;
use crate::{Error, Result};

pub fn probe_args(source: &Path) -> Vec<String> {
    let mut args = Vec::new();
    args.extend(["-v".to_string(), "error".to_string()]);
    args.extend(["-print_format".to_string(), "json".to_string()]);
    args.push("-show_format".to_string());
    args.push("-show_streams".to_string());
    args.push(path_arg(source));
    args
}

/// Read duration, dimensions, codecs, frame rate and bitrate of `source`.
pub async fn probe(tools: &Toolchain, source: &Path) -> Result<ProbeResult> {
    if !tokio::fs::try_exists(source).await.unwrap_or(false) {
        return Err(Error::not_found(format!(
            "source {} does not exist",
            source.display()
        )));
    }

    let output = tools.ffprobe.execute(&probe_args(source), None, None).await?;
    let result = ProbeResult::from_ffprobe_json(&output.stdout)?;

    info!(
        "Probed {}: {}x{} {} @ {} fps, {:.2}s, audio: {}",
        source.display(),
        result.width,
        result.height,
        result.video_codec,
        result.frame_rate,
        result.duration,
        result.audio_codec.as_deref().unwrap_or("none")
    );

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_args() {
        let args = probe_args(Path::new("/media/in.mp4"));
        assert_eq!(
            args,
            vec![
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
                "/media/in.mp4"
            ]
        );
    }
}
