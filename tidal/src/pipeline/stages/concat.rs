//! Stream-copy join of encoded chunks through a concat list file.

use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use super::{Toolchain, ensure_output, make_absolute, path_arg};
use crate::domain::{Container, EncodedChunk};
use crate::pipeline::progress::{ProgressReporter, StageProgress};
use crate::pipeline::stage::StageKind;
use crate::{Error, Result};

pub fn concatenated_path(work_dir: &Path, label: &str, container: Container) -> PathBuf {
    work_dir.join(format!("video_{label}.{}", container.extension()))
}

/// Concat demuxer manifest listing `chunks` in ascending index order.
pub fn concat_list(chunks: &[EncodedChunk]) -> String {
    let mut ordered: Vec<&EncodedChunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.index);

    ordered
        .iter()
        .map(|chunk| {
            let path = path_arg(&make_absolute(&chunk.path));
            format!("file '{}'\n", path.replace('\'', r"'\''"))
        })
        .collect()
}

pub fn concat_args(list_file: &Path, output: &Path) -> Vec<String> {
    let mut args = vec!["-y".to_string()];
    args.extend(["-f".to_string(), "concat".to_string()]);
    args.extend(["-safe".to_string(), "0".to_string()]);
    args.extend(["-i".to_string(), path_arg(list_file)]);
    args.extend(["-c".to_string(), "copy".to_string()]);
    args.push(path_arg(output));
    args
}

/// Join `chunks` into `video_<label>.<ext>` in `work_dir`.
///
/// Order follows chunk index, never the order of `chunks`.
pub async fn concatenate(
    tools: &Toolchain,
    chunks: &[EncodedChunk],
    label: &str,
    container: Container,
    work_dir: &Path,
    reporter: &ProgressReporter,
) -> Result<PathBuf> {
    if chunks.is_empty() {
        return Err(Error::domain("no chunks to concatenate"));
    }

    let output = concatenated_path(work_dir, label, container);

    // Removed on drop, whichever way this function returns.
    let mut list_file = tempfile::Builder::new()
        .prefix(&format!("concat_{label}_{}", Uuid::new_v4().simple()))
        .suffix(".txt")
        .rand_bytes(0)
        .tempfile_in(work_dir)?;
    list_file.write_all(concat_list(chunks).as_bytes())?;
    list_file.flush()?;
    debug!(label, "Concat list at {}", list_file.path().display());

    let args = concat_args(list_file.path(), &output);
    let callback = reporter.callback(StageProgress::new(StageKind::Concatenate).with_label(label));
    tools.ffmpeg.execute(&args, None, Some(callback)).await?;
    ensure_output(&output).await?;

    info!(label, "Concatenated {} chunks into {}", chunks.len(), output.display());
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(order: &[usize]) -> Vec<EncodedChunk> {
        order
            .iter()
            .map(|&i| EncodedChunk::new("720p", i, format!("/w/encoded_720p/encoded_720p_{i:04}.mkv")))
            .collect()
    }

    #[test]
    fn test_list_order_follows_index_not_input_order() {
        let forward = concat_list(&chunks(&[0, 1, 2]));
        let reverse = concat_list(&chunks(&[2, 1, 0]));
        assert_eq!(forward, reverse);
        assert_eq!(
            forward,
            "file '/w/encoded_720p/encoded_720p_0000.mkv'\n\
             file '/w/encoded_720p/encoded_720p_0001.mkv'\n\
             file '/w/encoded_720p/encoded_720p_0002.mkv'\n"
        );
    }

    #[test]
    fn test_list_escapes_single_quotes() {
        let list = concat_list(&[EncodedChunk::new("720p", 0, "/w/it's.mkv")]);
        assert_eq!(list, "file '/w/it'\\''s.mkv'\n");
    }

    #[test]
    fn test_build_args() {
        let args = concat_args(Path::new("/w/concat.txt"), Path::new("/w/video_720p.mp4"));
        assert_eq!(
            args,
            vec!["-y", "-f", "concat", "-safe", "0", "-i", "/w/concat.txt", "-c", "copy", "/w/video_720p.mp4"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_empty_chunk_list_is_domain_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let tools = crate::pipeline::stages::tests_support::fake_toolchain(&dir, "exit 0");
        let err = concatenate(
            &tools,
            &[],
            "720p",
            Container::Mp4,
            dir.path(),
            &ProgressReporter::noop("j"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Domain(_)));
        assert!(err.to_string().contains("no chunks"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_file_removed_after_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let tools = crate::pipeline::stages::tests_support::fake_toolchain(&dir, "exit 1");
        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();

        let err = concatenate(
            &tools,
            &chunks(&[0]),
            "720p",
            Container::Mp4,
            &work,
            &ProgressReporter::noop("j"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Process { .. }));

        let leftovers: Vec<_> = std::fs::read_dir(&work)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("concat_"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
