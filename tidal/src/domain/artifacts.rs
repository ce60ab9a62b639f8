//! Intermediate artifacts produced inside a job's working directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Zero-padding width of chunk indices in generated file names.
pub const CHUNK_INDEX_WIDTH: usize = 4;

/// File name of the `index`-th encoded chunk for `label`.
pub fn encoded_chunk_file_name(label: &str, index: usize) -> String {
    format!("encoded_{label}_{index:0width$}.mkv", width = CHUNK_INDEX_WIDTH)
}

/// Output of segmentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentResult {
    /// Video-only chunks in temporal order.
    chunk_paths: Vec<PathBuf>,
    /// Extracted audio side-stream, absent when the source has no audio.
    pub audio_path: Option<PathBuf>,
    pub work_dir: PathBuf,
}

impl SegmentResult {
    /// Build from an unordered listing; chunks are sorted by file name, which
    /// matches temporal order because indices are zero-padded.
    pub fn new(mut chunk_paths: Vec<PathBuf>, audio_path: Option<PathBuf>, work_dir: PathBuf) -> Self {
        chunk_paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Self {
            chunk_paths,
            audio_path,
            work_dir,
        }
    }

    pub fn chunk_paths(&self) -> &[PathBuf] {
        &self.chunk_paths
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_paths.len()
    }
}

/// One chunk encoded at one target resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedChunk {
    pub label: String,
    pub index: usize,
    pub path: PathBuf,
}

impl EncodedChunk {
    pub fn new(label: impl Into<String>, index: usize, path: impl AsRef<Path>) -> Self {
        Self {
            label: label.into(),
            index,
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_result_sorts_chunks() {
        let result = SegmentResult::new(
            vec![
                PathBuf::from("/w/chunks/chunk_0010.mkv"),
                PathBuf::from("/w/chunks/chunk_0002.mkv"),
                PathBuf::from("/w/chunks/chunk_0001.mkv"),
            ],
            None,
            PathBuf::from("/w"),
        );
        assert_eq!(result.chunk_count(), 3);
        assert_eq!(
            result.chunk_paths()[0],
            PathBuf::from("/w/chunks/chunk_0001.mkv")
        );
        assert_eq!(
            result.chunk_paths()[2],
            PathBuf::from("/w/chunks/chunk_0010.mkv")
        );
        assert!(result.audio_path.is_none());
    }

    #[test]
    fn test_encoded_chunk_file_name_is_padded() {
        assert_eq!(encoded_chunk_file_name("720p", 7), "encoded_720p_0007.mkv");
        assert!(encoded_chunk_file_name("720p", 9) < encoded_chunk_file_name("720p", 10));
    }
}
