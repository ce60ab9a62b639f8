//! Domain model shared by the execution engine and the pipeline.

mod artifacts;
mod job;
mod media;
mod probe;
mod quality;

pub use artifacts::{CHUNK_INDEX_WIDTH, EncodedChunk, SegmentResult, encoded_chunk_file_name};
pub use job::JobInput;
pub use media::{CodecConfig, Container, Resolution, audio_extension};
pub use probe::ProbeResult;
pub use quality::{QualityRating, QualityResult};
