//! Tidal: chunked parallel video transcoding.
//!
//! A source video is split into chunks that are encoded in parallel at one
//! or more resolutions, joined back together, muxed with a separately
//! transcoded audio track and scored with a perceptual quality metric.
//! Every external tool call goes through the sandboxed [`exec`] engine.

pub mod config;
pub mod domain;
pub mod error;
pub mod exec;
pub mod logging;
pub mod pipeline;

pub use error::{Error, ErrorKind, JobFailure, Result};
