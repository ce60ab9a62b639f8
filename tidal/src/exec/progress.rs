//! Decoding of the machine-readable `-progress` side-channel.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// A point-in-time progress sample of one running tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub frame: Option<u64>,
    pub fps: Option<f64>,
    /// Output time reached, in seconds.
    pub elapsed_secs: Option<f64>,
    /// Bits per second.
    pub bitrate: Option<u64>,
    /// Encode speed relative to realtime.
    pub speed: Option<f64>,
    /// Cumulative output size in bytes.
    pub total_size: Option<u64>,
    /// In `[0, 100]` when the input duration is known.
    pub percent: Option<f64>,
    pub status: String,
}

impl Default for ProgressEvent {
    fn default() -> Self {
        Self {
            frame: None,
            fps: None,
            elapsed_secs: None,
            bitrate: None,
            speed: None,
            total_size: None,
            percent: None,
            status: "processing".to_string(),
        }
    }
}

impl ProgressEvent {
    /// Whether the sample says how far the tool has got: a percent, a frame
    /// count, an fps reading or an output time. Status, speed, size and
    /// bitrate alone do not.
    pub fn has_position(&self) -> bool {
        self.percent.is_some()
            || self.frame.is_some()
            || self.fps.is_some()
            || self.elapsed_secs.is_some()
    }
}

/// Decode one side-channel line.
///
/// A line holds one or more `key=value` pairs. Returns `None` when no
/// recognised key carries a parsable value.
pub fn parse_progress_line(line: &str, total_duration: Option<f64>) -> Option<ProgressEvent> {
    let mut event = ProgressEvent::default();
    let mut recognised = false;

    for (key, value) in key_value_pairs(line) {
        let hit = match key {
            "frame" => value.parse().ok().map(|v| event.frame = Some(v)),
            "fps" => value.parse().ok().map(|v| event.fps = Some(v)),
            // ffmpeg reports microseconds under both names.
            "out_time_ms" | "out_time_us" => value
                .parse::<i64>()
                .ok()
                .map(|us| event.elapsed_secs = Some(us.max(0) as f64 / 1_000_000.0)),
            "bitrate" => value
                .strip_suffix("kbits/s")
                .and_then(|v| v.trim().parse::<f64>().ok())
                .map(|kbps| event.bitrate = Some((kbps * 1000.0) as u64)),
            "speed" => value
                .trim_end_matches('x')
                .trim()
                .parse()
                .ok()
                .map(|v| event.speed = Some(v)),
            "total_size" => value.parse().ok().map(|v| event.total_size = Some(v)),
            "progress" if !value.is_empty() => {
                event.status = value.to_string();
                Some(())
            }
            _ => None,
        };
        recognised |= hit.is_some();
    }

    if !recognised {
        return None;
    }

    if let (Some(total), Some(elapsed)) = (total_duration, event.elapsed_secs) {
        if total > 0.0 {
            event.percent = Some((elapsed / total * 100.0).min(100.0));
        }
    }

    Some(event)
}

/// Split a line into `key=value` pairs, tolerating a space after `=`
/// (`bitrate= 512.0kbits/s`).
fn key_value_pairs(line: &str) -> Vec<(&str, &str)> {
    let mut pairs = Vec::new();
    let mut tokens = line.split_whitespace().peekable();

    while let Some(token) = tokens.next() {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        if value.is_empty() {
            if let Some(next) = tokens.next_if(|t| !t.contains('=')) {
                pairs.push((key, next));
                continue;
            }
        }
        pairs.push((key, value));
    }

    pairs
}

/// Incremental reader over an append-only side-channel file.
///
/// Each call to [`ProgressReader::read_new_lines`] returns only complete
/// lines appended since the previous call.
#[derive(Debug)]
pub struct ProgressReader {
    path: PathBuf,
    offset: u64,
    pending: String,
}

impl ProgressReader {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            offset: 0,
            pending: String::new(),
        }
    }

    pub fn read_new_lines(&mut self) -> std::io::Result<Vec<String>> {
        let mut file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        if len <= self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        file.take(len - self.offset).read_to_end(&mut buf)?;
        self.offset += buf.len() as u64;
        self.pending.push_str(&String::from_utf8_lossy(&buf));

        let Some(last_newline) = self.pending.rfind('\n') else {
            return Ok(Vec::new());
        };
        let complete: String = self.pending.drain(..=last_newline).collect();
        Ok(complete
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}
