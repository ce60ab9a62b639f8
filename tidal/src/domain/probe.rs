//! Source metadata extracted from ffprobe JSON.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Fallback frame rate when the stream reports a zero denominator.
const DEFAULT_FRAME_RATE: f64 = 30.0;

/// Source metadata produced once per job by the prober.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Duration in seconds.
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub video_codec: String,
    /// Present exactly when the source has an audio stream.
    pub audio_codec: Option<String>,
    pub frame_rate: f64,
    /// Bits per second.
    pub bitrate: Option<u64>,
}

impl ProbeResult {
    pub fn has_audio(&self) -> bool {
        self.audio_codec.is_some()
    }

    /// Label derived from the source height, e.g. `1080p`.
    pub fn resolution_label(&self) -> String {
        format!("{}p", self.height)
    }

    /// Parse the output of `ffprobe -print_format json -show_format -show_streams`.
    pub fn from_ffprobe_json(json: &str) -> Result<Self> {
        let output: FfprobeOutput = serde_json::from_str(json)?;

        let video = output
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .ok_or_else(|| Error::domain("no video stream found in source"))?;
        let audio = output
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("audio"));

        let width = video
            .width
            .ok_or_else(|| Error::domain("video stream has no width"))?;
        let height = video
            .height
            .ok_or_else(|| Error::domain("video stream has no height"))?;
        let video_codec = video
            .codec_name
            .clone()
            .ok_or_else(|| Error::domain("video stream has no codec name"))?;

        let frame_rate = video
            .r_frame_rate
            .as_deref()
            .map(parse_frame_rate)
            .transpose()?
            .unwrap_or(DEFAULT_FRAME_RATE);

        let format = output.format.unwrap_or_default();
        let bitrate = format
            .bit_rate
            .as_deref()
            .or(video.bit_rate.as_deref())
            .and_then(|b| b.parse::<u64>().ok());
        let duration = format
            .duration
            .as_deref()
            .or(video.duration.as_deref())
            .and_then(|d| d.parse::<f64>().ok())
            .unwrap_or(0.0);

        Ok(Self {
            duration,
            width,
            height,
            video_codec,
            audio_codec: audio.map(|a| a.codec_name.clone().unwrap_or_else(|| "unknown".into())),
            frame_rate: (frame_rate * 1000.0).round() / 1000.0,
            bitrate,
        })
    }
}

/// Parse `30/1`, `30000/1001` or `29.97`.
fn parse_frame_rate(raw: &str) -> Result<f64> {
    let invalid = || Error::domain(format!("invalid frame rate '{raw}'"));
    match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().map_err(|_| invalid())?;
            let den: f64 = den.trim().parse().map_err(|_| invalid())?;
            if den == 0.0 {
                Ok(DEFAULT_FRAME_RATE)
            } else {
                Ok(num / den)
            }
        }
        None => raw.trim().parse().map_err(|_| invalid()),
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    bit_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}
