//! Encoding targets and codec parameters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// A target output resolution.
///
/// Width and height are always positive and even; construct through
/// [`Resolution::new`] or [`Resolution::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawResolution")]
pub struct Resolution {
    width: u32,
    height: u32,
    label: String,
}

#[derive(Deserialize)]
struct RawResolution {
    width: i64,
    height: i64,
    label: Option<String>,
}

impl TryFrom<RawResolution> for Resolution {
    type Error = Error;

    fn try_from(raw: RawResolution) -> Result<Self> {
        let width = checked_dimension("width", raw.width)?;
        let height = checked_dimension("height", raw.height)?;
        let label = raw.label.unwrap_or_else(|| format!("{height}p"));
        Self::new(width as i64, height as i64, label)
    }
}

fn checked_dimension(name: &str, value: i64) -> Result<u32> {
    if value <= 0 {
        return Err(Error::validation(format!(
            "resolution {name} must be positive, got {value}"
        )));
    }
    if value % 2 != 0 {
        return Err(Error::validation(format!(
            "resolution {name} must be even, got {value}"
        )));
    }
    u32::try_from(value)
        .map_err(|_| Error::validation(format!("resolution {name} is too large: {value}")))
}

impl Resolution {
    pub fn new(width: i64, height: i64, label: impl Into<String>) -> Result<Self> {
        let width = checked_dimension("width", width)?;
        let height = checked_dimension("height", height)?;
        let label = label.into();
        if label.trim().is_empty() {
            return Err(Error::validation("resolution label must not be empty"));
        }
        Ok(Self {
            width,
            height,
            label,
        })
    }

    /// Resolution labelled by its height, e.g. `1080p`.
    pub fn with_default_label(width: i64, height: i64) -> Result<Self> {
        Self::new(width, height, format!("{height}p"))
    }

    /// Parse `WIDTHxHEIGHT` or `WIDTHxHEIGHT:label`.
    pub fn parse(s: &str) -> Result<Self> {
        let (dims, label) = match s.split_once(':') {
            Some((dims, label)) => (dims, Some(label)),
            None => (s, None),
        };
        let (w, h) = dims
            .split_once(['x', 'X'])
            .ok_or_else(|| Error::validation(format!("invalid resolution '{s}', expected WxH")))?;
        let width: i64 = w
            .trim()
            .parse()
            .map_err(|_| Error::validation(format!("invalid resolution width '{w}'")))?;
        let height: i64 = h
            .trim()
            .parse()
            .map_err(|_| Error::validation(format!("invalid resolution height '{h}'")))?;

        match label {
            Some(label) => Self::new(width, height, label.trim()),
            None => Self::with_default_label(width, height),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn same_dimensions(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} ({})", self.width, self.height, self.label)
    }
}

/// Encoding parameters shared read-only by every stage of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub video_codec: String,
    pub video_preset: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    /// Constant Rate Factor (0-51, lower is better).
    pub crf: i32,
    pub pixel_format: String,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            video_preset: "medium".to_string(),
            audio_codec: "aac".to_string(),
            audio_bitrate: "192k".to_string(),
            crf: 23,
            pixel_format: "yuv420p".to_string(),
        }
    }
}

impl CodecConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0..=51).contains(&self.crf) {
            return Err(Error::validation(format!(
                "CRF must be between 0 and 51, got {}",
                self.crf
            )));
        }
        for (name, value) in [
            ("video codec", &self.video_codec),
            ("video preset", &self.video_preset),
            ("audio codec", &self.audio_codec),
            ("audio bitrate", &self.audio_bitrate),
            ("pixel format", &self.pixel_format),
        ] {
            if value.trim().is_empty() {
                return Err(Error::validation(format!("{name} must not be empty")));
            }
        }
        Ok(())
    }

    /// Validated builder-style CRF override.
    pub fn with_crf(mut self, crf: i32) -> Result<Self> {
        self.crf = crf;
        self.validate()?;
        Ok(self)
    }
}

/// Output container format.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Container {
    #[default]
    Mp4,
    Mkv,
    Webm,
    Mov,
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mkv => "mkv",
            Self::Webm => "webm",
            Self::Mov => "mov",
        }
    }

    /// MP4-family containers benefit from moving the index to the front.
    pub fn supports_faststart(&self) -> bool {
        matches!(self, Self::Mp4 | Self::Mov)
    }
}

impl FromStr for Container {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mp4" => Ok(Self::Mp4),
            "mkv" => Ok(Self::Mkv),
            "webm" => Ok(Self::Webm),
            "mov" => Ok(Self::Mov),
            other => Err(Error::validation(format!(
                "container '{other}' not supported, use one of: mp4, mkv, webm, mov"
            ))),
        }
    }
}

/// File extension for an audio stream encoded with `codec`.
pub fn audio_extension(codec: &str) -> &'static str {
    match codec {
        "aac" => "m4a",
        "libopus" | "opus" => "opus",
        "libvorbis" => "ogg",
        "flac" => "flac",
        "libmp3lame" | "mp3" => "mp3",
        "pcm_s16le" => "wav",
        _ => "mka",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_valid_resolution() {
        let res = Resolution::new(1920, 1080, "1080p").unwrap();
        assert_eq!(res.width(), 1920);
        assert_eq!(res.height(), 1080);
        assert_eq!(res.label(), "1080p");
    }

    #[rstest]
    #[case(-1920, 1080)]
    #[case(1920, 0)]
    #[case(1921, 1080)]
    #[case(1920, 1081)]
    fn test_invalid_resolution_rejected(#[case] width: i64, #[case] height: i64) {
        let err = Resolution::new(width, height, "bad").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_parse_resolution() {
        let res = Resolution::parse("1280x720").unwrap();
        assert_eq!(res.label(), "720p");

        let res = Resolution::parse("640x360:small").unwrap();
        assert_eq!((res.width(), res.height(), res.label()), (640, 360, "small"));

        assert!(Resolution::parse("1280").is_err());
        assert!(Resolution::parse("1281x720").is_err());
    }

    #[test]
    fn test_resolution_deserialize_validates() {
        let res: Resolution =
            serde_json::from_str(r#"{"width": 1280, "height": 720, "label": "720p"}"#).unwrap();
        assert_eq!(res.label(), "720p");

        let res: Resolution = serde_json::from_str(r#"{"width": 640, "height": 480}"#).unwrap();
        assert_eq!(res.label(), "480p");

        assert!(serde_json::from_str::<Resolution>(r#"{"width": 641, "height": 480}"#).is_err());
    }

    #[test]
    fn test_codec_defaults() {
        let codec = CodecConfig::default();
        assert_eq!(codec.video_codec, "libx264");
        assert_eq!(codec.video_preset, "medium");
        assert_eq!(codec.audio_codec, "aac");
        assert_eq!(codec.audio_bitrate, "192k");
        assert_eq!(codec.crf, 23);
        assert_eq!(codec.pixel_format, "yuv420p");
        assert!(codec.validate().is_ok());
    }

    #[rstest]
    #[case(0, true)]
    #[case(51, true)]
    #[case(52, false)]
    #[case(-1, false)]
    fn test_crf_bounds(#[case] crf: i32, #[case] ok: bool) {
        assert_eq!(CodecConfig::default().with_crf(crf).is_ok(), ok);
    }

    #[test]
    fn test_container_parse() {
        for name in ["mp4", "mkv", "webm", "mov"] {
            let container: Container = name.parse().unwrap();
            assert_eq!(container.extension(), name);
            assert_eq!(container.to_string(), name);
        }
        assert!(matches!("avi".parse::<Container>(), Err(Error::Validation(_))));
    }

    #[rstest]
    #[case("aac", "m4a")]
    #[case("libopus", "opus")]
    #[case("libmp3lame", "mp3")]
    #[case("flac", "flac")]
    #[case("libvorbis", "ogg")]
    #[case("pcm_s16le", "wav")]
    #[case("some_unknown_codec", "mka")]
    fn test_audio_extension(#[case] codec: &str, #[case] ext: &str) {
        assert_eq!(audio_extension(codec), ext);
    }
}
