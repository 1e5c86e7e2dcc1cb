use serde::Deserialize;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("ffprobe not found on PATH; please install FFmpeg (ffprobe)")]
    FfprobeMissing,
    #[error("parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Image,
    Audio,
}

#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub kind: MediaKind,
    pub duration_seconds: Option<f64>,
}

impl MediaInfo {
    /// Absolute time for a relative position, when the duration is known.
    pub fn time_at(&self, position: f32) -> Option<f64> {
        self.duration_seconds
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(|d| d * position.clamp(0.0, 1.0) as f64)
    }

    /// Where to seek for `position`. A still image only has its first frame.
    pub fn seek_time(&self, position: f32) -> Option<f64> {
        match self.kind {
            MediaKind::Image => Some(0.0),
            MediaKind::Video | MediaKind::Audio => self.time_at(position),
        }
    }
}

/// `ffprobe` invocation printing format and streams of `media` as JSON.
pub(crate) fn ffprobe_command(ffprobe: &Path, media: &Path) -> Command {
    let mut cmd = Command::new(ffprobe);
    cmd.args(["-v", "error", "-show_format", "-show_streams", "-print_format", "json"])
        .arg(media);
    cmd
}

pub(crate) fn parse_probe_output(json: &[u8]) -> Result<MediaInfo, ProbeError> {
    let parsed: ProbeOutput =
        serde_json::from_slice(json).map_err(|e| ProbeError::Parse(e.to_string()))?;

    let video = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let has_audio = parsed
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    let format_duration = parsed
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok());
    let stream_duration = video
        .and_then(|s| s.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok());
    let duration_seconds = format_duration.or(stream_duration);

    // Still images come out of ffprobe as a single-frame video stream.
    let kind = match (video, has_audio) {
        (Some(_), _) if duration_seconds.map_or(true, |d| d <= 0.05) => MediaKind::Image,
        (Some(_), _) => MediaKind::Video,
        (None, true) => MediaKind::Audio,
        (None, false) => return Err(ProbeError::Parse("no audio or video stream".into())),
    };

    Ok(MediaInfo {
        kind,
        duration_seconds,
    })
}
