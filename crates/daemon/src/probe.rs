//! Media probing for library events
//!
//! Before a filesystem event becomes a media event, the path is probed to
//! decide whether it is usable media at all. The production probe shells out
//! to ffprobe; tests substitute their own `MediaProbe`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Error type for probe operations.
///
/// A probe failure is not fatal anywhere: callers treat it the same as
/// "not a media file" and drop the event.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute or exited non-zero.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Information about a video stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoStream {
    /// Codec name (e.g., "hevc", "h264", "av1").
    pub codec_name: String,
    /// Video width in pixels.
    pub width: u32,
    /// Video height in pixels.
    pub height: u32,
}

/// Information about an audio stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioStream {
    /// Codec name (e.g., "aac", "truehd", "dts").
    pub codec_name: String,
    /// Number of audio channels.
    pub channels: u32,
}

/// Probe result for a usable media file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo {
    /// Video streams found in the file.
    pub video_streams: Vec<VideoStream>,
    /// Audio streams found in the file.
    pub audio_streams: Vec<AudioStream>,
    /// Duration in seconds, when the container reports one.
    pub duration_secs: Option<f64>,
}

/// Collaborator that decides whether a path is usable media.
///
/// `Ok(None)` means the file exists but is not media (no video stream);
/// errors are treated identically by callers.
pub trait MediaProbe: Send + Sync {
    fn probe(&self, path: &Path) -> Result<Option<MediaInfo>, ProbeError>;
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub channels: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Production probe backed by the ffprobe executable.
#[derive(Debug, Default)]
pub struct FfprobeMediaProbe;

impl MediaProbe for FfprobeMediaProbe {
    /// Runs `ffprobe -v quiet -print_format json -show_streams -show_format`
    /// and parses the JSON output. A file without any video stream yields
    /// `Ok(None)`.
    fn probe(&self, path: &Path) -> Result<Option<MediaInfo>, ProbeError> {
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ])
            .arg(path)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ffprobe_output(&stdout)
    }
}

/// Parses ffprobe JSON output into a `MediaInfo`, or `None` for non-media.
pub fn parse_ffprobe_output(json_str: &str) -> Result<Option<MediaInfo>, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();

    let mut video_streams = Vec::new();
    let mut audio_streams = Vec::new();

    for stream in streams {
        let codec_type = stream.codec_type.as_deref().unwrap_or("");
        let codec_name = stream.codec_name.clone().unwrap_or_default();

        match codec_type {
            "video" => video_streams.push(VideoStream {
                codec_name,
                width: stream.width.unwrap_or(0),
                height: stream.height.unwrap_or(0),
            }),
            "audio" => audio_streams.push(AudioStream {
                codec_name,
                channels: stream.channels.unwrap_or(0),
            }),
            _ => {}
        }
    }

    if video_streams.is_empty() {
        return Ok(None);
    }

    let duration_secs = ffprobe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok());

    Ok(Some(MediaInfo {
        video_streams,
        audio_streams,
        duration_secs,
    }))
}
