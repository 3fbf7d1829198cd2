use std::env;

use clap::Parser;
use serde::Serialize;

/// Coarse classification of the input source, used to decide pacing, looping,
/// transport, and format flags for the transcoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SourceKind {
    /// A local file: can loop, needs `-re` pacing.
    File,
    /// RTSP/HTTP/SRT/UDP/TCP/RTP/RTMP: already real-time, no pacing, no loop.
    LiveStream,
    /// A capture device (webcam, avfoundation, v4l2, dshow).
    Device,
    /// A file being written to concurrently (e.g. an active OBS recording).
    /// Paced like a file but never looped — looping would rewind past data
    /// that hasn't been written yet.
    GrowingFile,
}

impl SourceKind {
    /// Detect the source kind from a path or URL, honoring the `GROWING_FILE`
    /// environment hint when nothing else matches.
    pub fn detect(path: &str, growing_file_hint: bool) -> Self {
        let lower = path.to_ascii_lowercase();

        const LIVE_SCHEMES: &[&str] = &[
            "rtsp://", "rtmp://", "http://", "https://", "srt://", "udp://", "tcp://", "rtp://",
        ];
        if LIVE_SCHEMES.iter().any(|scheme| lower.starts_with(scheme)) {
            return SourceKind::LiveStream;
        }

        if lower.starts_with("avfoundation:") || lower.starts_with("dshow:") {
            return SourceKind::Device;
        }
        if path.starts_with("/dev/video") {
            return SourceKind::Device;
        }
        if lower.contains("video=") {
            return SourceKind::Device;
        }

        if growing_file_hint {
            return SourceKind::GrowingFile;
        }

        SourceKind::File
    }

    /// Source is already real-time; no pacing flag, no loop flag.
    pub fn is_live(self) -> bool {
        matches!(self, SourceKind::LiveStream | SourceKind::Device)
    }

    /// Source is eligible for the infinite-loop flag.
    pub fn can_loop(self) -> bool {
        matches!(self, SourceKind::File)
    }

    pub fn is_http(path: &str) -> bool {
        let lower = path.to_ascii_lowercase();
        lower.starts_with("http://") || lower.starts_with("https://")
    }

    pub fn is_rtsp(path: &str) -> bool {
        path.to_ascii_lowercase().starts_with("rtsp://")
    }
}

/// Explicit quality knobs, or a single scalar that maps monotonically to both.
#[derive(Debug, Clone, Copy)]
pub struct QualityKnobs {
    pub crf: u32,
    pub quality: Option<f64>,
}

impl QualityKnobs {
    /// Effective CRF: if `quality` is set it wins (maps 1.0 -> 18, 0.0 -> 40).
    pub fn effective_crf(&self) -> u32 {
        match self.quality {
            Some(q) => {
                let q = q.clamp(0.0, 1.0);
                (40.0 - q * 22.0).round() as u32
            }
            None => self.crf,
        }
    }

    /// Effective scale factor in (0, 1], or `None` if `quality` isn't set
    /// (use the explicit resolution instead).
    pub fn effective_scale(&self) -> Option<f64> {
        self.quality.map(|q| {
            let q = q.clamp(0.0, 1.0);
            0.25 + q * 0.75
        })
    }
}

#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub file_path: String,
    pub fps: u32,
    pub audio_bitrate: String,
    pub resolution: Option<String>,
    pub chunk_buffer_size: usize,
    pub quality_knobs: QualityKnobs,
    pub growing_file_hint: bool,
}

impl VideoConfig {
    pub fn source_kind(&self) -> SourceKind {
        SourceKind::detect(&self.file_path, self.growing_file_hint)
    }

    pub fn from_env() -> Self {
        let crf = env_parse("VIDEO_CRF", 23);
        let quality = env::var("VIDEO_QUALITY").ok().and_then(|v| match v.parse::<f64>() {
            Ok(q) => Some(q),
            Err(_) => {
                tracing::warn!("invalid VIDEO_QUALITY '{}', ignoring", v);
                None
            }
        });
        let resolution = env::var("VIDEO_RESOLUTION").ok();

        VideoConfig {
            file_path: env::var("VIDEO_FILE").unwrap_or_else(|_| "video.mp4".to_string()),
            fps: env_parse("VIDEO_FPS", 30),
            audio_bitrate: env::var("AUDIO_BITRATE").unwrap_or_else(|_| "128k".to_string()),
            resolution,
            chunk_buffer_size: 64,
            quality_knobs: QualityKnobs { crf, quality },
            growing_file_hint: env_bool("GROWING_FILE"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_clients: usize,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_parse("SERVER_PORT", 8000),
            max_clients: env_parse("MAX_CLIENTS", 100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub video: VideoConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        AppConfig {
            video: VideoConfig::from_env(),
            server: ServerConfig::from_env(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str) -> bool {
    matches!(
        env::var(key).map(|v| v.to_ascii_lowercase()).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

/// CLI overrides layered on top of the environment.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Transcoder binary to invoke (default: system `ffmpeg`).
    #[arg(long, default_value = "ffmpeg")]
    pub transcoder: String,

    /// Override the tracing log level (e.g. "debug", "warn").
    #[arg(long)]
    pub log_level: Option<String>,
}
