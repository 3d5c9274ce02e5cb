//! Configuration: TOML file with CLI overrides on top.
//!
//! Default location: `<config dir>/camdeck/config.toml`, e.g.
//! ```toml
//! [camera]
//! source = "v4l2src"
//! device = "/dev/video0"
//! width = 1280
//! height = 720
//! frame_rate = 30
//!
//! [preview]
//! tick_ms = 33
//! photo_warmup_ms = 3000
//!
//! [output]
//! directory = "/home/me/Pictures/Camera"
//! photo_format = "jpeg"
//!
//! [output.video]
//! encoder = "h264"
//! container = "mp4"
//! bitrate_kbps = 2000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::output::default_output_dir;
use crate::session::SessionSettings;
use crate::video::frame::Resolution;
use crate::video::photo::PhotoFormat;
use crate::video::record::VideoPreset;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct Config {
    pub camera: CameraConfig,
    pub preview: PreviewConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct CameraConfig {
    /// GStreamer source element.
    pub source: String,
    /// Device path handed to the source's `device` property, when it has one.
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: "v4l2src".to_string(),
            device: None,
            width: Resolution::HD.width,
            height: Resolution::HD.height,
            frame_rate: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct PreviewConfig {
    /// Preview tick period.
    pub tick_ms: u64,
    /// How long a single camera read may wait for a frame.
    pub read_timeout_ms: u64,
    /// Start the preview as soon as the window opens.
    pub autostart: bool,
    /// Time a camera opened only for a photo gets to deliver its first frame.
    pub photo_warmup_ms: u64,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            tick_ms: 33,
            read_timeout_ms: 20,
            autostart: true,
            photo_warmup_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct OutputConfig {
    /// Defaults to `<pictures>/Camera`.
    pub directory: Option<PathBuf>,
    pub photo_format: PhotoFormat,
    pub video: VideoPreset,
    /// Frames the recorder may queue before dropping.
    pub recording_backlog: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: None,
            photo_format: PhotoFormat::default(),
            video: VideoPreset::default(),
            recording_backlog: 30,
        }
    }
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "camdeck")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Loads `path` if given, else the default location if it exists, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match Self::default_path() {
            Some(default) if default.exists() => Self::from_file(&default),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let cam = &self.camera;
        if cam.width == 0 || cam.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "resolution must be non-zero, got {}x{}",
                cam.width, cam.height
            )));
        }
        if cam.frame_rate == 0 || cam.frame_rate > 240 {
            return Err(ConfigError::Invalid(format!(
                "frame rate must be 1..=240, got {}",
                cam.frame_rate
            )));
        }
        if !(10..=1000).contains(&self.preview.tick_ms) {
            return Err(ConfigError::Invalid(format!(
                "preview tick must be 10..=1000 ms, got {}",
                self.preview.tick_ms
            )));
        }
        if cam.source.trim().is_empty() {
            return Err(ConfigError::Invalid("camera source element is empty".into()));
        }
        if self.output.recording_backlog == 0 {
            return Err(ConfigError::Invalid("recording backlog must be at least 1".into()));
        }
        Ok(())
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.camera.width,
            height: self.camera.height,
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.preview.tick_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.preview.read_timeout_ms)
    }

    pub fn photo_warmup(&self) -> Duration {
        Duration::from_millis(self.preview.photo_warmup_ms)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output.directory.clone().unwrap_or_else(default_output_dir)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            resolution: self.resolution(),
            frame_rate: self.camera.frame_rate,
            output_dir: self.output_dir(),
            video: self.output.video,
            photo_format: self.output.photo_format,
            photo_warmup: self.photo_warmup(),
        }
    }
}
