//! Error types shared by the capture, recording and photo paths.

use thiserror::Error;

/// Failures reported by a camera device or an open capture source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// No usable camera: missing element, device node absent, pipeline refused to start.
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),

    /// The device is already held by another capture source.
    #[error("camera busy: {0}")]
    DeviceBusy(String),

    /// A single read produced no frame. The next tick may succeed.
    #[error("frame read failed: {0}")]
    ReadFailed(String),
}

impl CaptureError {
    /// Transient errors are skipped by the preview loop and never surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(self, CaptureError::ReadFailed(_))
    }
}

#[derive(Error, Debug)]
pub enum RecordError {
    /// Codec unsupported, path unwritable, or the writer pipeline would not start.
    #[error("could not start recording: {0}")]
    WriterInitFailed(String),

    #[error("could not write frame: {0}")]
    Write(String),

    #[error("could not finalize recording: {0}")]
    Finalize(String),

    /// Stopped before any frame reached the writer; the file was removed.
    #[error("recording discarded: no frames were captured")]
    Empty,
}

#[derive(Error, Debug)]
pub enum PhotoError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("could not encode photo: {0}")]
    Encode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced by [`crate::session::SessionController`] operations.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Photo(#[from] PhotoError),

    #[error("{0}")]
    InvalidTransition(&'static str),
}

pub type SessionResult<T> = Result<T, SessionError>;
