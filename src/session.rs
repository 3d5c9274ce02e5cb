//! Session state machine: preview, recording and photo capture over one camera.
//!
//! The controller owns the capture source, the display sink and the recording
//! session. It is driven from a single timeline (see [`crate::video::run_session_loop`]):
//! commands mutate state, ticks move frames. State changes are published on a
//! `watch` channel and user-facing messages on a `broadcast` channel.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Local;
use tokio::sync::{broadcast, watch};

use crate::error::{CaptureError, PhotoError, RecordError, SessionError, SessionResult};
use crate::output::timestamped_path;
use crate::video::display::FrameSink;
use crate::video::frame::{Frame, Resolution};
use crate::video::photo::{PhotoFormat, save_photo};
use crate::video::record::{
    Finalizing, RecordSettings, RecordingSession, VideoPreset, WriterFactory,
};
use crate::video::source::{CaptureDevice, CaptureSource};

/// Reads tried for a still from the live camera before giving up.
const PHOTO_READ_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Idle,
    PreviewOnly,
    Recording,
}

/// What the shutter button does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum CaptureMode {
    #[default]
    Photo,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionCommand {
    StartPreview,
    StopPreview,
    TogglePreview,
    StartRecording,
    StopRecording,
    ToggleRecording,
    CapturePhoto,
    SetMode(CaptureMode),
    /// Photo in photo mode, start/stop recording in video mode.
    Shutter,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionEvent {
    PreviewStarted,
    PreviewStopped,
    RecordingStarted(PathBuf),
    RecordingSaved { path: PathBuf, frames: u64 },
    PhotoSaved(PathBuf),
    ModeChanged(CaptureMode),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionSnapshot {
    pub state: SessionState,
    pub mode: CaptureMode,
    pub recording: Option<PathBuf>,
}

/// Capture and output parameters fixed for the life of the controller.
#[derive(Debug, Clone)]
pub(crate) struct SessionSettings {
    pub resolution: Resolution,
    pub frame_rate: u32,
    pub output_dir: PathBuf,
    pub video: VideoPreset,
    pub photo_format: PhotoFormat,
    /// How long a camera opened just for a photo may take to deliver its first frame.
    pub photo_warmup: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    /// Preview is off; nothing was read.
    Inactive,
    Delivered,
    /// Transient read failure, frame skipped.
    Skipped,
    /// The camera went away; preview and recording were torn down.
    Failed,
}

pub(crate) struct SessionController {
    device: Box<dyn CaptureDevice>,
    display: Box<dyn FrameSink>,
    recording: RecordingSession,
    settings: SessionSettings,
    source: Option<Box<dyn CaptureSource>>,
    mode: CaptureMode,
    preview_active: bool,
    finalizing: Vec<Finalizing>,
    events: broadcast::Sender<SessionEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl SessionController {
    pub fn new(
        device: Box<dyn CaptureDevice>,
        writers: Box<dyn WriterFactory>,
        display: Box<dyn FrameSink>,
        settings: SessionSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let (snapshot, _) = watch::channel(SessionSnapshot {
            state: SessionState::Idle,
            mode: CaptureMode::default(),
            recording: None,
        });
        Self {
            device,
            display,
            recording: RecordingSession::new(writers),
            settings,
            source: None,
            mode: CaptureMode::default(),
            preview_active: false,
            finalizing: Vec::new(),
            events,
            snapshot,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn state(&self) -> SessionState {
        if self.recording.is_active() {
            SessionState::Recording
        } else if self.preview_active {
            SessionState::PreviewOnly
        } else {
            SessionState::Idle
        }
    }

    pub fn preview_active(&self) -> bool {
        self.preview_active
    }

    #[cfg(test)]
    pub fn recording_active(&self) -> bool {
        self.recording.is_active()
    }

    #[cfg(test)]
    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    /// Applies a UI command. Errors are reported as [`SessionEvent::Error`]
    /// and never abort the loop.
    pub fn handle(&mut self, cmd: SessionCommand) {
        tracing::debug!(?cmd, state = ?self.state(), "session command");
        let result = match cmd {
            SessionCommand::StartPreview => self.start_preview(),
            SessionCommand::StopPreview => {
                self.stop_preview();
                Ok(())
            }
            SessionCommand::TogglePreview if self.preview_active => {
                self.stop_preview();
                Ok(())
            }
            SessionCommand::TogglePreview => self.start_preview(),
            SessionCommand::StartRecording => self.start_recording(),
            SessionCommand::StopRecording => {
                self.stop_recording();
                Ok(())
            }
            SessionCommand::ToggleRecording => self.toggle_recording(),
            SessionCommand::CapturePhoto => self.capture_photo().map(|_| ()),
            SessionCommand::SetMode(mode) => self.set_mode(mode),
            SessionCommand::Shutter => match self.mode {
                CaptureMode::Photo => self.capture_photo().map(|_| ()),
                CaptureMode::Video => self.toggle_recording(),
            },
            SessionCommand::Shutdown => {
                self.shutdown();
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::warn!(?cmd, "{e}");
            self.emit(SessionEvent::Error(e.to_string()));
        }
        self.reap_finalizers();
    }

    fn toggle_recording(&mut self) -> SessionResult<()> {
        if self.recording.is_active() {
            self.stop_recording();
            Ok(())
        } else {
            self.start_recording()
        }
    }

    /// `Idle → PreviewOnly`. Opens the camera if needed; no-op when already previewing.
    pub fn start_preview(&mut self) -> SessionResult<()> {
        if self.preview_active {
            return Ok(());
        }
        if self.source.as_ref().is_none_or(|s| !s.is_open()) {
            let source = self
                .device
                .open(self.settings.resolution, self.settings.frame_rate)?;
            self.source = Some(source);
        }

        self.preview_active = true;
        tracing::info!(device = self.device.id(), "preview started");
        self.emit(SessionEvent::PreviewStarted);
        self.publish();
        Ok(())
    }

    /// `PreviewOnly → Idle`, releasing the camera. A running recording is
    /// stopped first.
    pub fn stop_preview(&mut self) {
        self.stop_recording();
        if let Some(mut source) = self.source.take() {
            source.close();
        }
        if !self.preview_active {
            return;
        }

        self.preview_active = false;
        tracing::info!("preview stopped");
        self.emit(SessionEvent::PreviewStopped);
        self.publish();
    }

    /// `PreviewOnly → Recording`, starting preview first when idle. If the
    /// writer cannot start the controller stays in `PreviewOnly`.
    pub fn start_recording(&mut self) -> SessionResult<()> {
        if self.recording.is_active() {
            return Ok(());
        }
        self.start_preview()?;

        let (res, frame_rate) = match self.source.as_ref() {
            Some(source) => (source.resolution(), source.frame_rate()),
            None => (self.settings.resolution, self.settings.frame_rate),
        };
        std::fs::create_dir_all(&self.settings.output_dir)
            .map_err(|e| RecordError::WriterInitFailed(e.to_string()))?;
        let filepath = timestamped_path(
            &self.settings.output_dir,
            "video",
            self.settings.video.container.extension(),
            Local::now(),
        );

        self.recording.start(RecordSettings {
            res,
            frame_rate,
            preset: self.settings.video,
            filepath: filepath.clone(),
        })?;

        self.emit(SessionEvent::RecordingStarted(filepath));
        self.publish();
        Ok(())
    }

    /// `Recording → PreviewOnly`. Always succeeds; the file is flushed in the
    /// background. No-op without an active recording.
    pub fn stop_recording(&mut self) {
        if let Some(handle) = self.recording.stop() {
            self.finalizing.push(handle);
            self.publish();
        }
    }

    /// Writes one frame to `photo_<timestamp>.<ext>`. Uses the live camera when
    /// previewing, otherwise opens it just for this shot.
    pub fn capture_photo(&mut self) -> SessionResult<PathBuf> {
        std::fs::create_dir_all(&self.settings.output_dir).map_err(PhotoError::Io)?;

        let frame = match self.source.as_mut() {
            Some(source) if source.is_open() => read_still(source.as_mut(), Duration::ZERO)?,
            _ => {
                let mut source = self
                    .device
                    .open(self.settings.resolution, self.settings.frame_rate)
                    .map_err(PhotoError::Capture)?;
                let frame = read_still(source.as_mut(), self.settings.photo_warmup);
                source.close();
                frame?
            }
        };

        let format = self.settings.photo_format;
        let path = timestamped_path(
            &self.settings.output_dir,
            "photo",
            format.extension(),
            Local::now(),
        );
        save_photo(&frame, &path, format)?;

        tracing::info!(path = %path.display(), "photo saved");
        self.emit(SessionEvent::PhotoSaved(path.clone()));
        Ok(path)
    }

    pub fn set_mode(&mut self, mode: CaptureMode) -> SessionResult<()> {
        if mode == self.mode {
            return Ok(());
        }
        if self.recording.is_active() {
            return Err(SessionError::InvalidTransition(
                "cannot switch mode while recording",
            ));
        }
        self.mode = mode;
        self.emit(SessionEvent::ModeChanged(mode));
        self.publish();
        Ok(())
    }

    /// One preview iteration: read a frame and fan it out to the display and,
    /// when recording, to the writer.
    pub fn tick(&mut self) -> TickOutcome {
        self.reap_finalizers();
        if !self.preview_active {
            return TickOutcome::Inactive;
        }
        let Some(source) = self.source.as_mut() else {
            return TickOutcome::Inactive;
        };

        match source.read_frame() {
            Ok(frame) => {
                self.deliver(&frame);
                TickOutcome::Delivered
            }
            Err(e) if e.is_transient() => {
                tracing::debug!("tick skipped: {e}");
                TickOutcome::Skipped
            }
            Err(e) => {
                tracing::error!("camera lost: {e}");
                self.stop_preview();
                self.emit(SessionEvent::Error(e.to_string()));
                TickOutcome::Failed
            }
        }
    }

    fn deliver(&mut self, frame: &Frame) {
        tracing::trace!(ts = ?frame.timestamp, "frame");
        self.display.consume(frame);
        if self.recording.is_active() {
            self.recording.write(frame);
        }
    }

    /// Stops recording, closes the camera and waits for every pending
    /// recording to be flushed. Ends in `Idle`; safe to call repeatedly.
    pub fn shutdown(&mut self) {
        self.stop_preview();
        for handle in std::mem::take(&mut self.finalizing) {
            self.report_finalized(handle);
        }
        self.publish();
    }

    /// Number of recordings still being flushed.
    pub fn pending_finalizers(&self) -> usize {
        self.finalizing.len()
    }

    fn reap_finalizers(&mut self) {
        if self.finalizing.iter().all(|h| !h.is_finished()) {
            return;
        }
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.finalizing)
            .into_iter()
            .partition(|h| h.is_finished());
        self.finalizing = pending;
        for handle in done {
            self.report_finalized(handle);
        }
    }

    fn report_finalized(&mut self, handle: Finalizing) {
        match handle.join() {
            Ok(Ok(done)) => self.emit(SessionEvent::RecordingSaved {
                path: done.path,
                frames: done.frames,
            }),
            Ok(Err(e)) => self.emit(SessionEvent::Error(e.to_string())),
            Err(_) => self.emit(SessionEvent::Error("recording finalizer panicked".into())),
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        let next = SessionSnapshot {
            state: self.state(),
            mode: self.mode,
            recording: self.recording.path().map(PathBuf::from),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reads one frame, retrying transient failures for at least
/// `PHOTO_READ_ATTEMPTS` reads and until `warmup` has passed. A freshly
/// started camera can take a second before its first buffer.
fn read_still(source: &mut dyn CaptureSource, warmup: Duration) -> Result<Frame, PhotoError> {
    let deadline = Instant::now() + warmup;
    let mut attempts = 0;
    loop {
        match source.read_frame() {
            Ok(frame) => return Ok(frame),
            Err(e) if e.is_transient() => {
                attempts += 1;
                if attempts >= PHOTO_READ_ATTEMPTS && Instant::now() >= deadline {
                    return Err(e.into());
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}
