//! Synthetic camera and writers used by unit tests.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{CaptureError, RecordError};
use crate::video::display::FrameSink;
use crate::video::frame::{Frame, PixelFormat, Resolution};
use crate::video::record::{FinishedRecording, RecordSettings, RecordingWriter, WriterFactory};
use crate::video::source::{CaptureDevice, CaptureSource, DeviceClaim};

/// RGBA gradient whose first byte encodes `seq`.
pub(crate) fn synthetic_frame(width: u32, height: u32, seq: u64) -> Frame {
    let mut data = Vec::with_capacity(width as usize * height as usize * 4);
    for y in 0..height {
        for x in 0..width {
            data.extend_from_slice(&[(x % 256) as u8, (y % 256) as u8, seq as u8, 255]);
        }
    }
    if let Some(first) = data.first_mut() {
        *first = seq as u8;
    }
    Frame {
        width,
        height,
        format: PixelFormat::Rgba,
        timestamp: Duration::from_millis(seq * 33),
        data,
    }
}

#[derive(Debug, Default)]
pub(crate) struct CameraStats {
    pub opens: AtomicUsize,
    pub reads: AtomicU64,
    pub failed_reads: AtomicU64,
    pub unplugged: AtomicBool,
}

/// In-memory camera. Every `fail_every`-th read fails transiently, and the
/// first `warmup_reads` reads after each open deliver nothing.
pub(crate) struct SyntheticCamera {
    id: String,
    fail_every: Option<u64>,
    warmup_reads: u64,
    pub stats: Arc<CameraStats>,
}

impl SyntheticCamera {
    pub fn new(id: &str) -> Self {
        Self {
            id: format!("synthetic:{id}"),
            fail_every: None,
            warmup_reads: 0,
            stats: Arc::default(),
        }
    }

    pub fn failing_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n);
        self
    }

    pub fn warming_up(mut self, reads: u64) -> Self {
        self.warmup_reads = reads;
        self
    }
}

impl CaptureDevice for SyntheticCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn open(
        &self,
        res: Resolution,
        frame_rate: u32,
    ) -> Result<Box<dyn CaptureSource>, CaptureError> {
        let claim = DeviceClaim::acquire(&self.id)?;
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SyntheticSource {
            res,
            frame_rate,
            fail_every: self.fail_every,
            warmup_left: self.warmup_reads,
            stats: self.stats.clone(),
            claim: Some(claim),
            seq: 0,
        }))
    }
}

struct SyntheticSource {
    res: Resolution,
    frame_rate: u32,
    fail_every: Option<u64>,
    warmup_left: u64,
    stats: Arc<CameraStats>,
    claim: Option<DeviceClaim>,
    seq: u64,
}

impl CaptureSource for SyntheticSource {
    fn resolution(&self) -> Resolution {
        self.res
    }

    fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        if self.claim.is_none() {
            return Err(CaptureError::DeviceUnavailable("closed".into()));
        }
        if self.stats.unplugged.load(Ordering::SeqCst) {
            return Err(CaptureError::DeviceUnavailable("unplugged".into()));
        }
        let n = self.stats.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if self.warmup_left > 0 {
            self.warmup_left -= 1;
            self.stats.failed_reads.fetch_add(1, Ordering::SeqCst);
            return Err(CaptureError::ReadFailed("no frame within timeout".into()));
        }
        if self.fail_every.is_some_and(|every| n % every == 0) {
            self.stats.failed_reads.fetch_add(1, Ordering::SeqCst);
            return Err(CaptureError::ReadFailed("synthetic dropout".into()));
        }
        self.seq += 1;
        Ok(synthetic_frame(self.res.width, self.res.height, self.seq))
    }

    fn close(&mut self) {
        self.claim = None;
    }

    fn is_open(&self) -> bool {
        self.claim.is_some()
    }
}

/// Writes packed frames back to back, so the frame count is `len / frame_size`.
/// Every pts handed to a writer is kept in `pts`.
#[derive(Default)]
pub(crate) struct RawFileWriterFactory {
    pub pts: Arc<Mutex<Vec<Duration>>>,
    finish_delay: Duration,
    fail_finish: bool,
}

impl RawFileWriterFactory {
    /// Makes `finish` take at least `delay`, like a muxer writing its index.
    pub fn finishing_after(mut self, delay: Duration) -> Self {
        self.finish_delay = delay;
        self
    }

    /// Makes `finish` fail, like a full disk.
    pub fn failing_finish(mut self) -> Self {
        self.fail_finish = true;
        self
    }
}

impl WriterFactory for RawFileWriterFactory {
    fn create(&self, settings: &RecordSettings) -> Result<Box<dyn RecordingWriter>, RecordError> {
        let file = File::create(&settings.filepath)
            .map_err(|e| RecordError::WriterInitFailed(e.to_string()))?;
        Ok(Box::new(RawFileWriter {
            out: BufWriter::new(file),
            path: settings.filepath.clone(),
            frames: 0,
            pts: self.pts.clone(),
            finish_delay: self.finish_delay,
            fail_finish: self.fail_finish,
        }))
    }
}

struct RawFileWriter {
    out: BufWriter<File>,
    path: PathBuf,
    frames: u64,
    pts: Arc<Mutex<Vec<Duration>>>,
    finish_delay: Duration,
    fail_finish: bool,
}

impl RecordingWriter for RawFileWriter {
    fn write(&mut self, frame: &Frame, pts: Duration) -> Result<(), RecordError> {
        self.out
            .write_all(&frame.data)
            .map_err(|e| RecordError::Write(e.to_string()))?;
        self.pts.lock().push(pts);
        self.frames += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<FinishedRecording, RecordError> {
        std::thread::sleep(self.finish_delay);
        if self.fail_finish {
            return Err(RecordError::Finalize("No space left on device".into()));
        }
        self.out
            .flush()
            .map_err(|e| RecordError::Finalize(e.to_string()))?;
        Ok(FinishedRecording {
            path: self.path.clone(),
            frames: self.frames,
        })
    }
}

/// Factory whose writers never start, like a missing encoder plugin.
pub(crate) struct BrokenWriterFactory;

impl WriterFactory for BrokenWriterFactory {
    fn create(&self, _settings: &RecordSettings) -> Result<Box<dyn RecordingWriter>, RecordError> {
        Err(RecordError::WriterInitFailed("no such element x264enc".into()))
    }
}

pub(crate) fn read_raw_frame_count(path: &Path, width: u32, height: u32) -> u64 {
    let len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let frame_bytes = width as u64 * height as u64 * 4;
    assert_eq!(len % frame_bytes, 0, "partial frame in {}", path.display());
    len / frame_bytes
}

/// Display stand-in counting delivered frames.
#[derive(Clone, Default)]
pub(crate) struct CountingSink {
    pub frames: Arc<AtomicU64>,
}

impl FrameSink for CountingSink {
    fn consume(&mut self, _frame: &Frame) {
        self.frames.fetch_add(1, Ordering::SeqCst);
    }
}
