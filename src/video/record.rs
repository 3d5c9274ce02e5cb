use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use serde::{Deserialize, Serialize};

use crate::error::RecordError;
use crate::video::bus_error;
use crate::video::frame::{Frame, PixelFormat, Resolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum VideoEncoder {
    H264,
    H265,
    Mjpeg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Container {
    Mp4,
    Mov,
    Avi,
    Mkv,
}

impl Container {
    pub fn extension(self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mov => "mov",
            Container::Avi => "avi",
            Container::Mkv => "mkv",
        }
    }
}

/// 新录像使用的编码器/封装格式.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct VideoPreset {
    pub encoder: VideoEncoder,
    pub container: Container,
    pub bitrate_kbps: u32,
}

impl Default for VideoPreset {
    fn default() -> Self {
        Self {
            encoder: VideoEncoder::H264,
            container: Container::Mp4,
            bitrate_kbps: 2000,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecordSettings {
    pub res: Resolution,
    pub frame_rate: u32,
    pub preset: VideoPreset,
    pub filepath: PathBuf,
}

/// 已经写完并关闭的录像.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FinishedRecording {
    pub path: PathBuf,
    pub frames: u64,
}

/// 绑定到一个输出文件的帧写入器.
pub(crate) trait RecordingWriter: Send {
    /// 把一帧交给编码器, 必须在一个帧间隔内返回.
    /// `pts` 是录制会话分配的显示时间.
    fn write(&mut self, frame: &Frame, pts: Duration) -> Result<(), RecordError>;

    /// 刷出所有数据并关闭文件, 可能会阻塞到 muxer 写完.
    fn finish(self: Box<Self>) -> Result<FinishedRecording, RecordError>;
}

/// 为 [`RecordingSession::start`] 创建写入器.
pub(crate) trait WriterFactory: Send {
    fn create(&self, settings: &RecordSettings) -> Result<Box<dyn RecordingWriter>, RecordError>;
}

/// 正在后台收尾的录像.
pub(crate) type Finalizing = JoinHandle<Result<FinishedRecording, RecordError>>;

/// 最多一个活动写入器; 负责每段录像的帧计数和时间戳.
pub(crate) struct RecordingSession {
    writers: Box<dyn WriterFactory>,
    active: Option<ActiveRecording>,
}

/// 内部结构, 用于记住当前正在录制的组件, 以便后续释放.
struct ActiveRecording {
    writer: Box<dyn RecordingWriter>,
    path: PathBuf,
    frame_rate: u32,
    frames: u64,
    failed_writes: u64,
    /// 第一帧的采集时间, 即 pts 零点.
    origin: Option<Duration>,
    last_pts: Option<Duration>,
}

impl ActiveRecording {
    /// 时间戳取自采集时间, 以第一帧为零点.
    /// 源没有时间戳 (或时间戳倒退) 时按帧间隔往后推.
    fn next_pts(&mut self, frame: &Frame) -> Duration {
        let origin = *self.origin.get_or_insert(frame.timestamp);
        let pts = frame.timestamp.saturating_sub(origin);
        let pts = match self.last_pts {
            Some(last) if pts <= last => last + Duration::from_secs(1) / self.frame_rate,
            _ => pts,
        };
        self.last_pts = Some(pts);
        pts
    }
}

impl RecordingSession {
    pub fn new(writers: Box<dyn WriterFactory>) -> Self {
        Self {
            writers,
            active: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.path.as_path())
    }

    #[cfg(test)]
    pub fn frames_written(&self) -> u64 {
        self.active.as_ref().map_or(0, |a| a.frames)
    }

    /// 按 `settings` 打开写入器, 失败时不保留任何状态.
    pub fn start(&mut self, settings: RecordSettings) -> Result<(), RecordError> {
        if self.active.is_some() {
            return Err(RecordError::WriterInitFailed(
                "a recording is already active".into(),
            ));
        }

        let writer = self.writers.create(&settings)?;
        tracing::info!(path = %settings.filepath.display(), "recording started");
        self.active = Some(ActiveRecording {
            writer,
            path: settings.filepath,
            frame_rate: settings.frame_rate.max(1),
            frames: 0,
            failed_writes: 0,
            origin: None,
            last_pts: None,
        });
        Ok(())
    }

    /// 把一帧写入当前录像 (如果有). 写入失败只记日志并丢掉这一帧.
    pub fn write(&mut self, frame: &Frame) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let pts = active.next_pts(frame);
        match active.writer.write(frame, pts) {
            Ok(()) => active.frames += 1,
            Err(e) => {
                active.failed_writes += 1;
                if active.failed_writes == 1 || active.failed_writes % 100 == 0 {
                    tracing::warn!(dropped = active.failed_writes, "recording frame dropped: {e}");
                }
            }
        }
    }

    /// 取下写入器, 在后台线程里收尾. 没有在录制时返回 `None`.
    /// 一帧都没写进去的录像会被丢弃, 文件也会删掉.
    pub fn stop(&mut self) -> Option<Finalizing> {
        let active = self.active.take()?;
        tracing::info!(
            path = %active.path.display(),
            frames = active.frames,
            "recording stopping"
        );

        // 在后台线程里排空编码器，不阻塞预览
        let handle = std::thread::spawn(move || {
            let result = if active.frames == 0 {
                discard(active.writer, &active.path)
            } else {
                active.writer.finish()
            };
            match &result {
                Ok(done) => tracing::info!(
                    path = %done.path.display(),
                    frames = done.frames,
                    "recording saved"
                ),
                Err(e) => tracing::error!("recording finalize failed: {e}"),
            }
            result
        });
        Some(handle)
    }
}

fn discard(
    writer: Box<dyn RecordingWriter>,
    path: &Path,
) -> Result<FinishedRecording, RecordError> {
    drop(writer);
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "could not remove empty recording: {e}"),
    }
    Err(RecordError::Empty)
}

/// 通过 GStreamer `appsrc ! encoder ! muxer ! filesink` 管线写录像.
pub(crate) struct GstWriterFactory {
    /// 开始丢帧之前最多缓存的帧数.
    pub backlog: u32,
    pub finalize_timeout: Duration,
}

impl Default for GstWriterFactory {
    fn default() -> Self {
        Self {
            backlog: 30,
            finalize_timeout: Duration::from_secs(10),
        }
    }
}

impl WriterFactory for GstWriterFactory {
    fn create(&self, settings: &RecordSettings) -> Result<Box<dyn RecordingWriter>, RecordError> {
        let writer = GstRecorder::start(settings, self.backlog, self.finalize_timeout)?;
        Ok(Box::new(writer))
    }
}

struct GstRecorder {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    path: PathBuf,
    res: Resolution,
    frame_rate: u32,
    format: Option<PixelFormat>,
    /// 通过了丢帧队列的 buffer 数.
    encoded: Arc<AtomicU64>,
    finalize_timeout: Duration,
}

fn init_failed(e: impl std::fmt::Display) -> RecordError {
    RecordError::WriterInitFailed(e.to_string())
}

impl GstRecorder {
    fn start(
        settings: &RecordSettings,
        backlog: u32,
        finalize_timeout: Duration,
    ) -> Result<Self, RecordError> {
        // 1. 根据配置映射插件名称
        let enc_plugin = match settings.preset.encoder {
            VideoEncoder::H264 => format!(
                "x264enc tune=zerolatency bitrate={}",
                settings.preset.bitrate_kbps
            ),
            VideoEncoder::H265 => format!(
                "x265enc tune=zerolatency bitrate={}",
                settings.preset.bitrate_kbps
            ),
            VideoEncoder::Mjpeg => "jpegenc".to_string(),
        };
        let mux_plugin = match settings.preset.container {
            Container::Mp4 => "mp4mux faststart=true",
            Container::Mov => "qtmux",
            Container::Avi => "avimux",
            Container::Mkv => "matroskamux",
        };

        // 2. 构造录制管线
        // 流程：appsrc -> 有界丢帧队列 -> 格式转换 -> 缩放尺寸 -> 编码 -> 封装 -> 写入文件
        // NOTE: format=I420 修复 QuickTime Player 打不开 MP4 的问题
        let desc = format!(
            "appsrc name=src format=time !
             queue leaky=downstream max-size-buffers={backlog} max-size-bytes=0 max-size-time=0 !
             videoconvert name=conv !
             videoscale !
             video/x-raw,width={w},height={h},format=I420 !
             {enc} !
             {mux} name=mux !
             filesink name=out",
            w = settings.res.width,
            h = settings.res.height,
            enc = enc_plugin,
            mux = mux_plugin,
        );
        let pipeline = gst::parse::launch(&desc)
            .map_err(init_failed)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| init_failed("not a pipeline"))?;

        let filesink = pipeline
            .by_name("out")
            .ok_or_else(|| init_failed("filesink missing"))?;
        filesink.set_property("location", &*settings.filepath.to_string_lossy());

        let appsrc = pipeline
            .by_name("src")
            .and_then(|e| e.dynamic_cast::<gst_app::AppSrc>().ok())
            .ok_or_else(|| init_failed("appsrc missing"))?;

        // 队列满了会丢帧, 所以在队列之后计数
        let encoded = Arc::new(AtomicU64::new(0));
        let counter = encoded.clone();
        pipeline
            .by_name("conv")
            .and_then(|conv| conv.static_pad("sink"))
            .ok_or_else(|| init_failed("videoconvert sink pad missing"))?
            .add_probe(gst::PadProbeType::BUFFER, move |_, _| {
                counter.fetch_add(1, Ordering::Relaxed);
                gst::PadProbeReturn::Ok
            });

        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            let reason = bus_error(&pipeline).unwrap_or_else(|| e.to_string());
            let _ = pipeline.set_state(gst::State::Null);
            return Err(RecordError::WriterInitFailed(reason));
        }

        Ok(Self {
            pipeline,
            appsrc,
            path: settings.filepath.clone(),
            res: settings.res,
            frame_rate: settings.frame_rate.max(1),
            format: None,
            encoded,
            finalize_timeout,
        })
    }

    /// Caps 由第一帧决定, 录制过程中摄像头不会重新协商.
    fn negotiate(&mut self, frame: &Frame) -> Result<(), RecordError> {
        let format = match frame.format {
            PixelFormat::Rgba => gst_video::VideoFormat::Rgba,
            PixelFormat::Rgb => gst_video::VideoFormat::Rgb,
        };
        let info = gst_video::VideoInfo::builder(format, frame.width, frame.height)
            .fps(gst::Fraction::new(self.frame_rate as i32, 1))
            .build()
            .map_err(|e| RecordError::Write(e.to_string()))?;
        let caps = info.to_caps().map_err(|e| RecordError::Write(e.to_string()))?;
        self.appsrc.set_caps(Some(&caps));
        self.format = Some(frame.format);
        tracing::debug!(
            caps = %caps,
            target = %self.res,
            "recording caps negotiated ({})",
            frame.format.gst_name()
        );
        Ok(())
    }
}

impl RecordingWriter for GstRecorder {
    fn write(&mut self, frame: &Frame, pts: Duration) -> Result<(), RecordError> {
        if frame.data.len() != frame.row_bytes() * frame.height as usize {
            return Err(RecordError::Write("frame size does not match its dimensions".into()));
        }
        match self.format {
            None => self.negotiate(frame)?,
            Some(f) if f != frame.format => {
                return Err(RecordError::Write("pixel format changed".into()));
            }
            Some(_) => {}
        }

        let mut buffer = gst::Buffer::from_mut_slice(frame.data.clone());
        if let Some(buf) = buffer.get_mut() {
            buf.set_pts(gst::ClockTime::from_nseconds(pts.as_nanos() as u64));
            buf.set_duration(gst::ClockTime::from_nseconds(
                1_000_000_000 / self.frame_rate as u64,
            ));
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| RecordError::Write(format!("{e:?}")))?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<FinishedRecording, RecordError> {
        // 发送 EOS, 等待 muxer 写完文件尾
        let _ = self.appsrc.end_of_stream();

        let timeout = gst::ClockTime::from_mseconds(self.finalize_timeout.as_millis() as u64);
        let outcome = match self.pipeline.bus() {
            Some(bus) => match bus.timed_pop_filtered(
                timeout,
                &[gst::MessageType::Eos, gst::MessageType::Error],
            ) {
                Some(msg) => match msg.view() {
                    gst::MessageView::Error(err) => {
                        Err(RecordError::Finalize(err.error().to_string()))
                    }
                    _ => Ok(()),
                },
                None => Err(RecordError::Finalize("timed out waiting for EOS".into())),
            },
            None => Err(RecordError::Finalize("pipeline has no bus".into())),
        };

        let _ = self.pipeline.set_state(gst::State::Null);
        outcome?;

        Ok(FinishedRecording {
            path: self.path.clone(),
            frames: self.encoded.load(Ordering::Relaxed),
        })
    }
}

impl Drop for GstRecorder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
