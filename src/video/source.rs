use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use parking_lot::Mutex;

use crate::error::CaptureError;
use crate::video::bus_error;
use crate::video::frame::{Frame, PixelFormat, Resolution};

/// 可以打开成 [`CaptureSource`] 的设备, 即默认摄像头.
pub(crate) trait CaptureDevice: Send {
    /// 稳定的设备标识, 用于独占占用.
    fn id(&self) -> &str;

    fn open(
        &self,
        res: Resolution,
        frame_rate: u32,
    ) -> Result<Box<dyn CaptureSource>, CaptureError>;
}

/// 已打开的摄像头. 关闭或 drop 之前独占设备.
pub(crate) trait CaptureSource: Send {
    fn resolution(&self) -> Resolution;

    fn frame_rate(&self) -> u32;

    /// 读取下一帧. `ReadFailed` 是暂时性的; `DeviceUnavailable` 表示源已失效, 应当关闭.
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;

    /// 释放设备, 可以重复调用.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

static CLAIMED_DEVICES: LazyLock<Mutex<HashSet<String>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// 进程内对设备 id 的独占占用, drop 时释放.
#[derive(Debug)]
pub(crate) struct DeviceClaim {
    id: String,
}

impl DeviceClaim {
    pub fn acquire(id: &str) -> Result<DeviceClaim, CaptureError> {
        let mut claimed = CLAIMED_DEVICES.lock();
        if !claimed.insert(id.to_string()) {
            return Err(CaptureError::DeviceBusy(id.to_string()));
        }
        Ok(DeviceClaim { id: id.to_string() })
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        CLAIMED_DEVICES.lock().remove(&self.id);
    }
}

/// 通过 GStreamer 源元素访问的摄像头 (默认 `v4l2src`).
pub(crate) struct GstCamera {
    id: String,
    source_element: String,
    device: Option<String>,
    read_timeout: Duration,
}

impl GstCamera {
    pub fn new(source_element: &str, device: Option<&str>, read_timeout: Duration) -> Self {
        let id = match device {
            Some(path) => format!("{source_element}:{path}"),
            None => source_element.to_string(),
        };
        Self {
            id,
            source_element: source_element.to_string(),
            device: device.map(str::to_string),
            read_timeout,
        }
    }
}

impl CaptureDevice for GstCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn open(
        &self,
        res: Resolution,
        frame_rate: u32,
    ) -> Result<Box<dyn CaptureSource>, CaptureError> {
        let claim = DeviceClaim::acquire(&self.id)?;

        // 采集 RGBA 原始像素；appsink 只保留最新一帧，跟不上时直接丢帧
        let pipeline_str = format!(
            "{src} name=camsrc ! videoconvert ! videoscale ! videorate ! \
             video/x-raw,format=RGBA,width={w},height={h},framerate={fps}/1 ! \
             appsink name=sink max-buffers=1 drop=true sync=false",
            src = self.source_element,
            w = res.width,
            h = res.height,
            fps = frame_rate,
        );
        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| CaptureError::DeviceUnavailable("not a pipeline".into()))?;

        if let (Some(path), Some(src)) = (&self.device, pipeline.by_name("camsrc")) {
            if src.find_property("device").is_some() {
                src.set_property("device", path.as_str());
            }
        }

        let sink = pipeline
            .by_name("sink")
            .and_then(|s| s.dynamic_cast::<gst_app::AppSink>().ok())
            .ok_or_else(|| CaptureError::DeviceUnavailable("appsink missing".into()))?;

        let source = GstCaptureSource {
            pipeline,
            sink,
            res,
            frame_rate,
            read_timeout: self.read_timeout,
            _claim: claim,
            open: true,
        };
        source.start()?;

        tracing::info!(device = %self.id, %res, frame_rate, "camera opened");
        Ok(Box::new(source))
    }
}

struct GstCaptureSource {
    pipeline: gst::Pipeline,
    sink: gst_app::AppSink,
    res: Resolution,
    frame_rate: u32,
    read_timeout: Duration,
    _claim: DeviceClaim,
    open: bool,
}

impl GstCaptureSource {
    fn start(&self) -> Result<(), CaptureError> {
        let started = self.pipeline.set_state(gst::State::Playing);
        // 等待状态切换完成，设备打不开时会在这里失败
        let (settled, _, _) = self.pipeline.state(gst::ClockTime::from_seconds(5));

        if let Some(msg) = bus_error(&self.pipeline) {
            let _ = self.pipeline.set_state(gst::State::Null);
            return Err(CaptureError::DeviceUnavailable(msg));
        }
        if started.is_err() || settled.is_err() {
            let _ = self.pipeline.set_state(gst::State::Null);
            return Err(CaptureError::DeviceUnavailable(
                "camera pipeline failed to start".into(),
            ));
        }
        Ok(())
    }
}

impl CaptureSource for GstCaptureSource {
    fn resolution(&self) -> Resolution {
        self.res
    }

    fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        if !self.open {
            return Err(CaptureError::DeviceUnavailable("source closed".into()));
        }

        let timeout = gst::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64);
        let Some(sample) = self.sink.try_pull_sample(timeout) else {
            if let Some(msg) = bus_error(&self.pipeline) {
                return Err(CaptureError::DeviceUnavailable(msg));
            }
            if self.sink.is_eos() {
                return Err(CaptureError::DeviceUnavailable("camera stream ended".into()));
            }
            return Err(CaptureError::ReadFailed("no frame within timeout".into()));
        };

        let buffer = sample
            .buffer()
            .ok_or_else(|| CaptureError::ReadFailed("sample without buffer".into()))?;
        let caps = sample
            .caps()
            .ok_or_else(|| CaptureError::ReadFailed("sample without caps".into()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| CaptureError::ReadFailed(e.to_string()))?;
        let format = match info.format() {
            gst_video::VideoFormat::Rgba => PixelFormat::Rgba,
            gst_video::VideoFormat::Rgb => PixelFormat::Rgb,
            other => {
                return Err(CaptureError::ReadFailed(format!(
                    "unexpected pixel format {other:?}"
                )));
            }
        };

        let map = buffer
            .map_readable()
            .map_err(|e| CaptureError::ReadFailed(e.to_string()))?;
        let timestamp = buffer
            .pts()
            .map(|pts| Duration::from_nanos(pts.nseconds()))
            .unwrap_or_default();

        Frame::from_strided(
            info.width(),
            info.height(),
            format,
            info.stride()[0] as usize,
            timestamp,
            map.as_slice(),
        )
        .ok_or_else(|| CaptureError::ReadFailed("truncated frame buffer".into()))
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let _ = self.pipeline.set_state(gst::State::Null);
        tracing::info!("camera closed");
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl Drop for GstCaptureSource {
    fn drop(&mut self) {
        self.close();
    }
}
