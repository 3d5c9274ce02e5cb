mod config;
mod error;
mod output;
mod session;
mod ui;
mod video;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use eframe::egui;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::error::{CaptureError, SessionError};
use crate::session::SessionController;
use crate::video::display::DisplaySink;
use crate::video::photo::PhotoFormat;
use crate::video::record::GstWriterFactory;
use crate::video::source::GstCamera;

#[derive(Parser, Debug)]
#[command(name = "camdeck")]
#[command(about = "Take photos and record video from the local webcam")]
#[command(version)]
struct Cli {
    /// Config file (defaults to <config dir>/camdeck/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// GStreamer source element, e.g. v4l2src or autovideosrc
    #[arg(long)]
    source: Option<String>,

    /// Camera device path, e.g. /dev/video0
    #[arg(short, long)]
    device: Option<String>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    #[arg(long)]
    fps: Option<u32>,

    /// Preview tick period in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Where photos and videos are written
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// jpeg or png
    #[arg(long)]
    photo_format: Option<PhotoFormat>,

    /// Do not open the camera until preview is requested
    #[arg(long)]
    no_preview: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(source) = &self.source {
            config.camera.source = source.clone();
        }
        if let Some(device) = &self.device {
            config.camera.device = Some(device.clone());
        }
        if let Some(width) = self.width {
            config.camera.width = width;
        }
        if let Some(height) = self.height {
            config.camera.height = height;
        }
        if let Some(fps) = self.fps {
            config.camera.frame_rate = fps;
        }
        if let Some(tick_ms) = self.tick_ms {
            config.preview.tick_ms = tick_ms;
        }
        if let Some(dir) = &self.output_dir {
            config.output.directory = Some(dir.clone());
        }
        if let Some(format) = self.photo_format {
            config.output.photo_format = format;
        }
        if self.no_preview {
            config.preview.autostart = false;
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camdeck=debug,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = Config::load(cli.config.as_deref()).context("failed to load config")?;
    cli.apply(&mut config);
    config.validate()?;

    tracing::info!("Starting camdeck v{}", env!("CARGO_PKG_VERSION"));

    // 1. 初始化 GStreamer
    gstreamer::init().context("GStreamer init failed")?;

    // 2. 创建共享图像缓冲区 (RGBA)
    let frame_buffer = Arc::new(Mutex::new(None));

    let camera = GstCamera::new(
        &config.camera.source,
        config.camera.device.as_deref(),
        config.read_timeout(),
    );
    let writers = GstWriterFactory {
        backlog: config.output.recording_backlog,
        ..GstWriterFactory::default()
    };
    let mut controller = SessionController::new(
        Box::new(camera),
        Box::new(writers),
        Box::new(DisplaySink::new(frame_buffer.clone())),
        config.session_settings(),
    );

    // 3. 启动时打开摄像头, 打不开就直接退出
    if config.preview.autostart {
        match controller.start_preview() {
            Ok(()) => {}
            Err(SessionError::Capture(
                e @ (CaptureError::DeviceUnavailable(_) | CaptureError::DeviceBusy(_)),
            )) => {
                tracing::error!("no camera: {e}");
                return Ok(ExitCode::FAILURE);
            }
            Err(e) => return Err(e.into()),
        }
    }

    let snapshot = controller.watch();
    let events = controller.subscribe();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    // 4. 启动预览/录制线程
    let session_thread =
        video::spawn_session_thread(controller, cmd_rx, cancel.clone(), config.tick())
            .context("failed to spawn session thread")?;

    // 5. 运行 egui
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default().with_inner_size([1280.0, 800.0]),
        ..Default::default()
    };
    let ui_result = eframe::run_native(
        "Camdeck",
        options,
        Box::new(move |_cc| {
            Ok(Box::new(ui::CameraApp::new(
                frame_buffer,
                cmd_tx,
                snapshot,
                events,
            )))
        }),
    );

    // 窗口关闭后: 停止录制, 释放摄像头, 等文件写完
    cancel.cancel();
    if session_thread.join().is_err() {
        tracing::error!("session thread panicked");
    }

    ui_result.map_err(|e| anyhow::anyhow!("UI error: {e}"))?;
    Ok(ExitCode::SUCCESS)
}
