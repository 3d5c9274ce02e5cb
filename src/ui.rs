use std::time::{Duration, Instant};

use eframe::egui;
use tokio::sync::{broadcast, mpsc, watch};

use crate::session::{CaptureMode, SessionCommand, SessionEvent, SessionSnapshot, SessionState};
use crate::video::display::FrameBuffer;

/// 临时状态消息显示这么久之后恢复为常驻文本.
const STATUS_HOLD: Duration = Duration::from_secs(3);

pub struct CameraApp {
    frame_buffer: FrameBuffer,
    texture: Option<egui::TextureHandle>,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
    events: broadcast::Receiver<SessionEvent>,
    status: Option<(String, Instant)>,
    closing: bool,
}

impl CameraApp {
    pub(crate) fn new(
        frame_buffer: FrameBuffer,
        cmd_tx: mpsc::UnboundedSender<SessionCommand>,
        snapshot: watch::Receiver<SessionSnapshot>,
        events: broadcast::Receiver<SessionEvent>,
    ) -> Self {
        Self {
            frame_buffer,
            texture: None,
            cmd_tx,
            snapshot,
            events,
            status: None,
            closing: false,
        }
    }

    fn send(&self, cmd: SessionCommand) {
        if self.cmd_tx.send(cmd).is_err() {
            tracing::warn!(?cmd, "session loop is gone, command dropped");
        }
    }

    fn drain_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    if let Some(text) = status_text(&event) {
                        self.status = Some((text, Instant::now()));
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "status events lagged");
                }
                Err(_) => break,
            }
        }
    }

    fn status_line(&self, snapshot: &SessionSnapshot) -> String {
        if let Some((text, at)) = &self.status {
            if at.elapsed() < STATUS_HOLD {
                return text.clone();
            }
        }
        resting_status(snapshot)
    }
}

/// 事件发生后立即显示的消息, 不需要提示的事件返回 `None`.
fn status_text(event: &SessionEvent) -> Option<String> {
    let name = |p: &std::path::Path| {
        p.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    match event {
        SessionEvent::PhotoSaved(path) => Some(format!("Photo saved: {}", name(path))),
        SessionEvent::RecordingStarted(path) => Some(format!("Recording: {}", name(path))),
        SessionEvent::RecordingSaved { path, frames } => {
            Some(format!("Recording saved: {} ({frames} frames)", name(path)))
        }
        SessionEvent::Error(msg) => Some(format!("Error: {msg}")),
        SessionEvent::PreviewStarted
        | SessionEvent::PreviewStopped
        | SessionEvent::ModeChanged(_) => None,
    }
}

/// 没有临时消息时显示的文本.
fn resting_status(snapshot: &SessionSnapshot) -> String {
    match (&snapshot.state, &snapshot.recording) {
        (SessionState::Recording, Some(path)) => format!(
            "Recording: {}",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ),
        (SessionState::Idle, _) => "Preview paused".to_string(),
        _ => "Ready".to_string(),
    }
}

impl eframe::App for CameraApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.drain_events();
        let snapshot = self.snapshot.borrow().clone();
        let recording = snapshot.state == SessionState::Recording;

        // 关窗时尽早停止录制, 让文件尾先写起来
        if !self.closing && ctx.input(|i| i.viewport().close_requested()) {
            self.closing = true;
            self.send(SessionCommand::Shutdown);
        }

        // --- 1. 快捷键: R 切换录制, 空格 = 快门 ---
        if ctx.input(|i| i.key_pressed(egui::Key::R)) {
            self.send(SessionCommand::ToggleRecording);
        }
        if ctx.input(|i| i.key_pressed(egui::Key::Space)) {
            self.send(SessionCommand::Shutter);
        }

        // 2. 获取最新图像并转换为 GPU 纹理
        if let Some(image) = self.frame_buffer.lock().take() {
            self.texture = Some(ctx.load_texture("cam_frame", image, Default::default()));
        }

        // 3. 底部控制栏
        egui::TopBottomPanel::bottom("controls").show(ctx, |ui| {
            ui.add_space(8.0);
            ui.horizontal(|ui| {
                if ui
                    .add_sized([150.0, 40.0], egui::Button::new("📷 Take Photo"))
                    .clicked()
                {
                    self.send(SessionCommand::CapturePhoto);
                }

                let record_label = if recording {
                    "⏹ Stop Recording"
                } else {
                    "🔴 Record Video"
                };
                if ui
                    .add_sized([150.0, 40.0], egui::Button::new(record_label))
                    .clicked()
                {
                    self.send(SessionCommand::ToggleRecording);
                }

                let preview_label = if snapshot.state == SessionState::Idle {
                    "▶ Resume Preview"
                } else {
                    "⏸ Pause Preview"
                };
                if ui
                    .add_sized([150.0, 40.0], egui::Button::new(preview_label))
                    .clicked()
                {
                    self.send(SessionCommand::TogglePreview);
                }

                ui.separator();
                ui.add_enabled_ui(!recording, |ui| {
                    let mut mode = snapshot.mode;
                    ui.selectable_value(&mut mode, CaptureMode::Photo, "Photo");
                    ui.selectable_value(&mut mode, CaptureMode::Video, "Video");
                    if mode != snapshot.mode {
                        self.send(SessionCommand::SetMode(mode));
                    }
                });

                ui.add_space(20.0);
                ui.label(self.status_line(&snapshot));
            });
            ui.add_space(8.0);
        });

        // 4. 预览画面, 保持宽高比
        egui::CentralPanel::default()
            .frame(egui::Frame::new().fill(egui::Color32::BLACK))
            .show(ctx, |ui| {
                let rect = ui.max_rect();
                match &self.texture {
                    Some(texture) => {
                        let size = texture.size_vec2();
                        let scale = (rect.width() / size.x).min(rect.height() / size.y);
                        let image_rect =
                            egui::Rect::from_center_size(rect.center(), size * scale);
                        ui.painter().image(
                            texture.id(),
                            image_rect,
                            egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0)),
                            egui::Color32::WHITE,
                        );
                    }
                    None => {
                        ui.painter().text(
                            rect.center(),
                            egui::Align2::CENTER_CENTER,
                            "Camera preview not available",
                            egui::FontId::proportional(20.0),
                            egui::Color32::GRAY,
                        );
                    }
                }

                if recording {
                    ui.painter().text(
                        rect.left_top() + egui::vec2(20.0, 20.0),
                        egui::Align2::LEFT_TOP,
                        "● REC",
                        egui::FontId::proportional(20.0),
                        egui::Color32::RED,
                    );
                }
            });

        // 关键：请求下一帧重绘（实现实时视频）
        ctx.request_repaint();
    }
}
