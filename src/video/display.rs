use std::sync::Arc;

use eframe::egui;
use parking_lot::Mutex;

use crate::video::frame::{Frame, PixelFormat};

/// Shared slot holding the newest preview image; the UI takes it on repaint.
pub(crate) type FrameBuffer = Arc<Mutex<Option<egui::ColorImage>>>;

/// Anything that consumes frames during a preview tick.
pub(crate) trait FrameSink: Send {
    /// Must not block; a sink that cannot keep up drops the frame.
    fn consume(&mut self, frame: &Frame);
}

/// Live display surface. Keeps only the latest frame, older ones are overwritten.
pub(crate) struct DisplaySink {
    buffer: FrameBuffer,
}

impl DisplaySink {
    pub fn new(buffer: FrameBuffer) -> Self {
        Self { buffer }
    }
}

impl FrameSink for DisplaySink {
    fn consume(&mut self, frame: &Frame) {
        // 构建 egui 兼容的图像格式
        let size = [frame.width as usize, frame.height as usize];
        let image = match frame.format {
            PixelFormat::Rgba => egui::ColorImage::from_rgba_unmultiplied(size, &frame.data),
            PixelFormat::Rgb => egui::ColorImage::from_rgb(size, &frame.data),
        };
        *self.buffer.lock() = Some(image);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::testing::synthetic_frame;

    #[test]
    fn display_keeps_only_latest_frame() {
        let buffer: FrameBuffer = Arc::new(Mutex::new(None));
        let mut sink = DisplaySink::new(buffer.clone());

        sink.consume(&synthetic_frame(4, 2, 0));
        sink.consume(&synthetic_frame(8, 6, 1));

        let image = buffer.lock().take().unwrap();
        assert_eq!(image.size, [8, 6]);
        assert!(buffer.lock().is_none());
    }
}
