use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Packed pixel layouts a [`Frame`] may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgba,
    Rgb,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba => 4,
            PixelFormat::Rgb => 3,
        }
    }

    /// GStreamer caps name of the format.
    pub fn gst_name(self) -> &'static str {
        match self {
            PixelFormat::Rgba => "RGBA",
            PixelFormat::Rgb => "RGB",
        }
    }
}

/// One decoded image from the camera, tightly packed (no row padding).
///
/// Frames are borrowed by every attached sink during a single fan-out and
/// dropped afterwards.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Time since the capture source started.
    pub timestamp: Duration,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Builds a packed frame from a buffer whose rows may be padded to `stride`.
    pub fn from_strided(
        width: u32,
        height: u32,
        format: PixelFormat,
        stride: usize,
        timestamp: Duration,
        pixels: &[u8],
    ) -> Option<Frame> {
        let row = width as usize * format.bytes_per_pixel();
        if stride < row || pixels.len() < stride * (height as usize).saturating_sub(1) + row {
            return None;
        }

        let data = if stride == row {
            pixels[..row * height as usize].to_vec()
        } else {
            let mut packed = Vec::with_capacity(row * height as usize);
            for line in pixels.chunks(stride).take(height as usize) {
                packed.extend_from_slice(&line[..row]);
            }
            packed
        };

        Some(Frame {
            width,
            height,
            format,
            timestamp,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strided_rows_are_packed() {
        // 2x2 RGB with 8-byte stride (2 bytes of padding per row)
        let pixels = [
            1, 1, 1, 2, 2, 2, 0, 0, //
            3, 3, 3, 4, 4, 4, 0, 0,
        ];
        let frame =
            Frame::from_strided(2, 2, PixelFormat::Rgb, 8, Duration::ZERO, &pixels).unwrap();
        assert_eq!(frame.data, vec![1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4, 4]);
        assert_eq!(frame.row_bytes(), 6);
    }

    #[test]
    fn last_row_may_omit_padding() {
        let pixels = [9u8; 8 + 6];
        assert!(Frame::from_strided(2, 2, PixelFormat::Rgb, 8, Duration::ZERO, &pixels).is_some());
    }

    #[test]
    fn short_buffer_is_rejected() {
        let pixels = [0u8; 10];
        assert!(Frame::from_strided(2, 2, PixelFormat::Rgba, 8, Duration::ZERO, &pixels).is_none());
    }
}
