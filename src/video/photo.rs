use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use serde::{Deserialize, Serialize};

use crate::error::PhotoError;
use crate::video::bus_error;
use crate::video::frame::{Frame, PixelFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum PhotoFormat {
    #[default]
    Jpeg,
    Png,
}

impl PhotoFormat {
    pub fn extension(self) -> &'static str {
        match self {
            PhotoFormat::Jpeg => "jpg",
            PhotoFormat::Png => "png",
        }
    }
}

impl std::str::FromStr for PhotoFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(PhotoFormat::Jpeg),
            "png" => Ok(PhotoFormat::Png),
            other => Err(format!("unknown photo format: {other}")),
        }
    }
}

/// Encodes a single frame to `path`.
pub(crate) fn save_photo(
    frame: &Frame,
    path: &Path,
    format: PhotoFormat,
) -> Result<(), PhotoError> {
    match format {
        PhotoFormat::Jpeg => save_jpeg(frame, path),
        PhotoFormat::Png => save_png(frame, path),
    }
}

fn save_png(frame: &Frame, path: &Path) -> Result<(), PhotoError> {
    let file = File::create(path)?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), frame.width, frame.height);
    encoder.set_color(match frame.format {
        PixelFormat::Rgba => png::ColorType::Rgba,
        PixelFormat::Rgb => png::ColorType::Rgb,
    });
    encoder.set_depth(png::BitDepth::Eight);

    let encode = |e: png::EncodingError| PhotoError::Encode(e.to_string());
    let mut writer = encoder.write_header().map_err(encode)?;
    writer.write_image_data(&frame.data).map_err(encode)?;
    writer.finish().map_err(encode)
}

fn encode_err(e: impl std::fmt::Display) -> PhotoError {
    PhotoError::Encode(e.to_string())
}

// 单帧管线: appsrc ! videoconvert ! jpegenc ! filesink
fn save_jpeg(frame: &Frame, path: &Path) -> Result<(), PhotoError> {
    let pipeline = gst::parse::launch(
        "appsrc name=src format=time ! videoconvert ! jpegenc ! filesink name=out",
    )
    .map_err(encode_err)?
    .downcast::<gst::Pipeline>()
    .map_err(|_| PhotoError::Encode("not a pipeline".into()))?;

    let appsrc = pipeline
        .by_name("src")
        .and_then(|e| e.dynamic_cast::<gst_app::AppSrc>().ok())
        .ok_or_else(|| PhotoError::Encode("appsrc missing".into()))?;
    let filesink = pipeline
        .by_name("out")
        .ok_or_else(|| PhotoError::Encode("filesink missing".into()))?;
    filesink.set_property("location", &*path.to_string_lossy());

    let format = match frame.format {
        PixelFormat::Rgba => gst_video::VideoFormat::Rgba,
        PixelFormat::Rgb => gst_video::VideoFormat::Rgb,
    };
    let caps = gst_video::VideoInfo::builder(format, frame.width, frame.height)
        .fps(gst::Fraction::new(0, 1))
        .build()
        .and_then(|info| info.to_caps())
        .map_err(encode_err)?;
    appsrc.set_caps(Some(&caps));

    let result = (|| {
        pipeline.set_state(gst::State::Playing).map_err(|e| {
            PhotoError::Encode(bus_error(&pipeline).unwrap_or_else(|| e.to_string()))
        })?;

        let mut buffer = gst::Buffer::from_mut_slice(frame.data.clone());
        if let Some(buf) = buffer.get_mut() {
            buf.set_pts(gst::ClockTime::ZERO);
        }
        appsrc
            .push_buffer(buffer)
            .map_err(|e| PhotoError::Encode(format!("{e:?}")))?;
        let _ = appsrc.end_of_stream();

        wait_for_eos(&pipeline, Duration::from_secs(5))
    })();

    let _ = pipeline.set_state(gst::State::Null);
    result
}

fn wait_for_eos(pipeline: &gst::Pipeline, timeout: Duration) -> Result<(), PhotoError> {
    let bus = pipeline
        .bus()
        .ok_or_else(|| PhotoError::Encode("pipeline has no bus".into()))?;
    let msg = bus
        .timed_pop_filtered(
            gst::ClockTime::from_mseconds(timeout.as_millis() as u64),
            &[gst::MessageType::Eos, gst::MessageType::Error],
        )
        .ok_or_else(|| PhotoError::Encode("timed out encoding photo".into()))?;
    match msg.view() {
        gst::MessageView::Error(err) => Err(PhotoError::Encode(err.error().to_string())),
        _ => Ok(()),
    }
}
