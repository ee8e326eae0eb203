//! Frame sinks: where captured frames end up.

mod ffmpeg;
mod memory;
mod timestamps;

pub use ffmpeg::{compress_video, compressed_path, FfmpegSink, FfmpegSinks};
pub use memory::{MemorySink, MemorySinks};
pub use timestamps::{read_timestamps, TimestampLog};

use crate::frame::{Frame, PixelFormat};
use anyhow::Result;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Ordered frame writer.
///
/// Implementations preserve write order. A sink is used by exactly one thread
/// at a time, so it only needs to be `Send`.
pub trait FrameSink: Send {
    /// Append one frame.
    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and close. Calling it again is a no-op.
    fn release(&mut self) -> Result<()>;
}

/// What a new sink will receive and where it writes.
#[derive(Debug, Clone, Copy)]
pub struct SinkSpec<'a> {
    pub camera_id: usize,
    pub path: &'a Path,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub fps: f64,
}

/// Creates one sink per camera when a recording is set up.
pub trait SinkFactory {
    fn create(&mut self, spec: &SinkSpec<'_>) -> Result<Box<dyn FrameSink>>;
}

/// Encoder used for recorded videos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// Motion JPEG in AVI
    Mjpeg,
    /// H.264 in MP4
    H264,
    /// Lossless FFV1 in Matroska
    Ffv1,
    /// Uncompressed frames in AVI
    Raw,
}

impl VideoCodec {
    pub fn extension(&self) -> &'static str {
        match self {
            VideoCodec::Mjpeg | VideoCodec::Raw => "avi",
            VideoCodec::H264 => "mp4",
            VideoCodec::Ffv1 => "mkv",
        }
    }

    pub(crate) fn ffmpeg_args(&self) -> &'static [&'static str] {
        match self {
            VideoCodec::Mjpeg => &["-c:v", "mjpeg", "-q:v", "3"],
            VideoCodec::H264 => &["-c:v", "libx264", "-preset", "ultrafast", "-crf", "17"],
            VideoCodec::Ffv1 => &["-c:v", "ffv1"],
            VideoCodec::Raw => &["-c:v", "rawvideo"],
        }
    }
}
