//! Video encoding through the `ffmpeg` command-line tool.
//!
//! Raw frames are piped into a child process's stdin; ffmpeg does the
//! container and codec work.

use super::{FrameSink, SinkFactory, SinkSpec, VideoCodec};
use crate::frame::{Frame, PixelFormat};
use anyhow::{anyhow, Context, Result};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Writes frames to a video file via an ffmpeg subprocess.
pub struct FfmpegSink {
    path: PathBuf,
    width: u32,
    height: u32,
    format: PixelFormat,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stderr_thread: Option<JoinHandle<()>>,
}

impl FfmpegSink {
    /// Starts an encoder for frames of the given geometry.
    pub fn create(
        path: impl AsRef<Path>,
        width: u32,
        height: u32,
        format: PixelFormat,
        fps: f64,
        codec: VideoCodec,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
        }

        let size = format!("{}x{}", width, height);
        let rate = format!("{}", fps);
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("Video path {:?} is not valid UTF-8", path))?;

        // ffmpeg -f rawvideo -pix_fmt gray -s WxH -r fps -i - <codec> <file>
        let mut args: Vec<&str> = vec![
            "-hide_banner",
            "-loglevel",
            "error",
            "-y",
            "-f",
            "rawvideo",
            "-pix_fmt",
            format.ffmpeg_pix_fmt(),
            "-s",
            size.as_str(),
            "-r",
            rate.as_str(),
            "-i",
            "-",
        ];
        args.extend_from_slice(codec.ffmpeg_args());
        args.push(path_str);

        info!("Starting ffmpeg encoder for {:?} ({}, {:?})", path, size, codec);
        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn ffmpeg: {}", e))?;

        let stdin = child.stdin.take().ok_or_else(|| anyhow!("ffmpeg stdin unavailable"))?;
        let stderr_thread = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = [0u8; 1024];
                loop {
                    match stderr.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let msg = String::from_utf8_lossy(&buf[..n]);
                            for line in msg.lines() {
                                error!("ffmpeg: {}", line);
                            }
                        }
                    }
                }
            })
        });

        Ok(Self {
            path,
            width,
            height,
            format,
            child: Some(child),
            stdin: Some(stdin),
            stderr_thread,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameSink for FfmpegSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        if frame.width != self.width || frame.height != self.height || frame.format != self.format {
            return Err(anyhow!(
                "Frame {}x{} {:?} does not match encoder {}x{} {:?}",
                frame.width,
                frame.height,
                frame.format,
                self.width,
                self.height,
                self.format
            ));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("Encoder for {:?} already released", self.path))?;
        stdin
            .write_all(frame.data())
            .map_err(|e| anyhow!("Failed to write to ffmpeg: {}", e))
    }

    fn release(&mut self) -> Result<()> {
        // closing stdin signals end of stream
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait().context("Failed to wait for ffmpeg")?;
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
        if !status.success() {
            return Err(anyhow!("ffmpeg exited with {} while writing {:?}", status, self.path));
        }
        debug!("Encoder for {:?} finished", self.path);
        Ok(())
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!("Failed to finalize {:?}: {}", self.path, e);
        }
    }
}

/// Opens an [`FfmpegSink`] per camera with a fixed codec.
#[derive(Debug, Clone, Copy)]
pub struct FfmpegSinks {
    pub codec: VideoCodec,
}

impl SinkFactory for FfmpegSinks {
    fn create(&mut self, spec: &SinkSpec<'_>) -> Result<Box<dyn FrameSink>> {
        let sink = FfmpegSink::create(spec.path, spec.width, spec.height, spec.format, spec.fps, self.codec)?;
        Ok(Box::new(sink))
    }
}

/// Output path of [`compress_video`]: the input with an `.mp4` extension, or
/// a `_compressed.mp4` sibling when the input already is one.
pub fn compressed_path(input: &Path) -> PathBuf {
    let output = input.with_extension("mp4");
    if output != input {
        return output;
    }
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    input.with_file_name(format!("{}_compressed.mp4", stem))
}

/// Transcodes a saved video to H.264 MP4. Blocks until ffmpeg exits; callers
/// run it on a background thread.
pub fn compress_video(input: impl AsRef<Path>) -> Result<PathBuf> {
    let input = input.as_ref();
    let output = compressed_path(input);
    info!("Compressing {:?} -> {:?}", input, output);
    let result = Command::new("ffmpeg")
        .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
        .arg(input)
        .args(["-c:v", "libx264", "-crf", "17"])
        .arg(&output)
        .output()
        .map_err(|e| anyhow!("Failed to run ffmpeg: {}", e))?;
    if !result.status.success() {
        return Err(anyhow!("ffmpeg failed: {}", String::from_utf8_lossy(&result.stderr)));
    }
    info!("Compressed {:?}", output);
    Ok(output)
}
