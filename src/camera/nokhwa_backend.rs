//! UVC webcam adapter built on nokhwa.
//!
//! The nokhwa camera object lives on its own acquisition thread and streams
//! decoded frames into a bounded channel. UVC devices have no trigger input
//! and expose no portable exposure control, so those calls report failure.

use super::{CameraBackend, CameraDevice, CameraInfo};
use crate::config::CameraDetails;
use crate::frame::{Frame, PixelFormat};
use anyhow::{anyhow, Result};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};

const FRAME_TIMEOUT: Duration = Duration::from_secs(1);

pub struct UvcCamera {
    index: usize,
    name: String,
    width: u32,
    height: u32,
    fps: f64,
    rx: Receiver<Frame>,
    pending: Option<Frame>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// Opens the camera, trying progressively less demanding formats. Some
/// drivers only accept a request that roughly matches what they support.
fn open_stream(index: u32, fps: u32) -> Result<Camera> {
    let seed_formats = [
        CameraFormat::new(Resolution::new(1280, 720), FrameFormat::YUYV, fps),
        CameraFormat::new(Resolution::new(1280, 720), FrameFormat::MJPEG, fps),
        CameraFormat::new(Resolution::new(640, 480), FrameFormat::YUYV, fps),
        CameraFormat::new(Resolution::new(640, 480), FrameFormat::MJPEG, fps),
        CameraFormat::new(Resolution::new(640, 480), FrameFormat::MJPEG, 30),
    ];

    for seed in seed_formats {
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(seed));
        if let Ok(mut cam) = Camera::new(CameraIndex::Index(index), requested) {
            // creating the object is not enough for some drivers
            if cam.open_stream().is_ok() {
                info!("Opened UVC camera {} with seed format {:?}", index, seed);
                return Ok(cam);
            }
        }
    }
    Err(anyhow!("Could not open a stream on camera index {} with any standard format", index))
}

impl UvcCamera {
    fn stop_thread(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("UVC acquisition thread for camera {} panicked", self.index);
            }
        }
    }
}

impl CameraBackend for UvcCamera {
    fn list_devices() -> Result<Vec<CameraInfo>> {
        let devices = nokhwa::query(nokhwa::utils::ApiBackend::Auto)?;
        Ok(devices
            .into_iter()
            .map(|d| CameraInfo {
                index: d.index().as_index().unwrap_or(0) as usize,
                name: d.human_name().to_string(),
            })
            .collect())
    }

    fn open(index: usize, details: &CameraDetails) -> Result<Self> {
        let device_index = u32::try_from(index)?;
        let fps = 30;
        let (tx, rx) = mpsc::sync_channel::<Frame>(4);
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(u32, u32)>>();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name(format!("uvc-{}", index))
            .spawn(move || {
                let mut camera = match open_stream(device_index, fps) {
                    Ok(camera) => camera,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let resolution = camera.resolution();
                let (width, height) = (resolution.width(), resolution.height());
                let _ = ready_tx.send(Ok((width, height)));

                while !stop_flag.load(Ordering::SeqCst) {
                    let decoded = camera
                        .frame()
                        .and_then(|buffer| buffer.decode_image::<RgbFormat>());
                    let image = match decoded {
                        Ok(image) => image,
                        Err(e) => {
                            warn!("UVC camera {}: frame error: {}", device_index, e);
                            continue;
                        }
                    };
                    let Ok(frame) = Frame::from_data(width, height, PixelFormat::Rgb, image.into_raw()) else {
                        continue;
                    };
                    match tx.try_send(frame) {
                        Ok(()) | Err(TrySendError::Full(_)) => {}
                        Err(TrySendError::Disconnected(_)) => break,
                    }
                }
                let _ = camera.stop_stream();
            })?;

        let (width, height) = ready_rx
            .recv()
            .map_err(|_| anyhow!("UVC acquisition thread for camera {} exited", index))??;
        info!("Camera {} ({}) streaming at {}x{}", index, details.name, width, height);

        Ok(Self {
            index,
            name: details.name.clone(),
            width,
            height,
            fps: fps as f64,
            rx,
            pending: None,
            stop,
            thread: Some(thread),
        })
    }
}

impl CameraDevice for UvcCamera {
    fn info(&self) -> CameraInfo {
        CameraInfo {
            index: self.index,
            name: self.name.clone(),
        }
    }

    fn close(&mut self) {
        self.stop_thread();
    }

    fn get_image(&mut self) -> Option<Frame> {
        if let Some(frame) = self.pending.take() {
            return Some(frame);
        }
        self.rx.recv_timeout(FRAME_TIMEOUT).ok()
    }

    fn set_exposure(&mut self, _value: f64) -> bool {
        false
    }

    fn exposure(&self) -> Option<f64> {
        None
    }

    fn set_gain(&mut self, _value: f64) -> bool {
        false
    }

    fn gain(&self) -> Option<f64> {
        None
    }

    fn gain_range(&self) -> (f64, f64) {
        (0.0, 1.0)
    }

    fn enable_trigger(&mut self) -> bool {
        false
    }

    fn disable_trigger(&mut self) -> bool {
        true
    }

    fn wait_for_frame_ready(&mut self, timeout: Duration) -> bool {
        if self.pending.is_some() {
            return true;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => {
                self.pending = Some(frame);
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    fn set_frame_rate(&mut self, _fps: f64) -> bool {
        false
    }

    fn frame_rate(&self) -> Option<f64> {
        Some(self.fps)
    }

    fn frame_rate_list(&self) -> Vec<f64> {
        vec![self.fps]
    }

    fn set_continuous_mode(&mut self, _enabled: bool) -> bool {
        true
    }

    fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Rgb
    }
}

impl Drop for UvcCamera {
    fn drop(&mut self) {
        self.stop_thread();
    }
}
