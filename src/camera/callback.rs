//! Adapter for SDKs that deliver frames through a frame-ready callback.
//!
//! The SDK calls back on its own thread. Instead of marshaling that callback
//! into the capture thread, the callback pushes finished frames into a bounded
//! channel, and the capture thread consumes them through the ordinary
//! [`CameraDevice`] calls.

use super::{CameraDevice, CameraInfo};
use crate::frame::{Frame, PixelFormat};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Handle given to the SDK's frame-ready callback.
#[derive(Clone)]
pub struct FrameCallback {
    tx: SyncSender<Frame>,
    dropped: Arc<AtomicU64>,
}

impl FrameCallback {
    /// Delivers one frame. Never blocks: if the consumer is behind, the frame
    /// is dropped and counted. Returns false once the camera is gone.
    pub fn deliver(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Wraps a device whose images arrive through [`FrameCallback`].
///
/// Property calls are forwarded to the wrapped device; images come from the
/// callback channel first and fall back to a direct grab.
pub struct CallbackCamera<D> {
    inner: D,
    rx: Receiver<Frame>,
    callback: FrameCallback,
    pending: Option<Frame>,
}

impl<D: CameraDevice> CallbackCamera<D> {
    pub fn new(inner: D, capacity: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        Self {
            inner,
            rx,
            callback: FrameCallback {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            pending: None,
        }
    }

    /// The handle to register with the SDK.
    pub fn callback(&self) -> FrameCallback {
        self.callback.clone()
    }

    /// Frames discarded because the channel was full.
    pub fn dropped_frames(&self) -> u64 {
        self.callback.dropped.load(Ordering::Relaxed)
    }
}

impl<D: CameraDevice> CameraDevice for CallbackCamera<D> {
    fn info(&self) -> CameraInfo {
        self.inner.info()
    }

    fn close(&mut self) {
        let dropped = self.dropped_frames();
        if dropped > 0 {
            warn!("{}: {} callback frames dropped", self.inner.info().name, dropped);
        }
        self.inner.close();
    }

    fn get_image(&mut self) -> Option<Frame> {
        self.pending
            .take()
            .or_else(|| self.rx.try_recv().ok())
            .or_else(|| self.inner.get_image())
    }

    fn set_exposure(&mut self, value: f64) -> bool {
        self.inner.set_exposure(value)
    }

    fn exposure(&self) -> Option<f64> {
        self.inner.exposure()
    }

    fn set_gain(&mut self, value: f64) -> bool {
        self.inner.set_gain(value)
    }

    fn gain(&self) -> Option<f64> {
        self.inner.gain()
    }

    fn gain_range(&self) -> (f64, f64) {
        self.inner.gain_range()
    }

    fn enable_trigger(&mut self) -> bool {
        self.inner.enable_trigger()
    }

    fn disable_trigger(&mut self) -> bool {
        self.inner.disable_trigger()
    }

    /// A frame delivered by the callback counts as the frame-ready signal.
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

    fn set_frame_rate(&mut self, fps: f64) -> bool {
        self.inner.set_frame_rate(fps)
    }

    fn frame_rate(&self) -> Option<f64> {
        self.inner.frame_rate()
    }

    fn frame_rate_list(&self) -> Vec<f64> {
        self.inner.frame_rate_list()
    }

    fn set_continuous_mode(&mut self, enabled: bool) -> bool {
        self.inner.set_continuous_mode(enabled)
    }

    fn frame_size(&self) -> (u32, u32) {
        self.inner.frame_size()
    }

    fn pixel_format(&self) -> PixelFormat {
        self.inner.pixel_format()
    }
}
