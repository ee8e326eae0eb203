//! Camera device handles and the per-camera session that owns one.

mod callback;
#[cfg(feature = "uvc")]
mod nokhwa_backend;
mod simulated;

pub use callback::{CallbackCamera, FrameCallback};
#[cfg(feature = "uvc")]
pub use nokhwa_backend::UvcCamera;
pub use simulated::{SimulatedCamera, TriggerLine};

use crate::config::CameraDetails;
use crate::error::CoreError;
use crate::frame::{Frame, PixelFormat};
use anyhow::{anyhow, Result};
use std::time::Duration;
use tracing::{info, warn};

/// Capabilities of one opened camera.
///
/// Calls are blocking. Failures are reported through sentinel values
/// (`None`/`false`), matching vendor SDKs that never raise.
pub trait CameraDevice: Send {
    fn info(&self) -> CameraInfo;

    /// Stops acquisition and releases the device. Idempotent.
    fn close(&mut self);

    /// Grabs one frame.
    fn get_image(&mut self) -> Option<Frame>;

    fn set_exposure(&mut self, value: f64) -> bool;
    fn exposure(&self) -> Option<f64>;

    fn set_gain(&mut self, value: f64) -> bool;
    fn gain(&self) -> Option<f64>;
    /// Inclusive gain limits reported by the device.
    fn gain_range(&self) -> (f64, f64);

    fn enable_trigger(&mut self) -> bool;
    fn disable_trigger(&mut self) -> bool;
    /// Blocks until the next frame-ready signal or until `timeout` elapses.
    fn wait_for_frame_ready(&mut self, timeout: Duration) -> bool;

    fn set_frame_rate(&mut self, fps: f64) -> bool;
    fn frame_rate(&self) -> Option<f64>;
    fn frame_rate_list(&self) -> Vec<f64>;

    fn set_continuous_mode(&mut self, enabled: bool) -> bool;

    /// Current frame dimensions.
    fn frame_size(&self) -> (u32, u32);

    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Mono8
    }
}

/// A camera backend that can enumerate and open devices.
pub trait CameraBackend: CameraDevice + Sized {
    /// Returns a list of available camera devices.
    fn list_devices() -> Result<Vec<CameraInfo>>;

    /// Opens the camera with the given index and settings.
    fn open(index: usize, details: &CameraDetails) -> Result<Self>;
}

/// Information about a camera device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    /// Device index
    pub index: usize,
    /// Human-readable name
    pub name: String,
}

/// One physical camera and its settings.
///
/// The session owns its device exclusively. While a capture thread runs, the
/// device is lent to that thread and every direct call is refused.
pub struct CameraSession {
    id: usize,
    details: CameraDetails,
    device: Option<Box<dyn CameraDevice>>,
    trigger_enabled: bool,
    continuous_mode: bool,
}

impl CameraSession {
    /// Applies the configured exposure and gain and puts the device into
    /// snap mode.
    pub fn initialize(id: usize, details: CameraDetails, device: Box<dyn CameraDevice>) -> Result<Self> {
        let mut session = Self {
            id,
            details,
            device: Some(device),
            trigger_enabled: false,
            continuous_mode: false,
        };
        session.configure()?;
        info!(
            "Initialized camera {} ({}) at {}x{}",
            id,
            session.details.name,
            session.frame_size().0,
            session.frame_size().1
        );
        Ok(session)
    }

    fn configure(&mut self) -> Result<()> {
        let exposure = self.details.exposure;
        let gain = self.details.gain;
        let device = self.device_mut()?;
        if !device.set_continuous_mode(false) {
            warn!("Camera could not leave continuous mode");
        }
        self.continuous_mode = false;
        // some devices expose no exposure or gain control at all
        if let Err(e) = self.set_exposure(exposure) {
            warn!("{:#}; keeping the device default", e);
        }
        if let Err(e) = self.set_gain(gain) {
            warn!("{:#}; keeping the device default", e);
        }
        Ok(())
    }

    /// Closes the current device and replaces it with a freshly opened one.
    /// Refused while the camera is capturing.
    pub fn reinitialize(&mut self, device: Box<dyn CameraDevice>) -> Result<()> {
        let old = self.device.as_mut().ok_or(CoreError::RecordingActive { camera: self.id })?;
        old.close();
        self.device = Some(device);
        self.trigger_enabled = false;
        self.configure()
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn details(&self) -> &CameraDetails {
        &self.details
    }

    pub fn name(&self) -> &str {
        &self.details.name
    }

    pub fn exposure(&self) -> f64 {
        self.details.exposure
    }

    pub fn gain(&self) -> f64 {
        self.details.gain
    }

    pub fn trigger_enabled(&self) -> bool {
        self.trigger_enabled
    }

    pub fn continuous_mode(&self) -> bool {
        self.continuous_mode
    }

    /// True while a capture thread holds the device.
    pub fn is_capturing(&self) -> bool {
        self.device.is_none()
    }

    fn device_mut(&mut self) -> Result<&mut Box<dyn CameraDevice>, CoreError> {
        self.device.as_mut().ok_or(CoreError::RecordingActive { camera: self.id })
    }

    /// Sets exposure, clamped into `[0, 1]`. Returns the applied value.
    pub fn set_exposure(&mut self, value: f64) -> Result<f64> {
        let value = value.clamp(0.0, 1.0);
        if !self.device_mut()?.set_exposure(value) {
            return Err(anyhow!("Camera {} rejected exposure {}", self.id, value));
        }
        self.details.exposure = value;
        Ok(value)
    }

    /// Sets gain, rounded and clamped below the device maximum. Returns the
    /// applied value.
    pub fn set_gain(&mut self, value: f64) -> Result<f64> {
        let device = self.device_mut()?;
        let (min, max) = device.gain_range();
        let value = value.round().min(max - 1.0).max(min);
        if !device.set_gain(value) {
            return Err(anyhow!("Camera {} rejected gain {}", self.id, value));
        }
        self.details.gain = value;
        Ok(value)
    }

    pub fn set_trigger(&mut self, enabled: bool) -> Result<()> {
        let device = self.device_mut()?;
        let ok = if enabled {
            device.enable_trigger()
        } else {
            device.disable_trigger()
        };
        if !ok {
            return Err(anyhow!("Camera {} does not support trigger mode", self.id));
        }
        self.trigger_enabled = enabled;
        Ok(())
    }

    pub fn set_continuous_mode(&mut self, enabled: bool) -> Result<()> {
        if !self.device_mut()?.set_continuous_mode(enabled) {
            return Err(anyhow!("Camera {} rejected continuous mode {}", self.id, enabled));
        }
        self.continuous_mode = enabled;
        Ok(())
    }

    pub fn set_frame_rate(&mut self, fps: f64) -> Result<()> {
        if !self.device_mut()?.set_frame_rate(fps) {
            return Err(anyhow!("Camera {} rejected frame rate {}", self.id, fps));
        }
        Ok(())
    }

    pub fn frame_rate_list(&self) -> Vec<f64> {
        self.device.as_ref().map(|d| d.frame_rate_list()).unwrap_or_default()
    }

    pub fn frame_size(&self) -> (u32, u32) {
        self.device
            .as_ref()
            .map(|d| d.frame_size())
            .unwrap_or((self.details.crop.width, self.details.crop.height))
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.device.as_ref().map_or(PixelFormat::Mono8, |d| d.pixel_format())
    }

    /// Grabs a single frame outside of any capture thread.
    pub fn snap(&mut self) -> Result<Frame> {
        let id = self.id;
        self.device_mut()?
            .get_image()
            .ok_or_else(|| anyhow!("Camera {} returned no image", id))
    }

    /// Hands the device to a capture thread.
    pub fn lend_device(&mut self) -> Result<Box<dyn CameraDevice>, CoreError> {
        self.device.take().ok_or(CoreError::RecordingActive { camera: self.id })
    }

    /// Takes the device back from a finished capture thread.
    pub fn restore_device(&mut self, device: Box<dyn CameraDevice>) {
        if self.device.is_some() {
            warn!("Camera {} already holds a device; closing the returned one", self.id);
            let mut device = device;
            device.close();
            return;
        }
        self.device = Some(device);
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        if let Some(device) = self.device.as_mut() {
            device.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> CameraSession {
        let device = SimulatedCamera::new(0, 8, 6);
        CameraSession::initialize(0, CameraDetails::default(), Box::new(device)).unwrap()
    }

    #[test]
    fn test_exposure_and_gain_are_clamped() {
        let mut cam = session();
        assert_eq!(cam.set_exposure(3.0).unwrap(), 1.0);
        assert_eq!(cam.set_exposure(-2.0).unwrap(), 0.0);
        // simulated gain range is 0..=480
        assert_eq!(cam.set_gain(12.4).unwrap(), 12.0);
        assert_eq!(cam.set_gain(1000.0).unwrap(), 479.0);
        assert_eq!(cam.gain(), 479.0);
    }

    #[test]
    fn test_lent_device_refuses_direct_calls() {
        let mut cam = session();
        let device = cam.lend_device().unwrap();
        assert!(cam.is_capturing());
        assert!(cam.snap().is_err());
        let err = cam
            .reinitialize(Box::new(SimulatedCamera::new(0, 8, 6)))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<CoreError>(),
            Some(&CoreError::RecordingActive { camera: 0 })
        );

        cam.restore_device(device);
        assert!(!cam.is_capturing());
        assert_eq!(cam.snap().unwrap().width, 8);
    }

    #[test]
    fn test_reinitialize_reapplies_settings() {
        let mut cam = session();
        cam.set_exposure(0.25).unwrap();
        cam.reinitialize(Box::new(SimulatedCamera::new(0, 16, 12))).unwrap();
        assert_eq!(cam.frame_size(), (16, 12));
        assert_eq!(cam.exposure(), 0.25);
    }
}
