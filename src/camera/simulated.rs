//! Software camera producing synthetic frames.
//!
//! Used for dry runs without hardware and for exercising the capture
//! machinery: the capture latency can be made artificially slow, the trigger
//! input is a software line, and frames can carry a grid of bright markers
//! for the calibration board detector.

use super::{CameraBackend, CameraDevice, CameraInfo};
use crate::config::CameraDetails;
use crate::frame::{Frame, PixelFormat};
use crate::utils::lock;
use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

const GAIN_RANGE: (f64, f64) = (0.0, 480.0);
const FRAME_RATES: [f64; 6] = [15.0, 30.0, 60.0, 100.0, 120.0, 200.0];
const MARKER_RADIUS: i64 = 1;

/// A software trigger input shared between the "experiment" and cameras.
#[derive(Debug, Clone, Default)]
pub struct TriggerLine {
    inner: Arc<(Mutex<u64>, Condvar)>,
}

impl TriggerLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits one pulse to every listening camera.
    pub fn fire(&self) {
        let (count, cvar) = &*self.inner;
        *lock(count) += 1;
        cvar.notify_all();
    }

    fn pulses(&self) -> u64 {
        *lock(&self.inner.0)
    }

    /// Waits for a pulse after `seen`.
    fn wait_after(&self, seen: u64, timeout: Duration) -> bool {
        let (count, cvar) = &*self.inner;
        let guard = lock(count);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |pulses| *pulses <= seen)
            .unwrap_or_else(PoisonError::into_inner);
        *guard > seen
    }
}

/// Marker layout drawn into simulated frames.
#[derive(Debug, Clone, Copy)]
struct MarkerGrid {
    rows: u32,
    cols: u32,
}

pub struct SimulatedCamera {
    index: usize,
    width: u32,
    height: u32,
    exposure: f64,
    gain: f64,
    fps: f64,
    continuous: bool,
    trigger_enabled: bool,
    trigger: Option<TriggerLine>,
    pulses_seen: u64,
    capture_delay: Duration,
    stall: Option<(u64, Duration)>,
    fail_at: Option<u64>,
    grabs: u64,
    markers: Option<MarkerGrid>,
    frame_no: u64,
    rng: StdRng,
    closed: bool,
}

impl SimulatedCamera {
    pub fn new(index: usize, width: u32, height: u32) -> Self {
        Self {
            index,
            width,
            height,
            exposure: 0.01,
            gain: 0.0,
            fps: 30.0,
            continuous: false,
            trigger_enabled: false,
            trigger: None,
            pulses_seen: 0,
            capture_delay: Duration::ZERO,
            stall: None,
            fail_at: None,
            grabs: 0,
            markers: None,
            frame_no: 0,
            rng: StdRng::seed_from_u64(index as u64),
            closed: false,
        }
    }

    /// Every `get_image` takes at least this long.
    pub fn with_capture_delay(mut self, delay: Duration) -> Self {
        self.capture_delay = delay;
        self
    }

    /// The grab of frame number `frame` alone takes `delay`.
    pub fn with_stall_at(mut self, frame: u64, delay: Duration) -> Self {
        self.stall = Some((frame, delay));
        self
    }

    /// The grab with index `grab`, counting from zero, returns no image.
    pub fn with_failure_at(mut self, grab: u64) -> Self {
        self.fail_at = Some(grab);
        self
    }

    /// Connects the trigger input to a software line.
    pub fn with_trigger(mut self, line: TriggerLine) -> Self {
        self.trigger = Some(line);
        self
    }

    /// Draws a `rows` x `cols` grid of bright markers, one per cell, jittered
    /// by up to a pixel from frame to frame.
    pub fn with_markers(mut self, rows: u32, cols: u32) -> Self {
        self.markers = Some(MarkerGrid { rows, cols });
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn render(&mut self) -> Frame {
        let w = self.width as usize;
        let h = self.height as usize;
        // background stays well below any marker threshold
        let base = (self.frame_no % 64) as u8 + (self.exposure * 60.0).clamp(0.0, 60.0) as u8;
        let mut data = vec![base; w * h];

        if let Some(grid) = self.markers {
            let cell_w = self.width as f64 / grid.cols as f64;
            let cell_h = self.height as f64 / grid.rows as f64;
            for r in 0..grid.rows {
                for c in 0..grid.cols {
                    let cx = ((c as f64 + 0.5) * cell_w) as i64 + self.rng.random_range(-1..=1);
                    let cy = ((r as f64 + 0.5) * cell_h) as i64 + self.rng.random_range(-1..=1);
                    for dy in -MARKER_RADIUS..=MARKER_RADIUS {
                        for dx in -MARKER_RADIUS..=MARKER_RADIUS {
                            let (x, y) = (cx + dx, cy + dy);
                            if x >= 0 && y >= 0 && (x as usize) < w && (y as usize) < h {
                                data[y as usize * w + x as usize] = 255;
                            }
                        }
                    }
                }
            }
        }

        self.frame_no += 1;
        Frame::from_data(self.width, self.height, PixelFormat::Mono8, data)
            .unwrap_or_else(|_| Frame::new(self.width, self.height, PixelFormat::Mono8))
    }
}

impl CameraDevice for SimulatedCamera {
    fn info(&self) -> CameraInfo {
        CameraInfo {
            index: self.index,
            name: format!("Simulated camera {}", self.index),
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn get_image(&mut self) -> Option<Frame> {
        if self.closed {
            return None;
        }
        let grab = self.grabs;
        self.grabs += 1;
        if self.fail_at == Some(grab) {
            return None;
        }
        let started = Instant::now();
        let delay = match self.stall {
            Some((frame, delay)) if frame == self.frame_no => delay,
            _ => self.capture_delay,
        };
        let frame = self.render();
        let elapsed = started.elapsed();
        if elapsed < delay {
            thread::sleep(delay - elapsed);
        }
        Some(frame)
    }

    fn set_exposure(&mut self, value: f64) -> bool {
        self.exposure = value;
        !self.closed
    }

    fn exposure(&self) -> Option<f64> {
        Some(self.exposure)
    }

    fn set_gain(&mut self, value: f64) -> bool {
        if !(GAIN_RANGE.0..=GAIN_RANGE.1).contains(&value) {
            return false;
        }
        self.gain = value;
        !self.closed
    }

    fn gain(&self) -> Option<f64> {
        Some(self.gain)
    }

    fn gain_range(&self) -> (f64, f64) {
        GAIN_RANGE
    }

    fn enable_trigger(&mut self) -> bool {
        let Some(line) = &self.trigger else {
            return false;
        };
        self.pulses_seen = line.pulses();
        self.trigger_enabled = true;
        true
    }

    fn disable_trigger(&mut self) -> bool {
        self.trigger_enabled = false;
        true
    }

    fn wait_for_frame_ready(&mut self, timeout: Duration) -> bool {
        match (&self.trigger, self.trigger_enabled) {
            (Some(line), true) => {
                let seen = self.pulses_seen;
                if line.wait_after(seen, timeout) {
                    self.pulses_seen = line.pulses();
                    true
                } else {
                    false
                }
            }
            // free-running: a frame is always one period away
            _ => {
                thread::sleep(Duration::from_secs_f64(1.0 / self.fps).min(timeout));
                !self.closed
            }
        }
    }

    fn set_frame_rate(&mut self, fps: f64) -> bool {
        if fps <= 0.0 {
            return false;
        }
        self.fps = fps;
        true
    }

    fn frame_rate(&self) -> Option<f64> {
        Some(self.fps)
    }

    fn frame_rate_list(&self) -> Vec<f64> {
        FRAME_RATES.to_vec()
    }

    fn set_continuous_mode(&mut self, enabled: bool) -> bool {
        self.continuous = enabled;
        true
    }

    fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl CameraBackend for SimulatedCamera {
    fn list_devices() -> Result<Vec<CameraInfo>> {
        Ok((0..4)
            .map(|index| CameraInfo {
                index,
                name: format!("Simulated camera {}", index),
            })
            .collect())
    }

    fn open(index: usize, details: &CameraDetails) -> Result<Self> {
        Ok(Self::new(index, details.crop.width, details.crop.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_wait() {
        let line = TriggerLine::new();
        let mut cam = SimulatedCamera::new(0, 4, 4).with_trigger(line.clone());
        assert!(cam.enable_trigger());
        assert!(!cam.wait_for_frame_ready(Duration::from_millis(20)));

        let firing = line.clone();
        let pulse = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            firing.fire();
        });
        assert!(cam.wait_for_frame_ready(Duration::from_secs(5)));
        pulse.join().unwrap();
        // the same pulse is not reported twice
        assert!(!cam.wait_for_frame_ready(Duration::from_millis(20)));
    }

    #[test]
    fn test_trigger_unsupported_without_line() {
        let mut cam = SimulatedCamera::new(0, 4, 4);
        assert!(!cam.enable_trigger());
    }

    #[test]
    fn test_capture_delay_is_honored() {
        let mut cam = SimulatedCamera::new(0, 4, 4).with_capture_delay(Duration::from_millis(20));
        let started = Instant::now();
        assert!(cam.get_image().is_some());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_closed_camera_returns_sentinel() {
        let mut cam = SimulatedCamera::new(0, 4, 4);
        cam.close();
        assert!(cam.get_image().is_none());
    }

    #[test]
    fn test_scheduled_failure_returns_sentinel_once() {
        let mut cam = SimulatedCamera::new(0, 4, 4).with_failure_at(1);
        assert!(cam.get_image().is_some());
        assert!(cam.get_image().is_none());
        assert!(cam.get_image().is_some());
    }

    #[test]
    fn test_markers_are_drawn() {
        let mut cam = SimulatedCamera::new(0, 50, 40).with_markers(2, 2);
        let frame = cam.get_image().unwrap();
        let bright = frame.data().iter().filter(|&&v| v == 255).count();
        assert_eq!(bright, 4 * 9);
    }
}
