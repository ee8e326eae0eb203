//! Rig configuration loaded from YAML.
//!
//! One file describes the cameras and the recording and calibration
//! parameters. Every field has a default so a partial file is valid.

use crate::sink::VideoCodec;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Region of interest applied by the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crop {
    pub top: u32,
    pub left: u32,
    pub height: u32,
    pub width: u32,
}

impl Default for Crop {
    fn default() -> Self {
        Self {
            top: 0,
            left: 0,
            height: 550,
            width: 900,
        }
    }
}

/// Per-camera defaults. Exposure and gain can be changed at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraDetails {
    pub name: String,
    pub crop: Crop,
    pub rotate: u32,
    pub exposure: f64,
    pub gain: f64,
    pub output_dir: PathBuf,
}

impl Default for CameraDetails {
    fn default() -> Self {
        Self {
            name: "cam".to_string(),
            crop: Crop::default(),
            rotate: 0,
            exposure: 0.01,
            gain: 10.0,
            output_dir: PathBuf::from("videos"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub fps: f64,
    pub codec: VideoCodec,
    /// Frames buffered per camera before the oldest is evicted
    pub buffer_capacity: usize,
    /// Sleep of the flush thread when its buffer is empty
    pub flush_poll_interval_us: u64,
    /// Upper bound on a single sleep of a capture thread between frames
    pub capture_poll_interval_us: u64,
    /// Rendezvous all cameras before every frame
    pub synchronize: bool,
    pub barrier_timeout_ms: u64,
    /// Wait for an external trigger pulse before capturing
    pub trigger: bool,
    pub trigger_timeout_ms: u64,
    /// After the trigger, start capturing on the next whole second
    pub align_start_to_second: bool,
    /// Pixel sampled in every written frame, `[x, y]`
    pub tracking_point: Option<[u32; 2]>,
    pub join_timeout_ms: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            fps: 100.0,
            codec: VideoCodec::Mjpeg,
            buffer_capacity: 250,
            flush_poll_interval_us: 500,
            capture_poll_interval_us: 2_000,
            synchronize: true,
            barrier_timeout_ms: 1_000,
            trigger: false,
            trigger_timeout_ms: 100_000,
            align_start_to_second: true,
            tracking_point: None,
            join_timeout_ms: 5_000,
        }
    }
}

impl RecordingConfig {
    pub fn flush_poll_interval(&self) -> Duration {
        Duration::from_micros(self.flush_poll_interval_us)
    }

    pub fn capture_poll_interval(&self) -> Duration {
        Duration::from_micros(self.capture_poll_interval_us)
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }

    pub fn trigger_timeout(&self) -> Duration {
        Duration::from_millis(self.trigger_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Wall-clock budget of a calibration capture run: seconds or `inf`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DurationBudget {
    Limited(f64),
    Unlimited,
}

impl DurationBudget {
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            DurationBudget::Limited(secs) => Some(Duration::from_secs_f64(*secs)),
            DurationBudget::Unlimited => None,
        }
    }
}

impl FromStr for DurationBudget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("inf") {
            return Ok(DurationBudget::Unlimited);
        }
        let secs: f64 = s
            .parse()
            .map_err(|_| anyhow!("Invalid duration {:?}: expected seconds or \"inf\"", s))?;
        if secs.is_infinite() && secs > 0.0 {
            return Ok(DurationBudget::Unlimited);
        }
        if !secs.is_finite() || secs < 0.0 {
            return Err(anyhow!("Invalid duration {:?}: must be non-negative", s));
        }
        Ok(DurationBudget::Limited(secs))
    }
}

impl fmt::Display for DurationBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DurationBudget::Limited(secs) => write!(f, "{}", secs),
            DurationBudget::Unlimited => f.write_str("inf"),
        }
    }
}

impl Serialize for DurationBudget {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            DurationBudget::Limited(secs) => serializer.serialize_f64(*secs),
            DurationBudget::Unlimited => serializer.serialize_str("inf"),
        }
    }
}

impl<'de> Deserialize<'de> for DurationBudget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(secs) => DurationBudget::from_str(&secs.to_string()),
            Raw::Text(text) => DurationBudget::from_str(&text),
        }
        .map_err(serde::de::Error::custom)
    }
}

/// Grid of bright markers used as the calibration target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub rows: u32,
    pub cols: u32,
    pub square_length: f64,
    /// Minimum pixel value counted as marker
    pub threshold: u8,
    /// Fewer markers than this and the frame counts as a miss
    pub min_markers: usize,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            rows: 4,
            cols: 5,
            square_length: 1.0,
            threshold: 200,
            min_markers: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub fps: f64,
    pub duration: DurationBudget,
    /// New detections every camera must contribute before the store is rewritten
    pub frame_process_threshold: usize,
    pub queue_capacity: usize,
    /// Above this reprojection error the camera matrices are re-initialized
    pub error_threshold: f64,
    /// User override: re-initialize even when the previous error is good
    pub init_matrix: bool,
    pub max_nfev: usize,
    pub n_iters: usize,
    pub n_samp_iter: usize,
    pub n_samp_full: usize,
    pub output_dir: PathBuf,
    pub board: BoardConfig,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            fps: 30.0,
            duration: DurationBudget::Limited(30.0),
            frame_process_threshold: 5,
            queue_capacity: 1000,
            error_threshold: 0.1,
            init_matrix: false,
            max_nfev: 200,
            n_iters: 6,
            n_samp_iter: 200,
            n_samp_full: 1000,
            output_dir: PathBuf::from("calibration"),
            board: BoardConfig::default(),
        }
    }
}

impl CalibrationConfig {
    pub fn detections_path(&self) -> PathBuf {
        self.output_dir.join("detections.json")
    }

    pub fn model_path(&self) -> PathBuf {
        self.output_dir.join("calibration.json")
    }
}

/// Everything needed to drive one rig of cameras.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub cameras: Vec<CameraDetails>,
    pub subjects: Vec<String>,
    pub recording: RecordingConfig,
    pub calibration: CalibrationConfig,
}

impl Default for RigConfig {
    fn default() -> Self {
        let camera = |name: &str| CameraDetails {
            name: name.to_string(),
            ..Default::default()
        };
        Self {
            cameras: vec![camera("cam1"), camera("cam2")],
            subjects: Vec::new(),
            recording: RecordingConfig::default(),
            calibration: CalibrationConfig::default(),
        }
    }
}

impl RigConfig {
    /// Loads and validates a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).with_context(|| format!("Failed to read config {:?}", path))?;
        let config: RigConfig =
            serde_yaml::from_str(&content).with_context(|| format!("Failed to parse config {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(anyhow!("Config lists no cameras"));
        }
        if !(self.recording.fps > 0.0) || !(self.calibration.fps > 0.0) {
            return Err(anyhow!("Frame rate must be positive"));
        }
        if self.recording.buffer_capacity == 0 {
            return Err(anyhow!("buffer_capacity must be at least 1"));
        }
        if self.calibration.frame_process_threshold == 0 || self.calibration.queue_capacity == 0 {
            return Err(anyhow!("frame_process_threshold and queue_capacity must be at least 1"));
        }
        if self.calibration.board.rows == 0 || self.calibration.board.cols == 0 {
            return Err(anyhow!("Calibration board needs at least one row and column"));
        }
        Ok(())
    }
}
