//! Multi-camera calibration: online board detection during capture, batched
//! persistence of detections, and an asynchronous solver.

mod board;
mod detection;
mod pipeline;
mod session;
mod solver;
mod store;

pub use board::GridBoard;
pub use detection::{DetectionOutcome, DetectionWorker, QueueItem};
pub use pipeline::{CalibrationCapture, CalibrationRun};
pub use session::CalibrationSession;
pub use solver::{decide_init, CameraModel, SimilaritySolver, SolveMode, SolverWorker};
pub use store::DetectionStore;

use crate::config::CalibrationConfig;
use crate::frame::Frame;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Board corners found in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Image coordinates, pixels
    pub corners: Vec<[f64; 2]>,
    pub ids: Vec<u32>,
}

/// One frame's detection, normalized for the solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRow {
    /// Shared across cameras: equal numbers belong to the same capture cycle
    pub framenum: u64,
    pub camera_id: usize,
    pub timestamp: f64,
    pub corners: Vec<[f64; 2]>,
    pub ids: Vec<u32>,
    /// Board coordinates of each id, filled in by the board
    #[serde(default)]
    pub object_points: Vec<[f64; 3]>,
}

impl DetectionRow {
    pub fn new(camera_id: usize, framenum: u64, timestamp: f64, detection: Detection) -> Self {
        Self {
            framenum,
            camera_id,
            timestamp,
            corners: detection.corners,
            ids: detection.ids,
            object_points: Vec::new(),
        }
    }
}

/// Detection rows keyed by camera id.
pub type DetectionSet = BTreeMap<usize, Vec<DetectionRow>>;

/// A calibration target.
pub trait CalibrationBoard: Send + Sync {
    /// Finds the board in a frame. `None` when it is not visible.
    fn detect_image(&self, frame: &Frame) -> Option<Detection>;

    /// Attaches the canonical board coordinates to each row.
    fn fill_points_rows(&self, rows: &mut [DetectionRow]);
}

/// Solver knobs for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveParams {
    pub init_intrinsics: bool,
    pub init_extrinsics: bool,
    /// Upper bound on model evaluations
    pub max_nfev: usize,
    pub n_iters: usize,
    pub n_samp_iter: usize,
    pub n_samp_full: usize,
}

impl SolveParams {
    pub fn from_config(config: &CalibrationConfig, init: bool) -> Self {
        Self {
            init_intrinsics: init,
            init_extrinsics: init,
            max_nfev: config.max_nfev,
            n_iters: config.n_iters,
            n_samp_iter: config.n_samp_iter,
            n_samp_full: config.n_samp_full,
        }
    }
}

/// Fits a camera model to point correspondences.
pub trait CalibrationSolver: Send {
    /// Refines the model. Returns the reprojection error, or `None` when the
    /// solve failed; the model is then left unchanged.
    fn calibrate_rows(&mut self, rows: &DetectionSet, board: &dyn CalibrationBoard, params: &SolveParams)
        -> Option<f64>;

    /// Writes the current model.
    fn dump(&self, path: &Path) -> Result<()>;
}
