//! Refusals returned at the orchestration boundary.
//!
//! Everything else is reported through `anyhow::Error`; these are the cases a
//! caller is expected to match on and show to the user.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("a calibration solve is already running")]
    SolveInProgress,
    #[error("failed to start the solver thread: {0}")]
    SolverUnavailable(String),
    #[error("camera {camera} is busy capturing; stop it first")]
    RecordingActive { camera: usize },
    #[error("video writers are not set up; set up a recording first")]
    RecordingNotSetUp,
    #[error("a recording is already open; save or delete it before setting up a new one")]
    RecordingOpen,
    #[error("capture is already running")]
    AlreadyRunning,
    #[error("file {0:?} already exists; pick a new attempt number or allow overwrite")]
    FileExists(PathBuf),
    #[error("no such camera: {0}")]
    UnknownCamera(usize),
}

fn _test_error_is_send() {
    fn implements<T: Send + Sync>() {}
    implements::<CoreError>();
}
