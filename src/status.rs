//! Coarse status surface polled by the user interface.

use crate::utils::lock;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Lifecycle of one capture thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    WaitingForTrigger,
    Capturing,
    Draining,
    Stopped,
}

/// Lifecycle of the calibration pipeline and solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Idle,
    Capturing,
    ReadyToCalibrate,
    Calibrating,
    Calibrated,
    Failed,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaptureState::Idle => "idle",
            CaptureState::WaitingForTrigger => "waiting-trigger",
            CaptureState::Capturing => "capturing",
            CaptureState::Draining => "draining",
            CaptureState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

impl fmt::Display for CalibrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CalibrationState::Idle => "idle",
            CalibrationState::Capturing => "capturing",
            CalibrationState::ReadyToCalibrate => "ready-to-calibrate",
            CalibrationState::Calibrating => "calibrating",
            CalibrationState::Calibrated => "calibrated",
            CalibrationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A state plus the last human readable message.
#[derive(Debug, Clone, PartialEq)]
pub struct Status<S> {
    pub state: S,
    pub text: String,
}

/// Shared, cloneable status slot written by a worker thread.
#[derive(Debug)]
pub struct StatusCell<S> {
    inner: Arc<Mutex<Status<S>>>,
}

impl<S> Clone for StatusCell<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Clone> StatusCell<S> {
    pub fn new(state: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Status {
                state,
                text: String::new(),
            })),
        }
    }

    pub fn set(&self, state: S, text: impl Into<String>) {
        let mut status = lock(&self.inner);
        status.state = state;
        status.text = text.into();
    }

    pub fn set_state(&self, state: S) {
        lock(&self.inner).state = state;
    }

    pub fn set_text(&self, text: impl Into<String>) {
        lock(&self.inner).text = text.into();
    }

    pub fn get(&self) -> Status<S> {
        lock(&self.inner).clone()
    }

    pub fn state(&self) -> S {
        lock(&self.inner).state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_cell_is_shared() {
        let cell = StatusCell::new(CaptureState::Idle);
        let writer = cell.clone();
        writer.set(CaptureState::WaitingForTrigger, "Waiting for trigger...");
        let status = cell.get();
        assert_eq!(status.state, CaptureState::WaitingForTrigger);
        assert_eq!(status.text, "Waiting for trigger...");
        assert_eq!(status.state.to_string(), "waiting-trigger");
    }
}
