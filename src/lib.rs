//! camsync: synchronized multi-camera capture and calibration
//!
//! Drives several cameras from per-camera capture threads at a common cadence,
//! buffers their frames to disk, and calibrates the rig from a board seen by
//! all cameras while capture keeps running.

pub mod analysis;
pub mod barrier;
pub mod calibration;
pub mod camera;
pub mod capture;
pub mod config;
pub mod error;
pub mod frame;
pub mod naming;
pub mod recording;
pub mod rig;
pub mod sink;
pub mod status;
pub mod utils;
