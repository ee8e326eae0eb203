//! File names of recorded videos and their timestamp logs.

use crate::config::CameraDetails;
use crate::error::CoreError;
use crate::sink::VideoCodec;
use anyhow::Result;
use chrono::NaiveDate;
use std::path::PathBuf;

const TIMESTAMPS_PREFIX: &str = "TIMESTAMPS_";

/// Output files of one camera's recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingPaths {
    pub base: String,
    pub video: PathBuf,
    pub timestamps: PathBuf,
}

/// `<camera>_<subject>_<date>_<fps>f<exposure>e<gain>g`, with spaces removed
/// from the camera name.
pub fn base_name(camera: &str, subject: &str, date: NaiveDate, fps: f64, exposure: f64, gain: f64) -> String {
    let camera: String = camera.chars().filter(|c| !c.is_whitespace()).collect();
    format!(
        "{}_{}_{}_{}f{}e{}g",
        camera,
        subject,
        date.format("%Y-%m-%d"),
        fps,
        exposure,
        gain
    )
}

/// Naming inputs shared by all cameras of one recording.
#[derive(Debug, Clone)]
pub struct RecordingName<'a> {
    pub subject: &'a str,
    pub date: NaiveDate,
    pub fps: f64,
    pub attempt: u32,
    pub codec: VideoCodec,
    /// Replace files left by an earlier recording with the same attempt
    pub overwrite: bool,
}

impl RecordingName<'_> {
    /// Resolves the paths for one camera. Refuses to reuse an existing video
    /// unless `overwrite` is set.
    pub fn paths(&self, details: &CameraDetails) -> Result<RecordingPaths, CoreError> {
        let base = base_name(
            &details.name,
            self.subject,
            self.date,
            self.fps,
            details.exposure,
            details.gain,
        );
        let stem = format!("{}{}", base, self.attempt);
        let video = details
            .output_dir
            .join(format!("{}.{}", stem, self.codec.extension()));
        let timestamps = details
            .output_dir
            .join(format!("{}{}.csv", TIMESTAMPS_PREFIX, stem));

        if video.exists() && !self.overwrite {
            return Err(CoreError::FileExists(video));
        }
        Ok(RecordingPaths { base, video, timestamps })
    }
}
