//! Post-hoc timing analysis of recorded timestamp series.

use anyhow::{anyhow, Result};

/// Result of comparing the timestamps of two cameras.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    /// Difference in frame count between the two series
    pub missing_frames: usize,
    /// Interval indices whose length lies outside `period ± period/2`, for
    /// either camera. Only computed when no frames are missing.
    pub unsynced: Vec<usize>,
    /// Largest difference between matching normalized timestamps
    pub max_skew: Option<f64>,
}

impl SyncReport {
    pub fn is_synced(&self) -> bool {
        self.missing_frames == 0 && self.unsynced.is_empty()
    }

    /// Human readable summary lines.
    pub fn messages(&self) -> Vec<String> {
        if self.missing_frames > 0 {
            return vec![format!("Missing {} frames", self.missing_frames)];
        }
        let mut lines = vec!["No missing frames".to_string()];
        if self.unsynced.is_empty() {
            lines.push("frames are synced!".to_string());
        } else {
            lines.push(format!(
                "These frames may not be exactly synchronized: {:?}",
                self.unsynced
            ));
        }
        if let Some(skew) = self.max_skew {
            lines.push(format!("Max skew between cameras: {:.3} ms", skew * 1000.0));
        }
        lines
    }
}

fn normalized(series: &[f64]) -> Vec<f64> {
    // the first sample is taken before the cadence settles
    let tail = series.get(1..).unwrap_or_default();
    match tail.first() {
        Some(&first) => tail.iter().map(|t| t - first).collect(),
        None => Vec::new(),
    }
}

fn off_cadence(series: &[f64], period: f64) -> impl Iterator<Item = usize> + '_ {
    let tolerance = period * 0.5;
    series
        .windows(2)
        .enumerate()
        .filter(move |(_, w)| {
            let gap = w[1] - w[0];
            gap < period - tolerance || gap > period + tolerance
        })
        .map(|(i, _)| i)
}

/// Compares two cameras' timestamp series recorded at `fps`.
pub fn check_sync(a: &[f64], b: &[f64], fps: f64) -> Result<SyncReport> {
    if !(fps > 0.0) {
        return Err(anyhow!("Frame rate must be positive, got {}", fps));
    }
    let a = normalized(a);
    let b = normalized(b);
    let missing_frames = a.len().abs_diff(b.len());
    if missing_frames > 0 {
        return Ok(SyncReport {
            missing_frames,
            unsynced: Vec::new(),
            max_skew: None,
        });
    }

    let period = 1.0 / fps;
    let mut unsynced: Vec<usize> = off_cadence(&a, period).chain(off_cadence(&b, period)).collect();
    unsynced.sort_unstable();
    unsynced.dedup();
    let max_skew = a
        .iter()
        .zip(&b)
        .map(|(x, y)| (x - y).abs())
        .fold(None, |acc: Option<f64>, d| Some(acc.map_or(d, |m| m.max(d))));

    Ok(SyncReport {
        missing_frames,
        unsynced,
        max_skew,
    })
}

/// Counts inter-arrival gaps longer than one and a half periods, each of which
/// means at least one frame was not captured on schedule.
pub fn count_late_intervals(timestamps: &[f64], fps: f64) -> usize {
    if !(fps > 0.0) {
        return 0;
    }
    let limit = 1.5 / fps;
    timestamps.windows(2).filter(|w| w[1] - w[0] > limit).count()
}
