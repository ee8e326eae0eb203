//! Per-frame timestamp files written next to each video.

use anyhow::{anyhow, Context, Result};
use std::path::Path;

/// Parallel per-frame columns of one recording.
#[derive(Debug, Clone, Copy)]
pub struct TimestampLog<'a> {
    pub sequence: &'a [u64],
    pub timestamps: &'a [f64],
    /// Tracked pixel values; empty when no tracking point was configured
    pub tracked: &'a [f64],
}

impl TimestampLog<'_> {
    /// Writes `sequence,timestamp[,tracked]` rows with a header line.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if self.sequence.len() != self.timestamps.len() {
            return Err(anyhow!(
                "{} sequence numbers for {} timestamps",
                self.sequence.len(),
                self.timestamps.len()
            ));
        }
        let with_tracking = !self.tracked.is_empty();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }

        let mut writer = csv::Writer::from_path(path).with_context(|| format!("Failed to create {:?}", path))?;
        if with_tracking {
            writer.write_record(["sequence", "timestamp", "tracked"])?;
        } else {
            writer.write_record(["sequence", "timestamp"])?;
        }
        for (i, (seq, ts)) in self.sequence.iter().zip(self.timestamps).enumerate() {
            let mut record = vec![seq.to_string(), format!("{:.9}", ts)];
            if with_tracking {
                let value = self.tracked.get(i).copied().unwrap_or(f64::NAN);
                record.push(value.to_string());
            }
            writer.write_record(&record)?;
        }
        writer.flush().with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }
}

/// Reads the timestamp column of a timestamp file.
///
/// Accepts files written by [`TimestampLog`] as well as headerless files with
/// one timestamp per line.
pub fn read_timestamps(path: impl AsRef<Path>) -> Result<Vec<f64>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {:?}", path))?;

    let mut column = 0;
    let mut timestamps = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Failed to read {:?}", path))?;
        if line == 0 {
            if let Some(idx) = record.iter().position(|f| f.trim() == "timestamp") {
                column = idx;
                continue;
            }
        }
        let field = record
            .get(column)
            .ok_or_else(|| anyhow!("{:?} line {}: missing column {}", path, line + 1, column))?;
        let value: f64 = field
            .trim()
            .parse()
            .with_context(|| format!("{:?} line {}: invalid timestamp {:?}", path, line + 1, field))?;
        timestamps.push(value);
    }
    Ok(timestamps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_written_log_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("TIMESTAMPS_cam1.csv");
        TimestampLog {
            sequence: &[0, 1, 2],
            timestamps: &[0.5, 0.51, 0.52],
            tracked: &[12.0, 13.0, 14.0],
        }
        .write(&path)
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("sequence,timestamp,tracked\n"));
        assert_eq!(read_timestamps(&path).unwrap(), vec![0.5, 0.51, 0.52]);
    }

    #[test]
    fn test_reads_headerless_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("times.csv");
        std::fs::write(&path, "1.0\n1.5\n2.0\n").unwrap();
        assert_eq!(read_timestamps(&path).unwrap(), vec![1.0, 1.5, 2.0]);
    }

    #[test]
    fn test_mismatched_columns_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let log = TimestampLog {
            sequence: &[0],
            timestamps: &[],
            tracked: &[],
        };
        assert!(log.write(dir.path().join("bad.csv")).is_err());
    }
}
