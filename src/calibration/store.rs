use super::DetectionSet;
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Durable hand-off of detection rows from the detection thread to the
/// solver, stored as JSON.
#[derive(Debug, Clone)]
pub struct DetectionStore {
    path: PathBuf,
}

impl DetectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Replaces the stored set. The file is written next to the target and
    /// renamed, so a reader never sees a partial file.
    pub fn save(&self, rows: &DetectionSet) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let file = File::create(&tmp).with_context(|| format!("Failed to create {:?}", tmp))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, rows).context("Failed to serialize detections")?;
        writer.flush()?;
        drop(writer);
        fs::rename(&tmp, &self.path).with_context(|| format!("Failed to replace {:?}", self.path))?;

        let total: usize = rows.values().map(Vec::len).sum();
        debug!("Stored {} detections in {:?}", total, self.path);
        Ok(())
    }

    pub fn load(&self) -> Result<DetectionSet> {
        let file = File::open(&self.path).with_context(|| format!("Failed to open {:?}", self.path))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse detections in {:?}", self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{Detection, DetectionRow};

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = DetectionStore::new(dir.path().join("nested").join("detections.json"));
        assert!(store.load().is_err());

        let mut rows = DetectionSet::new();
        let detection = Detection {
            corners: vec![[1.5, 2.5]],
            ids: vec![3],
        };
        rows.insert(1, vec![DetectionRow::new(1, 7, 0.25, detection)]);
        store.save(&rows).unwrap();

        assert!(store.exists());
        assert_eq!(store.load().unwrap(), rows);
        assert!(!store.path().with_extension("json.tmp").exists());
    }
}
