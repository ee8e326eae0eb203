use super::{DetectionRow, DetectionSet, DetectionStore};
use crate::utils::lock;
use anyhow::Result;
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Debug, Default)]
struct Inner {
    /// Every row since the session was created or reset
    rows: DetectionSet,
    /// Rows of the current capture run only
    run_rows: DetectionSet,
    run_base: u64,
    next_framenum: u64,
    error: Option<f64>,
    history: Vec<f64>,
}

/// Detection rows and solver results accumulated across capture runs.
///
/// Clones share state. Readers get deep copies, so a solve never observes a
/// capture run appending rows.
#[derive(Debug, Clone, Default)]
pub struct CalibrationSession {
    inner: Arc<Mutex<Inner>>,
}

impl CalibrationSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from the rows already in `store`, so the next write extends
    /// the stored set instead of replacing it. A missing store gives an empty
    /// session.
    pub fn from_store(store: &DetectionStore) -> Result<Self> {
        let session = Self::new();
        if !store.exists() {
            return Ok(session);
        }
        let rows = store.load()?;
        let total: usize = rows.values().map(Vec::len).sum();
        {
            let mut inner = lock(&session.inner);
            inner.next_framenum = rows.values().flatten().map(|r| r.framenum + 1).max().unwrap_or(0);
            inner.rows = rows;
        }
        info!("Loaded {} stored detections from {:?}", total, store.path());
        Ok(session)
    }

    /// Starts a capture run and returns its first frame number. Frame numbers
    /// keep increasing across runs so rows from different runs never collide.
    pub fn begin_run(&self) -> u64 {
        let mut inner = lock(&self.inner);
        inner.run_rows.clear();
        inner.run_base = inner.next_framenum;
        inner.run_base
    }

    pub fn append(&self, row: DetectionRow) {
        let mut inner = lock(&self.inner);
        inner.next_framenum = inner.next_framenum.max(row.framenum + 1);
        inner.run_rows.entry(row.camera_id).or_default().push(row.clone());
        inner.rows.entry(row.camera_id).or_default().push(row);
    }

    /// Deep copy of all accumulated rows.
    pub fn snapshot(&self) -> DetectionSet {
        lock(&self.inner).rows.clone()
    }

    /// Deep copy of the current run's rows.
    pub fn snapshot_run(&self) -> DetectionSet {
        lock(&self.inner).run_rows.clone()
    }

    pub fn row_count(&self, camera_id: usize) -> usize {
        lock(&self.inner).rows.get(&camera_id).map_or(0, Vec::len)
    }

    /// Latest reprojection error, `None` before the first successful solve.
    pub fn error(&self) -> Option<f64> {
        lock(&self.inner).error
    }

    pub fn history(&self) -> Vec<f64> {
        lock(&self.inner).history.clone()
    }

    pub fn record_error(&self, error: f64) {
        let mut inner = lock(&self.inner);
        inner.error = Some(error);
        inner.history.push(error);
    }

    /// Forgets all rows and results.
    pub fn reset(&self) {
        *lock(&self.inner) = Inner::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Detection;

    fn row(camera_id: usize, framenum: u64) -> DetectionRow {
        DetectionRow::new(
            camera_id,
            framenum,
            0.0,
            Detection {
                corners: vec![[0.0, 0.0]],
                ids: vec![0],
            },
        )
    }

    #[test]
    fn test_runs_accumulate_and_frame_numbers_advance() {
        let session = CalibrationSession::new();
        assert_eq!(session.begin_run(), 0);
        session.append(row(0, 0));
        session.append(row(0, 4));
        session.append(row(1, 2));

        assert_eq!(session.begin_run(), 5);
        session.append(row(1, 5));
        assert_eq!(session.snapshot_run().len(), 1);
        assert_eq!(session.row_count(0), 2);
        assert_eq!(session.row_count(1), 2);
    }

    #[test]
    fn test_snapshot_is_independent() {
        let session = CalibrationSession::new();
        session.append(row(0, 0));
        let snapshot = session.snapshot();
        session.append(row(0, 1));
        assert_eq!(snapshot[&0].len(), 1);
        assert_eq!(session.row_count(0), 2);
    }

    #[test]
    fn test_reset_clears_everything() {
        let session = CalibrationSession::new();
        session.append(row(0, 9));
        session.record_error(0.5);
        session.reset();
        assert!(session.snapshot().is_empty());
        assert_eq!(session.error(), None);
        assert!(session.history().is_empty());
        assert_eq!(session.begin_run(), 0);
    }

    #[test]
    fn test_from_store_resumes_frame_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let store = DetectionStore::new(dir.path().join("detections.json"));
        assert!(CalibrationSession::from_store(&store).unwrap().snapshot().is_empty());

        let earlier = CalibrationSession::new();
        earlier.append(row(0, 0));
        earlier.append(row(1, 6));
        store.save(&earlier.snapshot()).unwrap();

        let session = CalibrationSession::from_store(&store).unwrap();
        assert_eq!(session.row_count(0), 1);
        assert_eq!(session.row_count(1), 1);
        assert_eq!(session.begin_run(), 7);
        assert!(session.snapshot_run().is_empty());
    }
}
