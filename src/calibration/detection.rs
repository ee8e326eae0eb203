use super::{CalibrationSession, DetectionStore};
use crate::frame::Frame;
use crate::sink::FrameSink;
use crate::status::{CalibrationState, StatusCell};
use std::collections::BTreeMap;
use std::sync::mpsc::Receiver;
use tracing::{debug, error, info, warn};

/// A frame with a detected board, on its way from a capture thread to the
/// detection thread.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub camera_id: usize,
    pub framenum: u64,
    pub timestamp: f64,
    pub frame: Frame,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionOutcome {
    /// Frames received per camera
    pub frames: BTreeMap<usize, usize>,
    /// Successful writes of the detection store
    pub serializations: usize,
}

/// Single consumer of the calibration frame queue.
///
/// Writes every frame to its camera's sink and rewrites the detection store
/// once every camera has contributed `threshold` new detections since the
/// last write.
pub struct DetectionWorker {
    camera_ids: Vec<usize>,
    sinks: BTreeMap<usize, Box<dyn FrameSink>>,
    pending: BTreeMap<usize, usize>,
    threshold: usize,
    session: CalibrationSession,
    store: DetectionStore,
    status: StatusCell<CalibrationState>,
    outcome: DetectionOutcome,
}

impl DetectionWorker {
    pub fn new(
        camera_ids: Vec<usize>,
        sinks: BTreeMap<usize, Box<dyn FrameSink>>,
        threshold: usize,
        session: CalibrationSession,
        store: DetectionStore,
        status: StatusCell<CalibrationState>,
    ) -> Self {
        let pending = camera_ids.iter().map(|&id| (id, 0)).collect();
        Self {
            camera_ids,
            sinks,
            pending,
            threshold: threshold.max(1),
            session,
            store,
            status,
            outcome: DetectionOutcome::default(),
        }
    }

    pub fn serializations(&self) -> usize {
        self.outcome.serializations
    }

    pub fn handle(&mut self, item: QueueItem) {
        if let Some(sink) = self.sinks.get_mut(&item.camera_id) {
            if let Err(e) = sink.write(&item.frame) {
                warn!("Camera {}: failed to write calibration frame {}: {}", item.camera_id, item.framenum, e);
            }
        }
        *self.outcome.frames.entry(item.camera_id).or_default() += 1;
        *self.pending.entry(item.camera_id).or_default() += 1;

        let ready = self
            .camera_ids
            .iter()
            .all(|id| self.pending.get(id).is_some_and(|&n| n >= self.threshold));
        if ready {
            self.serialize();
        }
    }

    /// Writes the store. On failure the counters are kept so the next frame
    /// retries.
    fn serialize(&mut self) -> bool {
        match self.store.save(&self.session.snapshot()) {
            Ok(()) => {
                self.outcome.serializations += 1;
                self.pending.values_mut().for_each(|n| *n = 0);
                debug!("Detection store updated ({} writes)", self.outcome.serializations);
                true
            }
            Err(e) => {
                warn!("Failed to store detections, retrying with the next batch: {:#}", e);
                false
            }
        }
    }

    /// Final write and sink release once every producer is done.
    pub fn finish(&mut self) -> DetectionOutcome {
        for (id, sink) in self.sinks.iter_mut() {
            if let Err(e) = sink.release() {
                error!("Camera {}: failed to close calibration video: {}", id, e);
            }
        }
        let total: usize = self.outcome.frames.values().sum();
        if total == 0 {
            warn!("No camera detected the calibration board");
            self.status.set(CalibrationState::Failed, "No detections");
            return self.outcome.clone();
        }
        if self.pending.values().any(|&n| n > 0) && !self.serialize() {
            self.status.set(CalibrationState::Failed, "Failed to store detections");
            return self.outcome.clone();
        }
        info!("Detection finished: {} frames with a board", total);
        self.status.set(
            CalibrationState::ReadyToCalibrate,
            format!("Ready to calibrate ({} detections)", total),
        );
        self.outcome.clone()
    }

    /// Drains the queue until every sender is gone.
    pub fn run(mut self, rx: Receiver<QueueItem>) -> DetectionOutcome {
        while let Ok(item) = rx.recv() {
            self.handle(item);
        }
        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{Detection, DetectionRow};
    use crate::frame::PixelFormat;
    use crate::sink::MemorySink;

    fn feed(worker: &mut DetectionWorker, session: &CalibrationSession, camera_id: usize, framenum: u64) {
        session.append(DetectionRow::new(
            camera_id,
            framenum,
            0.0,
            Detection {
                corners: vec![[1.0, 1.0]],
                ids: vec![0],
            },
        ));
        worker.handle(QueueItem {
            camera_id,
            framenum,
            timestamp: 0.0,
            frame: Frame::new(4, 4, PixelFormat::Mono8),
        });
    }

    fn worker(dir: &std::path::Path, session: &CalibrationSession) -> (DetectionWorker, DetectionStore) {
        let store = DetectionStore::new(dir.join("detections.json"));
        let worker = DetectionWorker::new(
            vec![0, 1],
            BTreeMap::new(),
            2,
            session.clone(),
            store.clone(),
            StatusCell::new(CalibrationState::Capturing),
        );
        (worker, store)
    }

    #[test]
    fn test_store_written_only_when_every_camera_reaches_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let session = CalibrationSession::new();
        let (mut worker, store) = worker(dir.path(), &session);

        feed(&mut worker, &session, 0, 0);
        feed(&mut worker, &session, 0, 1);
        feed(&mut worker, &session, 1, 0);
        assert_eq!(worker.serializations(), 0);
        assert!(!store.exists());

        feed(&mut worker, &session, 1, 1);
        assert_eq!(worker.serializations(), 1);
        assert_eq!(store.load().unwrap()[&1].len(), 2);

        // counters restart after a write
        feed(&mut worker, &session, 0, 2);
        feed(&mut worker, &session, 1, 2);
        assert_eq!(worker.serializations(), 1);
    }

    #[test]
    fn test_failed_store_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        // a directory where the store file should be makes the rename fail
        std::fs::create_dir(dir.path().join("detections.json")).unwrap();
        std::fs::write(dir.path().join("detections.json").join("x"), b"").unwrap();
        let session = CalibrationSession::new();
        let (mut worker, _) = worker(dir.path(), &session);

        for n in 0..2 {
            feed(&mut worker, &session, 0, n);
            feed(&mut worker, &session, 1, n);
        }
        assert_eq!(worker.serializations(), 0);

        std::fs::remove_dir_all(dir.path().join("detections.json")).unwrap();
        feed(&mut worker, &session, 0, 2);
        assert_eq!(worker.serializations(), 1);
    }

    #[test]
    fn test_run_finishes_when_senders_drop() {
        let dir = tempfile::tempdir().unwrap();
        let session = CalibrationSession::new();
        let store = DetectionStore::new(dir.path().join("detections.json"));
        let status = StatusCell::new(CalibrationState::Capturing);
        let sink = MemorySink::counting();
        let mut sinks: BTreeMap<usize, Box<dyn FrameSink>> = BTreeMap::new();
        sinks.insert(0, Box::new(sink.clone()));
        let worker = DetectionWorker::new(vec![0], sinks, 10, session.clone(), store.clone(), status.clone());

        let (tx, rx) = std::sync::mpsc::sync_channel(8);
        let consumer = std::thread::spawn(move || worker.run(rx));
        for n in 0..3 {
            tx.send(QueueItem {
                camera_id: 0,
                framenum: n,
                timestamp: 0.0,
                frame: Frame::new(4, 4, PixelFormat::Mono8),
            })
            .unwrap();
        }
        drop(tx);

        let outcome = consumer.join().unwrap();
        assert_eq!(outcome.frames[&0], 3);
        // below threshold during the run; the final write still happens
        assert_eq!(outcome.serializations, 1);
        assert!(store.exists());
        assert_eq!(sink.written(), 3);
        assert!(sink.is_released());
        assert_eq!(status.state(), CalibrationState::ReadyToCalibrate);
    }

    #[test]
    fn test_finish_without_detections_fails() {
        let dir = tempfile::tempdir().unwrap();
        let session = CalibrationSession::new();
        let store = DetectionStore::new(dir.path().join("detections.json"));
        let status = StatusCell::new(CalibrationState::Capturing);
        let mut worker = DetectionWorker::new(vec![0, 1], BTreeMap::new(), 2, session, store.clone(), status.clone());

        let outcome = worker.finish();
        assert_eq!(outcome.serializations, 0);
        assert_eq!(status.state(), CalibrationState::Failed);
        assert_eq!(status.get().text, "No detections");
        assert!(!store.exists());
    }

    #[test]
    fn test_second_session_extends_stored_detections() {
        let dir = tempfile::tempdir().unwrap();

        let first = CalibrationSession::new();
        let (mut first_worker, store) = worker(dir.path(), &first);
        let base = first.begin_run();
        for n in 0..3 {
            feed(&mut first_worker, &first, n % 2, base + n as u64);
        }
        first_worker.finish();
        assert_eq!(store.load().unwrap().values().map(Vec::len).sum::<usize>(), 3);

        // a later process starts from what the first one stored
        let second = CalibrationSession::from_store(&store).unwrap();
        let (mut second_worker, _) = worker(dir.path(), &second);
        let base = second.begin_run();
        assert_eq!(base, 3);
        for n in 0..3 {
            feed(&mut second_worker, &second, n % 2, base + n as u64);
        }
        second_worker.finish();

        let stored = store.load().unwrap();
        let mut framenums: Vec<u64> = stored.values().flatten().map(|r| r.framenum).collect();
        framenums.sort_unstable();
        assert_eq!(framenums, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(second.snapshot_run().values().map(Vec::len).sum::<usize>(), 3);
    }
}
