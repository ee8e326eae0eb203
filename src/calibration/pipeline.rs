use super::{
    CalibrationBoard, CalibrationSession, DetectionOutcome, DetectionRow, DetectionStore, DetectionWorker, QueueItem,
};
use crate::barrier::SyncBarrier;
use crate::camera::CameraDevice;
use crate::capture::{CaptureConfig, CaptureHandle, CaptureReport, FrameConsumer};
use crate::config::CalibrationConfig;
use crate::frame::FrameRecord;
use crate::sink::FrameSink;
use crate::status::{CalibrationState, Status, StatusCell};
use crate::utils::{join_timeout, SessionClock};
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Capture-side consumer: detects the board in every frame and forwards hits.
struct DetectingConsumer {
    camera_id: usize,
    base_framenum: u64,
    board: Arc<dyn CalibrationBoard>,
    session: CalibrationSession,
    tx: SyncSender<QueueItem>,
}

impl FrameConsumer for DetectingConsumer {
    fn consume(&mut self, record: FrameRecord) -> Result<()> {
        let Some(detection) = self.board.detect_image(&record.frame) else {
            return Ok(());
        };
        let framenum = self.base_framenum + record.seq;
        let mut row = [DetectionRow::new(self.camera_id, framenum, record.timestamp, detection)];
        self.board.fill_points_rows(&mut row);
        let [row] = row;
        self.session.append(row);

        let item = QueueItem {
            camera_id: self.camera_id,
            framenum,
            timestamp: record.timestamp,
            frame: record.frame,
        };
        // never block the capture cadence on a slow consumer
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(anyhow!("Calibration queue full; frame {} not written", framenum)),
            Err(TrySendError::Disconnected(_)) => Err(anyhow!("Detection thread is gone")),
        }
    }
}

/// Devices and results of a finished calibration capture.
pub struct CalibrationRun {
    pub devices: Vec<(usize, Box<dyn CameraDevice>)>,
    pub reports: Vec<CaptureReport>,
    pub detection: Option<DetectionOutcome>,
}

/// One calibration capture run: a capture thread per camera doing online
/// detection, plus the detection thread draining their queue.
pub struct CalibrationCapture {
    running: Arc<AtomicBool>,
    captures: Vec<CaptureHandle>,
    detection: Option<JoinHandle<DetectionOutcome>>,
    status: StatusCell<CalibrationState>,
}

impl CalibrationCapture {
    /// Starts capturing. Each capture thread stops on its own when the
    /// configured duration runs out. With `barrier_timeout` set, cameras are
    /// held in lockstep and a camera that misses a cycle by more than the
    /// timeout ends the run.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        devices: Vec<(usize, Box<dyn CameraDevice>)>,
        sinks: BTreeMap<usize, Box<dyn FrameSink>>,
        board: Arc<dyn CalibrationBoard>,
        session: CalibrationSession,
        store: DetectionStore,
        config: &CalibrationConfig,
        barrier_timeout: Option<Duration>,
        clock: SessionClock,
        status: StatusCell<CalibrationState>,
    ) -> Result<Self> {
        if devices.is_empty() {
            return Err(anyhow!("No cameras to calibrate"));
        }
        let camera_ids: Vec<usize> = devices.iter().map(|(id, _)| *id).collect();
        let base_framenum = session.begin_run();
        let (tx, rx) = mpsc::sync_channel(config.queue_capacity.max(1));

        let worker = DetectionWorker::new(
            camera_ids.clone(),
            sinks,
            config.frame_process_threshold,
            session.clone(),
            store,
            status.clone(),
        );
        let detection = thread::Builder::new()
            .name("detection".to_string())
            .spawn(move || worker.run(rx))?;

        let barrier = barrier_timeout
            .filter(|_| devices.len() > 1)
            .map(|timeout| Arc::new(SyncBarrier::new(devices.len(), timeout)));
        let running = Arc::new(AtomicBool::new(true));
        let duration = config.duration.as_duration();
        status.set(CalibrationState::Capturing, "Capturing calibration frames...");
        info!(
            "Calibration capture on cameras {:?} for {}",
            camera_ids, config.duration
        );

        let mut captures = Vec::with_capacity(devices.len());
        for (camera_id, device) in devices {
            let consumer = DetectingConsumer {
                camera_id,
                base_framenum,
                board: Arc::clone(&board),
                session: session.clone(),
                tx: tx.clone(),
            };
            let mut capture = CaptureConfig::new(camera_id, config.fps, clock).with_duration(duration);
            if let Some(barrier) = &barrier {
                capture = capture.with_barrier(Arc::clone(barrier));
            }
            match CaptureHandle::spawn(device, Box::new(consumer), capture, Arc::clone(&running)) {
                Ok(handle) => captures.push(handle),
                Err(e) => {
                    running.store(false, Ordering::SeqCst);
                    if let Some(barrier) = &barrier {
                        barrier.abort();
                    }
                    return Err(e);
                }
            }
        }
        // the detection thread ends once every capture thread drops its sender
        drop(tx);

        Ok(Self {
            running,
            captures,
            detection: Some(detection),
            status,
        })
    }

    pub fn status(&self) -> Status<CalibrationState> {
        self.status.get()
    }

    /// Ends capturing early.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// True once every capture thread and the detection thread are done.
    pub fn is_finished(&self) -> bool {
        self.captures.iter().all(CaptureHandle::is_finished)
            && self.detection.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Waits for all threads, sharing one deadline, and hands back the
    /// devices.
    pub fn join(mut self, timeout: Duration) -> Result<CalibrationRun> {
        let deadline = Instant::now() + timeout;
        let mut devices = Vec::new();
        let mut reports = Vec::new();
        let mut failures = Vec::new();
        for capture in self.captures.drain(..) {
            let camera_id = capture.camera_id();
            match capture.join(deadline.saturating_duration_since(Instant::now())) {
                Ok(outcome) => {
                    devices.push((camera_id, outcome.device));
                    reports.push(outcome.report);
                }
                Err(e) => failures.push(e),
            }
        }

        let detection = match self.detection.take() {
            Some(handle) => match join_timeout(handle, deadline.saturating_duration_since(Instant::now())) {
                Ok(Ok(outcome)) => Some(outcome),
                Ok(Err(_)) => {
                    warn!("Detection thread panicked");
                    None
                }
                Err(_) => {
                    warn!("Detection thread did not finish within {:?}", timeout);
                    None
                }
            },
            None => None,
        };

        if let Some(e) = failures.into_iter().next() {
            return Err(e);
        }
        Ok(CalibrationRun {
            devices,
            reports,
            detection,
        })
    }
}

impl Drop for CalibrationCapture {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
