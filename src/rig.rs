//! Multi-camera orchestration: the operations a user interface calls.

use crate::analysis::{check_sync, SyncReport};
use crate::barrier::SyncBarrier;
use crate::calibration::{CalibrationBoard, CalibrationCapture, CalibrationRun, CalibrationSession, DetectionStore};
use crate::camera::{CameraDevice, CameraSession};
use crate::capture::{CaptureConfig, CaptureHandle, CaptureReport, TriggerWait};
use crate::config::RigConfig;
use crate::error::CoreError;
use crate::naming::{RecordingName, RecordingPaths};
use crate::recording::{RecordingOptions, RecordingSession, RecordingSummary};
use crate::sink::{compress_video, FrameSink, SinkFactory, SinkSpec};
use crate::status::{CalibrationState, CaptureState, StatusCell};
use crate::utils::{SessionClock, ThreadGroup};
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Snapshot of one camera for display.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraStatus {
    pub id: usize,
    pub name: String,
    pub state: CaptureState,
    pub text: String,
    pub buffered: usize,
    pub written: usize,
    pub dropped: u64,
}

/// Outcome of saving a recording.
#[derive(Debug, Clone)]
pub struct SaveReport {
    pub summaries: Vec<RecordingSummary>,
    /// False when at least one camera recorded nothing and every video was
    /// discarded
    pub kept: bool,
    /// Timing comparison of the first two cameras
    pub sync: Option<SyncReport>,
}

/// A set of cameras driven together.
pub struct Rig {
    config: RigConfig,
    clock: SessionClock,
    cameras: Vec<CameraSession>,
    recordings: Vec<RecordingSession>,
    captures: Vec<CaptureHandle>,
    last_status: BTreeMap<usize, (CaptureState, String)>,
    running: Arc<AtomicBool>,
    calibration: Option<CalibrationCapture>,
    background: ThreadGroup<Result<()>>,
}

impl Rig {
    pub fn new(config: RigConfig, cameras: Vec<CameraSession>) -> Self {
        Self {
            config,
            clock: SessionClock::new(),
            cameras,
            recordings: Vec::new(),
            captures: Vec::new(),
            last_status: BTreeMap::new(),
            running: Arc::new(AtomicBool::new(false)),
            calibration: None,
            background: ThreadGroup::new(),
        }
    }

    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    pub fn clock(&self) -> SessionClock {
        self.clock
    }

    pub fn cameras(&self) -> &[CameraSession] {
        &self.cameras
    }

    pub fn camera_mut(&mut self, id: usize) -> Result<&mut CameraSession, CoreError> {
        self.cameras
            .iter_mut()
            .find(|c| c.id() == id)
            .ok_or(CoreError::UnknownCamera(id))
    }

    pub fn is_recording(&self) -> bool {
        !self.captures.is_empty()
    }

    pub fn has_recording(&self) -> bool {
        !self.recordings.is_empty()
    }

    fn ensure_idle(&self) -> Result<(), CoreError> {
        if !self.captures.is_empty() || self.calibration.is_some() {
            return Err(CoreError::AlreadyRunning);
        }
        Ok(())
    }

    /// Resolves file names and opens one sink per camera.
    pub fn setup_recording(
        &mut self,
        name: &RecordingName<'_>,
        sinks: &mut dyn SinkFactory,
    ) -> Result<Vec<RecordingPaths>> {
        self.ensure_idle()?;
        if !self.recordings.is_empty() {
            return Err(CoreError::RecordingOpen.into());
        }

        // check every name before creating any file
        let paths = self
            .cameras
            .iter()
            .map(|camera| name.paths(camera.details()))
            .collect::<Result<Vec<_>, _>>()?;

        let options = RecordingOptions::from_config(&self.config.recording);
        let mut recordings = Vec::with_capacity(self.cameras.len());
        for (camera, paths) in self.cameras.iter().zip(&paths) {
            let (width, height) = camera.frame_size();
            let sink = sinks.create(&SinkSpec {
                camera_id: camera.id(),
                path: &paths.video,
                width,
                height,
                format: camera.pixel_format(),
                fps: name.fps,
            })?;
            recordings.push(RecordingSession::new(
                camera.id(),
                sink,
                Some(paths.clone()),
                options.clone(),
            ));
        }
        for paths in &paths {
            info!("Recording to {:?}", paths.video);
        }
        self.recordings = recordings;
        Ok(paths)
    }

    /// Starts one capture thread per camera feeding its recording.
    pub fn start_recording(&mut self) -> Result<()> {
        self.ensure_idle()?;
        if self.recordings.is_empty() {
            return Err(CoreError::RecordingNotSetUp.into());
        }
        let rec = self.config.recording.clone();
        let barrier = (rec.synchronize && self.cameras.len() > 1)
            .then(|| Arc::new(SyncBarrier::new(self.cameras.len(), rec.barrier_timeout())));
        let trigger = rec.trigger.then(|| TriggerWait {
            timeout: rec.trigger_timeout(),
            align_start_to_second: rec.align_start_to_second,
        });

        for recording in &mut self.recordings {
            recording.start()?;
        }
        self.running = Arc::new(AtomicBool::new(true));
        self.last_status.clear();

        let mut failure = None;
        for (camera, recording) in self.cameras.iter_mut().zip(&self.recordings) {
            let mut config = CaptureConfig::new(camera.id(), rec.fps, self.clock)
                .with_poll_interval(rec.capture_poll_interval());
            if let Some(barrier) = &barrier {
                config = config.with_barrier(Arc::clone(barrier));
            }
            if let Some(trigger) = &trigger {
                config = config.with_trigger(trigger.clone());
            }
            let spawned = camera.lend_device().map_err(anyhow::Error::from).and_then(|device| {
                CaptureHandle::spawn(device, Box::new(recording.producer()), config, Arc::clone(&self.running))
            });
            match spawned {
                Ok(handle) => self.captures.push(handle),
                Err(e) => {
                    failure = Some((camera.id(), e));
                    break;
                }
            }
        }

        if let Some((id, e)) = failure {
            error!("Camera {}: failed to start capture: {}", id, e);
            if let Some(barrier) = &barrier {
                barrier.abort();
            }
            if let Err(stop_err) = self.stop_recording() {
                warn!("{}", stop_err);
            }
            for recording in &mut self.recordings {
                recording.pause();
            }
            return Err(e);
        }
        info!("Recording started on {} cameras at {} fps", self.captures.len(), rec.fps);
        Ok(())
    }

    /// Stops every capture thread and takes the devices back.
    pub fn stop_recording(&mut self) -> Result<Vec<CaptureReport>> {
        self.running.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + self.config.recording.join_timeout();
        let mut reports = Vec::new();
        let mut first_error = None;
        for handle in std::mem::take(&mut self.captures) {
            let id = handle.camera_id();
            let status = handle.status();
            self.last_status.insert(id, (status.state, status.text));
            match handle.join(deadline.saturating_duration_since(Instant::now())) {
                Ok(outcome) => {
                    self.restore(id, outcome.device);
                    reports.push(outcome.report);
                }
                Err(e) => {
                    error!("{}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }

    fn restore(&mut self, id: usize, device: Box<dyn CameraDevice>) {
        match self.cameras.iter_mut().find(|c| c.id() == id) {
            Some(camera) => camera.restore_device(device),
            None => warn!("Returned device for unknown camera {}", id),
        }
    }

    /// Releases every recording. If any camera recorded nothing, all videos
    /// are discarded so the set stays consistent; otherwise timestamp logs
    /// are written and, optionally, videos are transcoded in the background.
    pub fn save(&mut self, compress: bool) -> Result<SaveReport> {
        if self.recordings.is_empty() {
            return Err(CoreError::RecordingNotSetUp.into());
        }
        if self.is_recording() {
            self.stop_recording()?;
        }

        let mut recordings = std::mem::take(&mut self.recordings);
        let mut summaries = Vec::with_capacity(recordings.len());
        for recording in &mut recordings {
            summaries.push(recording.release()?);
        }

        if let Some(empty) = summaries.iter().find(|s| s.written == 0) {
            warn!(
                "Camera {} recorded no frames; deleting the videos of every camera",
                empty.camera_id
            );
            for recording in &recordings {
                recording.remove_files()?;
            }
            return Ok(SaveReport {
                summaries,
                kept: false,
                sync: None,
            });
        }

        for (recording, summary) in recordings.iter().zip(&summaries) {
            recording.persist(summary)?;
            let late = summary.late_frames(self.config.recording.fps);
            if late > 0 || summary.dropped > 0 {
                warn!(
                    "Camera {}: {} late frames, {} evicted",
                    summary.camera_id, late, summary.dropped
                );
            }
        }

        let sync = match summaries.as_slice() {
            [a, b, ..] => {
                let report = check_sync(&a.timestamps, &b.timestamps, self.config.recording.fps)?;
                for line in report.messages() {
                    info!("{}", line);
                }
                Some(report)
            }
            _ => None,
        };

        if compress {
            for recording in &recordings {
                let Some(paths) = recording.paths() else {
                    continue;
                };
                let video = paths.video.clone();
                self.background
                    .spawn(format!("compress-{}", recording.camera_id()), move || {
                        compress_video(&video).map(|_| ())
                    })?;
            }
        }

        Ok(SaveReport {
            summaries,
            kept: true,
            sync,
        })
    }

    /// Discards the current recording and its files.
    pub fn delete(&mut self) -> Result<()> {
        if self.recordings.is_empty() {
            return Err(CoreError::RecordingNotSetUp.into());
        }
        if self.is_recording() {
            if let Err(e) = self.stop_recording() {
                warn!("{}", e);
            }
        }
        for mut recording in std::mem::take(&mut self.recordings) {
            recording.delete()?;
        }
        info!("Recording deleted");
        Ok(())
    }

    /// Grabs one frame from an idle camera and writes it as an image.
    pub fn snap(&mut self, id: usize, path: impl AsRef<Path>) -> Result<()> {
        let frame = self.camera_mut(id)?.snap()?;
        frame.save(path)
    }

    pub fn status(&self) -> Vec<CameraStatus> {
        self.cameras
            .iter()
            .map(|camera| {
                let id = camera.id();
                let (state, text) = match self.captures.iter().find(|h| h.camera_id() == id) {
                    Some(handle) => {
                        let status = handle.status();
                        (status.state, status.text)
                    }
                    None => self
                        .last_status
                        .get(&id)
                        .cloned()
                        .unwrap_or((CaptureState::Idle, String::new())),
                };
                let recording = self.recordings.iter().find(|r| r.camera_id() == id);
                CameraStatus {
                    id,
                    name: camera.name().to_string(),
                    state,
                    text,
                    buffered: recording.map_or(0, RecordingSession::buffered),
                    written: recording.map_or(0, RecordingSession::frames_written),
                    dropped: recording.map_or(0, RecordingSession::dropped_frames),
                }
            })
            .collect()
    }

    /// Starts a calibration capture run on every camera. Detections are
    /// stored from `session`; build it with [`CalibrationSession::from_store`]
    /// to keep the rows of earlier runs.
    pub fn start_calibration(
        &mut self,
        board: Arc<dyn CalibrationBoard>,
        session: &CalibrationSession,
        sinks: Option<&mut dyn SinkFactory>,
        status: StatusCell<CalibrationState>,
    ) -> Result<()> {
        self.ensure_idle()?;
        let config = self.config.calibration.clone();

        let mut videos: BTreeMap<usize, Box<dyn FrameSink>> = BTreeMap::new();
        if let Some(factory) = sinks {
            let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
            for camera in &self.cameras {
                let (width, height) = camera.frame_size();
                let file = format!(
                    "{}_calibration_{}.{}",
                    camera.name().replace(char::is_whitespace, ""),
                    stamp,
                    self.config.recording.codec.extension()
                );
                let path = config.output_dir.join(file);
                let sink = factory.create(&SinkSpec {
                    camera_id: camera.id(),
                    path: &path,
                    width,
                    height,
                    format: camera.pixel_format(),
                    fps: config.fps,
                })?;
                videos.insert(camera.id(), sink);
            }
        }

        let mut devices = Vec::with_capacity(self.cameras.len());
        let mut refused = None;
        for camera in &mut self.cameras {
            match camera.lend_device() {
                Ok(device) => devices.push((camera.id(), device)),
                Err(e) => {
                    refused = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = refused {
            for (id, device) in devices {
                self.restore(id, device);
            }
            return Err(e.into());
        }

        let capture = CalibrationCapture::start(
            devices,
            videos,
            board,
            session.clone(),
            DetectionStore::new(config.detections_path()),
            &config,
            self.config.recording.synchronize.then(|| self.config.recording.barrier_timeout()),
            self.clock,
            status,
        )?;
        self.calibration = Some(capture);
        Ok(())
    }

    pub fn calibration_finished(&self) -> bool {
        self.calibration.as_ref().map_or(true, CalibrationCapture::is_finished)
    }

    pub fn stop_calibration(&self) {
        if let Some(capture) = &self.calibration {
            capture.stop();
        }
    }

    /// Waits for the calibration run and takes the devices back.
    pub fn finish_calibration(&mut self, timeout: Duration) -> Result<CalibrationRun> {
        let capture = self
            .calibration
            .take()
            .ok_or_else(|| anyhow!("No calibration capture is running"))?;
        let mut run = capture.join(timeout)?;
        for (id, device) in std::mem::take(&mut run.devices) {
            self.restore(id, device);
        }
        Ok(run)
    }

    /// Waits for background work such as video compression.
    pub fn wait_background(&mut self, timeout: Duration) {
        for (name, result) in self.background.join_all(timeout) {
            if let Some(Err(e)) = result {
                error!("{}: {:#}", name, e);
            }
        }
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(capture) = &self.calibration {
            capture.stop();
        }
        if !self.captures.is_empty() {
            if let Err(e) = self.stop_recording() {
                error!("{}", e);
            }
        }
    }
}
