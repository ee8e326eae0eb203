//! Buffered per-camera recording.
//!
//! The capture thread appends frames to a bounded FIFO; a flush thread pops
//! them from the other end and writes them to the [`FrameSink`]. Disk latency
//! therefore never stalls the capture cadence. When the FIFO is full the
//! oldest frame is evicted and counted.

use crate::analysis::count_late_intervals;
use crate::capture::FrameConsumer;
use crate::config::RecordingConfig;
use crate::error::CoreError;
use crate::frame::FrameRecord;
use crate::naming::RecordingPaths;
use crate::sink::{FrameSink, TimestampLog};
use crate::utils::lock;
use anyhow::{anyhow, Context, Result};
use std::collections::VecDeque;
use std::fs;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Longest time the capture thread waits for the flush thread to empty the
/// buffer when it stops.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RecordingOptions {
    pub capacity: usize,
    pub poll_interval: Duration,
    /// Pixel `[x, y]` sampled in every written frame
    pub tracking_point: Option<[u32; 2]>,
    /// Write from a background thread. Without it frames stay buffered until
    /// [`RecordingSession::release`].
    pub background_flush: bool,
}

impl RecordingOptions {
    pub fn from_config(config: &RecordingConfig) -> Self {
        Self {
            capacity: config.buffer_capacity,
            poll_interval: config.flush_poll_interval(),
            tracking_point: config.tracking_point,
            background_flush: true,
        }
    }
}

impl Default for RecordingOptions {
    fn default() -> Self {
        Self::from_config(&RecordingConfig::default())
    }
}

#[derive(Debug)]
struct Buffer {
    frames: VecDeque<FrameRecord>,
    capacity: usize,
    dropped: u64,
    /// Mirrors the session's active flag; checked under the lock so no frame
    /// slips in after release
    accepting: bool,
}

#[derive(Debug, Default)]
struct WriteLog {
    timestamps: Vec<f64>,
    sequence: Vec<u64>,
    tracked: Vec<f64>,
    failures: u64,
}

#[derive(Debug)]
struct Shared {
    buffer: Mutex<Buffer>,
    log: Mutex<WriteLog>,
    active: AtomicBool,
    flushing: AtomicBool,
    tracking_point: Option<[u32; 2]>,
}

impl Shared {
    fn acquire(&self, record: FrameRecord) -> bool {
        let mut buffer = lock(&self.buffer);
        if !buffer.accepting {
            return false;
        }
        if buffer.frames.len() >= buffer.capacity {
            buffer.frames.pop_front();
            buffer.dropped += 1;
        }
        buffer.frames.push_back(record);
        true
    }

    fn pop(&self) -> Option<FrameRecord> {
        lock(&self.buffer).frames.pop_front()
    }

    fn write_frame(&self, sink: &mut dyn FrameSink, record: FrameRecord) {
        if let Err(e) = sink.write(&record.frame) {
            warn!("Failed to write frame {}: {}", record.seq, e);
            lock(&self.log).failures += 1;
            return;
        }
        let tracked = self
            .tracking_point
            .map(|[x, y]| record.frame.sample(x, y, 0).unwrap_or(f64::NAN));
        let mut log = lock(&self.log);
        log.timestamps.push(record.timestamp);
        log.sequence.push(record.seq);
        if let Some(value) = tracked {
            log.tracked.push(value);
        }
    }

    fn drain_into(&self, sink: &mut dyn FrameSink) {
        while let Some(record) = self.pop() {
            self.write_frame(sink, record);
        }
    }
}

fn flush_loop(shared: Arc<Shared>, mut sink: Box<dyn FrameSink>, poll: Duration) -> Box<dyn FrameSink> {
    loop {
        match shared.pop() {
            Some(record) => shared.write_frame(sink.as_mut(), record),
            None if !shared.active.load(Ordering::SeqCst) => break,
            None => thread::sleep(poll),
        }
    }
    shared.flushing.store(false, Ordering::SeqCst);
    sink
}

/// What a released recording wrote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordingSummary {
    pub camera_id: usize,
    pub written: usize,
    /// Frames evicted from a full buffer
    pub dropped: u64,
    /// Frames the sink rejected
    pub failures: u64,
    pub timestamps: Vec<f64>,
    pub sequence: Vec<u64>,
    pub tracked: Vec<f64>,
}

impl RecordingSummary {
    /// Inter-arrival gaps over one and a half periods.
    pub fn late_frames(&self, fps: f64) -> usize {
        count_late_intervals(&self.timestamps, fps)
    }
}

/// Producer end of a recording, handed to the capture thread.
pub struct RecordingProducer {
    shared: Arc<Shared>,
}

impl FrameConsumer for RecordingProducer {
    fn consume(&mut self, record: FrameRecord) -> Result<()> {
        if !self.shared.acquire(record) {
            return Err(anyhow!("Recording is not active"));
        }
        Ok(())
    }

    /// Waits for the flush thread to empty the buffer.
    fn finish(&mut self) -> Result<()> {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.shared.flushing.load(Ordering::SeqCst) && !lock(&self.shared.buffer).frames.is_empty() {
            if Instant::now() >= deadline {
                return Err(anyhow!("Buffer not drained within {:?}", DRAIN_TIMEOUT));
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }
}

/// One camera's active recording: the frame buffer, its flush thread, and the
/// sink they feed.
pub struct RecordingSession {
    camera_id: usize,
    paths: Option<RecordingPaths>,
    options: RecordingOptions,
    shared: Arc<Shared>,
    sink: Option<Box<dyn FrameSink>>,
    flush_thread: Option<JoinHandle<Box<dyn FrameSink>>>,
    released: bool,
}

impl RecordingSession {
    pub fn new(
        camera_id: usize,
        sink: Box<dyn FrameSink>,
        paths: Option<RecordingPaths>,
        options: RecordingOptions,
    ) -> Self {
        let shared = Arc::new(Shared {
            buffer: Mutex::new(Buffer {
                frames: VecDeque::with_capacity(options.capacity),
                capacity: options.capacity.max(1),
                dropped: 0,
                accepting: false,
            }),
            log: Mutex::new(WriteLog::default()),
            active: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            tracking_point: options.tracking_point,
        });
        Self {
            camera_id,
            paths,
            options,
            shared,
            sink: Some(sink),
            flush_thread: None,
            released: false,
        }
    }

    pub fn camera_id(&self) -> usize {
        self.camera_id
    }

    pub fn paths(&self) -> Option<&RecordingPaths> {
        self.paths.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Frames waiting in the buffer.
    pub fn buffered(&self) -> usize {
        lock(&self.shared.buffer).frames.len()
    }

    pub fn dropped_frames(&self) -> u64 {
        lock(&self.shared.buffer).dropped
    }

    pub fn frames_written(&self) -> usize {
        lock(&self.shared.log).sequence.len()
    }

    pub fn producer(&self) -> RecordingProducer {
        RecordingProducer {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Starts accepting frames and, with background flushing, the flush
    /// thread.
    pub fn start(&mut self) -> Result<()> {
        if self.released {
            return Err(CoreError::RecordingNotSetUp.into());
        }
        if self.is_active() {
            return Err(CoreError::AlreadyRunning.into());
        }
        self.shared.active.store(true, Ordering::SeqCst);
        lock(&self.shared.buffer).accepting = true;

        if self.options.background_flush {
            let sink = self.sink.take().ok_or(CoreError::RecordingNotSetUp)?;
            let shared = Arc::clone(&self.shared);
            let poll = self.options.poll_interval;
            self.shared.flushing.store(true, Ordering::SeqCst);
            let handle = thread::Builder::new()
                .name(format!("flush-{}", self.camera_id))
                .spawn(move || flush_loop(shared, sink, poll))?;
            self.flush_thread = Some(handle);
        }
        debug!("Recording for camera {} started", self.camera_id);
        Ok(())
    }

    /// Stops accepting frames and writes what is buffered. The sink stays
    /// open, so the recording can be started again.
    pub fn pause(&mut self) {
        if !self.is_active() {
            return;
        }
        {
            let mut buffer = lock(&self.shared.buffer);
            buffer.accepting = false;
            self.shared.active.store(false, Ordering::SeqCst);
        }
        if let Some(handle) = self.flush_thread.take() {
            match handle.join() {
                Ok(sink) => self.sink = Some(sink),
                Err(_) => warn!("Flush thread for camera {} panicked", self.camera_id),
            }
        }
        if let Some(sink) = self.sink.as_mut() {
            self.shared.drain_into(sink.as_mut());
        }
        debug!("Recording for camera {} paused", self.camera_id);
    }

    /// Appends a frame. Returns false when the recording is not active.
    pub fn acquire_frame(&self, record: FrameRecord) -> bool {
        self.shared.acquire(record)
    }

    /// Stops accepting frames, writes everything still buffered, closes the
    /// sink and hands back what was written. Later calls return an empty
    /// summary.
    pub fn release(&mut self) -> Result<RecordingSummary> {
        let mut summary = RecordingSummary {
            camera_id: self.camera_id,
            ..Default::default()
        };
        if self.released {
            return Ok(summary);
        }
        self.released = true;
        {
            let mut buffer = lock(&self.shared.buffer);
            buffer.accepting = false;
            self.shared.active.store(false, Ordering::SeqCst);
        }

        if let Some(handle) = self.flush_thread.take() {
            match handle.join() {
                Ok(sink) => self.sink = Some(sink),
                Err(_) => warn!("Flush thread for camera {} panicked", self.camera_id),
            }
        }

        let release_result = match self.sink.as_mut() {
            Some(sink) => {
                self.shared.drain_into(sink.as_mut());
                sink.release()
            }
            None => Err(anyhow!("Sink of camera {} was lost", self.camera_id)),
        };
        self.sink = None;

        let log = mem::take(&mut *lock(&self.shared.log));
        let mut buffer = lock(&self.shared.buffer);
        summary.dropped = mem::take(&mut buffer.dropped);
        buffer.frames.clear();
        drop(buffer);

        summary.written = log.sequence.len();
        summary.failures = log.failures;
        summary.timestamps = log.timestamps;
        summary.sequence = log.sequence;
        summary.tracked = log.tracked;
        if summary.dropped > 0 {
            warn!(
                "Camera {}: {} frames evicted from a full buffer",
                self.camera_id, summary.dropped
            );
        }
        info!("Camera {}: released after {} frames", self.camera_id, summary.written);

        release_result.with_context(|| format!("Failed to close the sink of camera {}", self.camera_id))?;
        Ok(summary)
    }

    /// Writes the timestamp log for a released recording, or removes the
    /// video when nothing was recorded.
    pub fn persist(&self, summary: &RecordingSummary) -> Result<()> {
        let Some(paths) = &self.paths else {
            return Ok(());
        };
        if summary.written == 0 {
            warn!("Camera {}: no frames recorded; removing {:?}", self.camera_id, paths.video);
            return remove_if_exists(&paths.video);
        }
        TimestampLog {
            sequence: &summary.sequence,
            timestamps: &summary.timestamps,
            tracked: &summary.tracked,
        }
        .write(&paths.timestamps)?;
        info!("Saved {:?}", paths.video);
        Ok(())
    }

    /// Removes the video and its timestamp log.
    pub fn remove_files(&self) -> Result<()> {
        if let Some(paths) = &self.paths {
            remove_if_exists(&paths.video)?;
            remove_if_exists(&paths.timestamps)?;
        }
        Ok(())
    }

    /// Releases and persists.
    pub fn save(&mut self) -> Result<RecordingSummary> {
        if self.released {
            return Err(CoreError::RecordingNotSetUp.into());
        }
        let summary = self.release()?;
        self.persist(&summary)?;
        Ok(summary)
    }

    /// Releases and discards the files.
    pub fn delete(&mut self) -> Result<()> {
        if let Err(e) = self.release() {
            warn!("Camera {}: {}", self.camera_id, e);
        }
        self.remove_files()
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.release() {
                warn!("Camera {}: {}", self.camera_id, e);
            }
        }
    }
}

fn remove_if_exists(path: &std::path::Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureConfig, CaptureHandle};
    use crate::camera::SimulatedCamera;
    use crate::frame::{Frame, PixelFormat};
    use crate::sink::{read_timestamps, MemorySink};
    use crate::utils::SessionClock;

    fn record(seq: u64) -> FrameRecord {
        FrameRecord {
            frame: Frame::from_data(2, 2, PixelFormat::Mono8, vec![seq as u8; 4]).unwrap(),
            timestamp: seq as f64 * 0.01,
            seq,
        }
    }

    fn options(capacity: usize, background_flush: bool) -> RecordingOptions {
        RecordingOptions {
            capacity,
            poll_interval: Duration::from_micros(200),
            tracking_point: None,
            background_flush,
        }
    }

    #[test]
    fn test_full_buffer_evicts_oldest() {
        let sink = MemorySink::new();
        let mut session = RecordingSession::new(0, Box::new(sink.clone()), None, options(5, false));
        session.start().unwrap();
        for seq in 0..8 {
            assert!(session.acquire_frame(record(seq)));
        }
        assert_eq!(session.buffered(), 5);
        assert_eq!(session.dropped_frames(), 3);

        let summary = session.release().unwrap();
        assert_eq!(summary.written, 5);
        assert_eq!(summary.dropped, 3);
        assert_eq!(summary.sequence, vec![3, 4, 5, 6, 7]);
        assert_eq!(sink.written(), 5);
    }

    #[test]
    fn test_flush_thread_preserves_order() {
        let sink = MemorySink::new().with_write_delay(Duration::from_micros(300));
        let mut session = RecordingSession::new(1, Box::new(sink.clone()), None, options(100, true));
        session.start().unwrap();
        for seq in 0..60 {
            assert!(session.acquire_frame(record(seq)));
        }
        let summary = session.release().unwrap();
        assert_eq!(summary.written, 60);
        assert_eq!(summary.dropped, 0);
        assert!(summary.sequence.windows(2).all(|w| w[0] < w[1]));
        let pixels: Vec<u8> = sink.frames().iter().map(|f| f.data()[0]).collect();
        assert_eq!(pixels, (0..60).collect::<Vec<u8>>());
    }

    #[test]
    fn test_release_is_idempotent() {
        let sink = MemorySink::new();
        let mut session = RecordingSession::new(0, Box::new(sink.clone()), None, options(5, true));
        session.start().unwrap();
        let first = session.release().unwrap();
        assert!(first.timestamps.is_empty());
        assert!(first.sequence.is_empty());
        assert!(sink.is_released());

        let second = session.release().unwrap();
        assert_eq!(second.written, 0);
        assert!(!session.acquire_frame(record(0)));
        assert!(session.start().is_err());
    }

    #[test]
    fn test_paused_session_restarts() {
        let sink = MemorySink::new();
        let mut session = RecordingSession::new(0, Box::new(sink.clone()), None, options(10, true));
        session.start().unwrap();
        assert!(session.acquire_frame(record(0)));
        session.pause();
        assert!(!session.is_active());
        assert!(!session.acquire_frame(record(1)));
        assert_eq!(session.buffered(), 0);
        assert!(!sink.is_released());

        session.start().unwrap();
        assert!(session.acquire_frame(record(2)));
        let summary = session.release().unwrap();
        assert_eq!(summary.sequence, vec![0, 2]);
        assert_eq!(sink.written(), 2);
    }

    #[test]
    fn test_inactive_session_rejects_frames() {
        let session = RecordingSession::new(0, Box::new(MemorySink::new()), None, options(5, true));
        assert!(!session.acquire_frame(record(0)));
        assert_eq!(session.buffered(), 0);
    }

    #[test]
    fn test_tracking_point_sampled() {
        let mut opts = options(10, false);
        opts.tracking_point = Some([1, 1]);
        let mut session = RecordingSession::new(0, Box::new(MemorySink::counting()), None, opts);
        session.start().unwrap();
        session.acquire_frame(record(7));
        session.acquire_frame(record(9));
        let summary = session.release().unwrap();
        assert_eq!(summary.tracked, vec![7.0, 9.0]);
    }

    fn paths_in(dir: &std::path::Path) -> RecordingPaths {
        RecordingPaths {
            base: "cam_m_2024-01-01_100f0.01e10g".to_string(),
            video: dir.join("cam1.avi"),
            timestamps: dir.join("TIMESTAMPS_cam1.csv"),
        }
    }

    #[test]
    fn test_save_writes_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        let mut session = RecordingSession::new(0, Box::new(MemorySink::counting()), Some(paths.clone()), options(10, true));
        session.start().unwrap();
        for seq in 0..3 {
            session.acquire_frame(record(seq));
        }
        let summary = session.save().unwrap();
        assert_eq!(summary.written, 3);
        assert_eq!(read_timestamps(&paths.timestamps).unwrap(), vec![0.0, 0.01, 0.02]);
        // saving twice is refused instead of clobbering the log
        assert!(session.save().is_err());
        assert!(paths.timestamps.exists());
    }

    #[test]
    fn test_save_without_frames_removes_video() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        fs::write(&paths.video, b"header").unwrap();
        let mut session = RecordingSession::new(0, Box::new(MemorySink::counting()), Some(paths.clone()), options(10, true));
        session.start().unwrap();
        session.save().unwrap();
        assert!(!paths.video.exists());
        assert!(!paths.timestamps.exists());
    }

    #[test]
    fn test_delete_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        fs::write(&paths.video, b"frames").unwrap();
        let mut session = RecordingSession::new(0, Box::new(MemorySink::counting()), Some(paths.clone()), options(10, true));
        session.start().unwrap();
        session.acquire_frame(record(0));
        session.delete().unwrap();
        assert!(!paths.video.exists());
    }

    #[test]
    fn test_capture_thread_feeds_recording() {
        let sink = MemorySink::counting();
        let mut session = RecordingSession::new(0, Box::new(sink.clone()), None, options(50, true));
        session.start().unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let config = CaptureConfig::new(0, 100.0, SessionClock::new()).with_duration(Some(Duration::from_millis(300)));
        let handle = CaptureHandle::spawn(
            Box::new(SimulatedCamera::new(0, 32, 24)),
            Box::new(session.producer()),
            config,
            running,
        )
        .unwrap();
        let report = handle.join(Duration::from_secs(5)).unwrap().report;

        // the capture thread waits for the buffer to drain before exiting
        assert_eq!(session.buffered(), 0);
        let summary = session.release().unwrap();
        assert_eq!(summary.written as u64, report.frames);
        assert_eq!(summary.timestamps, report.timestamps);
        assert_eq!(sink.written() as u64, report.frames);
    }
}
