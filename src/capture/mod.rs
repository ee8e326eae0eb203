//! Per-camera capture thread.
//!
//! Each camera gets one producer thread that owns its device, grabs frames at
//! a target cadence and hands them to a [`FrameConsumer`]. Cameras can be
//! forced into lockstep with a shared [`SyncBarrier`].

use crate::barrier::{BarrierError, SyncBarrier};
use crate::camera::CameraDevice;
use crate::frame::FrameRecord;
use crate::status::{CaptureState, Status, StatusCell};
use crate::utils::{join_timeout, FpsCounter, SessionClock};
use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Longest single wait on the trigger input before re-checking the stop flag.
const TRIGGER_POLL: Duration = Duration::from_millis(100);

/// Receives every frame a capture thread produces.
pub trait FrameConsumer: Send {
    /// Takes ownership of one frame. Errors are logged by the capture thread
    /// and the frame is lost; capturing continues.
    fn consume(&mut self, record: FrameRecord) -> Result<()>;

    /// Called once after the last frame, before the thread exits.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Block on the camera's trigger input before capturing.
#[derive(Debug, Clone)]
pub struct TriggerWait {
    pub timeout: Duration,
    /// Start capturing on the next whole second of the rig clock
    pub align_start_to_second: bool,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub camera_id: usize,
    pub fps: f64,
    pub clock: SessionClock,
    pub barrier: Option<Arc<SyncBarrier>>,
    pub trigger: Option<TriggerWait>,
    /// Hard wall-clock budget; `None` runs until stopped
    pub duration: Option<Duration>,
    /// Longest sleep between schedule checks
    pub poll_interval: Duration,
}

impl CaptureConfig {
    pub fn new(camera_id: usize, fps: f64, clock: SessionClock) -> Self {
        Self {
            camera_id,
            fps,
            clock,
            barrier: None,
            trigger: None,
            duration: None,
            poll_interval: Duration::from_millis(2),
        }
    }

    pub fn with_barrier(mut self, barrier: Arc<SyncBarrier>) -> Self {
        self.barrier = Some(barrier);
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerWait) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_duration(mut self, duration: Option<Duration>) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Why a capture loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEnd {
    Stopped,
    DurationReached,
    BarrierReleased(BarrierError),
}

#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub camera_id: usize,
    pub frames: u64,
    /// Grabs that returned no image
    pub failures: u64,
    /// Capture time of every delivered frame, seconds on the rig clock
    pub timestamps: Vec<f64>,
    /// When the trigger pulse arrived, if one was awaited and received
    pub trigger_time: Option<f64>,
    pub end: CaptureEnd,
}

/// Device handed back by a finished capture thread, with its report.
pub struct CaptureOutcome {
    pub device: Box<dyn CameraDevice>,
    pub report: CaptureReport,
}

/// Owner-side handle of a running capture thread.
pub struct CaptureHandle {
    camera_id: usize,
    running: Arc<AtomicBool>,
    status: StatusCell<CaptureState>,
    handle: Option<JoinHandle<CaptureOutcome>>,
}

impl CaptureHandle {
    /// Starts capturing on a new thread. The loop runs while `running` is set;
    /// several cameras may share one flag.
    pub fn spawn(
        device: Box<dyn CameraDevice>,
        consumer: Box<dyn FrameConsumer>,
        config: CaptureConfig,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        if !(config.fps > 0.0) {
            return Err(anyhow!("Frame rate must be positive, got {}", config.fps));
        }
        let camera_id = config.camera_id;
        let status = StatusCell::new(CaptureState::Idle);
        let thread_status = status.clone();
        let thread_running = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name(format!("capture-{}", camera_id))
            .spawn(move || run_capture(device, consumer, config, thread_running, thread_status))?;

        Ok(Self {
            camera_id,
            running,
            status,
            handle: Some(handle),
        })
    }

    pub fn camera_id(&self) -> usize {
        self.camera_id
    }

    pub fn status(&self) -> Status<CaptureState> {
        self.status.get()
    }

    /// Clears the shared running flag.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Waits up to `timeout` for the thread and takes back the device.
    pub fn join(mut self, timeout: Duration) -> Result<CaptureOutcome> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| anyhow!("Capture thread for camera {} already joined", self.camera_id))?;
        match join_timeout(handle, timeout) {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(anyhow!("Capture thread for camera {} panicked", self.camera_id)),
            Err(_) => Err(anyhow!(
                "Capture thread for camera {} did not stop within {:?}",
                self.camera_id,
                timeout
            )),
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.running.store(false, Ordering::SeqCst);
            if join_timeout(handle, Duration::from_secs(5)).is_err() {
                error!("Capture thread for camera {} left running", self.camera_id);
            }
        }
    }
}

/// Waits for the trigger pulse. Returns the pulse time, or `None` on timeout
/// or stop; either way the trigger is disabled again before returning.
fn wait_for_trigger(
    device: &mut dyn CameraDevice,
    trigger: &TriggerWait,
    config: &CaptureConfig,
    running: &AtomicBool,
    status: &StatusCell<CaptureState>,
) -> Option<f64> {
    let id = config.camera_id;
    let clock = &config.clock;
    status.set(CaptureState::WaitingForTrigger, "Waiting for trigger...");
    if !device.enable_trigger() {
        warn!("Camera {}: trigger mode unavailable", id);
        status.set_text("Trigger mode unavailable; capturing free-running");
        return None;
    }

    let waited_from = clock.now();
    let received = loop {
        if !running.load(Ordering::SeqCst) {
            break false;
        }
        let waited = Duration::from_secs_f64(clock.now() - waited_from);
        let Some(remaining) = trigger.timeout.checked_sub(waited).filter(|d| !d.is_zero()) else {
            break false;
        };
        if device.wait_for_frame_ready(remaining.min(TRIGGER_POLL)) {
            break true;
        }
    };
    let pulse_time = clock.now();
    device.disable_trigger();

    if !received {
        if running.load(Ordering::SeqCst) {
            warn!("Camera {}: no trigger within {:?}", id, trigger.timeout);
            status.set_text(format!(
                "Trigger not received after {:.1}s; capturing free-running",
                pulse_time - waited_from
            ));
        }
        return None;
    }

    info!("Camera {}: trigger received after {:.3}s", id, pulse_time - waited_from);
    status.set_text(format!("Trigger received. Waited {:.2}s", pulse_time - waited_from));
    if trigger.align_start_to_second {
        let start_at = pulse_time.trunc() + 1.0;
        while clock.now() < start_at && running.load(Ordering::SeqCst) {
            clock.sleep_until(start_at, config.poll_interval);
        }
    }
    Some(pulse_time)
}

fn run_capture(
    mut device: Box<dyn CameraDevice>,
    mut consumer: Box<dyn FrameConsumer>,
    config: CaptureConfig,
    running: Arc<AtomicBool>,
    status: StatusCell<CaptureState>,
) -> CaptureOutcome {
    let id = config.camera_id;
    let clock = config.clock;
    let mut report = CaptureReport {
        camera_id: id,
        frames: 0,
        failures: 0,
        timestamps: Vec::new(),
        trigger_time: None,
        end: CaptureEnd::Stopped,
    };

    if let Some(trigger) = &config.trigger {
        report.trigger_time = wait_for_trigger(device.as_mut(), trigger, &config, &running, &status);
    }

    let period = 1.0 / config.fps;
    let budget = config.duration.map(|d| d.as_secs_f64());
    let mut fps_counter = FpsCounter::new();
    status.set_state(CaptureState::Capturing);
    info!("Camera {}: capturing at {} fps", id, config.fps);

    let start = clock.now();
    let mut next_frame = start;
    // counts scheduled grabs, failed ones included
    let mut cycle: u64 = 0;
    report.end = loop {
        if !running.load(Ordering::SeqCst) {
            break CaptureEnd::Stopped;
        }
        if budget.is_some_and(|b| clock.now() - start >= b) {
            break CaptureEnd::DurationReached;
        }
        if clock.now() < next_frame {
            clock.sleep_until(next_frame, config.poll_interval);
            continue;
        }

        if let Some(barrier) = &config.barrier {
            if let Err(e) = barrier.wait() {
                break CaptureEnd::BarrierReleased(e);
            }
        }

        let timestamp = clock.now();
        match device.get_image() {
            Some(frame) => {
                report.timestamps.push(timestamp);
                let record = FrameRecord {
                    frame,
                    timestamp,
                    seq: cycle,
                };
                if let Err(e) = consumer.consume(record) {
                    warn!("Camera {}: dropped frame {}: {}", id, cycle, e);
                }
                report.frames += 1;
                if let Some(fps) = fps_counter.update() {
                    debug!("[Perf] Camera {} capturing at {:.2} FPS", id, fps);
                }
            }
            None => {
                report.failures += 1;
                warn!("Camera {}: no image returned for frame {}", id, cycle);
            }
        }
        cycle += 1;
        // after a stall, resume half a period after the late frame instead of
        // bursting to catch up
        next_frame = (next_frame + period).max(timestamp + 0.5 * period);
    };

    // siblings must not wait at the barrier for a camera that has left
    if let Some(barrier) = &config.barrier {
        barrier.abort();
    }
    if matches!(report.end, CaptureEnd::BarrierReleased(_)) && !running.load(Ordering::SeqCst) {
        report.end = CaptureEnd::Stopped;
    }

    status.set_state(CaptureState::Draining);
    if let Err(e) = consumer.finish() {
        error!("Camera {}: failed to flush frames: {}", id, e);
    }

    let text = match report.end {
        CaptureEnd::Stopped => format!("Stopped after {} frames", report.frames),
        CaptureEnd::DurationReached => format!("Capture duration reached after {} frames", report.frames),
        CaptureEnd::BarrierReleased(e) => format!("Stopped after {} frames: {}", report.frames, e),
    };
    info!("Camera {}: {}", id, text);
    status.set(CaptureState::Stopped, text);

    CaptureOutcome { device, report }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{SimulatedCamera, TriggerLine};
    use crate::utils::lock;
    use std::sync::Mutex;

    /// Collects records for inspection after the thread ends.
    #[derive(Clone, Default)]
    struct Collect {
        records: Arc<Mutex<Vec<FrameRecord>>>,
        finished: Arc<AtomicBool>,
    }

    impl FrameConsumer for Collect {
        fn consume(&mut self, record: FrameRecord) -> Result<()> {
            lock(&self.records).push(record);
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn spawn_camera(
        camera: SimulatedCamera,
        config: CaptureConfig,
        running: &Arc<AtomicBool>,
    ) -> (CaptureHandle, Collect) {
        let sink = Collect::default();
        let handle = CaptureHandle::spawn(
            Box::new(camera),
            Box::new(sink.clone()),
            config,
            Arc::clone(running),
        )
        .unwrap();
        (handle, sink)
    }

    #[test]
    fn test_cadence_matches_fps() {
        let clock = SessionClock::new();
        let running = Arc::new(AtomicBool::new(true));
        let config = CaptureConfig::new(0, 100.0, clock).with_duration(Some(Duration::from_millis(500)));
        let (handle, sink) = spawn_camera(SimulatedCamera::new(0, 8, 8), config, &running);

        let outcome = handle.join(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.report.end, CaptureEnd::DurationReached);
        let frames = outcome.report.frames as i64;
        assert!((frames - 50).abs() <= 1, "captured {} frames", frames);
        assert!(sink.finished.load(Ordering::SeqCst));

        let seqs: Vec<u64> = lock(&sink.records).iter().map(|r| r.seq).collect();
        assert_eq!(seqs, (0..frames as u64).collect::<Vec<_>>());
    }

    #[test]
    fn test_stall_does_not_burst() {
        // frame 5 takes 100ms, eight periods at 80 fps; the frames after it
        // must not be grabbed back to back to make up the lost time
        let clock = SessionClock::new();
        let running = Arc::new(AtomicBool::new(true));
        let config = CaptureConfig::new(0, 80.0, clock).with_duration(Some(Duration::from_millis(400)));
        let camera = SimulatedCamera::new(0, 8, 8).with_stall_at(5, Duration::from_millis(100));
        let (handle, _) = spawn_camera(camera, config, &running);

        let report = handle.join(Duration::from_secs(5)).unwrap().report;
        let gaps: Vec<f64> = report.timestamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[5] >= 0.1, "{:?}", gaps);
        assert!(gaps.iter().all(|g| *g >= 0.5 / 80.0 - 0.002), "{:?}", gaps);
        // 300ms left after the stall at 12.5ms per frame
        assert!(report.frames < 32, "{} frames", report.frames);
    }

    #[test]
    fn test_stop_flag_ends_loop_and_returns_device() {
        let clock = SessionClock::new();
        let running = Arc::new(AtomicBool::new(true));
        let (handle, sink) = spawn_camera(
            SimulatedCamera::new(3, 8, 8),
            CaptureConfig::new(3, 200.0, clock),
            &running,
        );
        thread::sleep(Duration::from_millis(100));
        assert_eq!(handle.status().state, CaptureState::Capturing);
        handle.stop();

        let outcome = handle.join(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.report.end, CaptureEnd::Stopped);
        assert!(outcome.report.frames > 0);
        assert_eq!(outcome.device.info().index, 3);
        assert!(sink.finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_barrier_keeps_cameras_in_lockstep() {
        // camera 1 is slow; camera 0 must stall with it
        let clock = SessionClock::new();
        let running = Arc::new(AtomicBool::new(true));
        let barrier = Arc::new(SyncBarrier::new(2, Duration::from_secs(1)));
        let budget = Some(Duration::from_millis(600));

        let (fast, fast_sink) = spawn_camera(
            SimulatedCamera::new(0, 8, 8),
            CaptureConfig::new(0, 100.0, clock)
                .with_barrier(Arc::clone(&barrier))
                .with_duration(budget),
            &running,
        );
        let (slow, slow_sink) = spawn_camera(
            SimulatedCamera::new(1, 8, 8).with_capture_delay(Duration::from_millis(30)),
            CaptureConfig::new(1, 100.0, clock)
                .with_barrier(Arc::clone(&barrier))
                .with_duration(budget),
            &running,
        );

        let fast = fast.join(Duration::from_secs(5)).unwrap().report;
        let slow = slow.join(Duration::from_secs(5)).unwrap().report;
        // 600ms at one frame per ~45ms (30ms grab + half period), not 60 frames
        assert!(fast.frames < 25, "fast camera ran free: {} frames", fast.frames);
        assert!((fast.frames as i64 - slow.frames as i64).abs() <= 1);

        let fast_ts: Vec<f64> = lock(&fast_sink.records).iter().map(|r| r.timestamp).collect();
        let slow_ts: Vec<f64> = lock(&slow_sink.records).iter().map(|r| r.timestamp).collect();
        for (a, b) in fast_ts.iter().zip(&slow_ts) {
            assert!((a - b).abs() < 0.01, "skew {}", (a - b).abs());
        }
    }

    #[test]
    fn test_two_cameras_synchronized_at_100fps() {
        let clock = SessionClock::new();
        let running = Arc::new(AtomicBool::new(true));
        let barrier = Arc::new(SyncBarrier::new(2, Duration::from_secs(1)));
        let handles: Vec<_> = (0..2)
            .map(|id| {
                spawn_camera(
                    SimulatedCamera::new(id, 16, 16),
                    CaptureConfig::new(id, 100.0, clock)
                        .with_barrier(Arc::clone(&barrier))
                        .with_duration(Some(Duration::from_secs(1))),
                    &running,
                )
            })
            .collect();

        let reports: Vec<_> = handles
            .into_iter()
            .map(|(h, _)| h.join(Duration::from_secs(5)).unwrap().report)
            .collect();
        for report in &reports {
            assert!((report.frames as i64 - 100).abs() <= 1, "{} frames", report.frames);
        }
        for (a, b) in reports[0].timestamps.iter().zip(&reports[1].timestamps) {
            assert!((a - b).abs() < 0.005);
        }
    }

    #[test]
    fn test_failed_grab_keeps_cycle_numbers_aligned() {
        // camera 1 returns nothing on its third grab; later frames must still
        // carry the same number as camera 0's frame of that cycle
        let clock = SessionClock::new();
        let running = Arc::new(AtomicBool::new(true));
        let barrier = Arc::new(SyncBarrier::new(2, Duration::from_secs(1)));
        let budget = Some(Duration::from_millis(200));
        let (first, first_sink) = spawn_camera(
            SimulatedCamera::new(0, 8, 8),
            CaptureConfig::new(0, 50.0, clock)
                .with_barrier(Arc::clone(&barrier))
                .with_duration(budget),
            &running,
        );
        let (second, second_sink) = spawn_camera(
            SimulatedCamera::new(1, 8, 8).with_failure_at(2),
            CaptureConfig::new(1, 50.0, clock)
                .with_barrier(Arc::clone(&barrier))
                .with_duration(budget),
            &running,
        );

        let first = first.join(Duration::from_secs(5)).unwrap().report;
        let second = second.join(Duration::from_secs(5)).unwrap().report;
        assert_eq!(first.failures, 0);
        assert_eq!(second.failures, 1);

        let first_records = lock(&first_sink.records);
        let second_records = lock(&second_sink.records);
        assert!(second_records.iter().all(|r| r.seq != 2));
        for record in second_records.iter() {
            let Some(peer) = first_records.iter().find(|r| r.seq == record.seq) else {
                continue;
            };
            assert!(
                (peer.timestamp - record.timestamp).abs() < 0.01,
                "frame {} pairs {} and {}",
                record.seq,
                peer.timestamp,
                record.timestamp
            );
        }
        assert!(second_records.iter().any(|r| r.seq > 2));
    }

    #[test]
    fn test_trigger_gates_capture() {
        let clock = SessionClock::new();
        let running = Arc::new(AtomicBool::new(true));
        let line = TriggerLine::new();
        let config = CaptureConfig::new(0, 100.0, clock).with_trigger(TriggerWait {
            timeout: Duration::from_secs(5),
            align_start_to_second: false,
        });
        let camera = SimulatedCamera::new(0, 8, 8).with_trigger(line.clone());
        let (handle, sink) = spawn_camera(camera, config, &running);

        thread::sleep(Duration::from_millis(80));
        assert_eq!(handle.status().state, CaptureState::WaitingForTrigger);
        assert!(lock(&sink.records).is_empty());

        line.fire();
        thread::sleep(Duration::from_millis(100));
        assert!(handle.status().text.starts_with("Trigger received"));
        handle.stop();
        let report = handle.join(Duration::from_secs(5)).unwrap().report;
        let pulse = report.trigger_time.unwrap();
        assert!(report.frames > 0);
        assert!(report.timestamps[0] >= pulse);
    }

    #[test]
    fn test_trigger_timeout_falls_back_to_free_running() {
        let clock = SessionClock::new();
        let running = Arc::new(AtomicBool::new(true));
        let config = CaptureConfig::new(0, 100.0, clock)
            .with_trigger(TriggerWait {
                timeout: Duration::from_millis(50),
                align_start_to_second: false,
            })
            .with_duration(Some(Duration::from_millis(50)));
        let camera = SimulatedCamera::new(0, 8, 8).with_trigger(TriggerLine::new());
        let (handle, _) = spawn_camera(camera, config, &running);

        let report = handle.join(Duration::from_secs(5)).unwrap().report;
        assert_eq!(report.trigger_time, None);
        assert!(report.frames > 0);
    }
}
