//! camsync: synchronized multi-camera recording and calibration CLI.

use anyhow::{anyhow, Result};
use camsync::analysis::check_sync;
use camsync::calibration::{
    CalibrationBoard, CalibrationSession, DetectionStore, GridBoard, SimilaritySolver, SolveMode, SolverWorker,
};
#[cfg(feature = "uvc")]
use camsync::camera::UvcCamera;
use camsync::camera::{CameraBackend, CameraDevice, CameraInfo, CameraSession, SimulatedCamera};
use camsync::config::{DurationBudget, RigConfig};
use camsync::naming::RecordingName;
use camsync::rig::Rig;
use camsync::sink::{read_timestamps, FfmpegSinks, MemorySinks, SinkFactory};
use camsync::status::{CalibrationState, StatusCell};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Where camera devices come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Synthetic cameras, no hardware needed
    Sim,
    /// USB video class webcams
    #[cfg(feature = "uvc")]
    Uvc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Solve from every stored detection
    Recalibrate,
    /// Solve from this run's detections only
    Update,
}

impl From<Mode> for SolveMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Recalibrate => SolveMode::Recalibrate,
            Mode::Update => SolveMode::Update,
        }
    }
}

/// Synchronized multi-camera capture.
#[derive(Parser, Debug)]
#[command(name = "camsync")]
#[command(about = "Record and calibrate synchronized cameras")]
struct Args {
    /// Rig configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Camera backend
    #[arg(long, value_enum, default_value = "sim", global = true)]
    backend: Backend,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available cameras and exit
    ListDevices,

    /// Record every configured camera until Ctrl-C or the duration elapses
    Record {
        /// Subject name used in file names
        #[arg(short, long)]
        subject: Option<String>,

        /// Attempt number appended to file names
        #[arg(short, long, default_value = "1")]
        attempt: u32,

        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<f64>,

        /// Replace existing files with the same attempt number
        #[arg(long)]
        overwrite: bool,

        /// Transcode the videos to H.264 after saving
        #[arg(long)]
        compress: bool,

        /// Count frames in memory instead of encoding
        #[arg(long)]
        dry_run: bool,
    },

    /// Capture calibration frames, then solve
    Calibrate {
        #[arg(long, value_enum, default_value = "update")]
        mode: Mode,

        /// Capture budget in seconds or "inf"; overrides the config
        #[arg(short, long)]
        duration: Option<DurationBudget>,

        /// Solve from the stored detections without capturing
        #[arg(long)]
        no_capture: bool,
    },

    /// Compare the timestamp files of two cameras
    CheckSync {
        first: PathBuf,
        second: PathBuf,

        #[arg(long, default_value = "100")]
        fps: f64,
    },

    /// Save one frame of a camera as an image
    Snap {
        #[arg(long, default_value = "0")]
        camera: usize,

        #[arg(short, long, default_value = "snap.png")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => RigConfig::load(path)?,
        None => RigConfig::default(),
    };

    match args.command {
        Command::ListDevices => list_devices(args.backend),
        Command::CheckSync { first, second, fps } => {
            let report = check_sync(&read_timestamps(first)?, &read_timestamps(second)?, fps)?;
            for line in report.messages() {
                println!("{}", line);
            }
            Ok(())
        }
        Command::Snap { camera, output } => {
            let mut rig = Rig::new(config.clone(), open_cameras(args.backend, &config)?);
            rig.snap(camera, &output)?;
            info!("Saved {:?}", output);
            Ok(())
        }
        Command::Record {
            subject,
            attempt,
            duration,
            overwrite,
            compress,
            dry_run,
        } => {
            let subject = subject
                .or_else(|| config.subjects.first().cloned())
                .unwrap_or_else(|| "subject".to_string());
            let cameras = open_cameras(args.backend, &config)?;
            let name = RecordingName {
                subject: &subject,
                date: chrono::Local::now().date_naive(),
                fps: config.recording.fps,
                attempt,
                codec: config.recording.codec,
                overwrite,
            };
            run_recording(Rig::new(config.clone(), cameras), &name, duration, compress, dry_run)
        }
        Command::Calibrate {
            mode,
            duration,
            no_capture,
        } => {
            let mut config = config;
            if let Some(duration) = duration {
                config.calibration.duration = duration;
            }
            run_calibration(args.backend, config, mode.into(), no_capture)
        }
    }
}

fn list_devices(backend: Backend) -> Result<()> {
    let devices: Vec<CameraInfo> = match backend {
        Backend::Sim => SimulatedCamera::list_devices()?,
        #[cfg(feature = "uvc")]
        Backend::Uvc => UvcCamera::list_devices()?,
    };
    println!("Available cameras:");
    for device in devices {
        println!("  [{}] {}", device.index, device.name);
    }
    Ok(())
}

fn open_cameras(backend: Backend, config: &RigConfig) -> Result<Vec<CameraSession>> {
    let board = &config.calibration.board;
    config
        .cameras
        .iter()
        .enumerate()
        .map(|(index, details)| {
            info!("Opening camera {} ({})...", index, details.name);
            let device: Box<dyn CameraDevice> = match backend {
                Backend::Sim => Box::new(SimulatedCamera::open(index, details)?.with_markers(board.rows, board.cols)),
                #[cfg(feature = "uvc")]
                Backend::Uvc => Box::new(UvcCamera::open(index, details)?),
            };
            CameraSession::initialize(index, details.clone(), device)
        })
        .collect()
}

/// Stop flag set by Ctrl-C.
fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down...");
        flag.store(true, Ordering::SeqCst);
    })?;
    Ok(interrupted)
}

fn run_recording(
    mut rig: Rig,
    name: &RecordingName<'_>,
    duration: Option<f64>,
    compress: bool,
    dry_run: bool,
) -> Result<()> {
    let interrupted = interrupt_flag()?;
    let mut sinks: Box<dyn SinkFactory> = if dry_run {
        Box::new(MemorySinks::new())
    } else {
        Box::new(FfmpegSinks {
            codec: rig.config().recording.codec,
        })
    };
    rig.setup_recording(name, sinks.as_mut())?;
    rig.start_recording()?;

    let deadline = duration.map(|secs| Instant::now() + Duration::from_secs_f64(secs));
    let mut last_report = Instant::now();
    while !interrupted.load(Ordering::SeqCst) && deadline.map_or(true, |d| Instant::now() < d) {
        thread::sleep(Duration::from_millis(100));
        if last_report.elapsed() >= Duration::from_secs(5) {
            for camera in rig.status() {
                info!(
                    "{}: {} ({} written, {} buffered, {} dropped) {}",
                    camera.name, camera.state, camera.written, camera.buffered, camera.dropped, camera.text
                );
            }
            last_report = Instant::now();
        }
    }

    rig.stop_recording()?;
    if dry_run {
        let report = rig.save(false)?;
        for summary in &report.summaries {
            info!("Camera {}: {} frames", summary.camera_id, summary.written);
        }
        return Ok(());
    }
    let report = rig.save(compress)?;
    if !report.kept {
        warn!("Recording discarded");
    }
    rig.wait_background(Duration::from_secs(3600));
    Ok(())
}

fn run_calibration(backend: Backend, config: RigConfig, mode: SolveMode, no_capture: bool) -> Result<()> {
    let board: Arc<dyn CalibrationBoard> = Arc::new(GridBoard::new(config.calibration.board.clone()));
    let status = StatusCell::new(CalibrationState::Idle);
    let store = DetectionStore::new(config.calibration.detections_path());
    let session = CalibrationSession::from_store(&store)?;

    if no_capture {
        if mode == SolveMode::Update {
            return Err(anyhow!("Update needs detections from a capture run; use --mode recalibrate"));
        }
    } else {
        let interrupted = interrupt_flag()?;
        let mut rig = Rig::new(config.clone(), open_cameras(backend, &config)?);
        let mut sinks = FfmpegSinks {
            codec: config.recording.codec,
        };
        rig.start_calibration(Arc::clone(&board), &session, Some(&mut sinks), status.clone())?;
        while !rig.calibration_finished() {
            if interrupted.load(Ordering::SeqCst) {
                rig.stop_calibration();
            }
            thread::sleep(Duration::from_millis(100));
        }
        let run = rig.finish_calibration(config.recording.join_timeout())?;
        for report in &run.reports {
            info!("Camera {}: {} frames", report.camera_id, report.frames);
        }
        if status.state() != CalibrationState::ReadyToCalibrate {
            return Err(anyhow!("Calibration capture failed: {}", status.get().text));
        }
    }

    let worker = SolverWorker::new(
        Box::new(SimilaritySolver::new()),
        board,
        session.clone(),
        store,
        config.calibration.clone(),
        status.clone(),
    );
    worker.start(mode)?;
    match worker.wait(Duration::from_secs(3600))? {
        Some(error) => {
            println!("Calibration error: {:.4}", error);
            println!("Model written to {:?}", config.calibration.model_path());
            Ok(())
        }
        None => Err(anyhow!("Failed to calibrate")),
    }
}
