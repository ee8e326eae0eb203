use super::{CalibrationBoard, CalibrationSession, CalibrationSolver, DetectionSet, DetectionStore, SolveParams};
use crate::config::CalibrationConfig;
use crate::error::CoreError;
use crate::status::{CalibrationState, StatusCell};
use crate::utils::{join_timeout, lock};
use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Which detections a solve uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveMode {
    /// Everything in the detection store
    Recalibrate,
    /// Only the current capture run
    Update,
}

/// Re-initialize the camera matrices when the previous error is unknown or
/// above `threshold`; otherwise follow the user's choice.
pub fn decide_init(previous: Option<f64>, threshold: f64, user_override: bool) -> bool {
    match previous {
        Some(error) if error <= threshold => user_override,
        _ => true,
    }
}

type SolveJob = Box<dyn FnOnce() -> Option<f64> + Send + 'static>;

/// Clears the busy flag however the solve ends.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs the solver on a worker thread, at most one solve at a time.
pub struct SolverWorker {
    solver: Arc<Mutex<Box<dyn CalibrationSolver>>>,
    board: Arc<dyn CalibrationBoard>,
    session: CalibrationSession,
    store: DetectionStore,
    config: CalibrationConfig,
    status: StatusCell<CalibrationState>,
    busy: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<Option<f64>>>>,
}

impl SolverWorker {
    pub fn new(
        solver: Box<dyn CalibrationSolver>,
        board: Arc<dyn CalibrationBoard>,
        session: CalibrationSession,
        store: DetectionStore,
        config: CalibrationConfig,
        status: StatusCell<CalibrationState>,
    ) -> Self {
        Self {
            solver: Arc::new(Mutex::new(solver)),
            board,
            session,
            store,
            config,
            status,
            busy: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Starts a solve. Refused while another one is running.
    pub fn start(&self, mode: SolveMode) -> Result<(), CoreError> {
        self.launch(mode, |job| thread::Builder::new().name("solver".to_string()).spawn(job))
    }

    fn launch<F>(&self, mode: SolveMode, spawn: F) -> Result<(), CoreError>
    where
        F: FnOnce(SolveJob) -> io::Result<JoinHandle<Option<f64>>>,
    {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CoreError::SolveInProgress);
        }
        let guard = BusyGuard(Arc::clone(&self.busy));

        // reap the previous, finished solve
        if let Some(previous) = lock(&self.handle).take() {
            let _ = previous.join();
        }

        let solver = Arc::clone(&self.solver);
        let board = Arc::clone(&self.board);
        let session = self.session.clone();
        let store = self.store.clone();
        let config = self.config.clone();
        let status = self.status.clone();
        let job: SolveJob = Box::new(move || {
            let _guard = guard;
            solve(mode, solver, board.as_ref(), &session, &store, &config, &status)
        });
        // a job that never runs is dropped here, and its guard clears the flag
        match spawn(job) {
            Ok(handle) => {
                *lock(&self.handle) = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start the solver thread: {}", e);
                self.status.set(CalibrationState::Failed, "Failed to calibrate");
                Err(CoreError::SolverUnavailable(e.to_string()))
            }
        }
    }

    /// Starts a solve, first waiting up to `timeout` for a running one to
    /// finish.
    pub fn start_after(&self, mode: SolveMode, timeout: Duration) -> Result<(), CoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.start(mode) {
                Err(CoreError::SolveInProgress) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(5));
                }
                result => return result,
            }
        }
    }

    /// Waits for the current solve. Returns its error, `None` if it failed or
    /// nothing was running.
    pub fn wait(&self, timeout: Duration) -> Result<Option<f64>> {
        let Some(handle) = lock(&self.handle).take() else {
            return Ok(None);
        };
        match join_timeout(handle, timeout) {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(anyhow!("Solver thread panicked")),
            Err(handle) => {
                *lock(&self.handle) = Some(handle);
                Err(anyhow!("Solve still running after {:?}", timeout))
            }
        }
    }
}

fn solve(
    mode: SolveMode,
    solver: Arc<Mutex<Box<dyn CalibrationSolver>>>,
    board: &dyn CalibrationBoard,
    session: &CalibrationSession,
    store: &DetectionStore,
    config: &CalibrationConfig,
    status: &StatusCell<CalibrationState>,
) -> Option<f64> {
    status.set(CalibrationState::Calibrating, "Calibrating...");
    let rows = match mode {
        SolveMode::Recalibrate => match store.load() {
            Ok(rows) => rows,
            Err(e) => {
                error!("Failed to calibrate: {:#}", e);
                status.set(CalibrationState::Failed, "Failed to calibrate");
                return None;
            }
        },
        SolveMode::Update => session.snapshot_run(),
    };

    let init = decide_init(session.error(), config.error_threshold, config.init_matrix);
    let params = SolveParams::from_config(config, init);
    info!("Calibrating with {:?} detections (init matrices: {})", mode, init);

    let mut solver = lock(&solver);
    let Some(error) = solver.calibrate_rows(&rows, board, &params) else {
        error!("Failed to calibrate");
        status.set(CalibrationState::Failed, "Failed to calibrate");
        return None;
    };

    session.record_error(error);
    if let Err(e) = solver.dump(&config.model_path()) {
        warn!("Failed to save calibration: {:#}", e);
    }
    info!("Calibration error: {:.4}", error);
    status.set(CalibrationState::Calibrated, format!("Calibrated. Error: {:.4}", error));
    Some(error)
}

/// Per-camera mapping from board plane to image: `p = scale * [x, y] + translation`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub scale: f64,
    pub translation: [f64; 2],
}

impl CameraModel {
    pub fn project(&self, object: [f64; 3]) -> [f64; 2] {
        [
            self.scale * object[0] + self.translation[0],
            self.scale * object[1] + self.translation[1],
        ]
    }
}

#[derive(Debug, Serialize)]
struct ModelFile<'a> {
    cameras: &'a BTreeMap<usize, CameraModel>,
    error: Option<f64>,
}

/// Least-squares similarity fit per camera, over random subsamples of the
/// correspondences.
///
/// Each iteration fits a candidate on `n_samp_iter` points and scores it on
/// `n_samp_full` points; the best candidate wins. Without re-initialization
/// the previous model competes as a candidate too.
pub struct SimilaritySolver {
    models: BTreeMap<usize, CameraModel>,
    error: Option<f64>,
    rng: StdRng,
}

type Correspondence = ([f64; 3], [f64; 2]);

impl SimilaritySolver {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            models: BTreeMap::new(),
            error: None,
            rng,
        }
    }

    pub fn model(&self, camera_id: usize) -> Option<CameraModel> {
        self.models.get(&camera_id).copied()
    }

    fn fit(points: &[&Correspondence]) -> Option<CameraModel> {
        if points.len() < 2 {
            return None;
        }
        let n = points.len() as f64;
        let (mut mx, mut my, mut mu, mut mv) = (0.0, 0.0, 0.0, 0.0);
        for (obj, img) in points {
            mx += obj[0] / n;
            my += obj[1] / n;
            mu += img[0] / n;
            mv += img[1] / n;
        }

        let mut num = 0.0;
        let mut den = 0.0;
        for (obj, img) in points {
            let (dx, dy) = (obj[0] - mx, obj[1] - my);
            num += dx * (img[0] - mu) + dy * (img[1] - mv);
            den += dx * dx + dy * dy;
        }
        if den < f64::EPSILON {
            return None;
        }
        let scale = num / den;
        Some(CameraModel {
            scale,
            translation: [mu - scale * mx, mv - scale * my],
        })
    }

    /// Sum of squared pixel residuals.
    fn residual(model: &CameraModel, points: &[&Correspondence]) -> f64 {
        points
            .iter()
            .map(|(obj, img)| {
                let p = model.project(*obj);
                (p[0] - img[0]).powi(2) + (p[1] - img[1]).powi(2)
            })
            .sum()
    }

    fn sample<'a>(&mut self, points: &'a [Correspondence], n: usize) -> Vec<&'a Correspondence> {
        if n >= points.len() {
            return points.iter().collect();
        }
        points.choose_multiple(&mut self.rng, n).collect()
    }
}

impl Default for SimilaritySolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CalibrationSolver for SimilaritySolver {
    fn calibrate_rows(&mut self, rows: &DetectionSet, board: &dyn CalibrationBoard, params: &SolveParams) -> Option<f64> {
        let mut models = BTreeMap::new();
        let mut squared = 0.0;
        let mut count = 0usize;
        let mut evaluations = 0usize;

        for (&camera_id, camera_rows) in rows {
            let mut camera_rows = camera_rows.clone();
            board.fill_points_rows(&mut camera_rows);
            let points: Vec<Correspondence> = camera_rows
                .iter()
                .flat_map(|row| row.object_points.iter().copied().zip(row.corners.iter().copied()))
                .filter(|(obj, _)| obj.iter().all(|v| v.is_finite()))
                .collect();
            if points.len() < 2 {
                warn!("Camera {}: not enough correspondences to calibrate", camera_id);
                return None;
            }

            let scoring = self.sample(&points, params.n_samp_full.max(2));
            let mut best = if params.init_intrinsics {
                None
            } else {
                self.models
                    .get(&camera_id)
                    .map(|m| (*m, Self::residual(m, &scoring)))
            };
            for _ in 0..params.n_iters.max(1) {
                if evaluations >= params.max_nfev.max(1) {
                    break;
                }
                evaluations += 1;
                let subset = self.sample(&points, params.n_samp_iter.max(2));
                let Some(candidate) = Self::fit(&subset) else {
                    continue;
                };
                let score = Self::residual(&candidate, &scoring);
                if best.map_or(true, |(_, s)| score < s) {
                    best = Some((candidate, score));
                }
            }

            let (model, _) = best?;
            let all: Vec<&Correspondence> = points.iter().collect();
            squared += Self::residual(&model, &all);
            count += all.len();
            models.insert(camera_id, model);
        }

        if count == 0 {
            return None;
        }
        let error = (squared / count as f64).sqrt();
        if !error.is_finite() {
            return None;
        }
        self.models.extend(models);
        self.error = Some(error);
        Some(error)
    }

    fn dump(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }
        let file = ModelFile {
            cameras: &self.models,
            error: self.error,
        };
        let json = serde_json::to_string_pretty(&file)?;
        fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{Detection, DetectionRow, GridBoard};
    use crate::config::BoardConfig;
    use std::sync::atomic::AtomicUsize;

    fn board() -> Arc<GridBoard> {
        Arc::new(GridBoard::new(BoardConfig {
            rows: 2,
            cols: 3,
            square_length: 10.0,
            ..Default::default()
        }))
    }

    /// Rows seen through a camera with scale 2 and translation (5, 7).
    fn rows(cameras: &[usize]) -> DetectionSet {
        let model = CameraModel {
            scale: 2.0,
            translation: [5.0, 7.0],
        };
        let board = board();
        let mut set = DetectionSet::new();
        for &camera in cameras {
            let ids: Vec<u32> = (0..6).collect();
            let corners = ids
                .iter()
                .map(|&id| model.project(board.object_point(id).unwrap()))
                .collect();
            set.insert(camera, vec![DetectionRow::new(camera, 0, 0.0, Detection { corners, ids })]);
        }
        set
    }

    #[test]
    fn test_decide_init() {
        assert!(decide_init(None, 0.1, false));
        assert!(decide_init(Some(0.5), 0.1, false));
        assert!(!decide_init(Some(0.05), 0.1, false));
        assert!(decide_init(Some(0.05), 0.1, true));
    }

    #[test]
    fn test_similarity_solver_recovers_model() {
        let mut solver = SimilaritySolver::with_seed(1);
        let params = SolveParams::from_config(&CalibrationConfig::default(), true);
        let error = solver.calibrate_rows(&rows(&[0, 1]), board().as_ref(), &params).unwrap();
        assert!(error < 1e-9);
        let model = solver.model(1).unwrap();
        assert!((model.scale - 2.0).abs() < 1e-9);
        assert!((model.translation[0] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_failed_solve_keeps_model() {
        let mut solver = SimilaritySolver::with_seed(1);
        let params = SolveParams::from_config(&CalibrationConfig::default(), true);
        solver.calibrate_rows(&rows(&[0]), board().as_ref(), &params).unwrap();
        let before = solver.model(0);

        let mut degenerate = rows(&[0]);
        degenerate.get_mut(&0).unwrap()[0].ids.truncate(1);
        degenerate.get_mut(&0).unwrap()[0].corners.truncate(1);
        assert!(solver.calibrate_rows(&degenerate, board().as_ref(), &params).is_none());
        assert_eq!(solver.model(0), before);
    }

    /// Records how many solves overlap.
    struct SlowSolver {
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
        result: Option<f64>,
    }

    impl CalibrationSolver for SlowSolver {
        fn calibrate_rows(&mut self, _: &DetectionSet, _: &dyn CalibrationBoard, _: &SolveParams) -> Option<f64> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.result
        }

        fn dump(&self, path: &Path) -> Result<()> {
            fs::write(path, b"{}")?;
            Ok(())
        }
    }

    fn worker(dir: &Path, result: Option<f64>) -> (SolverWorker, Arc<AtomicUsize>, StatusCell<CalibrationState>, CalibrationSession) {
        let max_active = Arc::new(AtomicUsize::new(0));
        let solver = SlowSolver {
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::clone(&max_active),
            result,
        };
        let config = CalibrationConfig {
            output_dir: dir.to_path_buf(),
            ..Default::default()
        };
        let status = StatusCell::new(CalibrationState::ReadyToCalibrate);
        let session = CalibrationSession::new();
        let worker = SolverWorker::new(
            Box::new(solver),
            board(),
            session.clone(),
            DetectionStore::new(config.detections_path()),
            config,
            status.clone(),
        );
        (worker, max_active, status, session)
    }

    #[test]
    fn test_second_solve_is_refused_while_busy() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, max_active, status, session) = worker(dir.path(), Some(0.05));

        worker.start(SolveMode::Update).unwrap();
        assert!(worker.is_busy());
        assert_eq!(worker.start(SolveMode::Update), Err(CoreError::SolveInProgress));

        // waits for the first solve, then runs
        worker.start_after(SolveMode::Update, Duration::from_secs(5)).unwrap();
        assert_eq!(worker.wait(Duration::from_secs(5)).unwrap(), Some(0.05));
        assert!(!worker.is_busy());
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(session.history(), vec![0.05, 0.05]);
        assert_eq!(status.state(), CalibrationState::Calibrated);
        assert!(dir.path().join("calibration.json").exists());
    }

    #[test]
    fn test_failed_solve_clears_busy_only() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, _, status, session) = worker(dir.path(), None);
        session.record_error(0.3);

        worker.start(SolveMode::Update).unwrap();
        assert_eq!(worker.wait(Duration::from_secs(5)).unwrap(), None);
        assert!(!worker.is_busy());
        assert_eq!(session.history(), vec![0.3]);
        assert_eq!(status.get().text, "Failed to calibrate");
        assert!(!dir.path().join("calibration.json").exists());
    }

    #[test]
    fn test_recalibrate_without_store_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, max_active, status, _) = worker(dir.path(), Some(0.01));
        worker.start(SolveMode::Recalibrate).unwrap();
        assert_eq!(worker.wait(Duration::from_secs(5)).unwrap(), None);
        assert_eq!(max_active.load(Ordering::SeqCst), 0);
        assert_eq!(status.state(), CalibrationState::Failed);
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, max_active, status, _) = worker(dir.path(), Some(0.01));
        let result = worker.launch(SolveMode::Update, |_| Err(io::Error::other("no threads left")));
        assert_eq!(result, Err(CoreError::SolverUnavailable("no threads left".to_string())));
        assert!(!worker.is_busy());
        assert_eq!(status.state(), CalibrationState::Failed);
        assert_eq!(worker.wait(Duration::from_secs(1)).unwrap(), None);
        assert_eq!(max_active.load(Ordering::SeqCst), 0);

        // a later solve still runs
        worker.start(SolveMode::Update).unwrap();
        assert_eq!(worker.wait(Duration::from_secs(5)).unwrap(), Some(0.01));
    }
}
