use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// A utility for tracking frames per second.
pub struct FpsCounter {
    frame_count: u32,
    last_time: Instant,
    interval: Duration,
}

impl FpsCounter {
    /// Create a new FPS counter with a one second reporting interval.
    pub fn new() -> Self {
        Self {
            frame_count: 0,
            last_time: Instant::now(),
            interval: Duration::from_secs(1),
        }
    }

    /// Update the counter with a new frame.
    /// Returns Some(fps) if the reporting interval has passed, otherwise None.
    pub fn update(&mut self) -> Option<f64> {
        self.frame_count += 1;
        let elapsed = self.last_time.elapsed();

        if elapsed >= self.interval {
            let fps = self.frame_count as f64 / elapsed.as_secs_f64();
            self.frame_count = 0;
            self.last_time = Instant::now();
            Some(fps)
        } else {
            None
        }
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic clock shared by all cameras of a rig so their timestamps are
/// directly comparable.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    epoch: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    /// Seconds since the epoch.
    pub fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Sleeps until `target` seconds after the epoch, in slices no longer than
    /// `max_slice`. Returns early if `target` is already in the past.
    pub fn sleep_until(&self, target: f64, max_slice: Duration) {
        let remaining = target - self.now();
        if remaining > 0.0 {
            thread::sleep(Duration::from_secs_f64(remaining).min(max_slice));
        }
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Locks a mutex, recovering the data if another thread panicked while
/// holding it. Shared state here is queues and counters that stay valid.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Waits for a thread to finish for at most `timeout`.
///
/// Returns `Err(handle)` if the thread is still running so the caller can
/// decide what to do with it.
pub fn join_timeout<T>(handle: JoinHandle<T>, timeout: Duration) -> Result<thread::Result<T>, JoinHandle<T>> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Err(handle);
        }
        thread::sleep(Duration::from_millis(1));
    }
    Ok(handle.join())
}

/// Named thread handles that are always joined, never left to process exit.
pub struct ThreadGroup<T> {
    handles: Vec<(String, JoinHandle<T>)>,
}

impl<T: Send + 'static> ThreadGroup<T> {
    pub fn new() -> Self {
        Self { handles: Vec::new() }
    }

    pub fn spawn<F>(&mut self, name: impl Into<String>, f: F) -> std::io::Result<()>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let name = name.into();
        let handle = thread::Builder::new().name(name.clone()).spawn(f)?;
        self.handles.push((name, handle));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Joins every thread, sharing one overall deadline. Threads that panic or
    /// miss the deadline yield `None` and are logged.
    pub fn join_all(&mut self, timeout: Duration) -> Vec<(String, Option<T>)> {
        let deadline = Instant::now() + timeout;
        let mut results = Vec::with_capacity(self.handles.len());
        for (name, handle) in self.handles.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match join_timeout(handle, remaining) {
                Ok(Ok(value)) => results.push((name, Some(value))),
                Ok(Err(_)) => {
                    error!("Thread {} panicked", name);
                    results.push((name, None));
                }
                Err(_) => {
                    warn!("Thread {} did not finish within {:?}; detaching", name, timeout);
                    results.push((name, None));
                }
            }
        }
        results
    }
}

impl<T: Send + 'static> Default for ThreadGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}
