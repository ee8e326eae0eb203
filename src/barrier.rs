//! Rendezvous barrier with a per-call timeout and an abort switch.
//!
//! `std::sync::Barrier` can neither time out nor be broken, so a camera that
//! stops would leave its siblings blocked forever. Here a timeout or an
//! explicit [`SyncBarrier::abort`] breaks the barrier: every waiter, current
//! and future, is released with an error until [`SyncBarrier::reset`].

use crate::utils::lock;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierError {
    #[error("barrier is broken")]
    Broken,
    #[error("timed out waiting at barrier")]
    Timeout,
}

#[derive(Debug)]
struct State {
    arrived: usize,
    generation: u64,
    broken: bool,
}

#[derive(Debug)]
pub struct SyncBarrier {
    parties: usize,
    timeout: Duration,
    state: Mutex<State>,
    cvar: Condvar,
}

impl SyncBarrier {
    /// A barrier for `parties` threads. `parties` is clamped to at least 1.
    pub fn new(parties: usize, timeout: Duration) -> Self {
        Self {
            parties: parties.max(1),
            timeout,
            state: Mutex::new(State {
                arrived: 0,
                generation: 0,
                broken: false,
            }),
            cvar: Condvar::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Blocks until all parties have arrived.
    ///
    /// Returns `Ok(true)` for exactly one thread per cycle (the last to
    /// arrive). A timeout breaks the barrier for everyone.
    pub fn wait(&self) -> Result<bool, BarrierError> {
        let mut state = lock(&self.state);
        if state.broken {
            return Err(BarrierError::Broken);
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cvar.notify_all();
            return Ok(true);
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                state.broken = true;
                self.cvar.notify_all();
                return Err(BarrierError::Timeout);
            }
            let (guard, _) = self
                .cvar
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            // released before anyone broke it
            if state.generation != generation {
                return Ok(false);
            }
            if state.broken {
                return Err(BarrierError::Broken);
            }
        }
    }

    /// Breaks the barrier, releasing all current and future waiters.
    pub fn abort(&self) {
        let mut state = lock(&self.state);
        state.broken = true;
        self.cvar.notify_all();
    }

    pub fn is_broken(&self) -> bool {
        lock(&self.state).broken
    }

    /// Returns the barrier to its initial state. Only call this once every
    /// participant has stopped waiting.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.arrived = 0;
        state.generation = state.generation.wrapping_add(1);
        state.broken = false;
    }
}
