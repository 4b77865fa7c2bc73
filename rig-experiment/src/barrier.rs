//! Onset barrier for synchronized delivery groups.

use parking_lot::{Condvar, Mutex};
use rig_timing::{Clock, Interrupt, Waiter};
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierError {
    /// This participant's own wait ran out.
    TimedOut,
    /// Another participant gave up or failed before everyone arrived.
    Broken,
    Cancelled,
    /// The session deadline passed while waiting.
    Deadline,
}

impl fmt::Display for BarrierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BarrierError::TimedOut => f.write_str("timed out waiting for the group"),
            BarrierError::Broken => f.write_str("group abandoned before onset"),
            BarrierError::Cancelled => f.write_str("cancelled at the onset barrier"),
            BarrierError::Deadline => f.write_str("session deadline reached at the onset barrier"),
        }
    }
}

impl std::error::Error for BarrierError {}

#[derive(Debug, Default)]
struct State {
    arrived: usize,
    released: Option<Instant>,
    broken: bool,
}

/// Single-use barrier: releases every participant at once when `arity` have
/// arrived, or fails all of them if any one times out, is interrupted or
/// abandons the group.
#[derive(Debug)]
pub struct OnsetBarrier {
    arity: usize,
    state: Mutex<State>,
    cond: Condvar,
}

impl OnsetBarrier {
    pub fn new(arity: usize) -> Self {
        Self {
            arity,
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn is_broken(&self) -> bool {
        self.state.lock().broken
    }

    /// Marks the group as failed and wakes every waiter.
    pub fn abandon(&self) {
        let mut state = self.state.lock();
        if state.released.is_none() {
            state.broken = true;
            self.cond.notify_all();
        }
    }

    /// Blocks until the group is complete. Returns the common release time.
    /// The waiter's cancel token and deadline are checked every slice.
    pub fn wait<C: Clock>(&self, timeout: Duration, waiter: &Waiter<C>) -> Result<Instant, BarrierError> {
        let deadline = Instant::now() + timeout;
        let slice = waiter.slice().max(Duration::from_millis(1));
        let mut state = self.state.lock();
        if state.broken {
            return Err(BarrierError::Broken);
        }
        state.arrived += 1;
        if state.arrived == self.arity {
            let now = Instant::now();
            state.released = Some(now);
            self.cond.notify_all();
            return Ok(now);
        }
        loop {
            if let Some(at) = state.released {
                return Ok(at);
            }
            if state.broken {
                return Err(BarrierError::Broken);
            }
            let failed = match waiter.check() {
                Err(Interrupt::Cancelled) => Some(BarrierError::Cancelled),
                Err(Interrupt::Deadline) => Some(BarrierError::Deadline),
                Ok(()) if Instant::now() >= deadline => Some(BarrierError::TimedOut),
                Ok(()) => None,
            };
            if let Some(e) = failed {
                state.broken = true;
                self.cond.notify_all();
                return Err(e);
            }
            let wait = deadline.saturating_duration_since(Instant::now()).min(slice);
            self.cond.wait_for(&mut state, wait);
        }
    }
}
