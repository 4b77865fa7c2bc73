use crate::cancel::CancelToken;
use crate::clock::Clock;
use std::fmt;
use std::time::Duration;

/// Why a wait ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    Deadline,
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::Cancelled => f.write_str("cancelled by operator"),
            Interrupt::Deadline => f.write_str("session deadline reached"),
        }
    }
}

impl std::error::Error for Interrupt {}

/// Blocking waits sliced at the poll interval.
///
/// Every slice boundary checks the cancel token and the optional deadline, so
/// an interrupt is observed at most one slice late.
#[derive(Debug, Clone)]
pub struct Waiter<C: Clock> {
    clock: C,
    cancel: CancelToken,
    deadline_ns: Option<u64>,
    slice: Duration,
}

impl<C: Clock> Waiter<C> {
    pub fn new(clock: C, cancel: CancelToken, slice: Duration) -> Self {
        Self {
            clock,
            cancel,
            deadline_ns: None,
            slice,
        }
    }

    pub fn with_deadline(mut self, deadline_ns: u64) -> Self {
        self.deadline_ns = Some(deadline_ns);
        self
    }

    /// Same clock, deadline and slice, observing `cancel` instead.
    pub fn with_cancel(&self, cancel: CancelToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn slice(&self) -> Duration {
        self.slice
    }

    pub fn deadline_ns(&self) -> Option<u64> {
        self.deadline_ns
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn check(&self) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        match self.deadline_ns {
            Some(deadline) if self.clock.now() > deadline => Err(Interrupt::Deadline),
            _ => Ok(()),
        }
    }

    pub fn sleep(&self, d: Duration) -> Result<(), Interrupt> {
        self.check()?;
        let end = self.clock.now().saturating_add(d.as_nanos() as u64);
        loop {
            let now = self.clock.now();
            if now >= end {
                return Ok(());
            }
            let chunk = Duration::from_nanos(end - now).min(self.slice);
            self.clock.sleep(chunk);
            self.check()?;
        }
    }

    /// Evaluates `ready` every slice until it returns true; yields the time
    /// spent waiting.
    pub fn poll_until<E, F>(&self, mut ready: F) -> Result<Duration, E>
    where
        E: From<Interrupt>,
        F: FnMut() -> Result<bool, E>,
    {
        let start = self.clock.now();
        loop {
            self.check()?;
            if ready()? {
                return Ok(self.clock.elapsed(start));
            }
            self.clock.sleep(self.slice);
        }
    }
}

/// Plain cancellable sleep without a deadline.
pub fn sleep_for<C: Clock>(clock: &C, cancel: &CancelToken, d: Duration, slice: Duration) -> Result<(), Interrupt> {
    Waiter::new(clock.clone(), cancel.clone(), slice).sleep(d)
}
