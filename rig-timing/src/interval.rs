use std::time::Duration;

/// Countdown measured from its most recent restart.
///
/// Used for the ITI: every qualifying input event restarts the countdown, so
/// the interval only elapses after `length` of uninterrupted quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResettableInterval {
    length: Duration,
    started_ns: u64,
    restarts: u32,
}

impl ResettableInterval {
    pub fn start(length: Duration, now_ns: u64) -> Self {
        Self {
            length,
            started_ns: now_ns,
            restarts: 0,
        }
    }

    pub fn restart(&mut self, now_ns: u64) {
        self.started_ns = now_ns;
        self.restarts += 1;
    }

    pub fn length(&self) -> Duration {
        self.length
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn started_ns(&self) -> u64 {
        self.started_ns
    }

    pub fn remaining(&self, now_ns: u64) -> Duration {
        self.length
            .saturating_sub(Duration::from_nanos(now_ns.saturating_sub(self.started_ns)))
    }

    pub fn expired(&self, now_ns: u64) -> bool {
        self.remaining(now_ns).is_zero()
    }
}

/// Debounce: a condition must hold continuously for `hold` before it counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldTracker {
    hold: Duration,
    since_ns: Option<u64>,
}

impl HoldTracker {
    pub fn new(hold: Duration) -> Self {
        Self { hold, since_ns: None }
    }

    /// Feeds one sample; returns true once the condition has held long enough.
    /// Any false sample resets the counter to zero.
    pub fn observe(&mut self, now_ns: u64, condition: bool) -> bool {
        if !condition {
            self.since_ns = None;
            return false;
        }
        let since = *self.since_ns.get_or_insert(now_ns);
        Duration::from_nanos(now_ns.saturating_sub(since)) >= self.hold
    }

    pub fn held_since(&self) -> Option<u64> {
        self.since_ns
    }
}
