//! Debounced sampling of the nose-poke beam.

use rig_core::{Channel, DigitalIo, HardwareError, Polarity, RigResult};
use rig_timing::{Clock, HoldTracker, PollStats, ResettableInterval, Waiter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorLine {
    pub channel: Channel,
    pub polarity: Polarity,
}

/// Result of waiting for a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PokeWait {
    /// `latency` runs from the start of the wait to the first sample of the
    /// accepted hold.
    Poked { latency: Duration },
    WindowElapsed,
}

pub struct SensorPoller<G: DigitalIo> {
    io: Arc<G>,
    line: SensorLine,
    stats: PollStats,
    last_sample_ns: Option<u64>,
}

impl<G: DigitalIo> SensorPoller<G> {
    pub fn new(io: Arc<G>, line: SensorLine) -> Self {
        Self {
            io,
            line,
            stats: PollStats::default(),
            last_sample_ns: None,
        }
    }

    pub fn line(&self) -> SensorLine {
        self.line
    }

    pub fn stats(&self) -> &PollStats {
        &self.stats
    }

    /// Reads the line once; true when the beam is broken.
    pub fn sample(&mut self, now_ns: u64) -> Result<bool, HardwareError> {
        let level = self.io.read(self.line.channel)?;
        if let Some(prev) = self.last_sample_ns.replace(now_ns) {
            self.stats
                .record(Duration::from_nanos(now_ns.saturating_sub(prev)));
        }
        Ok(self.line.polarity.is_active(level))
    }

    /// Waits for a poke held at least `hold`. With a `window`, gives up once
    /// the window has passed without an accepted poke.
    pub fn wait_for_poke<C: Clock>(
        &mut self,
        hold: Duration,
        window: Option<Duration>,
        waiter: &Waiter<C>,
    ) -> RigResult<PokeWait> {
        let start = waiter.now();
        let mut tracker = HoldTracker::new(hold);
        let mut outcome = PokeWait::WindowElapsed;
        waiter.poll_until(|| -> RigResult<bool> {
            let now = waiter.now();
            if tracker.observe(now, self.sample(now)?) {
                let since = tracker.held_since().unwrap_or(now);
                outcome = PokeWait::Poked {
                    latency: Duration::from_nanos(since.saturating_sub(start)),
                };
                return Ok(true);
            }
            Ok(window.is_some_and(|w| Duration::from_nanos(now - start) >= w))
        })?;
        Ok(outcome)
    }

    /// Waits until the beam has stayed clear for `hold`; every renewed poke
    /// starts the count again. Returns the time spent waiting.
    pub fn wait_for_release<C: Clock>(&mut self, hold: Duration, waiter: &Waiter<C>) -> RigResult<Duration> {
        let mut tracker = HoldTracker::new(hold);
        waiter.poll_until(|| -> RigResult<bool> {
            let now = waiter.now();
            let clear = !self.sample(now)?;
            Ok(tracker.observe(now, clear))
        })
    }

    /// Runs `interval` to expiry. With `resets`, every sample with the beam
    /// broken restarts it; `on_poke` sees the start of each new poke.
    pub fn wait_quiet<C: Clock>(
        &mut self,
        interval: &mut ResettableInterval,
        resets: bool,
        waiter: &Waiter<C>,
        mut on_poke: impl FnMut(u64),
    ) -> RigResult<()> {
        let mut was_active = false;
        loop {
            let now = waiter.now();
            if resets {
                let active = self.sample(now)?;
                if active {
                    if !was_active {
                        on_poke(now);
                    }
                    interval.restart(now);
                }
                was_active = active;
            }
            let remaining = interval.remaining(now);
            if remaining.is_zero() {
                return Ok(());
            }
            waiter.sleep(remaining.min(waiter.slice()))?;
        }
    }
}
