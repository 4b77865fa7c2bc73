//! Simulated digital I/O gateway.
//!
//! `MockGateway` stands in for the rig's GPIO header in tests and in
//! `--simulate` runs. It keeps the current level of every line, a history of
//! writes, scripted input levels, and injectable faults (failed or slow
//! writes) for exercising the recovery paths.

use crate::error::HardwareError;
use crate::io::{Channel, DigitalIo, Direction, Level};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

type InputScript = Arc<dyn Fn() -> Level + Send + Sync>;

/// A write accepted by the mock, in acceptance order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriteRecord {
    pub channel: Channel,
    pub level: Level,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct WriteFault {
    level: Option<Level>,
    remaining: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct WriteDelay {
    delay: Duration,
    remaining: Option<usize>,
}

#[derive(Default)]
struct Inner {
    directions: HashMap<Channel, Direction>,
    levels: HashMap<Channel, Level>,
    inputs: HashMap<Channel, InputScript>,
    write_faults: HashMap<Channel, WriteFault>,
    read_faults: HashMap<Channel, usize>,
    write_delays: HashMap<Channel, WriteDelay>,
    history: Vec<WriteRecord>,
    releases: usize,
}

#[derive(Clone, Default)]
pub struct MockGateway {
    inner: Arc<Mutex<Inner>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds an input line at a constant level.
    pub fn set_input(&self, channel: Channel, level: Level) {
        self.script_input(channel, move || level);
    }

    /// Drives an input line from a closure, typically of a shared clock.
    pub fn script_input(&self, channel: Channel, script: impl Fn() -> Level + Send + Sync + 'static) {
        self.inner.lock().inputs.insert(channel, Arc::new(script));
    }

    /// Fails the next `count` writes to `channel` (of `level` only, if given).
    pub fn fail_writes(&self, channel: Channel, level: Option<Level>, count: usize) {
        self.inner.lock().write_faults.insert(
            channel,
            WriteFault {
                level,
                remaining: Some(count),
            },
        );
    }

    /// Fails every write to `channel` of `level` (or any level).
    pub fn fail_all_writes(&self, channel: Channel, level: Option<Level>) {
        self.inner.lock().write_faults.insert(
            channel,
            WriteFault {
                level,
                remaining: None,
            },
        );
    }

    pub fn clear_faults(&self, channel: Channel) {
        let mut inner = self.inner.lock();
        inner.write_faults.remove(&channel);
        inner.read_faults.remove(&channel);
    }

    pub fn fail_reads(&self, channel: Channel, count: usize) {
        self.inner.lock().read_faults.insert(channel, count);
    }

    /// Makes every write to `channel` block for `delay` before taking effect.
    pub fn delay_writes(&self, channel: Channel, delay: Duration) {
        self.inner
            .lock()
            .write_delays
            .insert(channel, WriteDelay { delay, remaining: None });
    }

    /// Delays only the next `count` writes to `channel`.
    pub fn delay_next_writes(&self, channel: Channel, delay: Duration, count: usize) {
        self.inner.lock().write_delays.insert(
            channel,
            WriteDelay {
                delay,
                remaining: Some(count),
            },
        );
    }

    pub fn level(&self, channel: Channel) -> Option<Level> {
        self.inner.lock().levels.get(&channel).copied()
    }

    pub fn direction(&self, channel: Channel) -> Option<Direction> {
        self.inner.lock().directions.get(&channel).copied()
    }

    pub fn history(&self) -> Vec<WriteRecord> {
        self.inner.lock().history.clone()
    }

    /// Accepted writes to one channel, in order.
    pub fn writes_to(&self, channel: Channel) -> Vec<Level> {
        self.inner
            .lock()
            .history
            .iter()
            .filter(|w| w.channel == channel)
            .map(|w| w.level)
            .collect()
    }

    /// First time `channel` was driven to `level`.
    pub fn first_write(&self, channel: Channel, level: Level) -> Option<Instant> {
        self.inner
            .lock()
            .history
            .iter()
            .find(|w| w.channel == channel && w.level == level)
            .map(|w| w.at)
    }

    pub fn releases(&self) -> usize {
        self.inner.lock().releases
    }

    fn take_write_fault(inner: &mut Inner, channel: Channel, level: Level) -> bool {
        let Some(fault) = inner.write_faults.get_mut(&channel) else {
            return false;
        };
        if fault.level.is_some_and(|l| l != level) {
            return false;
        }
        match fault.remaining.as_mut() {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }

    fn take_write_delay(inner: &mut Inner, channel: Channel) -> Option<Duration> {
        let slow = inner.write_delays.get_mut(&channel)?;
        let delay = slow.delay;
        match slow.remaining.as_mut() {
            None => Some(delay),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(delay)
            }
        }
    }
}

impl DigitalIo for MockGateway {
    fn configure(&self, channel: Channel, direction: Direction) -> Result<(), HardwareError> {
        let mut inner = self.inner.lock();
        inner.directions.insert(channel, direction);
        if direction == Direction::Output {
            inner.levels.entry(channel).or_insert(Level::Low);
        }
        Ok(())
    }

    /// Never passes through the default low level; the first write is `initial`.
    fn configure_output(&self, channel: Channel, initial: Level) -> Result<(), HardwareError> {
        self.inner.lock().directions.insert(channel, Direction::Output);
        self.write(channel, initial)
    }

    fn write(&self, channel: Channel, level: Level) -> Result<(), HardwareError> {
        let delay = {
            let mut inner = self.inner.lock();
            if inner.directions.get(&channel) != Some(&Direction::Output) {
                return Err(HardwareError::new("write", channel, "channel not configured as output"));
            }
            if Self::take_write_fault(&mut inner, channel, level) {
                return Err(HardwareError::new("write", channel, "injected fault"));
            }
            Self::take_write_delay(&mut inner, channel)
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut inner = self.inner.lock();
        inner.levels.insert(channel, level);
        inner.history.push(WriteRecord {
            channel,
            level,
            at: Instant::now(),
        });
        Ok(())
    }

    fn read(&self, channel: Channel) -> Result<Level, HardwareError> {
        let script = {
            let mut inner = self.inner.lock();
            if let Some(n) = inner.read_faults.get_mut(&channel) {
                if *n > 0 {
                    *n -= 1;
                    return Err(HardwareError::new("read", channel, "injected fault"));
                }
            }
            match inner.directions.get(&channel) {
                Some(Direction::Input) => inner.inputs.get(&channel).cloned(),
                _ => return Err(HardwareError::new("read", channel, "channel not configured as input")),
            }
        };
        // The script may consult other shared state; never call it under our lock.
        Ok(script.map_or(Level::Low, |f| f()))
    }

    fn release_all(&self) -> Result<(), HardwareError> {
        let mut inner = self.inner.lock();
        inner.releases += 1;
        inner.directions.clear();
        Ok(())
    }
}
