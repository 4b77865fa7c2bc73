use crate::error::HardwareError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A digital line on the rig, addressed by board pin number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(pub u16);

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn inverted(self) -> Self {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

/// Which electrical level means "on" for a line.
///
/// Solenoid drivers are active-high; the cue light and the IR beam on the
/// nose-poke port are wired active-low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    #[default]
    ActiveHigh,
    ActiveLow,
}

impl Polarity {
    pub fn active(self) -> Level {
        match self {
            Polarity::ActiveHigh => Level::High,
            Polarity::ActiveLow => Level::Low,
        }
    }

    pub fn inactive(self) -> Level {
        self.active().inverted()
    }

    pub fn is_active(self, level: Level) -> bool {
        level == self.active()
    }
}

/// Digital I/O gateway the engine drives.
///
/// Implementations must tolerate concurrent calls on *disjoint* channels from
/// several threads; they need not be reentrant for the same channel.
pub trait DigitalIo: Send + Sync {
    fn configure(&self, channel: Channel, direction: Direction) -> Result<(), HardwareError>;
    /// Configures `channel` as an output that comes up at `initial`.
    fn configure_output(&self, channel: Channel, initial: Level) -> Result<(), HardwareError> {
        self.configure(channel, Direction::Output)?;
        self.write(channel, initial)
    }
    fn write(&self, channel: Channel, level: Level) -> Result<(), HardwareError>;
    fn read(&self, channel: Channel) -> Result<Level, HardwareError>;
    /// Returns every channel to its power-on state and releases the device.
    fn release_all(&self) -> Result<(), HardwareError>;
}

impl<T: DigitalIo + ?Sized> DigitalIo for std::sync::Arc<T> {
    fn configure(&self, channel: Channel, direction: Direction) -> Result<(), HardwareError> {
        (**self).configure(channel, direction)
    }
    fn configure_output(&self, channel: Channel, initial: Level) -> Result<(), HardwareError> {
        (**self).configure_output(channel, initial)
    }
    fn write(&self, channel: Channel, level: Level) -> Result<(), HardwareError> {
        (**self).write(channel, level)
    }
    fn read(&self, channel: Channel) -> Result<Level, HardwareError> {
        (**self).read(channel)
    }
    fn release_all(&self) -> Result<(), HardwareError> {
        (**self).release_all()
    }
}
