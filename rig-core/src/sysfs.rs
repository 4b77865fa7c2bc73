//! Linux sysfs GPIO gateway (`/sys/class/gpio`).
//!
//! Channels are kernel GPIO numbers. Exported lines are unexported again on
//! `release_all`.

use crate::error::HardwareError;
use crate::io::{Channel, DigitalIo, Direction, Level};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

pub struct SysfsGateway {
    root: PathBuf,
    exported: Mutex<BTreeSet<Channel>>,
}

impl SysfsGateway {
    pub fn new() -> Self {
        Self::with_root("/sys/class/gpio")
    }

    /// Uses an alternative sysfs root; tests point this at a temp directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            exported: Mutex::new(BTreeSet::new()),
        }
    }

    fn line(&self, channel: Channel) -> PathBuf {
        self.root.join(format!("gpio{}", channel.0))
    }

    fn export(&self, channel: Channel) -> Result<(), HardwareError> {
        if self.line(channel).exists() {
            return Ok(());
        }
        fs::write(self.root.join("export"), channel.0.to_string())
            .map_err(|e| HardwareError::new("export", channel, e.to_string()))?;
        // udev needs a moment to fix permissions on fresh lines.
        std::thread::sleep(Duration::from_millis(50));
        Ok(())
    }

    fn set_direction(&self, channel: Channel, dir: &str) -> Result<(), HardwareError> {
        self.export(channel)?;
        fs::write(self.line(channel).join("direction"), dir)
            .map_err(|e| HardwareError::new("configure", channel, e.to_string()))?;
        self.exported.lock().insert(channel);
        Ok(())
    }
}

impl Default for SysfsGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl DigitalIo for SysfsGateway {
    fn configure(&self, channel: Channel, direction: Direction) -> Result<(), HardwareError> {
        let dir = match direction {
            Direction::Input => "in",
            Direction::Output => "low",
        };
        self.set_direction(channel, dir)?;
        debug!("Configured {} as {:?}", channel, direction);
        Ok(())
    }

    /// Writes `high` or `low` to `direction`, so the line switches to output
    /// already at `initial`.
    fn configure_output(&self, channel: Channel, initial: Level) -> Result<(), HardwareError> {
        let dir = match initial {
            Level::Low => "low",
            Level::High => "high",
        };
        self.set_direction(channel, dir)?;
        debug!("Configured {} as output at {:?}", channel, initial);
        Ok(())
    }

    fn write(&self, channel: Channel, level: Level) -> Result<(), HardwareError> {
        let value = match level {
            Level::Low => "0",
            Level::High => "1",
        };
        fs::write(self.line(channel).join("value"), value)
            .map_err(|e| HardwareError::new("write", channel, e.to_string()))
    }

    fn read(&self, channel: Channel) -> Result<Level, HardwareError> {
        let raw = fs::read_to_string(self.line(channel).join("value"))
            .map_err(|e| HardwareError::new("read", channel, e.to_string()))?;
        match raw.trim() {
            "0" => Ok(Level::Low),
            "1" => Ok(Level::High),
            other => Err(HardwareError::new("read", channel, format!("unexpected value {other:?}"))),
        }
    }

    fn release_all(&self) -> Result<(), HardwareError> {
        let channels: Vec<Channel> = std::mem::take(&mut *self.exported.lock()).into_iter().collect();
        let mut first_err = None;
        for channel in channels {
            if let Err(e) = fs::write(self.root.join("unexport"), channel.0.to_string()) {
                warn!("Failed to unexport {}: {}", channel, e);
                first_err.get_or_insert(HardwareError::new("release_all", channel, e.to_string()));
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
