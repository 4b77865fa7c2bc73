use crate::io::{Channel, Level, Polarity};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A controlled output: solenoid valve, vacuum line, cue light or marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actuator {
    pub name: String,
    pub channel: Channel,
    /// Default open time for one actuation.
    pub open_duration: Duration,
    /// Output that mirrors this actuator into the recording system.
    pub monitor: Option<Channel>,
    pub polarity: Polarity,
}

impl Actuator {
    pub fn new(name: impl Into<String>, channel: Channel, open_duration: Duration) -> Self {
        Self {
            name: name.into(),
            channel,
            open_duration,
            monitor: None,
            polarity: Polarity::ActiveHigh,
        }
    }

    pub fn with_monitor(mut self, monitor: Channel) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_polarity(mut self, polarity: Polarity) -> Self {
        self.polarity = polarity;
        self
    }

    /// Every line this actuator drives, primary first.
    pub fn channels(&self) -> impl Iterator<Item = Channel> + '_ {
        std::iter::once(self.channel).chain(self.monitor)
    }

    /// `(channel, level)` writes that switch the actuator on, in order.
    pub fn on_writes(&self) -> Vec<(Channel, Level)> {
        let mut writes = vec![(self.channel, self.polarity.active())];
        if let Some(m) = self.monitor {
            writes.push((m, Level::High));
        }
        writes
    }

    /// `(channel, level)` writes that switch the actuator off, in order.
    pub fn off_writes(&self) -> Vec<(Channel, Level)> {
        let mut writes = vec![(self.channel, self.polarity.inactive())];
        if let Some(m) = self.monitor {
            writes.push((m, Level::Low));
        }
        writes
    }
}

/// One actuator of a stimulus delivery group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryStep {
    pub actuator: Actuator,
    /// Onset delay from the group's common start.
    pub offset: Duration,
    pub hold: Duration,
}

impl DeliveryStep {
    pub fn immediate(actuator: Actuator) -> Self {
        let hold = actuator.open_duration;
        Self {
            actuator,
            offset: Duration::ZERO,
            hold,
        }
    }

    /// When this step's actuator closes, relative to the group start.
    pub fn end(&self) -> Duration {
        self.offset + self.hold
    }
}

/// A trial type. Immutable for the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stimulus {
    pub name: String,
    pub delivery: Vec<DeliveryStep>,
    pub cue: Option<Actuator>,
}

impl Stimulus {
    pub fn new(name: impl Into<String>, delivery: Vec<DeliveryStep>) -> Self {
        Self {
            name: name.into(),
            delivery,
            cue: None,
        }
    }

    pub fn with_cue(mut self, cue: Actuator) -> Self {
        self.cue = Some(cue);
        self
    }

    /// Span from the first onset to the last closing.
    pub fn delivery_span(&self) -> Duration {
        self.delivery
            .iter()
            .map(DeliveryStep::end)
            .max()
            .unwrap_or_default()
    }
}
