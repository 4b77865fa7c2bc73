//! Session configuration.
//!
//! `SessionConfig` is the TOML document an operator edits; `validate` turns it
//! into a `SessionSetup` with names resolved to actuators and every duration
//! converted, or reports every problem it found in one `Configuration` error.

use crate::iti::{ItiDraw, ItiRegime, ItiSchedule};
use crate::sensor::SensorLine;
use rig_core::{
    Actuator, Channel, DeliveryStep, Polarity, Protocol, ProtocolKind, RigError, RigResult,
    Stimulus,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub protocol: ProtocolKind,
    /// Presentations of each stimulus.
    pub repeats: usize,
    pub max_trials: Option<usize>,
    pub max_duration_s: f64,
    pub poll_interval_s: f64,
    pub start_delay_s: f64,
    pub debounce_s: f64,
    pub withdrawal_hold_s: f64,
    pub response_window_s: Option<f64>,
    /// How long cue and lights stay on after the last delivery.
    pub cue_hold_s: f64,
    pub sync_timeout_s: f64,
    /// Consecutive hardware-aborted trials tolerated before the session fails.
    pub hardware_retry_budget: u32,
    pub seed: Option<u64>,
    pub sensor: Option<SensorConfig>,
    /// Actuators switched on with every trial's cue.
    pub lights: Vec<String>,
    pub reward: Option<String>,
    pub iti: ItiConfig,
    pub actuators: Vec<ActuatorConfig>,
    pub stimuli: Vec<StimulusConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorConfig {
    pub channel: u16,
    #[serde(default = "beam_polarity")]
    pub polarity: Polarity,
}

fn beam_polarity() -> Polarity {
    Polarity::ActiveLow
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ItiConfig {
    pub draw: ItiDrawKind,
    /// Step between candidate lengths for discrete draws.
    pub step_s: Option<f64>,
    /// Overrides the protocol's reset-on-poke behaviour.
    pub resets_on_poke: Option<bool>,
    pub regimes: Vec<ItiRegimeConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItiDrawKind {
    #[default]
    Uniform,
    Discrete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ItiRegimeConfig {
    pub through_trial: Option<usize>,
    /// Regime boundary as a fraction of the plan length (0.5 = first half).
    pub through_fraction: Option<f64>,
    pub min_s: f64,
    pub max_s: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActuatorConfig {
    pub name: String,
    pub channel: u16,
    #[serde(default)]
    pub open_s: f64,
    pub monitor: Option<u16>,
    #[serde(default)]
    pub polarity: Polarity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StimulusConfig {
    pub name: String,
    pub actuators: Vec<String>,
    /// Per-actuator onset offsets; all zero when omitted.
    #[serde(default)]
    pub offsets_s: Vec<f64>,
    pub cue: Option<String>,
}

impl Default for ItiConfig {
    fn default() -> Self {
        Self {
            draw: ItiDrawKind::Uniform,
            step_s: None,
            resets_on_poke: None,
            regimes: vec![ItiRegimeConfig {
                through_trial: None,
                through_fraction: None,
                min_s: 1.0,
                max_s: 1.0,
            }],
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolKind::Passive,
            repeats: 20,
            max_trials: None,
            max_duration_s: 3600.0,
            poll_interval_s: 0.01,
            start_delay_s: 0.0,
            debounce_s: 0.1,
            withdrawal_hold_s: 0.5,
            response_window_s: None,
            cue_hold_s: 0.0,
            sync_timeout_s: 1.0,
            hardware_retry_budget: 3,
            seed: None,
            sensor: None,
            lights: Vec::new(),
            reward: None,
            iti: ItiConfig::default(),
            actuators: Vec::new(),
            stimuli: Vec::new(),
        }
    }
}

/// Durations the session runs against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionTiming {
    pub max_trials: Option<usize>,
    pub max_duration: Duration,
    pub poll_interval: Duration,
    pub start_delay: Duration,
    pub debounce: Duration,
    pub withdrawal_hold: Duration,
    pub response_window: Option<Duration>,
    pub cue_hold: Duration,
    pub sync_timeout: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            max_trials: None,
            max_duration: Duration::from_secs(3600),
            poll_interval: Duration::from_millis(10),
            start_delay: Duration::ZERO,
            debounce: Duration::from_millis(100),
            withdrawal_hold: Duration::from_millis(500),
            response_window: None,
            cue_hold: Duration::ZERO,
            sync_timeout: Duration::from_secs(1),
        }
    }
}

/// A validated session: everything the controller needs, names resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub protocol: ProtocolKind,
    pub stimuli: Vec<Stimulus>,
    pub repeats: usize,
    /// Every declared output, in declaration order.
    pub outputs: Vec<Actuator>,
    pub sensor: Option<SensorLine>,
    pub lights: Vec<Actuator>,
    pub reward: Option<Actuator>,
    pub iti: ItiSchedule,
    pub iti_resets_on_poke: bool,
    pub timing: SessionTiming,
    pub hardware_retry_budget: u32,
    pub seed: Option<u64>,
}

impl SessionSetup {
    pub fn plan_len(&self) -> usize {
        self.stimuli.len() * self.repeats
    }

    /// Trials the session will attempt at most.
    pub fn trial_limit(&self) -> usize {
        self.timing
            .max_trials
            .map_or(self.plan_len(), |m| m.min(self.plan_len()))
    }
}

impl SessionConfig {
    pub fn from_toml_str(text: &str) -> RigResult<Self> {
        toml::from_str(text).map_err(|e| RigError::config(format!("invalid session file: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> RigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RigError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Resolves a subset of actuators by name (maintenance commands).
    pub fn actuators_named(&self, names: &[String]) -> RigResult<Vec<Actuator>> {
        let mut errors = Errors::default();
        let outputs = self.build_outputs(&mut errors);
        let by_name: BTreeMap<&str, &Actuator> =
            outputs.iter().map(|a| (a.name.as_str(), a)).collect();
        let mut picked = Vec::new();
        for name in names {
            match by_name.get(name.as_str()) {
                Some(a) => picked.push((*a).clone()),
                None => errors.push(format!("unknown actuator '{name}'")),
            }
        }
        errors.finish(picked)
    }

    pub fn validate(&self) -> RigResult<SessionSetup> {
        let mut errors = Errors::default();

        let timing = SessionTiming {
            max_trials: self.max_trials,
            max_duration: errors.duration("max_duration_s", self.max_duration_s),
            poll_interval: errors.duration("poll_interval_s", self.poll_interval_s),
            start_delay: errors.duration("start_delay_s", self.start_delay_s),
            debounce: errors.duration("debounce_s", self.debounce_s),
            withdrawal_hold: errors.duration("withdrawal_hold_s", self.withdrawal_hold_s),
            response_window: self
                .response_window_s
                .map(|w| errors.duration("response_window_s", w)),
            cue_hold: errors.duration("cue_hold_s", self.cue_hold_s),
            sync_timeout: errors.duration("sync_timeout_s", self.sync_timeout_s),
        };
        if timing.poll_interval.is_zero() {
            errors.push("poll_interval_s must be greater than zero");
        }
        if self.max_trials == Some(0) {
            errors.push("max_trials must be at least 1");
        }
        if self.repeats < 1 {
            errors.push("repeats must be at least 1");
        }
        if self.stimuli.is_empty() {
            errors.push("at least one stimulus is required");
        }

        let outputs = self.build_outputs(&mut errors);
        let by_name: BTreeMap<&str, &Actuator> =
            outputs.iter().map(|a| (a.name.as_str(), a)).collect();
        let resolve = |what: &str, name: &str, errors: &mut Errors| -> Option<Actuator> {
            let found = by_name.get(name).map(|a| (*a).clone());
            if found.is_none() {
                errors.push(format!("{what} refers to unknown actuator '{name}'"));
            }
            found
        };

        let sensor = self.sensor.as_ref().map(|s| SensorLine {
            channel: Channel(s.channel),
            polarity: s.polarity,
        });
        if let Some(sensor) = &sensor {
            if outputs
                .iter()
                .any(|a| a.channels().any(|c| c == sensor.channel))
            {
                errors.push(format!("sensor {} is also declared as an output", sensor.channel));
            }
        }

        let lights: Vec<Actuator> = self
            .lights
            .iter()
            .filter_map(|n| resolve("lights", n, &mut errors))
            .collect();
        let reward = self
            .reward
            .as_deref()
            .and_then(|n| resolve("reward", n, &mut errors));
        if let Some((ch, a, b)) = first_shared_line(lights.iter().chain(&reward)) {
            errors.push(format!("lights and reward drive {ch} twice ('{a}' and '{b}')"));
        }

        let mut stimuli = Vec::with_capacity(self.stimuli.len());
        let mut stimulus_names = BTreeSet::new();
        for sc in &self.stimuli {
            if !stimulus_names.insert(sc.name.as_str()) {
                errors.push(format!("duplicate stimulus '{}'", sc.name));
            }
            if sc.actuators.is_empty() {
                errors.push(format!("stimulus '{}' has no actuators", sc.name));
            }
            if !sc.offsets_s.is_empty() && sc.offsets_s.len() != sc.actuators.len() {
                errors.push(format!(
                    "stimulus '{}' has {} offsets for {} actuators",
                    sc.name,
                    sc.offsets_s.len(),
                    sc.actuators.len()
                ));
            }
            let mut delivery = Vec::new();
            for (i, name) in sc.actuators.iter().enumerate() {
                let what = format!("stimulus '{}'", sc.name);
                let Some(actuator) = resolve(&what, name, &mut errors) else {
                    continue;
                };
                let offset = sc
                    .offsets_s
                    .get(i)
                    .map_or(Duration::ZERO, |&o| errors.duration("offsets_s", o));
                let hold = actuator.open_duration;
                delivery.push(DeliveryStep {
                    actuator,
                    offset,
                    hold,
                });
            }
            let cue = sc
                .cue
                .as_deref()
                .and_then(|n| resolve(&format!("stimulus '{}' cue", sc.name), n, &mut errors));

            let mut group = BTreeSet::new();
            for step in &delivery {
                for ch in step.actuator.channels() {
                    if !group.insert(ch) {
                        errors.push(format!(
                            "stimulus '{}' drives {ch} from more than one actuator",
                            sc.name
                        ));
                    }
                }
            }
            if let Some(cue) = &cue {
                for other in lights.iter().chain(&reward) {
                    if cue.channels().any(|c| other.channels().any(|o| o == c)) {
                        errors.push(format!(
                            "stimulus '{}' cue '{}' shares a line with '{}'",
                            sc.name, cue.name, other.name
                        ));
                    }
                }
            }
            let trial_lines = cue.iter().chain(&lights).chain(&reward);
            for other in trial_lines {
                if other.channels().any(|c| group.contains(&c)) {
                    errors.push(format!(
                        "stimulus '{}' delivery shares a line with '{}'",
                        sc.name, other.name
                    ));
                }
            }

            let mut stimulus = Stimulus::new(sc.name.clone(), delivery);
            stimulus.cue = cue;
            stimuli.push(stimulus);
        }

        let protocol = self.protocol;
        if protocol.awaits_response() && sensor.is_none() {
            errors.push(format!("protocol {protocol:?} needs a sensor"));
        }
        if protocol.has_reward() && reward.is_none() {
            errors.push(format!("protocol {protocol:?} needs a reward actuator"));
        }
        if protocol == ProtocolKind::PassiveCue
            && lights.is_empty()
            && stimuli.iter().any(|s| s.cue.is_none())
        {
            errors.push("protocol PassiveCue needs a cue on every stimulus or session lights");
        }

        let iti = self.build_iti(self.stimuli.len() * self.repeats, &mut errors);
        let iti_resets_on_poke = self
            .iti
            .resets_on_poke
            .unwrap_or_else(|| protocol.iti_resets_on_poke());
        if iti_resets_on_poke && sensor.is_none() {
            errors.push("ITI reset on poke needs a sensor");
        }

        let setup = SessionSetup {
            protocol,
            stimuli,
            repeats: self.repeats,
            outputs,
            sensor,
            lights,
            reward,
            iti: iti.unwrap_or_else(|| ItiSchedule::fixed(Duration::ZERO)),
            iti_resets_on_poke,
            timing,
            hardware_retry_budget: self.hardware_retry_budget,
            seed: self.seed,
        };
        errors.finish(setup)
    }

    fn build_outputs(&self, errors: &mut Errors) -> Vec<Actuator> {
        let mut names = BTreeSet::new();
        let mut lines: BTreeMap<Channel, &str> = BTreeMap::new();
        let mut outputs = Vec::with_capacity(self.actuators.len());
        for ac in &self.actuators {
            if !names.insert(ac.name.as_str()) {
                errors.push(format!("duplicate actuator '{}'", ac.name));
            }
            for ch in std::iter::once(ac.channel).chain(ac.monitor) {
                if let Some(owner) = lines.insert(Channel(ch), &ac.name) {
                    errors.push(format!(
                        "{} is used by both '{owner}' and '{}'",
                        Channel(ch),
                        ac.name
                    ));
                }
            }
            let open = errors.duration(&format!("actuator '{}' open_s", ac.name), ac.open_s);
            let mut actuator =
                Actuator::new(ac.name.clone(), Channel(ac.channel), open).with_polarity(ac.polarity);
            if let Some(m) = ac.monitor {
                actuator = actuator.with_monitor(Channel(m));
            }
            outputs.push(actuator);
        }
        outputs
    }

    fn build_iti(&self, plan_len: usize, errors: &mut Errors) -> Option<ItiSchedule> {
        let draw = match (self.iti.draw, self.iti.step_s) {
            (ItiDrawKind::Uniform, _) => ItiDraw::Uniform,
            (ItiDrawKind::Discrete, Some(step_s)) => ItiDraw::Discrete { step_s },
            (ItiDrawKind::Discrete, None) => {
                errors.push("discrete ITI draw needs step_s");
                return None;
            }
        };
        let mut regimes = Vec::with_capacity(self.iti.regimes.len());
        for (i, rc) in self.iti.regimes.iter().enumerate() {
            let through_trial = match (rc.through_trial, rc.through_fraction) {
                (Some(_), Some(_)) => {
                    errors.push(format!(
                        "ITI regime {i} sets both through_trial and through_fraction"
                    ));
                    None
                }
                (Some(t), None) => Some(t),
                (None, Some(f)) if (0.0..=1.0).contains(&f) => {
                    Some(((plan_len as f64) * f).floor() as usize)
                }
                (None, Some(f)) => {
                    errors.push(format!("ITI regime {i} through_fraction {f} is outside 0..=1"));
                    None
                }
                (None, None) => None,
            };
            regimes.push(ItiRegime::new(
                through_trial,
                errors.duration("iti min_s", rc.min_s),
                errors.duration("iti max_s", rc.max_s),
            ));
        }
        match ItiSchedule::new(regimes, draw) {
            Ok(s) => Some(s),
            Err(RigError::Configuration(msg)) => {
                errors.push(msg);
                None
            }
            Err(e) => {
                errors.push(e.to_string());
                None
            }
        }
    }
}

/// First line driven by two of `actuators`, with both owners.
fn first_shared_line<'a>(actuators: impl IntoIterator<Item = &'a Actuator>) -> Option<(Channel, &'a str, &'a str)> {
    let mut owners: BTreeMap<Channel, &'a str> = BTreeMap::new();
    for a in actuators {
        for ch in a.channels() {
            if let Some(prev) = owners.insert(ch, a.name.as_str()) {
                return Some((ch, prev, a.name.as_str()));
            }
        }
    }
    None
}

#[derive(Default)]
struct Errors(Vec<String>);

impl Errors {
    fn push(&mut self, msg: impl Into<String>) {
        self.0.push(msg.into());
    }

    fn duration(&mut self, field: &str, secs: f64) -> Duration {
        if secs.is_finite() && secs >= 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            self.push(format!("{field} must be a finite non-negative number, got {secs}"));
            Duration::ZERO
        }
    }

    fn finish<T>(self, value: T) -> RigResult<T> {
        if self.0.is_empty() {
            Ok(value)
        } else {
            Err(RigError::Configuration(self.0.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOSE_POKE: &str = r#"
        protocol = "nose_poke"
        repeats = 10
        debounce_s = 0.1
        withdrawal_hold_s = 0.5
        lights = ["cue"]

        [sensor]
        channel = 36

        [iti]
        regimes = [
            { through_fraction = 0.5, min_s = 0.8, max_s = 5.0 },
            { min_s = 0.4, max_s = 2.0 },
        ]

        [[actuators]]
        name = "cue"
        channel = 15
        polarity = "active_low"

        [[actuators]]
        name = "sucrose"
        channel = 31
        open_s = 0.015
        monitor = 35

        [[actuators]]
        name = "water"
        channel = 33
        open_s = 0.012

        [[stimuli]]
        name = "sucrose"
        actuators = ["sucrose"]

        [[stimuli]]
        name = "water"
        actuators = ["water"]
    "#;

    #[test]
    fn nose_poke_session_validates() {
        let setup = SessionConfig::from_toml_str(NOSE_POKE).unwrap().validate().unwrap();
        assert_eq!(setup.protocol, ProtocolKind::NosePoke);
        assert_eq!(setup.plan_len(), 20);
        assert!(setup.iti_resets_on_poke);
        let sensor = setup.sensor.unwrap();
        assert_eq!(sensor.polarity, Polarity::ActiveLow);
        assert_eq!(setup.iti.regime_for(10).max, Duration::from_secs(5));
        assert_eq!(setup.iti.regime_for(11).max, Duration::from_secs(2));
        assert_eq!(setup.stimuli[0].delivery[0].hold, Duration::from_millis(15));
        assert_eq!(setup.lights[0].polarity, Polarity::ActiveLow);
    }

    #[test]
    fn reports_every_violation() {
        let mut cfg = SessionConfig::from_toml_str(NOSE_POKE).unwrap();
        cfg.repeats = 0;
        cfg.poll_interval_s = 0.0;
        cfg.stimuli[1].actuators.push("missing".into());
        cfg.sensor = None;
        let Err(RigError::Configuration(msg)) = cfg.validate() else {
            panic!("expected configuration error");
        };
        assert!(msg.contains("repeats"), "{msg}");
        assert!(msg.contains("poll_interval_s"), "{msg}");
        assert!(msg.contains("'missing'"), "{msg}");
        assert!(msg.contains("needs a sensor"), "{msg}");
    }

    #[test]
    fn overlapping_lines_are_rejected() {
        let mut cfg = SessionConfig::from_toml_str(NOSE_POKE).unwrap();
        cfg.actuators[2].channel = 35;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("ch35 is used by both 'sucrose' and 'water'"), "{err}");
    }

    #[test]
    fn cue_lights_and_reward_must_not_overlap() {
        let mut cfg = SessionConfig::from_toml_str(NOSE_POKE).unwrap();
        cfg.protocol = ProtocolKind::PassiveCue;
        cfg.stimuli[0].cue = Some("cue".into());
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("stimulus 'sucrose' cue 'cue' shares a line with 'cue'"), "{err}");

        cfg.stimuli[0].cue = None;
        cfg.lights = vec!["cue".into(), "cue".into()];
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("lights and reward drive ch15 twice"), "{err}");

        cfg.lights = vec!["cue".into()];
        cfg.validate().unwrap();
    }

    #[test]
    fn sensor_cannot_be_an_output() {
        let mut cfg = SessionConfig::from_toml_str(NOSE_POKE).unwrap();
        cfg.sensor = Some(SensorConfig {
            channel: 31,
            polarity: Polarity::ActiveLow,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn odor_protocol_requires_reward() {
        let mut cfg = SessionConfig::from_toml_str(NOSE_POKE).unwrap();
        cfg.protocol = ProtocolKind::OdorNosePoke;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("reward"), "{err}");
        cfg.reward = Some("water".into());
        cfg.stimuli.truncate(1);
        cfg.validate().unwrap();
    }

    #[test]
    fn unknown_fields_are_refused() {
        assert!(SessionConfig::from_toml_str("repeets = 3").is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        std::fs::write(&path, NOSE_POKE).unwrap();
        let cfg = SessionConfig::load(&path).unwrap();
        assert_eq!(cfg.repeats, 10);
        assert!(SessionConfig::load(dir.path().join("absent.toml")).is_err());
    }
}
