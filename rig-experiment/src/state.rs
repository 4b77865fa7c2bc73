use crate::config::SessionSetup;
use crate::sensor::{PokeWait, SensorPoller};
use crate::sequencer::ActuatorSequencer;
use rand::Rng;
use rig_core::{
    Actuator, DigitalIo, Protocol, RigError, RigResult, Stimulus, TrialOutcome, TrialRecord,
    TrialState,
};
use rig_timing::{Clock, ResettableInterval, Waiter};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// A trial that ended because the session has to stop.
#[derive(Debug, Clone, PartialEq)]
pub struct Interrupted {
    pub record: TrialRecord,
    pub error: RigError,
}

pub struct TrialStateMachine<G, C, R>
where
    G: DigitalIo + 'static,
    C: Clock,
    R: Rng,
{
    pub setup: Arc<SessionSetup>,
    pub sequencer: ActuatorSequencer<G, C>,
    pub sensor: Option<SensorPoller<G>>,
    pub rng: R,
    pub state: Option<TrialState>,
    /// Cause of the most recent aborted trial, until taken.
    pub last_fault: Option<RigError>,
    lit: Vec<Actuator>,
}

impl<G, C, R> TrialStateMachine<G, C, R>
where
    G: DigitalIo + 'static,
    C: Clock,
    R: Rng,
{
    pub fn new(
        setup: Arc<SessionSetup>,
        sequencer: ActuatorSequencer<G, C>,
        sensor: Option<SensorPoller<G>>,
        rng: R,
    ) -> Self {
        Self {
            setup,
            sequencer,
            sensor,
            rng,
            state: None,
            last_fault: None,
            lit: Vec::new(),
        }
    }

    pub fn current_state(&self) -> Option<TrialState> {
        self.state
    }

    pub fn take_fault(&mut self) -> Option<RigError> {
        self.last_fault.take()
    }

    /// Runs one trial from `CUE_ON` through its ITI.
    ///
    /// Hardware and synchronization faults abort the trial but still run the
    /// ITI; the record comes back with `Aborted`. Cancellation and the session
    /// deadline stop the trial where it is, with every output forced off.
    pub fn run_trial(&mut self, index: usize, stimulus: usize, waiter: &Waiter<C>) -> Result<TrialRecord, Interrupted> {
        let Some(stim) = self.setup.stimuli.get(stimulus).cloned() else {
            let error = RigError::config(format!("trial plan refers to stimulus {stimulus}"));
            return Err(Interrupted {
                record: TrialRecord::new(index, "?", waiter.now()),
                error,
            });
        };
        let onset = self.sequencer.log().emit_with(format!("Trial {}", index + 1), |e| {
            e.with("trial", index + 1).with("stimulus", &stim.name)
        });
        info!("Trial {} ({}) started", index + 1, stim.name);
        let mut record = TrialRecord::new(index, stim.name.clone(), onset);

        match self.run_states(index, &stim, &mut record, waiter) {
            Ok(()) => {}
            Err(e) if e.is_trial_local() => self.abort(&mut record, e),
            Err(e) => return Err(self.interrupt(record, e, false)),
        }

        match self.run_iti(index, &mut record, waiter) {
            Ok(()) => {}
            Err(e) if e.is_trial_local() => self.abort(&mut record, e),
            Err(e) => return Err(self.interrupt(record, e, true)),
        }
        self.state = None;
        Ok(record)
    }

    fn enter(&mut self, index: usize, state: TrialState) {
        self.state = Some(state);
        self.sequencer
            .log()
            .emit_with(state.to_string(), |e| e.with("trial", index + 1));
    }

    fn run_states(
        &mut self,
        index: usize,
        stim: &Stimulus,
        record: &mut TrialRecord,
        waiter: &Waiter<C>,
    ) -> RigResult<()> {
        let protocol = self.setup.protocol;
        let timing = self.setup.timing;
        let mut state = TrialState::CueOn;
        loop {
            if state == TrialState::Iti {
                return Ok(());
            }
            self.enter(index, state);
            match state {
                TrialState::CueOn => {
                    let cues: Vec<Actuator> =
                        self.setup.lights.iter().chain(&stim.cue).cloned().collect();
                    for cue in cues {
                        self.sequencer.activate(&cue)?;
                        self.lit.push(cue);
                    }
                }
                TrialState::AwaitResponse => {
                    let sensor = self
                        .sensor
                        .as_mut()
                        .ok_or_else(|| RigError::config("response protocol without a sensor"))?;
                    match sensor.wait_for_poke(timing.debounce, timing.response_window, waiter)? {
                        PokeWait::Poked { latency } => {
                            record.response_latency_ns = Some(latency.as_nanos() as u64);
                            self.sequencer.log().emit_with("Poke", |e| {
                                e.with("trial", index + 1)
                                    .with("latency_ms", latency.as_millis())
                            });
                        }
                        PokeWait::WindowElapsed => {
                            record.outcome = TrialOutcome::TimedOut;
                            self.sequencer
                                .log()
                                .emit_with("Response window elapsed", |e| e.with("trial", index + 1));
                            self.lights_off(Duration::ZERO, waiter)?;
                            return Ok(());
                        }
                    }
                }
                TrialState::AwaitWithdrawal => {
                    let sensor = self
                        .sensor
                        .as_mut()
                        .ok_or_else(|| RigError::config("withdrawal without a sensor"))?;
                    sensor.wait_for_release(timing.withdrawal_hold, waiter)?;
                    self.sequencer
                        .log()
                        .emit_with("Withdrawal", |e| e.with("trial", index + 1));
                }
                TrialState::Delivery => {
                    self.deliver(stim, waiter)?;
                    if !protocol.has_reward() {
                        self.lights_off(timing.cue_hold, waiter)?;
                    }
                }
                TrialState::Reward => {
                    if let Some(reward) = self.setup.reward.clone() {
                        self.sequencer.fire(&reward, reward.open_duration, waiter)?;
                    }
                    self.lights_off(timing.cue_hold, waiter)?;
                }
                TrialState::Iti | TrialState::SessionEnd => return Ok(()),
            }
            match protocol.next(state) {
                Some(next) => state = next,
                None => return Ok(()),
            }
        }
    }

    fn deliver(&mut self, stim: &Stimulus, waiter: &Waiter<C>) -> RigResult<()> {
        if self.setup.protocol.synchronized_delivery() {
            let report = self.sequencer.fire_synchronized(
                &stim.name,
                &stim.delivery,
                stim.delivery.len(),
                self.setup.timing.sync_timeout,
                waiter,
            )?;
            info!("Group '{}' fired with {:?} spread", report.group, report.spread());
            return Ok(());
        }
        // Unsynchronized steps run back to back; offsets count from the
        // previous step's close.
        for step in &stim.delivery {
            waiter.sleep(step.offset)?;
            self.sequencer.fire(&step.actuator, step.hold, waiter)?;
        }
        Ok(())
    }

    /// Holds the trial's cue lights a little longer, then switches them off.
    fn lights_off(&mut self, hold: Duration, waiter: &Waiter<C>) -> RigResult<()> {
        if self.lit.is_empty() {
            return Ok(());
        }
        let held = waiter.sleep(hold);
        let mut result = Ok(());
        for cue in std::mem::take(&mut self.lit) {
            if let Err(e) = self.sequencer.deactivate(&cue) {
                result = result.and(Err(e));
            }
        }
        held?;
        result
    }

    fn run_iti(&mut self, index: usize, record: &mut TrialRecord, waiter: &Waiter<C>) -> RigResult<()> {
        self.enter(index, TrialState::Iti);
        let length = self.setup.iti.draw(index + 1, &mut self.rng);
        record.iti_ns = Some(length.as_nanos() as u64);
        let log = self.sequencer.log();
        log.emit_with("ITI length", |e| {
            e.with("trial", index + 1).with("length_ms", length.as_millis())
        });
        match self.sensor.as_mut() {
            Some(sensor) if self.setup.iti_resets_on_poke => {
                let mut interval = ResettableInterval::start(length, waiter.now());
                sensor.wait_quiet(&mut interval, true, waiter, |_| {
                    log.emit_with("ITI restarted", |e| e.with("trial", index + 1));
                })?;
                if interval.restarts() > 0 {
                    info!("ITI of trial {} restarted {} times", index + 1, interval.restarts());
                }
            }
            _ => waiter.sleep(length)?,
        }
        Ok(())
    }

    /// Trial-local fault: log it, make every output safe, keep the session going.
    fn abort(&mut self, record: &mut TrialRecord, fault: RigError) {
        warn!("Trial {} aborted: {}", record.index + 1, fault);
        self.sequencer.log().emit_with("Trial aborted", |e| {
            e.with("trial", record.index + 1).with("error", &fault)
        });
        self.lit.clear();
        for e in self.sequencer.force_off_all() {
            error!("Output left unsafe after abort: {}", e);
        }
        record.outcome = TrialOutcome::Aborted;
        record.note = Some(fault.to_string());
        self.last_fault = Some(fault);
    }

    /// A stop inside the ITI leaves the trial's own outcome as it was.
    fn interrupt(&mut self, mut record: TrialRecord, error: RigError, in_iti: bool) -> Interrupted {
        self.sequencer.log().emit_with("Trial interrupted", |e| {
            e.with("trial", record.index + 1).with("reason", &error)
        });
        self.lit.clear();
        for e in self.sequencer.force_off_all() {
            error!("Output left unsafe after interrupt: {}", e);
        }
        if !in_iti {
            record.outcome = TrialOutcome::Aborted;
            record.note.get_or_insert_with(|| error.to_string());
        }
        self.state = None;
        Interrupted { record, error }
    }
}
