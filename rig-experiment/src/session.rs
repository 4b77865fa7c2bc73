//! Session controller: owns the trial plan, drives the state machine until a
//! stop condition binds, and always leaves the rig safe.

use crate::config::SessionSetup;
use crate::events::{EventLog, EventSink};
use crate::plan::TrialPlan;
use crate::sensor::SensorPoller;
use crate::sequencer::ActuatorSequencer;
use crate::state::{Interrupted, TrialStateMachine};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rig_core::{
    DigitalIo, Direction, HardwareError, RigError, RigResult, TrialOutcome, TrialRecord,
    TrialState,
};
use rig_timing::{CancelToken, Clock, Interrupt, PollSummary, Waiter};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    PlanComplete,
    TrialLimit,
    TimeLimit,
    Cancelled,
    Fatal(String),
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::PlanComplete => f.write_str("plan complete"),
            EndReason::TrialLimit => f.write_str("trial limit reached"),
            EndReason::TimeLimit => f.write_str("time limit reached"),
            EndReason::Cancelled => f.write_str("cancelled by operator"),
            EndReason::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl From<Interrupt> for EndReason {
    fn from(i: Interrupt) -> Self {
        match i {
            Interrupt::Cancelled => EndReason::Cancelled,
            Interrupt::Deadline => EndReason::TimeLimit,
        }
    }
}

impl From<&RigError> for EndReason {
    fn from(e: &RigError) -> Self {
        match e {
            RigError::OperatorCancelled => EndReason::Cancelled,
            RigError::SessionTimeout => EndReason::TimeLimit,
            other => EndReason::Fatal(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub records: Vec<TrialRecord>,
    pub end_reason: EndReason,
    pub elapsed: Duration,
    pub poll: PollSummary,
    /// Outputs that could not be made safe, or a failed release.
    pub cleanup_errors: Vec<HardwareError>,
}

impl SessionSummary {
    pub fn count(&self, outcome: TrialOutcome) -> usize {
        self.records.iter().filter(|r| r.outcome == outcome).count()
    }

    /// Fails if cleanup left anything behind.
    pub fn cleanup_result(&self) -> RigResult<()> {
        if self.cleanup_errors.is_empty() {
            Ok(())
        } else {
            Err(RigError::CleanupFailed(self.cleanup_errors.clone()))
        }
    }
}

pub struct SessionController<G: DigitalIo + 'static, C: Clock> {
    setup: Arc<SessionSetup>,
    io: Arc<G>,
    clock: C,
    log: EventLog<C>,
    cancel: CancelToken,
    rng: StdRng,
}

impl<G: DigitalIo + 'static, C: Clock> SessionController<G, C> {
    pub fn new(
        setup: SessionSetup,
        io: Arc<G>,
        clock: C,
        sink: impl EventSink + 'static,
        cancel: CancelToken,
    ) -> Self {
        let rng = match setup.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            log: EventLog::new(sink, clock.clone()),
            setup: Arc::new(setup),
            io,
            clock,
            cancel,
            rng,
        }
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn log(&self) -> &EventLog<C> {
        &self.log
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Runs the session to its end.
    ///
    /// Returns `Err` only for plan or configuration problems found before any
    /// line is touched. Every other ending, cancellation included, yields a
    /// summary after full cleanup.
    pub fn run(self) -> RigResult<SessionSummary> {
        let SessionController {
            setup,
            io,
            clock,
            log,
            cancel,
            mut rng,
        } = self;
        let plan = TrialPlan::generate(setup.stimuli.len(), setup.repeats, &mut rng)?;
        plan.verify()?;
        let limit = setup.trial_limit();

        let start_ns = clock.now();
        let deadline_ns = start_ns.saturating_add(setup.timing.max_duration.as_nanos() as u64);
        let waiter = Waiter::new(clock.clone(), cancel, setup.timing.poll_interval).with_deadline(deadline_ns);

        log.emit_with("Session started", |e| {
            e.with("protocol", format!("{:?}", setup.protocol))
                .with("trials", limit)
                .with("max_duration_s", setup.timing.max_duration.as_secs_f64())
        });
        info!(
            "Session: {:?}, {} trials planned, {} will run",
            setup.protocol,
            plan.len(),
            limit
        );

        let sequencer = ActuatorSequencer::new(Arc::clone(&io), log.clone(), setup.outputs.clone());
        let sensor = setup.sensor.map(|line| SensorPoller::new(Arc::clone(&io), line));
        let mut machine = TrialStateMachine::new(Arc::clone(&setup), sequencer, sensor, rng);

        let mut records = Vec::with_capacity(limit);
        let end_reason = match Self::prepare(&io, &machine) {
            Err(e) => {
                error!("Rig preparation failed: {}", e);
                EndReason::Fatal(e.to_string())
            }
            Ok(()) => match waiter.sleep(setup.timing.start_delay) {
                Err(i) => i.into(),
                Ok(()) => Self::run_trials(&mut machine, &plan, limit, &waiter, &mut records),
            },
        };

        let cleanup_errors = Self::cleanup(&io, &log, &machine, &end_reason);
        let summary = SessionSummary {
            poll: machine
                .sensor
                .as_ref()
                .map(|s| s.stats().summary())
                .unwrap_or_default(),
            records,
            end_reason,
            elapsed: clock.elapsed(start_ns),
            cleanup_errors,
        };
        info!(
            "Session ended ({}): {} completed, {} timed out, {} aborted in {:.1}s",
            summary.end_reason,
            summary.count(TrialOutcome::Completed),
            summary.count(TrialOutcome::TimedOut),
            summary.count(TrialOutcome::Aborted),
            summary.elapsed.as_secs_f64()
        );
        Ok(summary)
    }

    fn prepare(io: &G, machine: &TrialStateMachine<G, C, StdRng>) -> RigResult<()> {
        if let Some(sensor) = &machine.sensor {
            io.configure(sensor.line().channel, Direction::Input)?;
        }
        machine.sequencer.prepare()
    }

    fn run_trials(
        machine: &mut TrialStateMachine<G, C, StdRng>,
        plan: &TrialPlan,
        limit: usize,
        waiter: &Waiter<C>,
        records: &mut Vec<TrialRecord>,
    ) -> EndReason {
        let budget = machine.setup.hardware_retry_budget;
        let mut consecutive_faults = 0u32;
        for (index, stimulus) in plan.iter().enumerate().take(limit) {
            if let Err(i) = waiter.check() {
                return i.into();
            }
            match machine.run_trial(index, stimulus, waiter) {
                Ok(record) => records.push(record),
                Err(Interrupted { record, error }) => {
                    records.push(record);
                    return EndReason::from(&error);
                }
            }
            match machine.take_fault() {
                Some(RigError::Hardware(e)) => {
                    consecutive_faults += 1;
                    if consecutive_faults > budget {
                        return EndReason::Fatal(format!(
                            "{consecutive_faults} consecutive trials aborted by hardware faults, last: {e}"
                        ));
                    }
                }
                Some(_) | None => consecutive_faults = 0,
            }
        }
        if limit < plan.len() {
            EndReason::TrialLimit
        } else {
            EndReason::PlanComplete
        }
    }

    fn cleanup(
        io: &G,
        log: &EventLog<C>,
        machine: &TrialStateMachine<G, C, StdRng>,
        reason: &EndReason,
    ) -> Vec<HardwareError> {
        let mut errors = machine.sequencer.force_off_all();
        match reason {
            EndReason::Cancelled | EndReason::Fatal(_) => {
                warn!("Session aborted: {}", reason);
                log
                    .emit_with("Session aborted", |e| e.with("reason", reason));
            }
            _ => {}
        }
        log.emit_with(TrialState::SessionEnd.to_string(), |e| {
            e.with("reason", reason)
        });
        if let Err(e) = io.release_all() {
            errors.push(e);
        }
        for e in &errors {
            error!("Cleanup: {}", e);
            log.emit_with("Cleanup failure", |entry| entry.with("error", e));
        }
        log.flush();
        errors
    }
}
