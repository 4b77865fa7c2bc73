//! Actuator sequencing: single firings, held groups and synchronized
//! multi-actuator deliveries.
//!
//! Every activation is paired with exactly one deactivation on every exit
//! path. The sequencer tracks energized lines and refuses to energize a line
//! that is already on.

use crate::barrier::{BarrierError, OnsetBarrier};
use crate::events::EventLog;
use crossbeam::channel::{self, RecvTimeoutError};
use parking_lot::Mutex;
use rig_core::{Actuator, Channel, DeliveryStep, DigitalIo, HardwareError, RigError, RigResult};
use rig_timing::{Clock, Waiter};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Write attempts per line when forcing an actuator off.
const FORCE_OFF_ATTEMPTS: usize = 3;
/// Slack on top of the group's own timing before a join gives up. Also how
/// long a failed group waits for stragglers after forcing its lines off.
const JOIN_MARGIN: Duration = Duration::from_millis(500);

/// Outcome of a synchronized delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub group: String,
    /// `(actuator, onset_ns)` in step order.
    pub onsets: Vec<(String, u64)>,
    /// When the onset barrier let the group go.
    pub released: Instant,
}

impl SyncReport {
    /// Spread between the earliest and latest onset.
    pub fn spread(&self) -> Duration {
        let (min, max) = self
            .onsets
            .iter()
            .fold((u64::MAX, 0), |(lo, hi), &(_, t)| (lo.min(t), hi.max(t)));
        Duration::from_nanos(max.saturating_sub(min))
    }

    pub fn onset(&self, actuator: &str) -> Option<u64> {
        self.onsets.iter().find(|(n, _)| n == actuator).map(|&(_, t)| t)
    }
}

pub struct ActuatorSequencer<G: DigitalIo, C: Clock> {
    io: Arc<G>,
    log: EventLog<C>,
    outputs: Arc<Vec<Actuator>>,
    energized: Arc<Mutex<BTreeMap<Channel, String>>>,
}

impl<G: DigitalIo, C: Clock> Clone for ActuatorSequencer<G, C> {
    fn clone(&self) -> Self {
        Self {
            io: Arc::clone(&self.io),
            log: self.log.clone(),
            outputs: Arc::clone(&self.outputs),
            energized: Arc::clone(&self.energized),
        }
    }
}

impl<G: DigitalIo + 'static, C: Clock> ActuatorSequencer<G, C> {
    pub fn new(io: Arc<G>, log: EventLog<C>, outputs: Vec<Actuator>) -> Self {
        Self {
            io,
            log,
            outputs: Arc::new(outputs),
            energized: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn log(&self) -> &EventLog<C> {
        &self.log
    }

    pub fn io(&self) -> &Arc<G> {
        &self.io
    }

    pub fn outputs(&self) -> &[Actuator] {
        &self.outputs
    }

    /// Lines currently switched on.
    pub fn energized(&self) -> Vec<Channel> {
        self.energized.lock().keys().copied().collect()
    }

    /// Configures every output line so that it comes up at its inactive
    /// level.
    pub fn prepare(&self) -> RigResult<()> {
        for a in self.outputs.iter() {
            for (ch, level) in a.off_writes() {
                self.io.configure_output(ch, level)?;
            }
        }
        Ok(())
    }

    /// Switches `actuator` on and returns the timestamp of its "turned On" entry.
    pub fn activate(&self, actuator: &Actuator) -> RigResult<u64> {
        {
            let mut energized = self.energized.lock();
            if let Some(ch) = actuator.channels().find(|c| energized.contains_key(c)) {
                return Err(HardwareError::new("activate", ch, "line already energized").into());
            }
            for ch in actuator.channels() {
                energized.insert(ch, actuator.name.clone());
            }
        }
        let at = self.log.emit_with(format!("{} turned On", actuator.name), |e| {
            e.with("channel", actuator.channel)
        });
        for (ch, level) in actuator.on_writes() {
            if let Err(e) = self.io.write(ch, level) {
                error!("Activating {} failed: {}", actuator.name, e);
                self.log_fault(actuator, &e);
                if let Err(off) = self.force_off(actuator) {
                    error!("{} could not be forced off: {}", actuator.name, off);
                }
                return Err(e.into());
            }
        }
        Ok(at)
    }

    /// Switches `actuator` off. Every line is attempted even if one fails; a
    /// failure is logged, the actuator forced off, and the error returned.
    /// An actuator that another path already switched off is left alone.
    pub fn deactivate(&self, actuator: &Actuator) -> RigResult<()> {
        if !self.is_energized(actuator) {
            debug!("{} already off", actuator.name);
            return Ok(());
        }
        let failed: Vec<HardwareError> = actuator
            .off_writes()
            .into_iter()
            .filter_map(|(ch, level)| self.io.write(ch, level).err())
            .collect();
        let Some(e) = failed.into_iter().next() else {
            if self.release(actuator) {
                self.log.emit_with(format!("{} turned Off", actuator.name), |e| {
                    e.with("channel", actuator.channel)
                });
            }
            return Ok(());
        };
        warn!("Deactivating {} failed ({}), forcing off", actuator.name, e);
        self.log_fault(actuator, &e);
        if let Err(stuck) = self.force_off(actuator) {
            error!("{} could not be forced off: {}", actuator.name, stuck);
        }
        Err(e.into())
    }

    /// Drives every line of `actuator` inactive, retrying each write.
    pub fn force_off(&self, actuator: &Actuator) -> Result<(), HardwareError> {
        let mut stuck = None;
        for (ch, level) in actuator.off_writes() {
            let mut result = Ok(());
            for attempt in 1..=FORCE_OFF_ATTEMPTS {
                result = self.io.write(ch, level);
                match &result {
                    Ok(()) => break,
                    Err(e) => debug!("Force-off of {} attempt {} failed: {}", ch, attempt, e),
                }
            }
            if let Err(e) = result {
                stuck.get_or_insert(e);
            }
        }
        if let Some(e) = stuck {
            error!("{} is stuck: {}", actuator.name, e);
            return Err(e);
        }
        if self.release(actuator) {
            self.log.emit_with(format!("{} turned Off", actuator.name), |e| {
                e.with("channel", actuator.channel).with("forced", true)
            });
        }
        Ok(())
    }

    /// Forces every known output off. Returns the lines that could not be.
    pub fn force_off_all(&self) -> Vec<HardwareError> {
        self.outputs
            .iter()
            .filter_map(|a| self.force_off(a).err())
            .collect()
    }

    /// True while any line of `actuator` is registered to it.
    fn is_energized(&self, actuator: &Actuator) -> bool {
        let energized = self.energized.lock();
        actuator
            .channels()
            .any(|c| energized.get(&c).is_some_and(|owner| *owner == actuator.name))
    }

    fn log_fault(&self, actuator: &Actuator, err: &HardwareError) {
        self.log.emit_with("Hardware fault", |e| {
            e.with("actuator", &actuator.name).with("detail", err)
        });
    }

    /// Forgets `actuator`'s lines; true if any were energized.
    fn release(&self, actuator: &Actuator) -> bool {
        let mut energized = self.energized.lock();
        let mut any = false;
        for ch in actuator.channels() {
            any |= energized.remove(&ch).is_some();
        }
        any
    }

    /// On, hold, off. The actuator is switched off even if the hold is
    /// interrupted; the interrupt is returned after the deactivation.
    pub fn fire(&self, actuator: &Actuator, hold: Duration, waiter: &Waiter<C>) -> RigResult<u64> {
        let onset = self.activate(actuator)?;
        let held = waiter.sleep(hold);
        let closed = self.deactivate(actuator);
        held?;
        closed?;
        Ok(onset)
    }

    /// Holds several actuators open together for `duration`.
    pub fn hold_together(&self, actuators: &[Actuator], duration: Duration, waiter: &Waiter<C>) -> RigResult<()> {
        let mut opened = Vec::with_capacity(actuators.len());
        let mut result = Ok(());
        for a in actuators {
            match self.activate(a) {
                Ok(_) => opened.push(a),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        if result.is_ok() {
            result = waiter.sleep(duration).map_err(RigError::from);
        }
        for a in opened {
            if let Err(e) = self.deactivate(a) {
                result = result.and(Err(e));
            }
        }
        result
    }

    /// Fires `steps` from one worker thread each, with a common onset.
    ///
    /// Each worker drives its lines safe, logs that it is armed, waits on an
    /// onset barrier of `arity`, then applies its offset and hold. If any
    /// participant fails or misses the barrier within `timeout`, the group's
    /// token is cancelled and every line of the group is forced off. Workers
    /// still running are then given `JOIN_MARGIN` to wind down before the
    /// error is returned.
    pub fn fire_synchronized(
        &self,
        group: &str,
        steps: &[DeliveryStep],
        arity: usize,
        timeout: Duration,
        waiter: &Waiter<C>,
    ) -> RigResult<SyncReport> {
        if arity == 0 || arity != steps.len() {
            return Err(RigError::config(format!(
                "group '{group}' declares arity {arity} for {} participants",
                steps.len()
            )));
        }
        let mut lines = BTreeSet::new();
        for step in steps {
            if let Some(ch) = step.actuator.channels().find(|c| !lines.insert(*c)) {
                return Err(RigError::config(format!(
                    "group '{group}' drives {ch} from more than one participant"
                )));
            }
        }

        let barrier = Arc::new(OnsetBarrier::new(arity));
        let operator = waiter.cancel_token().clone();
        let abort = operator.child();
        let group_waiter = waiter.with_cancel(abort.clone());
        let (tx, rx) = channel::bounded(arity);
        let mut failures: Vec<RigError> = Vec::new();
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(steps.len());
        for (idx, step) in steps.iter().enumerate() {
            let seq = self.clone();
            let barrier_w = Arc::clone(&barrier);
            let waiter = group_waiter.clone();
            let operator = operator.clone();
            let step = step.clone();
            let group_name = group.to_string();
            let tx = tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("sync-{}", step.actuator.name))
                .spawn(move || {
                    let result = seq
                        .participate(&group_name, &step, &barrier_w, timeout, &waiter)
                        .map_err(|e| match e {
                            RigError::OperatorCancelled if !operator.is_cancelled() => RigError::Synchronization {
                                group: group_name.clone(),
                                detail: format!("{}: group aborted", step.actuator.name),
                            },
                            e => e,
                        });
                    let _ = tx.send((idx, result));
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    abort.cancel();
                    barrier.abandon();
                    failures.push(RigError::Synchronization {
                        group: group.to_string(),
                        detail: format!("could not start worker for {}: {e}", steps[idx].actuator.name),
                    });
                }
            }
        }
        drop(tx);

        let join_deadline = Instant::now()
            + timeout
            + steps.iter().map(DeliveryStep::end).max().unwrap_or_default()
            + JOIN_MARGIN;
        let mut onsets: Vec<Option<(String, u64)>> = vec![None; steps.len()];
        let mut released: Option<Instant> = None;
        let mut reported = failures.len();
        while reported < steps.len() {
            let left = join_deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(left) {
                Ok((idx, Ok((onset, at)))) => {
                    onsets[idx] = Some((steps[idx].actuator.name.clone(), onset));
                    released = Some(released.map_or(at, |r| r.min(at)));
                    reported += 1;
                }
                Ok((_, Err(e))) => {
                    abort.cancel();
                    barrier.abandon();
                    failures.push(e);
                    reported += 1;
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                    abort.cancel();
                    barrier.abandon();
                    failures.push(RigError::Synchronization {
                        group: group.to_string(),
                        detail: format!(
                            "{} of {} participants did not finish in time",
                            steps.len() - reported,
                            steps.len()
                        ),
                    });
                    break;
                }
            }
        }

        if let (true, Some(released)) = (failures.is_empty(), released) {
            join_finished(handles, true);
            return Ok(SyncReport {
                group: group.to_string(),
                onsets: onsets.into_iter().flatten().collect(),
                released,
            });
        }

        let err = failures
            .into_iter()
            .min_by_key(severity)
            .unwrap_or_else(|| RigError::Synchronization {
                group: group.to_string(),
                detail: "unknown failure".into(),
            });
        self.log.emit_with("Synchronization failure", |e| {
            e.with("group", group).with("detail", &err)
        });
        for step in steps {
            if let Err(e) = self.force_off(&step.actuator) {
                error!("Group '{}' could not force {} off: {}", group, step.actuator.name, e);
            }
        }
        if reported < steps.len() {
            let drain_deadline = Instant::now() + JOIN_MARGIN;
            while reported < steps.len() {
                match rx.recv_timeout(drain_deadline.saturating_duration_since(Instant::now())) {
                    Ok(_) => reported += 1,
                    Err(_) => break,
                }
            }
            if reported < steps.len() {
                error!(
                    "Group '{}': {} workers still running after force-off",
                    group,
                    steps.len() - reported
                );
            }
            // A straggler may have switched its line on after the first pass.
            for step in steps.iter().filter(|s| self.is_energized(&s.actuator)) {
                if let Err(e) = self.force_off(&step.actuator) {
                    error!("Group '{}' could not force {} off: {}", group, step.actuator.name, e);
                }
            }
        }
        join_finished(handles, reported == steps.len());
        Err(err)
    }

    fn participate(
        &self,
        group: &str,
        step: &DeliveryStep,
        barrier: &OnsetBarrier,
        timeout: Duration,
        waiter: &Waiter<C>,
    ) -> RigResult<(u64, Instant)> {
        let actuator = &step.actuator;
        for (ch, level) in actuator.off_writes() {
            if let Err(e) = self.io.write(ch, level) {
                barrier.abandon();
                return Err(e.into());
            }
        }
        self.log.emit_with(format!("{} armed", actuator.name), |e| {
            e.with("group", group).with("offset_ms", step.offset.as_millis())
        });
        let released = barrier.wait(timeout, waiter).map_err(|b| match b {
            BarrierError::Cancelled => RigError::OperatorCancelled,
            BarrierError::Deadline => RigError::SessionTimeout,
            other => RigError::Synchronization {
                group: group.to_string(),
                detail: format!("{}: {other}", actuator.name),
            },
        })?;
        waiter.sleep(step.offset)?;
        Ok((self.fire(actuator, step.hold, waiter)?, released))
    }
}

/// Joins workers that have exited; with `all`, every worker has reported
/// and is joined.
fn join_finished(handles: Vec<JoinHandle<()>>, all: bool) {
    for handle in handles {
        if (all || handle.is_finished()) && handle.join().is_err() {
            error!("Synchronized worker panicked");
        }
    }
}

/// Which of several concurrent failures a group reports.
fn severity(e: &RigError) -> u8 {
    match e {
        RigError::OperatorCancelled => 0,
        RigError::SessionTimeout => 1,
        RigError::Hardware(_) => 2,
        RigError::Synchronization { .. } => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use rig_core::{Level, MockGateway, Polarity};
    use rig_timing::{CancelToken, HighPrecisionClock, ManualClock};

    fn valve(name: &str, ch: u16, ms: u64) -> Actuator {
        Actuator::new(name, Channel(ch), Duration::from_millis(ms))
    }

    fn setup(outputs: Vec<Actuator>) -> (Arc<MockGateway>, MemorySink, ActuatorSequencer<MockGateway, ManualClock>, Waiter<ManualClock>) {
        let gw = Arc::new(MockGateway::new());
        let sink = MemorySink::new();
        let clock = ManualClock::new();
        let seq = ActuatorSequencer::new(Arc::clone(&gw), EventLog::new(sink.clone(), clock.clone()), outputs);
        seq.prepare().unwrap();
        let waiter = Waiter::new(clock, CancelToken::new(), Duration::from_millis(10));
        (gw, sink, seq, waiter)
    }

    #[test]
    fn fire_logs_around_writes() {
        let taste = valve("sucrose", 31, 15).with_monitor(Channel(35));
        let (gw, sink, seq, waiter) = setup(vec![taste.clone()]);
        let onset = seq.fire(&taste, taste.open_duration, &waiter).unwrap();
        assert_eq!(onset, 0);
        assert_eq!(sink.events(), vec!["sucrose turned On", "sucrose turned Off"]);
        assert_eq!(sink.entries()[1].at_ns, 15_000_000);
        assert_eq!(gw.writes_to(Channel(31)), vec![Level::Low, Level::High, Level::Low]);
        assert_eq!(gw.writes_to(Channel(35)), vec![Level::Low, Level::High, Level::Low]);
        assert!(seq.energized().is_empty());
    }

    #[test]
    fn energized_line_is_refused() {
        let cue = valve("cue", 15, 0).with_polarity(Polarity::ActiveLow);
        let (gw, _sink, seq, _w) = setup(vec![cue.clone()]);
        seq.activate(&cue).unwrap();
        assert_eq!(gw.level(Channel(15)), Some(Level::Low));
        assert!(matches!(seq.activate(&cue), Err(RigError::Hardware(_))));
        seq.deactivate(&cue).unwrap();
        assert_eq!(gw.level(Channel(15)), Some(Level::High));
        seq.activate(&cue).unwrap();
    }

    #[test]
    fn interrupted_hold_still_closes() {
        let water = valve("water", 33, 5000);
        let (gw, sink, seq, waiter) = setup(vec![water.clone()]);
        let waiter = waiter.with_deadline(1_000_000_000);
        let err = seq.fire(&water, water.open_duration, &waiter).unwrap_err();
        assert_eq!(err, RigError::SessionTimeout);
        assert_eq!(gw.level(Channel(33)), Some(Level::Low));
        assert_eq!(sink.events().last().map(String::as_str), Some("water turned Off"));
    }

    #[test]
    fn failed_activation_forces_line_safe() {
        let water = valve("water", 33, 10).with_monitor(Channel(34));
        let (gw, _sink, seq, waiter) = setup(vec![water.clone()]);
        gw.fail_writes(Channel(34), Some(Level::High), 1);
        assert!(seq.fire(&water, water.open_duration, &waiter).is_err());
        assert_eq!(gw.level(Channel(33)), Some(Level::Low));
        assert!(seq.energized().is_empty());
    }

    #[test]
    fn failed_off_write_is_logged_and_returned() {
        let taste = valve("sucrose", 31, 15).with_monitor(Channel(35));
        let (gw, sink, seq, waiter) = setup(vec![taste.clone()]);
        gw.fail_writes(Channel(31), Some(Level::Low), 1);
        let err = seq.fire(&taste, taste.open_duration, &waiter).unwrap_err();
        assert!(matches!(err, RigError::Hardware(_)), "{err:?}");
        assert_eq!(
            sink.events(),
            vec!["sucrose turned On", "Hardware fault", "sucrose turned Off"]
        );
        assert_eq!(sink.entries()[2].get("forced"), Some("true"));
        assert_eq!(gw.level(Channel(31)), Some(Level::Low));
        assert_eq!(gw.level(Channel(35)), Some(Level::Low));
        assert!(seq.energized().is_empty());
    }

    #[test]
    fn forced_actuator_is_not_switched_off_twice() {
        let water = valve("water", 33, 10);
        let (gw, sink, seq, _w) = setup(vec![water.clone()]);
        seq.activate(&water).unwrap();
        seq.force_off(&water).unwrap();
        let writes = gw.writes_to(Channel(33)).len();
        seq.deactivate(&water).unwrap();
        assert_eq!(gw.writes_to(Channel(33)).len(), writes);
        assert_eq!(sink.events(), vec!["water turned On", "water turned Off"]);
    }

    #[test]
    fn stuck_line_is_reported() {
        let water = valve("water", 33, 10);
        let (gw, _sink, seq, _w) = setup(vec![water.clone()]);
        seq.activate(&water).unwrap();
        gw.fail_all_writes(Channel(33), Some(Level::Low));
        let errors = seq.force_off_all();
        assert_eq!(errors.len(), 1);
        assert_eq!(seq.energized(), vec![Channel(33)]);
        gw.clear_faults(Channel(33));
        assert!(seq.force_off_all().is_empty());
    }

    #[test]
    fn hold_together_closes_every_line() {
        let lines = vec![valve("a", 1, 0), valve("b", 2, 0), valve("c", 3, 0)];
        let (gw, sink, seq, waiter) = setup(lines.clone());
        seq.hold_together(&lines, Duration::from_secs(5), &waiter).unwrap();
        for ch in 1..=3 {
            assert_eq!(gw.level(Channel(ch)), Some(Level::Low));
        }
        assert_eq!(sink.events().len(), 6);
    }

    #[test]
    fn arity_mismatch_is_configuration_error() {
        let steps = vec![DeliveryStep::immediate(valve("odor", 40, 10))];
        let (_gw, _sink, seq, waiter) = setup(vec![]);
        let err = seq
            .fire_synchronized("odor", &steps, 2, Duration::from_secs(1), &waiter)
            .unwrap_err();
        assert!(matches!(err, RigError::Configuration(_)));
    }

    #[test]
    fn shared_line_is_configuration_error() {
        let steps = vec![
            DeliveryStep::immediate(valve("odor", 40, 10).with_monitor(Channel(41))),
            DeliveryStep::immediate(valve("marker", 41, 10)),
        ];
        let (_gw, _sink, seq, waiter) = setup(vec![]);
        let err = seq
            .fire_synchronized("odor", &steps, 2, Duration::from_secs(1), &waiter)
            .unwrap_err();
        assert!(matches!(err, RigError::Configuration(_)));
    }

    #[test]
    fn synchronized_onsets_land_together() {
        let steps = vec![
            DeliveryStep::immediate(valve("odor", 40, 30)),
            DeliveryStep::immediate(valve("taste", 31, 20)),
            DeliveryStep::immediate(valve("marker", 42, 10)),
        ];
        let outputs: Vec<Actuator> = steps.iter().map(|s| s.actuator.clone()).collect();
        let gw = Arc::new(MockGateway::new());
        let clock = HighPrecisionClock::new();
        let seq = ActuatorSequencer::new(Arc::clone(&gw), EventLog::new(MemorySink::new(), clock.clone()), outputs);
        seq.prepare().unwrap();
        let waiter = Waiter::new(clock, CancelToken::new(), Duration::from_millis(5));
        let report = seq
            .fire_synchronized("multimodal", &steps, 3, Duration::from_secs(1), &waiter)
            .unwrap();
        assert_eq!(report.onsets.len(), 3);
        assert!(report.spread() < Duration::from_millis(10), "{:?}", report.spread());
        assert!(seq.energized().is_empty());
    }

    #[test]
    fn offset_delays_one_participant() {
        let steps = vec![
            DeliveryStep::immediate(valve("vacuum", 38, 700)),
            DeliveryStep {
                actuator: valve("odor", 40, 500),
                offset: Duration::from_millis(200),
                hold: Duration::from_millis(500),
            },
        ];
        let outputs: Vec<Actuator> = steps.iter().map(|s| s.actuator.clone()).collect();
        let gw = Arc::new(MockGateway::new());
        let clock = HighPrecisionClock::new();
        let seq = ActuatorSequencer::new(Arc::clone(&gw), EventLog::new(MemorySink::new(), clock.clone()), outputs);
        seq.prepare().unwrap();
        let waiter = Waiter::new(clock, CancelToken::new(), Duration::from_millis(5));
        let report = seq
            .fire_synchronized("odor", &steps, 2, Duration::from_secs(1), &waiter)
            .unwrap();
        let lead = report.onset("odor").unwrap() - report.onset("vacuum").unwrap();
        assert!(lead >= 190_000_000 && lead < 260_000_000, "{lead}");
    }

    #[test]
    fn missing_participant_leaves_group_off() {
        let steps = vec![
            DeliveryStep::immediate(valve("odor", 40, 20)),
            DeliveryStep::immediate(valve("taste", 31, 20)),
        ];
        let outputs: Vec<Actuator> = steps.iter().map(|s| s.actuator.clone()).collect();
        let gw = Arc::new(MockGateway::new());
        let clock = HighPrecisionClock::new();
        let sink = MemorySink::new();
        let seq = ActuatorSequencer::new(Arc::clone(&gw), EventLog::new(sink.clone(), clock.clone()), outputs);
        seq.prepare().unwrap();
        // The taste worker is stuck arming past the barrier timeout.
        gw.delay_writes(Channel(31), Duration::from_millis(300));
        let waiter = Waiter::new(clock, CancelToken::new(), Duration::from_millis(5));
        let err = seq
            .fire_synchronized("multimodal", &steps, 2, Duration::from_millis(50), &waiter)
            .unwrap_err();
        assert!(matches!(err, RigError::Synchronization { .. }), "{err:?}");
        assert_eq!(gw.first_write(Channel(40), Level::High), None);
        assert_eq!(gw.first_write(Channel(31), Level::High), None);
        assert!(seq.energized().is_empty());
        assert!(sink.position("Synchronization failure").is_some());
    }

    #[test]
    fn slow_participant_is_wound_down_before_return() {
        let steps = vec![
            DeliveryStep::immediate(valve("odor", 40, 20)),
            DeliveryStep::immediate(valve("taste", 31, 20)),
        ];
        let outputs: Vec<Actuator> = steps.iter().map(|s| s.actuator.clone()).collect();
        let gw = Arc::new(MockGateway::new());
        let clock = HighPrecisionClock::new();
        let sink = MemorySink::new();
        let seq = ActuatorSequencer::new(Arc::clone(&gw), EventLog::new(sink.clone(), clock.clone()), outputs);
        seq.prepare().unwrap();
        // Taste arms in time, then overruns the join while switching.
        gw.delay_writes(Channel(31), Duration::from_millis(900));
        let waiter = Waiter::new(clock, CancelToken::new(), Duration::from_millis(5));
        let err = seq
            .fire_synchronized("multimodal", &steps, 2, Duration::from_secs(1), &waiter)
            .unwrap_err();
        assert!(matches!(err, RigError::Synchronization { .. }), "{err:?}");

        let writes = gw.writes_to(Channel(31));
        let events = sink.events();
        std::thread::sleep(Duration::from_millis(1200));
        assert_eq!(gw.writes_to(Channel(31)), writes);
        assert_eq!(sink.events(), events);

        let count = |name: &str| events.iter().filter(|e| *e == name).count();
        assert_eq!(count("taste turned On"), 1);
        assert_eq!(count("taste turned Off"), 1);
        assert_eq!(gw.level(Channel(31)), Some(Level::Low));
        assert!(seq.energized().is_empty());
    }

    #[test]
    fn failed_participant_aborts_the_rest_of_the_group() {
        let steps = vec![
            DeliveryStep::immediate(valve("odor", 40, 2000)),
            DeliveryStep::immediate(valve("taste", 31, 20)),
        ];
        let outputs: Vec<Actuator> = steps.iter().map(|s| s.actuator.clone()).collect();
        let gw = Arc::new(MockGateway::new());
        let clock = HighPrecisionClock::new();
        let sink = MemorySink::new();
        let seq = ActuatorSequencer::new(Arc::clone(&gw), EventLog::new(sink.clone(), clock.clone()), outputs);
        seq.prepare().unwrap();
        gw.fail_writes(Channel(31), Some(Level::High), 1);
        let waiter = Waiter::new(clock, CancelToken::new(), Duration::from_millis(5));
        let start = Instant::now();
        let err = seq
            .fire_synchronized("multimodal", &steps, 2, Duration::from_secs(1), &waiter)
            .unwrap_err();
        assert!(matches!(err, RigError::Hardware(_)), "{err:?}");
        assert!(start.elapsed() < Duration::from_millis(1000), "{:?}", start.elapsed());
        assert_eq!(gw.level(Channel(40)), Some(Level::Low));
        assert!(!waiter.cancel_token().is_cancelled());
        assert!(seq.energized().is_empty());
    }
}
