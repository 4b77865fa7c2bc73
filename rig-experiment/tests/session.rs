use rand::SeedableRng;
use rand::rngs::StdRng;
use rig_core::{Channel, DigitalIo, EventLogEntry, Level, MockGateway, RigError, TrialOutcome};
use rig_experiment::{EndReason, EventSink, MemorySink, SessionConfig, SessionController, SessionSetup};
use rig_timing::{CancelToken, Clock, HighPrecisionClock, ManualClock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::io;
use std::time::Duration;

const MS: u64 = 1_000_000;
const BEAM: Channel = Channel(36);

const PASSIVE: &str = r#"
    protocol = "passive"
    repeats = 5
    poll_interval_s = 0.01
    seed = 42

    [iti]
    regimes = [{ min_s = 1.0, max_s = 2.0 }]

    [[actuators]]
    name = "sucrose"
    channel = 31
    open_s = 0.015
    monitor = 35

    [[actuators]]
    name = "nacl"
    channel = 33
    open_s = 0.015

    [[actuators]]
    name = "water"
    channel = 37
    open_s = 0.012

    [[stimuli]]
    name = "sucrose"
    actuators = ["sucrose"]

    [[stimuli]]
    name = "nacl"
    actuators = ["nacl"]

    [[stimuli]]
    name = "water"
    actuators = ["water"]
"#;

const NOSE_POKE: &str = r#"
    protocol = "nose_poke"
    repeats = 3
    seed = 7
    lights = ["cue"]

    [sensor]
    channel = 36

    [iti]
    regimes = [{ min_s = 1.0, max_s = 1.0 }]

    [[actuators]]
    name = "cue"
    channel = 15
    polarity = "active_low"

    [[actuators]]
    name = "sucrose"
    channel = 31
    open_s = 0.015

    [[stimuli]]
    name = "sucrose"
    actuators = ["sucrose"]
"#;

const ODOR_TASTE: &str = r#"
    protocol = "cued_multimodal"
    repeats = 2
    poll_interval_s = 0.002
    debounce_s = 0.0
    sync_timeout_s = 0.05
    lights = ["cue"]

    [sensor]
    channel = 36

    [iti]
    regimes = [{ min_s = 0.05, max_s = 0.05 }]

    [[actuators]]
    name = "cue"
    channel = 15
    polarity = "active_low"

    [[actuators]]
    name = "odor"
    channel = 40
    open_s = 0.03

    [[actuators]]
    name = "taste"
    channel = 31
    open_s = 0.02

    [[stimuli]]
    name = "odor_taste"
    actuators = ["odor", "taste"]
"#;

/// Memory sink that cancels `token` when `event` is logged.
struct CancelOn {
    inner: MemorySink,
    event: &'static str,
    token: CancelToken,
}

impl EventSink for CancelOn {
    fn append(&mut self, entry: &EventLogEntry) -> io::Result<()> {
        if entry.event == self.event {
            self.token.cancel();
        }
        self.inner.append(entry)
    }
}

fn config(text: &str) -> SessionConfig {
    SessionConfig::from_toml_str(text).unwrap()
}

fn run(setup: SessionSetup, gw: &Arc<MockGateway>, clock: &ManualClock, cancel: CancelToken) -> (rig_experiment::SessionSummary, MemorySink) {
    let sink = MemorySink::new();
    let summary = SessionController::new(setup, Arc::clone(gw), clock.clone(), sink.clone(), cancel)
        .run()
        .unwrap();
    (summary, sink)
}

/// Beam broken (active-low) while the clock is in any of `spans` (ms).
fn script_beam(gw: &MockGateway, clock: &ManualClock, spans: Vec<(u64, u64)>) {
    let clock_at = clock.clone();
    gw.script_input(BEAM, move || {
        let t = clock_at.now() / MS;
        if spans.iter().any(|&(a, b)| t >= a && t < b) {
            Level::Low
        } else {
            Level::High
        }
    });
}

fn assert_paired(sink: &MemorySink) {
    let mut open: BTreeMap<String, usize> = BTreeMap::new();
    for event in sink.events() {
        if let Some(name) = event.strip_suffix(" turned On") {
            let n = open.entry(name.to_string()).or_default();
            assert_eq!(*n, 0, "{name} activated while on");
            *n += 1;
        } else if let Some(name) = event.strip_suffix(" turned Off") {
            let n = open.entry(name.to_string()).or_default();
            assert_eq!(*n, 1, "{name} deactivated while off");
            *n -= 1;
        }
    }
    assert!(open.values().all(|&n| n == 0), "{open:?}");
}

#[test]
fn passive_session_presents_every_stimulus_repeat_times() {
    let setup = config(PASSIVE).validate().unwrap();
    let gw = Arc::new(MockGateway::new());
    let clock = ManualClock::new();
    let (summary, sink) = run(setup, &gw, &clock, CancelToken::new());

    assert_eq!(summary.end_reason, EndReason::PlanComplete);
    assert_eq!(summary.records.len(), 15);
    let mut per_stimulus: BTreeMap<&str, usize> = BTreeMap::new();
    for r in &summary.records {
        *per_stimulus.entry(r.stimulus.as_str()).or_default() += 1;
        assert!(r.is_completed());
        let iti = Duration::from_nanos(r.iti_ns.unwrap());
        assert!(iti >= Duration::from_secs(1) && iti <= Duration::from_secs(2));
    }
    assert_eq!(per_stimulus.values().copied().collect::<Vec<_>>(), vec![5, 5, 5]);
    assert_paired(&sink);
    assert!(summary.cleanup_result().is_ok());
    assert_eq!(gw.releases(), 1);
    assert_eq!(sink.events().last().map(String::as_str), Some("SESSION_END"));
}

#[test]
fn seeded_sessions_repeat_their_order() {
    let order = || {
        let gw = Arc::new(MockGateway::new());
        let (summary, _) = run(config(PASSIVE).validate().unwrap(), &gw, &ManualClock::new(), CancelToken::new());
        summary
            .records
            .into_iter()
            .map(|r| (r.stimulus, r.iti_ns))
            .collect::<Vec<_>>()
    };
    assert_eq!(order(), order());
}

#[test]
fn trial_limit_binds_before_plan_end() {
    let mut cfg = config(PASSIVE);
    cfg.max_trials = Some(4);
    let gw = Arc::new(MockGateway::new());
    let (summary, _) = run(cfg.validate().unwrap(), &gw, &ManualClock::new(), CancelToken::new());
    assert_eq!(summary.records.len(), 4);
    assert_eq!(summary.end_reason, EndReason::TrialLimit);
}

#[test]
fn time_limit_stops_within_one_poll() {
    for max_s in [3.0, 7.5, 10.0, 12.34] {
        let mut cfg = config(PASSIVE);
        cfg.max_duration_s = max_s;
        cfg.start_delay_s = 0.5;
        let gw = Arc::new(MockGateway::new());
        let clock = ManualClock::new();
        let (summary, sink) = run(cfg.validate().unwrap(), &gw, &clock, CancelToken::new());

        assert_eq!(summary.end_reason, EndReason::TimeLimit);
        let max = Duration::from_secs_f64(max_s);
        assert!(summary.elapsed <= max + Duration::from_millis(10), "{max_s}: {:?}", summary.elapsed);
        assert_paired(&sink);
        for ch in [31, 33, 35, 37] {
            assert_eq!(gw.level(Channel(ch)), Some(Level::Low));
        }
        assert_eq!(gw.releases(), 1);
    }
}

#[test]
fn nose_poke_iti_restarts_on_pokes() {
    let setup = config(NOSE_POKE).validate().unwrap();
    let gw = Arc::new(MockGateway::new());
    let clock = ManualClock::new();
    // Trial 1: poke at 100..300, delivery at 800, ITI from 815 with pokes
    // at 1200 and 1700. Trials 2 and 3 respond to the later pokes.
    script_beam(
        &gw,
        &clock,
        vec![(100, 300), (1200, 1230), (1700, 1750), (4000, 4200), (7000, 7200)],
    );
    let (summary, sink) = run(setup, &gw, &clock, CancelToken::new());
    assert_eq!(summary.end_reason, EndReason::PlanComplete);
    assert_eq!(summary.records.len(), 3);

    let entries = sink.entries();
    let trial_2 = entries.iter().find(|e| e.event == "Trial 2").unwrap();
    // Last beam-broken sample of the ITI is at 1745 ms.
    assert_eq!(trial_2.at_ns, 2745 * MS);
    let restarts = entries
        .iter()
        .filter(|e| e.event == "ITI restarted" && e.get("trial") == Some("1"))
        .count();
    assert_eq!(restarts, 2);
    assert_eq!(summary.records[1].response_latency_ns, Some(1260 * MS));
    assert!(summary.poll.samples > 0);
    assert_paired(&sink);
}

#[test]
fn response_window_records_time_outs() {
    let mut cfg = config(NOSE_POKE);
    cfg.response_window_s = Some(2.0);
    let gw = Arc::new(MockGateway::new());
    let clock = ManualClock::new();
    script_beam(&gw, &clock, vec![]);
    let (summary, sink) = run(cfg.validate().unwrap(), &gw, &clock, CancelToken::new());
    assert_eq!(summary.count(TrialOutcome::TimedOut), 3);
    assert_eq!(gw.first_write(Channel(31), Level::High), None);
    assert_eq!(clock.now_duration(), Duration::from_secs(9));
    assert_paired(&sink);
}

#[test]
fn hardware_fault_aborts_one_trial_and_continues() {
    let gw = Arc::new(MockGateway::new());
    let clock = ManualClock::new();
    gw.fail_writes(Channel(31), Some(Level::High), 1);
    let (summary, sink) = run(config(PASSIVE).validate().unwrap(), &gw, &clock, CancelToken::new());
    assert_eq!(summary.end_reason, EndReason::PlanComplete);
    assert_eq!(summary.count(TrialOutcome::Aborted), 1);
    assert_eq!(summary.count(TrialOutcome::Completed), 14);
    let aborted = summary
        .records
        .iter()
        .position(|r| r.outcome == TrialOutcome::Aborted)
        .unwrap();
    assert_eq!(summary.records[aborted].stimulus, "sucrose");
    assert!(sink.position("Trial aborted").is_some());
    assert_paired(&sink);
}

#[test]
fn persistent_hardware_faults_end_the_session() {
    let mut cfg = config(PASSIVE);
    cfg.hardware_retry_budget = 2;
    let gw = Arc::new(MockGateway::new());
    gw.fail_all_writes(Channel(37), Some(Level::High));
    cfg.stimuli.retain(|s| s.name == "water");
    let (summary, sink) = run(cfg.validate().unwrap(), &gw, &ManualClock::new(), CancelToken::new());
    assert!(matches!(summary.end_reason, EndReason::Fatal(_)), "{:?}", summary.end_reason);
    assert_eq!(summary.records.len(), 3);
    assert!(sink.position("Session aborted").is_some());
    assert_eq!(gw.level(Channel(37)), Some(Level::Low));
}

#[test]
fn cancellation_cleans_up_and_logs_abort() {
    let setup = config(NOSE_POKE).validate().unwrap();
    let gw = Arc::new(MockGateway::new());
    let clock = ManualClock::new();
    let cancel = CancelToken::new();
    let (token, clock_at) = (cancel.clone(), clock.clone());
    gw.script_input(BEAM, move || {
        if clock_at.now() >= 2500 * MS {
            token.cancel();
        }
        Level::High
    });
    let (summary, sink) = run(setup, &gw, &clock, cancel);
    assert_eq!(summary.end_reason, EndReason::Cancelled);
    assert_eq!(summary.records.len(), 1);
    assert_eq!(summary.records[0].outcome, TrialOutcome::Aborted);
    assert!(sink.position("Session aborted").is_some());
    assert_eq!(gw.level(Channel(15)), Some(Level::High));
    assert_eq!(gw.releases(), 1);
    assert_paired(&sink);
    assert!(clock.now() <= 2510 * MS);
}

#[test]
fn invalid_plan_fails_before_touching_lines() {
    let mut setup = config(PASSIVE).validate().unwrap();
    setup.repeats = 0;
    let gw = Arc::new(MockGateway::new());
    let err = SessionController::new(setup, Arc::clone(&gw), ManualClock::new(), MemorySink::new(), CancelToken::new())
        .run()
        .unwrap_err();
    assert!(matches!(err, RigError::Configuration(_)));
    assert!(gw.history().is_empty());
    assert_eq!(gw.releases(), 0);
}

#[test]
fn multimodal_group_fires_together() {
    let text = r#"
        protocol = "cued_multimodal"
        repeats = 3
        poll_interval_s = 0.002
        debounce_s = 0.0
        lights = ["cue"]

        [sensor]
        channel = 36

        [iti]
        regimes = [{ min_s = 0.05, max_s = 0.05 }]

        [[actuators]]
        name = "cue"
        channel = 15
        polarity = "active_low"

        [[actuators]]
        name = "odor"
        channel = 40
        open_s = 0.03

        [[actuators]]
        name = "taste"
        channel = 31
        open_s = 0.02

        [[actuators]]
        name = "marker"
        channel = 21
        open_s = 0.01

        [[stimuli]]
        name = "odor_taste"
        actuators = ["odor", "taste", "marker"]
    "#;
    let setup = config(text).validate().unwrap();
    let gw = Arc::new(MockGateway::new());
    gw.set_input(BEAM, Level::Low);
    let clock = HighPrecisionClock::new();
    let sink = MemorySink::new();
    let summary = SessionController::new(setup, Arc::clone(&gw), clock.clone(), sink.clone(), CancelToken::new())
        .with_rng(StdRng::seed_from_u64(3))
        .run()
        .unwrap();
    assert_eq!(summary.count(TrialOutcome::Completed), 3);

    let entries = sink.entries();
    for (start, _) in entries.iter().enumerate().filter(|(_, e)| e.event == "DELIVERY") {
        let onsets: Vec<u64> = entries[start..]
            .iter()
            .filter(|e| e.event.ends_with(" turned On"))
            .take(3)
            .map(|e| e.at_ns)
            .collect();
        let spread = onsets.iter().max().unwrap() - onsets.iter().min().unwrap();
        assert!(spread < 10 * MS, "onset spread {spread} ns");
    }
    assert!(clock.now() > 0);
    assert!(gw.read(BEAM).is_err());
}

#[test]
fn stalled_participant_aborts_only_its_trial() {
    let setup = config(ODOR_TASTE).validate().unwrap();
    let gw = Arc::new(MockGateway::new());
    gw.set_input(BEAM, Level::Low);
    // Setup, then trial 1's arming write to the taste line, are slow.
    gw.delay_next_writes(Channel(31), Duration::from_millis(200), 2);
    let sink = MemorySink::new();
    let summary = SessionController::new(setup, Arc::clone(&gw), HighPrecisionClock::new(), sink.clone(), CancelToken::new())
        .run()
        .unwrap();

    assert_eq!(summary.end_reason, EndReason::PlanComplete);
    assert_eq!(summary.records.len(), 2);
    assert_eq!(summary.records[0].outcome, TrialOutcome::Aborted);
    let note = summary.records[0].note.as_deref().unwrap_or_default();
    assert!(note.contains("Synchronization"), "{note}");
    assert!(summary.records[1].is_completed(), "{:?}", summary.records[1].note);
    assert_eq!(sink.events().iter().filter(|e| *e == "Synchronization failure").count(), 1);
    assert_eq!(sink.events().iter().filter(|e| *e == "taste turned On").count(), 1);
    assert_paired(&sink);
    for ch in [40, 31] {
        assert_eq!(gw.level(Channel(ch)), Some(Level::Low));
    }
    assert_eq!(gw.level(Channel(15)), Some(Level::High));
}

#[test]
fn cancel_at_the_onset_barrier_stops_the_session_safely() {
    let setup = config(ODOR_TASTE).validate().unwrap();
    let gw = Arc::new(MockGateway::new());
    gw.set_input(BEAM, Level::Low);
    gw.delay_next_writes(Channel(31), Duration::from_millis(200), 2);
    let cancel = CancelToken::new();
    let sink = MemorySink::new();
    let cancel_on_arm = CancelOn {
        inner: sink.clone(),
        event: "odor armed",
        token: cancel.clone(),
    };
    let summary = SessionController::new(setup, Arc::clone(&gw), HighPrecisionClock::new(), cancel_on_arm, cancel)
        .run()
        .unwrap();

    assert_eq!(summary.end_reason, EndReason::Cancelled);
    assert_eq!(summary.records.len(), 1);
    assert_eq!(summary.records[0].outcome, TrialOutcome::Aborted);
    assert_eq!(gw.first_write(Channel(40), Level::High), None);
    assert_eq!(gw.first_write(Channel(31), Level::High), None);
    assert_eq!(gw.level(Channel(15)), Some(Level::High));
    assert_paired(&sink);
    assert!(sink.position("Synchronization failure").is_some());
    assert_eq!(sink.events().last().map(String::as_str), Some("SESSION_END"));
    assert!(summary.cleanup_result().is_ok());
}
