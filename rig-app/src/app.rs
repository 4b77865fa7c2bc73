use crate::{Cli, Commands};
use anyhow::{Context, Result, anyhow, bail};
use rig_core::{Actuator, Channel, DigitalIo, Level, MockGateway, RigError, RigResult, SysfsGateway};
use rig_experiment::{
    ActuatorSequencer, CsvSink, EndReason, EventLog, EventSink, JsonLinesSink, NullSink,
    SessionConfig, SessionController, SessionSetup, maintenance,
};
use rig_timing::{CancelToken, Clock, HighPrecisionClock, Waiter};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Poll slice for maintenance commands.
const MAINTENANCE_SLICE: Duration = Duration::from_millis(10);
/// How long the simulated subject keeps its nose in the port.
const SIM_POKE_HOLD: Duration = Duration::from_millis(300);

enum Gateway {
    Simulated(Arc<MockGateway>),
    Sysfs(Arc<SysfsGateway>),
}

pub struct App {
    command: Commands,
    simulate: bool,
    clock: HighPrecisionClock,
    cancel: CancelToken,
}

impl App {
    pub fn new(cli: Cli) -> Result<Self> {
        let cancel = CancelToken::new();
        install_ctrl_c(cancel.clone())?;
        Ok(Self {
            command: cli.command,
            simulate: cli.simulate,
            clock: HighPrecisionClock::new(),
            cancel,
        })
    }

    pub fn run(self) -> Result<()> {
        println!("=== BEHAVIORAL RIG ===");
        println!("Platform: {}", std::env::consts::OS);
        println!("Gateway: {}", if self.simulate { "simulated" } else { "sysfs GPIO" });
        println!("Press Ctrl-C to stop; every line is closed before exit.\n");

        match &self.command {
            Commands::Check { config } => self.check(config),
            Commands::Run {
                config,
                seed,
                events,
                records,
                poke_every,
            } => {
                let mut cfg = load(config)?;
                if seed.is_some() {
                    cfg.seed = *seed;
                }
                let setup = cfg.validate().context("invalid session file")?;
                let sink = open_sink(events.as_deref())?;
                match self.gateway() {
                    Gateway::Simulated(gw) => {
                        if let Some(sensor) = setup.sensor {
                            self.simulate_subject(&gw, sensor.channel, sensor.polarity.active(), *poke_every)?;
                        }
                        self.run_session(gw, setup, sink, records.as_deref())
                    }
                    Gateway::Sysfs(gw) => self.run_session(gw, setup, sink, records.as_deref()),
                }
            }
            Commands::Clearout {
                config,
                lines,
                duration,
            } => {
                let cfg = load(config)?;
                let lines = cfg.actuators_named(lines)?;
                self.maintain(lines, Routine::Clearout(seconds("duration", *duration)?))
            }
            Commands::Calibrate {
                config,
                lines,
                open_time,
                repeats,
            } => {
                let cfg = load(config)?;
                let lines = cfg.actuators_named(lines)?;
                let routine = Routine::Calibrate {
                    open_time: seconds("open-time", *open_time)?,
                    repeats: *repeats,
                };
                self.maintain(lines, routine)
            }
            Commands::Mark {
                config,
                marker,
                pulse,
                gap,
            } => {
                let cfg = load(config)?;
                let lines = cfg.actuators_named(std::slice::from_ref(marker))?;
                let routine = Routine::Mark {
                    pulse: seconds("pulse", *pulse)?,
                    gap: seconds("gap", *gap)?,
                };
                self.maintain(lines, routine)
            }
            Commands::ClearAll { config } => {
                let setup = load(config)?.validate().context("invalid session file")?;
                let inputs = setup.sensor.iter().map(|s| s.channel).collect();
                self.maintain(setup.outputs, Routine::ClearAll { inputs })
            }
        }
    }

    fn check(&self, path: &Path) -> Result<()> {
        let setup = load(path)?.validate().context("invalid session file")?;
        println!("Protocol:    {:?}", setup.protocol);
        println!(
            "Trials:      {} ({} stimuli x {} repeats, limit {})",
            setup.plan_len(),
            setup.stimuli.len(),
            setup.repeats,
            setup.trial_limit()
        );
        println!("Max length:  {:.0} s", setup.timing.max_duration.as_secs_f64());
        for s in &setup.stimuli {
            let group: Vec<String> = s
                .delivery
                .iter()
                .map(|d| format!("{}@{}ms/{}ms", d.actuator.name, d.offset.as_millis(), d.hold.as_millis()))
                .collect();
            println!("Stimulus {:<12} {}", s.name, group.join(" + "));
        }
        if let Some(sensor) = setup.sensor {
            println!("Sensor:      {} ({:?})", sensor.channel, sensor.polarity);
        }
        println!("ITI resets on poke: {}", setup.iti_resets_on_poke);
        Ok(())
    }

    fn gateway(&self) -> Gateway {
        if self.simulate {
            Gateway::Simulated(Arc::new(MockGateway::new()))
        } else {
            Gateway::Sysfs(Arc::new(SysfsGateway::new()))
        }
    }

    /// The simulated subject pokes every `every` seconds for a short hold.
    fn simulate_subject(&self, gw: &MockGateway, channel: Channel, active: Level, every: f64) -> Result<()> {
        let period = seconds("poke-every", every)?.as_nanos() as u64;
        if period == 0 {
            bail!("--poke-every must be positive");
        }
        let hold = SIM_POKE_HOLD.as_nanos() as u64;
        let clock = self.clock.clone();
        gw.script_input(channel, move || {
            if clock.now() % period < hold {
                active
            } else {
                active.inverted()
            }
        });
        info!("Simulated subject pokes every {:.1} s", every);
        Ok(())
    }

    fn run_session<G: DigitalIo + 'static>(
        &self,
        io: Arc<G>,
        setup: SessionSetup,
        sink: Box<dyn EventSink>,
        records: Option<&Path>,
    ) -> Result<()> {
        let summary = SessionController::new(setup, io, self.clock.clone(), sink, self.cancel.clone())
            .run()
            .context("session could not start")?;

        if let Some(path) = records {
            let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
            serde_json::to_writer_pretty(BufWriter::new(file), &summary.records)
                .context("Failed to write trial records")?;
            info!("Trial records written to {}", path.display());
        }

        println!(
            "\nSession ended: {} after {:.1} s, {} trials",
            summary.end_reason,
            summary.elapsed.as_secs_f64(),
            summary.records.len()
        );
        if summary.poll.samples > 0 {
            println!(
                "Sensor poll: {:.3} ms average, {:.3} ms jitter",
                summary.poll.average_ns / 1e6,
                summary.poll.jitter_ns / 1e6
            );
        }
        summary.cleanup_result()?;
        match summary.end_reason {
            EndReason::Fatal(msg) => Err(anyhow!("session failed: {msg}")),
            EndReason::Cancelled => {
                warn!("Session cancelled by operator");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Runs a maintenance routine over `lines`, then makes them safe and
    /// releases the gateway.
    fn maintain(&self, lines: Vec<Actuator>, routine: Routine) -> Result<()> {
        match self.gateway() {
            Gateway::Simulated(gw) => self.maintain_with(gw, lines, &routine),
            Gateway::Sysfs(gw) => self.maintain_with(gw, lines, &routine),
        }
    }

    fn maintain_with<G: DigitalIo + 'static>(&self, io: Arc<G>, lines: Vec<Actuator>, routine: &Routine) -> Result<()> {
        let seq = ActuatorSequencer::new(Arc::clone(&io), EventLog::new(NullSink, self.clock.clone()), lines);
        let waiter = Waiter::new(self.clock.clone(), self.cancel.clone(), MAINTENANCE_SLICE);
        let result = seq.prepare().and_then(|()| routine.run(&seq, &waiter));
        let mut stuck = seq.force_off_all();
        if let Err(e) = io.release_all() {
            stuck.push(e);
        }
        if !stuck.is_empty() {
            return Err(RigError::CleanupFailed(stuck).into());
        }
        match result {
            Err(RigError::OperatorCancelled) => {
                warn!("Stopped by operator; lines closed");
                Ok(())
            }
            other => other.map_err(Into::into),
        }
    }
}

/// A maintenance command with its parameters resolved.
enum Routine {
    Clearout(Duration),
    Calibrate { open_time: Duration, repeats: usize },
    Mark { pulse: Duration, gap: Duration },
    ClearAll { inputs: Vec<Channel> },
}

impl Routine {
    fn run<G: DigitalIo + 'static, C: Clock>(&self, seq: &ActuatorSequencer<G, C>, waiter: &Waiter<C>) -> RigResult<()> {
        let lines = seq.outputs();
        match self {
            Routine::Clearout(duration) => maintenance::clearout(seq, lines, *duration, waiter),
            Routine::Calibrate { open_time, repeats } => {
                maintenance::calibrate(seq, lines, *open_time, *repeats, waiter)
            }
            Routine::Mark { pulse, gap } => match lines.first() {
                Some(marker) => maintenance::marker_pulses(seq, marker, *pulse, *gap, waiter),
                None => Err(RigError::config("no marker line")),
            },
            Routine::ClearAll { inputs } => maintenance::clear_all(seq, inputs),
        }
    }
}

fn load(path: &Path) -> Result<SessionConfig> {
    SessionConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

fn seconds(flag: &str, value: f64) -> Result<Duration> {
    if !(value.is_finite() && value >= 0.0) {
        bail!("--{flag} must be a non-negative number of seconds, got {value}");
    }
    Ok(Duration::from_secs_f64(value))
}

/// Opens the event log; without a path, a timestamped CSV in the working
/// directory.
fn open_sink(path: Option<&Path>) -> Result<Box<dyn EventSink>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(|| {
        PathBuf::from(format!("events_{}.csv", chrono::Local::now().format("%Y%m%d_%H%M%S")))
    });
    let sink: Box<dyn EventSink> = if path.extension().is_some_and(|e| e == "jsonl") {
        Box::new(JsonLinesSink::create(&path).with_context(|| format!("Failed to create {}", path.display()))?)
    } else {
        Box::new(CsvSink::create(&path).with_context(|| format!("Failed to create {}", path.display()))?)
    };
    info!("Event log: {}", path.display());
    Ok(sink)
}

/// Cancels `cancel` on Ctrl-C, from a dedicated signal thread.
fn install_ctrl_c(cancel: CancelToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build signal runtime")?;
    std::thread::Builder::new()
        .name("ctrl-c".into())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Ctrl-C received, stopping");
                    cancel.cancel();
                }
            })
        })
        .context("Failed to spawn signal thread")?;
    Ok(())
}
