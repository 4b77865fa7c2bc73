//! Line maintenance run outside a session: flushing, calibration, marker
//! pulses and resetting every line.

use crate::sequencer::ActuatorSequencer;
use rig_core::{Actuator, Channel, DigitalIo, Direction, RigResult};
use rig_timing::{Clock, Waiter};
use std::time::Duration;
use tracing::info;

/// Pause between calibration openings.
pub const CALIBRATION_PAUSE: Duration = Duration::from_secs(1);

/// Opens `lines` together for `duration` to flush them, then closes them.
pub fn clearout<G: DigitalIo + 'static, C: Clock>(
    seq: &ActuatorSequencer<G, C>,
    lines: &[Actuator],
    duration: Duration,
    waiter: &Waiter<C>,
) -> RigResult<()> {
    seq.log().emit_with("Clearout started", |e| {
        e.with("lines", names(lines)).with("duration_s", duration.as_secs_f64())
    });
    seq.hold_together(lines, duration, waiter)?;
    seq.log().emit("Clearout finished");
    Ok(())
}

/// Opens `lines` together for `open_time`, `repeats` times, pausing between
/// openings, so the delivered volume can be weighed.
pub fn calibrate<G: DigitalIo + 'static, C: Clock>(
    seq: &ActuatorSequencer<G, C>,
    lines: &[Actuator],
    open_time: Duration,
    repeats: usize,
    waiter: &Waiter<C>,
) -> RigResult<()> {
    seq.log().emit_with("Calibration started", |e| {
        e.with("lines", names(lines))
            .with("open_ms", open_time.as_millis())
            .with("repeats", repeats)
    });
    for i in 0..repeats {
        seq.hold_together(lines, open_time, waiter)?;
        if i + 1 < repeats {
            waiter.sleep(CALIBRATION_PAUSE)?;
        }
    }
    info!("Calibration: {} openings of {:?}", repeats, open_time);
    seq.log().emit("Calibration finished");
    Ok(())
}

/// Brackets a recording with two marker pulses `gap` apart.
pub fn marker_pulses<G: DigitalIo + 'static, C: Clock>(
    seq: &ActuatorSequencer<G, C>,
    marker: &Actuator,
    pulse: Duration,
    gap: Duration,
    waiter: &Waiter<C>,
) -> RigResult<()> {
    seq.fire(marker, pulse, waiter)?;
    waiter.sleep(gap)?;
    seq.fire(marker, pulse, waiter)?;
    Ok(())
}

/// Configures `inputs`, then drives every output of `seq` to its inactive level.
pub fn clear_all<G: DigitalIo + 'static, C: Clock>(seq: &ActuatorSequencer<G, C>, inputs: &[Channel]) -> RigResult<()> {
    for &ch in inputs {
        seq.io().configure(ch, Direction::Input)?;
    }
    seq.prepare()?;
    seq.log().emit_with("All lines cleared", |e| {
        e.with("outputs", names(seq.outputs())).with("inputs", inputs.len())
    });
    Ok(())
}

fn names(lines: &[Actuator]) -> String {
    lines
        .iter()
        .map(|a| a.name.as_str())
        .collect::<Vec<_>>()
        .join(",")
}
