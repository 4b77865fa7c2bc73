use rand::Rng;
use rig_core::{RigError, RigResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How an ITI length is drawn from its regime's range.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ItiDraw {
    /// Uniform over `[min, max]`, truncated to 10 ms.
    #[default]
    Uniform,
    /// One of `min, min + step, ..., max`, equally likely.
    Discrete { step_s: f64 },
}

/// ITI range for a span of trials.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ItiRegime {
    /// Last 1-based trial this regime applies to; `None` runs to the end.
    pub through_trial: Option<usize>,
    pub min: Duration,
    pub max: Duration,
}

impl ItiRegime {
    pub fn new(through_trial: Option<usize>, min: Duration, max: Duration) -> Self {
        Self {
            through_trial,
            min,
            max,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItiSchedule {
    regimes: Vec<ItiRegime>,
    draw: ItiDraw,
}

const QUANTUM_NS: u64 = 10_000_000;

impl ItiSchedule {
    pub fn new(regimes: Vec<ItiRegime>, draw: ItiDraw) -> RigResult<Self> {
        if regimes.is_empty() {
            return Err(RigError::config("ITI schedule needs at least one regime"));
        }
        let mut last = 0;
        for (i, r) in regimes.iter().enumerate() {
            if r.min > r.max {
                return Err(RigError::config(format!(
                    "ITI regime {i}: min {:?} exceeds max {:?}",
                    r.min, r.max
                )));
            }
            match r.through_trial {
                Some(t) if t <= last => {
                    return Err(RigError::config(format!(
                        "ITI regime {i}: through_trial {t} must exceed the previous regime's"
                    )));
                }
                Some(t) => last = t,
                None if i + 1 != regimes.len() => {
                    return Err(RigError::config(format!(
                        "ITI regime {i} is open-ended but not last"
                    )));
                }
                None => {}
            }
        }
        if let ItiDraw::Discrete { step_s } = draw {
            if !(step_s.is_finite() && step_s > 0.0) {
                return Err(RigError::config(format!("ITI step must be positive, got {step_s}")));
            }
        }
        Ok(Self { regimes, draw })
    }

    pub fn fixed(length: Duration) -> Self {
        Self {
            regimes: vec![ItiRegime::new(None, length, length)],
            draw: ItiDraw::Uniform,
        }
    }

    /// Two regimes split at the middle of a plan of `total` trials.
    pub fn split_half(total: usize, first: (Duration, Duration), second: (Duration, Duration)) -> RigResult<Self> {
        Self::new(
            vec![
                ItiRegime::new(Some(total / 2), first.0, first.1),
                ItiRegime::new(None, second.0, second.1),
            ],
            ItiDraw::Uniform,
        )
    }

    /// Regime for a 1-based trial number. Trials past the last bounded
    /// regime fall into the final one.
    pub fn regime_for(&self, trial: usize) -> &ItiRegime {
        self.regimes
            .iter()
            .find(|r| r.through_trial.is_none_or(|t| trial <= t))
            .unwrap_or_else(|| &self.regimes[self.regimes.len() - 1])
    }

    pub fn draw<R: Rng + ?Sized>(&self, trial: usize, rng: &mut R) -> Duration {
        let regime = self.regime_for(trial);
        let (min, max) = (regime.min.as_nanos() as u64, regime.max.as_nanos() as u64);
        if min == max {
            return regime.min;
        }
        let ns = match self.draw {
            ItiDraw::Uniform => {
                let u: f64 = rng.random();
                let span = (max - min) as f64 * u;
                min + (span as u64 / QUANTUM_NS) * QUANTUM_NS
            }
            ItiDraw::Discrete { step_s } => {
                let step = ((step_s * 1e9).round() as u64).max(1);
                let slots = (max - min) / step;
                min + rng.random_range(0..=slots) * step
            }
        };
        Duration::from_nanos(ns.min(max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn split_regime_selects_by_trial() {
        let sched = ItiSchedule::split_half(200, (secs(0.8), secs(5.0)), (secs(0.4), secs(2.0))).unwrap();
        assert_eq!(sched.regime_for(100).max, secs(5.0));
        assert_eq!(sched.regime_for(101).max, secs(2.0));
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..500 {
            let d = sched.draw(150, &mut rng);
            assert!(d >= secs(0.4) && d <= secs(2.0), "{d:?}");
            assert_eq!(d.as_nanos() % 10_000_000, 0);
        }
    }

    #[test]
    fn discrete_draw_lands_on_steps() {
        let sched = ItiSchedule::new(
            vec![ItiRegime::new(None, secs(10.0), secs(30.0))],
            ItiDraw::Discrete { step_s: 5.0 },
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..400 {
            seen.insert(sched.draw(1, &mut rng).as_secs());
        }
        assert_eq!(seen.into_iter().collect::<Vec<_>>(), vec![10, 15, 20, 25, 30]);
    }

    #[test]
    fn fixed_schedule_never_varies() {
        let sched = ItiSchedule::fixed(secs(1.5));
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(sched.draw(1, &mut rng), secs(1.5));
        assert_eq!(sched.draw(999, &mut rng), secs(1.5));
    }

    #[test]
    fn rejects_inverted_and_unordered_regimes() {
        assert!(ItiSchedule::new(vec![ItiRegime::new(None, secs(2.0), secs(1.0))], ItiDraw::Uniform).is_err());
        assert!(
            ItiSchedule::new(
                vec![
                    ItiRegime::new(Some(50), secs(1.0), secs(2.0)),
                    ItiRegime::new(Some(20), secs(1.0), secs(2.0)),
                ],
                ItiDraw::Uniform
            )
            .is_err()
        );
        assert!(ItiSchedule::new(vec![], ItiDraw::Uniform).is_err());
    }
}
