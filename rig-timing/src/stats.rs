use std::collections::VecDeque;
use std::time::Duration;

/// Summary of observed poll periods.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollSummary {
    pub samples: usize,
    pub average_ns: f64,
    pub jitter_ns: f64,
    pub min_ns: f64,
    pub max_ns: f64,
}

/// Rolling record of actual sample-to-sample periods of a poll loop.
#[derive(Debug, Clone)]
pub struct PollStats {
    periods: VecDeque<Duration>,
    max_samples: usize,
}

impl PollStats {
    pub fn new(max_samples: usize) -> Self {
        Self {
            periods: VecDeque::with_capacity(max_samples.min(4096)),
            max_samples,
        }
    }

    pub fn record(&mut self, period: Duration) {
        if self.max_samples == 0 {
            return;
        }
        if self.periods.len() >= self.max_samples {
            self.periods.pop_front();
        }
        self.periods.push_back(period);
    }

    pub fn summary(&self) -> PollSummary {
        if self.periods.is_empty() {
            return PollSummary::default();
        }
        let times: Vec<f64> = self.periods.iter().map(|d| d.as_nanos() as f64).collect();
        let n = times.len() as f64;
        let avg = times.iter().sum::<f64>() / n;
        let var = times.iter().map(|x| (x - avg).powi(2)).sum::<f64>() / n;
        PollSummary {
            samples: times.len(),
            average_ns: avg,
            jitter_ns: var.sqrt(),
            min_ns: times.iter().copied().fold(f64::INFINITY, f64::min),
            max_ns: times.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

impl Default for PollStats {
    fn default() -> Self {
        Self::new(1000)
    }
}
