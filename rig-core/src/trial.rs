use serde::{Deserialize, Serialize};
use std::fmt;

/// Trial state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    CueOn,
    AwaitResponse,
    Delivery,
    AwaitWithdrawal,
    Reward,
    Iti,
    SessionEnd,
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrialState::CueOn => "CUE_ON",
            TrialState::AwaitResponse => "AWAIT_RESPONSE",
            TrialState::Delivery => "DELIVERY",
            TrialState::AwaitWithdrawal => "AWAIT_WITHDRAWAL",
            TrialState::Reward => "REWARD",
            TrialState::Iti => "ITI",
            TrialState::SessionEnd => "SESSION_END",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialOutcome {
    Completed,
    TimedOut,
    Aborted,
}

/// Recorded result per trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    /// Zero-based position in the trial plan.
    pub index: usize,
    pub stimulus: String,
    /// Session clock at `CUE_ON`, in nanoseconds.
    pub onset_ns: u64,
    pub outcome: TrialOutcome,
    pub response_latency_ns: Option<u64>,
    pub iti_ns: Option<u64>,
    /// Human-readable cause when the trial did not complete.
    pub note: Option<String>,
}

impl TrialRecord {
    pub fn new(index: usize, stimulus: impl Into<String>, onset_ns: u64) -> Self {
        Self {
            index,
            stimulus: stimulus.into(),
            onset_ns,
            outcome: TrialOutcome::Completed,
            response_latency_ns: None,
            iti_ns: None,
            note: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == TrialOutcome::Completed
    }
}
