//! Error taxonomy for the rig engine.
//!
//! - **`Configuration`**: invalid plan parameters or a malformed actuator map.
//!   Always raised before a session starts (or at `fire_synchronized` call
//!   time for a mismatched barrier).
//! - **`Hardware`**: a gateway call failed. The state machine recovers by
//!   forcing the channel safe and aborting the trial.
//! - **`Synchronization`**: a synchronized group missed its onset barrier or
//!   its join deadline. Trial-local.
//! - **`SessionTimeout`**: the session clock passed its maximum. A normal stop.
//! - **`OperatorCancelled`**: explicit interruption. Fatal to the session.

use crate::io::Channel;
use rig_timing::Interrupt;
use thiserror::Error;

pub type RigResult<T> = std::result::Result<T, RigError>;

/// A failed gateway call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{op} failed on {}: {reason}", target(.channel))]
pub struct HardwareError {
    pub op: &'static str,
    pub channel: Option<Channel>,
    pub reason: String,
}

fn target(channel: &Option<Channel>) -> String {
    channel.map_or_else(|| "gateway".to_string(), |c| c.to_string())
}

impl HardwareError {
    pub fn new(op: &'static str, channel: Channel, reason: impl Into<String>) -> Self {
        Self {
            op,
            channel: Some(channel),
            reason: reason.into(),
        }
    }

    pub fn gateway(op: &'static str, reason: impl Into<String>) -> Self {
        Self {
            op,
            channel: None,
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RigError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    #[error("Synchronization error in group '{group}': {detail}")]
    Synchronization { group: String, detail: String },

    #[error("Session time limit reached")]
    SessionTimeout,

    #[error("Session cancelled by operator")]
    OperatorCancelled,

    #[error("Cleanup failed with errors")]
    CleanupFailed(Vec<HardwareError>),
}

impl RigError {
    pub fn config(msg: impl Into<String>) -> Self {
        RigError::Configuration(msg.into())
    }

    /// Errors that end the trial but not the session.
    pub fn is_trial_local(&self) -> bool {
        matches!(self, RigError::Hardware(_) | RigError::Synchronization { .. })
    }
}

impl From<Interrupt> for RigError {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Cancelled => RigError::OperatorCancelled,
            Interrupt::Deadline => RigError::SessionTimeout,
        }
    }
}
