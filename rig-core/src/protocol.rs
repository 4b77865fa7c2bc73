use crate::trial::TrialState;
use serde::{Deserialize, Serialize};

/// Defines which trial states a protocol passes through.
pub trait Protocol: Copy + Clone + PartialEq + Send + Sync + std::fmt::Debug {
    fn awaits_response(&self) -> bool;
    fn next(&self, state: TrialState) -> Option<TrialState>;

    fn awaits_withdrawal(&self) -> bool {
        false
    }
    fn synchronized_delivery(&self) -> bool {
        false
    }
    fn has_reward(&self) -> bool {
        false
    }
    /// Whether pokes during the ITI restart the countdown.
    fn iti_resets_on_poke(&self) -> bool {
        self.awaits_response()
    }
}

/// The protocol variants run on the rig.
#[derive(Copy, Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    /// Non-contingent deliveries on a shuffled schedule.
    #[default]
    Passive,
    /// Passive deliveries with a cue light held across delivery.
    PassiveCue,
    /// Poke, withdraw, then taste delivery.
    NosePoke,
    /// Poke, synchronized vacuum/odor, withdraw, then taste reward.
    OdorNosePoke,
    /// Poke, then one synchronized odor/taste/marker delivery.
    CuedMultimodal,
}

impl Protocol for ProtocolKind {
    fn awaits_response(&self) -> bool {
        matches!(self, Self::NosePoke | Self::OdorNosePoke | Self::CuedMultimodal)
    }

    fn awaits_withdrawal(&self) -> bool {
        matches!(self, Self::NosePoke | Self::OdorNosePoke)
    }

    fn synchronized_delivery(&self) -> bool {
        matches!(self, Self::OdorNosePoke | Self::CuedMultimodal)
    }

    fn has_reward(&self) -> bool {
        matches!(self, Self::OdorNosePoke)
    }

    fn iti_resets_on_poke(&self) -> bool {
        matches!(self, Self::NosePoke)
    }

    fn next(&self, state: TrialState) -> Option<TrialState> {
        use TrialState::*;
        Some(match (self, state) {
            (_, SessionEnd) => return None,
            (p, CueOn) if p.awaits_response() => AwaitResponse,
            (_, CueOn) => Delivery,
            (Self::NosePoke, AwaitResponse) => AwaitWithdrawal,
            (_, AwaitResponse) => Delivery,
            (Self::NosePoke, AwaitWithdrawal) => Delivery,
            (Self::OdorNosePoke, Delivery) => AwaitWithdrawal,
            (Self::OdorNosePoke, AwaitWithdrawal) => Reward,
            (_, AwaitWithdrawal) => Iti,
            (_, Delivery) | (_, Reward) => Iti,
            (_, Iti) => return None,
        })
    }
}

impl ProtocolKind {
    /// Full state sequence of one trial, starting at `CueOn`.
    pub fn trial_states(&self) -> Vec<TrialState> {
        let mut states = vec![TrialState::CueOn];
        let mut current = TrialState::CueOn;
        while let Some(next) = self.next(current) {
            states.push(next);
            current = next;
        }
        states
    }
}
