use rand::Rng;
use rand::seq::SliceRandom;
use rig_core::{RigError, RigResult};

/// Randomized order of stimulus presentations for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialPlan {
    order: Vec<usize>,
    stimuli: usize,
    repeats: usize,
}

impl TrialPlan {
    /// Each of `stimuli` indices appears exactly `repeats` times, in a full
    /// Fisher–Yates permutation drawn from `rng`.
    pub fn generate<R: Rng + ?Sized>(stimuli: usize, repeats: usize, rng: &mut R) -> RigResult<Self> {
        if stimuli < 1 {
            return Err(RigError::config("trial plan needs at least one stimulus"));
        }
        if repeats < 1 {
            return Err(RigError::config("trial plan needs at least one repeat per stimulus"));
        }
        let mut order: Vec<usize> = (0..repeats).flat_map(|_| 0..stimuli).collect();
        order.shuffle(rng);
        Ok(Self {
            order,
            stimuli,
            repeats,
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, trial: usize) -> Option<usize> {
        self.order.get(trial).copied()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.order.iter().copied()
    }

    /// Occurrences of each stimulus index.
    pub fn counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.stimuli];
        for &s in &self.order {
            counts[s] += 1;
        }
        counts
    }

    /// Re-checks length and per-stimulus counts before a session starts.
    pub fn verify(&self) -> RigResult<()> {
        if self.order.len() != self.stimuli * self.repeats {
            return Err(RigError::config(format!(
                "trial plan has {} entries, expected {}",
                self.order.len(),
                self.stimuli * self.repeats
            )));
        }
        if let Some((idx, n)) = self
            .counts()
            .into_iter()
            .enumerate()
            .find(|&(_, n)| n != self.repeats)
        {
            return Err(RigError::config(format!(
                "stimulus {idx} appears {n} times, expected {}",
                self.repeats
            )));
        }
        Ok(())
    }
}
