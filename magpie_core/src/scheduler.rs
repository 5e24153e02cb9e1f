use crate::corpus::Corpus;
use crate::coverage::EntryId;
use crate::input::Input;
use rand::Rng;
use rand_core::RngCore;
use thiserror::Error;

/// Default multiplier applied to an entry's energy when a selection of it
/// produced novel coverage or a crash.
pub const DEFAULT_REWARD_FACTOR: f64 = 2.0;
/// Default multiplier applied when a selection produced nothing.
pub const DEFAULT_DECAY_FACTOR: f64 = 0.95;

/// Errors that can occur during scheduler operations.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The corpus is empty, so there is nothing to schedule. The campaign
    /// guarantees at least one entry before workers start, so seeing this
    /// mid-run is an invariant violation.
    #[error("Corpus is empty, cannot schedule next input")]
    CorpusEmpty,
    /// Wraps an error originating from the corpus backend encountered
    /// during a scheduler operation.
    #[error("Corpus interaction failed within scheduler: {0}")]
    CorpusInteractionError(#[from] crate::corpus::CorpusError),
}

/// A `Scheduler` selects the next corpus entry to mutate.
///
/// Schedulers range from uniform random selection to feedback-driven
/// strategies that concentrate effort on entries whose mutations keep
/// finding new coverage.
pub trait Scheduler<I: Input>: Send + Sync {
    /// Selects and returns the id of the next entry to mutate.
    ///
    /// # Arguments
    /// * `corpus`: The corpus to select from. Mutable so schedulers can
    ///   touch per-entry scheduling state.
    /// * `rng`: Drives any randomness in the selection.
    ///
    /// # Returns
    /// The selected entry id, or `SchedulerError::CorpusEmpty` if there is
    /// nothing to select.
    fn next(
        &mut self,
        corpus: &mut dyn Corpus<I>,
        rng: &mut dyn RngCore,
    ) -> Result<EntryId, SchedulerError>;

    /// Reports how the last selection of `id` turned out.
    ///
    /// `productive` means the mutated candidate yielded novel coverage or a
    /// crash. Feedback-driven schedulers adjust the entry's weight here;
    /// others may ignore it.
    fn report(
        &mut self,
        corpus: &mut dyn Corpus<I>,
        id: &EntryId,
        productive: bool,
    ) -> Result<(), SchedulerError>;
}

/// A basic `Scheduler` that selects entries uniformly at random.
///
/// Ignores all feedback; every entry is equally likely on every draw.
#[derive(Default, Debug)]
pub struct RandomScheduler;

impl RandomScheduler {
    /// Creates a new `RandomScheduler`.
    pub fn new() -> Self {
        RandomScheduler
    }
}

impl<I: Input> Scheduler<I> for RandomScheduler {
    fn next(
        &mut self,
        corpus: &mut dyn Corpus<I>,
        rng: &mut dyn RngCore,
    ) -> Result<EntryId, SchedulerError> {
        if corpus.is_empty() {
            return Err(SchedulerError::CorpusEmpty);
        }
        let index = rng.random_range(0..corpus.len());
        Ok(corpus.list()[index])
    }

    fn report(
        &mut self,
        _corpus: &mut dyn Corpus<I>,
        _id: &EntryId,
        _productive: bool,
    ) -> Result<(), SchedulerError> {
        Ok(())
    }
}

/// Selects entries with probability proportional to their energy.
///
/// A productive selection multiplies the entry's energy by `reward_factor`;
/// an unproductive one multiplies it by `decay_factor`, so entries that
/// stopped yielding discoveries fade exponentially. The corpus floors
/// energy above zero, so even a fully decayed entry keeps a nonzero chance
/// of selection and can never starve.
///
/// The weighted draw walks entries in discovery order, so among entries of
/// equal energy the earliest-discovered one wins a boundary tie.
#[derive(Debug, Clone, Copy)]
pub struct WeightedEnergyScheduler {
    reward_factor: f64,
    decay_factor: f64,
}

impl WeightedEnergyScheduler {
    pub fn new(reward_factor: f64, decay_factor: f64) -> Self {
        WeightedEnergyScheduler {
            reward_factor: reward_factor.max(1.0),
            decay_factor: decay_factor.clamp(0.0, 1.0),
        }
    }
}

impl Default for WeightedEnergyScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_REWARD_FACTOR, DEFAULT_DECAY_FACTOR)
    }
}

impl<I: Input> Scheduler<I> for WeightedEnergyScheduler {
    fn next(
        &mut self,
        corpus: &mut dyn Corpus<I>,
        rng: &mut dyn RngCore,
    ) -> Result<EntryId, SchedulerError> {
        if corpus.is_empty() {
            return Err(SchedulerError::CorpusEmpty);
        }

        let ids: Vec<EntryId> = corpus.list().to_vec();
        let mut total = 0.0;
        for id in &ids {
            total += corpus.metadata(id)?.energy;
        }
        if total <= 0.0 {
            // Energies are floored above zero, so this cannot happen for a
            // non-empty corpus; fall back to the earliest entry.
            return Ok(ids[0]);
        }

        let mark = rng.random::<f64>() * total;
        let mut accumulated = 0.0;
        for id in &ids {
            accumulated += corpus.metadata(id)?.energy;
            if mark < accumulated {
                return Ok(*id);
            }
        }
        // Floating-point accumulation can land the mark just past the last
        // boundary.
        Ok(*ids.last().unwrap_or(&ids[0]))
    }

    fn report(
        &mut self,
        corpus: &mut dyn Corpus<I>,
        id: &EntryId,
        productive: bool,
    ) -> Result<(), SchedulerError> {
        let energy = if productive {
            corpus.reward_energy(id, self.reward_factor)?
        } else {
            corpus.decay_energy(id, self.decay_factor)?
        };
        log::trace!(
            "scheduler: entry {} {} to energy {:.6}",
            id,
            if productive { "rewarded" } else { "decayed" },
            energy
        );
        Ok(())
    }
}
