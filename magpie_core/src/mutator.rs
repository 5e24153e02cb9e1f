use crate::input::Input;
use rand::Rng;
use rand_core::RngCore;

/// Default cap on candidate payload size, in bytes.
pub const DEFAULT_MAX_INPUT_LEN: usize = 4096;

/// Most bytes a single length-changing edit will insert.
const MAX_INSERT_LEN: usize = 16;

/// A `Mutator` transforms an entry's payload into a new candidate payload.
///
/// Mutators are the engine that turns retained corpus entries into fresh
/// test cases. A mutator must be a pure function of its arguments and the
/// RNG state: replaying the same base payload, splice partner, and seeded
/// RNG reproduces the same candidate byte-for-byte, which is what makes a
/// fuzzing session replayable.
///
/// # Type Parameters
/// * `I`: The payload type this mutator operates on.
pub trait Mutator<I: Input>: Send {
    /// Derives a new candidate payload.
    ///
    /// # Arguments
    /// * `base`: The payload to mutate. `None` means start from scratch.
    /// * `rng`: The (caller-seeded) random number generator driving every
    ///   decision this call makes.
    /// * `splice_partner`: A second corpus payload for crossover-style
    ///   strategies. Mutators that never splice may ignore it.
    ///
    /// # Returns
    /// `Ok(candidate)` with the derived payload, or an error if the
    /// mutation could not be performed.
    fn mutate(
        &mut self,
        base: Option<&I>,
        rng: &mut dyn RngCore,
        splice_partner: Option<&I>,
    ) -> Result<I, anyhow::Error>;
}

/// The classic havoc repertoire: each call rolls one strategy at random.
///
/// * bit flip: XOR one random bit of one random byte;
/// * byte nudge: add a small random value (1-15) to one byte, wrapping;
/// * splice: prefix of the base payload glued to a suffix of the partner;
/// * length change: insert a short random run, or delete a random window.
///
/// Candidates longer than `max_input_len` are truncated, never dropped, so
/// the length bound cannot starve the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct HavocMutator {
    max_input_len: usize,
}

impl HavocMutator {
    pub fn new(max_input_len: usize) -> Self {
        HavocMutator {
            max_input_len: max_input_len.max(1),
        }
    }

    fn flip_bit(bytes: &mut [u8], rng: &mut dyn RngCore) {
        let index = rng.random_range(0..bytes.len());
        let bit = rng.random_range(0..8u32);
        bytes[index] ^= 1 << bit;
    }

    fn nudge_byte(bytes: &mut [u8], rng: &mut dyn RngCore) {
        let delta = rng.random_range(1u8..=15u8);
        let index = rng.random_range(0..bytes.len());
        bytes[index] = bytes[index].wrapping_add(delta);
    }

    fn splice(bytes: &mut Vec<u8>, partner: &[u8], rng: &mut dyn RngCore) {
        // `random_range` with `..=` includes the bound, so a cut may keep
        // all of the base or take all of the partner.
        let cut_base = rng.random_range(0..=bytes.len());
        let cut_partner = rng.random_range(0..=partner.len());
        bytes.truncate(cut_base);
        bytes.extend_from_slice(&partner[cut_partner..]);
    }

    fn change_length(bytes: &mut Vec<u8>, rng: &mut dyn RngCore) {
        if bytes.len() > 1 && rng.random_bool(0.5) {
            let start = rng.random_range(0..bytes.len());
            let window = rng.random_range(1..=bytes.len() - start);
            bytes.drain(start..start + window);
        } else {
            let count = rng.random_range(1..=MAX_INSERT_LEN);
            let at = rng.random_range(0..=bytes.len());
            let mut run = vec![0u8; count];
            rng.fill_bytes(&mut run);
            let tail = bytes.split_off(at);
            bytes.extend_from_slice(&run);
            bytes.extend_from_slice(&tail);
        }
    }
}

impl Default for HavocMutator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INPUT_LEN)
    }
}

impl<I> Mutator<I> for HavocMutator
where
    I: Input + From<Vec<u8>>,
    Vec<u8>: From<I>,
{
    fn mutate(
        &mut self,
        base: Option<&I>,
        rng: &mut dyn RngCore,
        splice_partner: Option<&I>,
    ) -> Result<I, anyhow::Error> {
        let base_input: I = match base {
            Some(input) => input.clone(),
            None => I::from(vec![0u8; 1]),
        };
        let mut bytes = Vec::from(base_input);
        if bytes.is_empty() {
            bytes.push(0);
        }

        match rng.random_range(0..4u32) {
            0 => Self::flip_bit(&mut bytes, rng),
            1 => Self::nudge_byte(&mut bytes, rng),
            2 => match splice_partner {
                Some(partner) if !partner.is_empty() => {
                    Self::splice(&mut bytes, partner.as_bytes(), rng)
                }
                _ => Self::flip_bit(&mut bytes, rng),
            },
            _ => Self::change_length(&mut bytes, rng),
        }

        if bytes.is_empty() {
            bytes.push(0);
        }
        if bytes.len() > self.max_input_len {
            bytes.truncate(self.max_input_len);
        }
        Ok(I::from(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    #[test]
    fn identical_seed_reproduces_identical_candidates() {
        let mut mutator = HavocMutator::default();
        let base: Vec<u8> = b"deterministic base payload".to_vec();
        let partner: Vec<u8> = b"partner material".to_vec();

        for seed in 0..20u8 {
            let mut rng_a = ChaCha8Rng::from_seed([seed; 32]);
            let mut rng_b = ChaCha8Rng::from_seed([seed; 32]);
            let out_a = mutator
                .mutate(Some(&base), &mut rng_a, Some(&partner))
                .unwrap();
            let out_b = mutator
                .mutate(Some(&base), &mut rng_b, Some(&partner))
                .unwrap();
            assert_eq!(out_a, out_b, "seed {seed} produced diverging candidates");
        }
    }

    #[test]
    fn mutation_changes_the_payload() {
        let mut mutator = HavocMutator::default();
        let mut rng = ChaCha8Rng::from_seed([0u8; 32]);
        let base: Vec<u8> = vec![10, 20, 30, 40];

        let mut changed = 0;
        for _ in 0..50 {
            let candidate = mutator.mutate(Some(&base), &mut rng, None).unwrap();
            if candidate != base {
                changed += 1;
            }
        }
        assert!(changed > 0, "no mutation altered the payload in 50 rounds");
    }

    #[test]
    fn handles_empty_and_none_input() {
        let mut mutator = HavocMutator::default();
        let mut rng = ChaCha8Rng::from_seed([1u8; 32]);

        let from_empty: Vec<u8> = mutator.mutate(Some(&vec![]), &mut rng, None).unwrap();
        assert!(!from_empty.is_empty());

        let from_none: Vec<u8> = mutator.mutate(None, &mut rng, None).unwrap();
        assert!(!from_none.is_empty());
    }

    #[test]
    fn candidates_never_exceed_the_size_cap() {
        let mut mutator = HavocMutator::new(8);
        let mut rng = ChaCha8Rng::from_seed([2u8; 32]);
        let base: Vec<u8> = vec![0xAA; 8];
        let partner: Vec<u8> = vec![0xBB; 64];

        for _ in 0..200 {
            let candidate = mutator
                .mutate(Some(&base), &mut rng, Some(&partner))
                .unwrap();
            assert!(candidate.len() <= 8, "cap violated: {}", candidate.len());
            assert!(!candidate.is_empty());
        }
    }

    #[test]
    fn splice_mixes_in_partner_bytes() {
        let mut mutator = HavocMutator::default();
        let mut rng = ChaCha8Rng::from_seed([3u8; 32]);
        let base: Vec<u8> = vec![0x00; 16];
        let partner: Vec<u8> = vec![b'Z'; 16];

        let mut saw_partner_bytes = false;
        for _ in 0..200 {
            let candidate = mutator
                .mutate(Some(&base), &mut rng, Some(&partner))
                .unwrap();
            if candidate.contains(&b'Z') {
                saw_partner_bytes = true;
                break;
            }
        }
        assert!(saw_partner_bytes, "splice never pulled partner material");
    }

    #[test]
    fn length_changing_edits_occur() {
        let mut mutator = HavocMutator::default();
        let mut rng = ChaCha8Rng::from_seed([4u8; 32]);
        let base: Vec<u8> = vec![1, 2, 3, 4, 5, 6, 7, 8];

        let mut saw_length_change = false;
        for _ in 0..200 {
            let candidate = mutator.mutate(Some(&base), &mut rng, None).unwrap();
            if candidate.len() != base.len() {
                saw_length_change = true;
                break;
            }
        }
        assert!(saw_length_change, "no length-changing edit in 200 rounds");
    }
}
