use anyhow::{Context, bail};

/// Default bound on delta-debugging passes.
pub const DEFAULT_MAX_ROUNDS: usize = 16;

/// Reduces a payload while preserving a caller-supplied property.
///
/// The property is a predicate such as "the target still crashes" or "the
/// run still covers these units"; re-executing the target to answer it is
/// the caller's business, so the minimizer stays free of executor wiring
/// and is trivially testable.
#[derive(Debug, Clone, Copy)]
pub struct Minimizer {
    max_rounds: usize,
}

impl Minimizer {
    pub fn new(max_rounds: usize) -> Self {
        Minimizer {
            max_rounds: max_rounds.max(1),
        }
    }

    /// Shrinks `payload` by iterative delta debugging.
    ///
    /// Contiguous chunks are removed starting at half the payload length;
    /// a removal is kept only when `predicate` still holds. A pass that
    /// removes nothing halves the chunk size; the search stops when a
    /// chunk-size-1 pass removes nothing or after `max_rounds` passes, so
    /// it terminates even on pathological inputs.
    ///
    /// The result is never longer than the input and always satisfies the
    /// predicate. A payload that does not satisfy the predicate on entry is
    /// an error, never a silent pass-through.
    pub fn minimize<P>(&self, payload: &[u8], mut predicate: P) -> anyhow::Result<Vec<u8>>
    where
        P: FnMut(&[u8]) -> anyhow::Result<bool>,
    {
        let holds = predicate(payload).context("minimizer: initial predicate check failed")?;
        if !holds {
            bail!("minimizer: input does not satisfy the predicate it should preserve");
        }

        let mut best = payload.to_vec();
        let mut chunk = best.len().max(1).div_ceil(2);
        let mut rounds = 0;

        while chunk > 0 && !best.is_empty() && rounds < self.max_rounds {
            rounds += 1;
            let mut removed_any = false;
            let mut at = 0usize;
            while at < best.len() {
                let end = (at + chunk).min(best.len());
                let mut trial = best.clone();
                trial.drain(at..end);
                if predicate(&trial).context("minimizer: predicate check failed")? {
                    best = trial;
                    removed_any = true;
                    // The window now holds fresh bytes; retry at the same
                    // offset.
                } else {
                    at = end;
                }
            }

            if !removed_any {
                if chunk == 1 {
                    break;
                }
                chunk = chunk / 2;
            }
        }

        log::debug!(
            "minimizer: {} -> {} bytes in {} pass(es)",
            payload.len(),
            best.len(),
            rounds
        );
        Ok(best)
    }
}

impl Default for Minimizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ROUNDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_everything_the_predicate_does_not_need() {
        let minimizer = Minimizer::default();
        let payload: Vec<u8> = b"aaaaaaaaaaaaaaaaXbbbbbbbbbbbbbbbb".to_vec();
        let result = minimizer
            .minimize(&payload, |bytes| Ok(bytes.contains(&b'X')))
            .unwrap();
        assert_eq!(result, b"X".to_vec());
    }

    #[test]
    fn always_true_predicate_minimizes_to_empty() {
        let minimizer = Minimizer::default();
        let payload = vec![0u8; 64];
        let result = minimizer.minimize(&payload, |_| Ok(true)).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn result_never_longer_and_still_satisfies_predicate() {
        let minimizer = Minimizer::default();
        // Property: payload still contains the subsequence "ab".
        let holds = |bytes: &[u8]| {
            Ok(bytes.windows(2).any(|w| w == b"ab"))
        };
        let payload: Vec<u8> = b"zzzabzzzzabzz".to_vec();
        let result = minimizer.minimize(&payload, holds).unwrap();
        assert!(result.len() <= payload.len());
        assert!(holds(&result).unwrap());
    }

    #[test]
    fn unsatisfied_input_is_an_error() {
        let minimizer = Minimizer::default();
        let err = minimizer
            .minimize(b"no marker here", |bytes| Ok(bytes.contains(&b'X')))
            .unwrap_err();
        assert!(err.to_string().contains("does not satisfy"));
    }

    #[test]
    fn predicate_errors_propagate() {
        let minimizer = Minimizer::default();
        let result = minimizer.minimize(b"abc", |_| bail!("target vanished"));
        assert!(result.is_err());
    }

    #[test]
    fn round_bound_limits_predicate_evaluations() {
        let bounded = Minimizer::new(1);
        let mut calls = 0u32;
        let payload = vec![7u8; 1024];
        let result = bounded
            .minimize(&payload, |bytes| {
                calls += 1;
                // Only exact halving steps succeed, forcing many fruitless
                // probes per pass.
                Ok(bytes.len() >= 512)
            })
            .unwrap();
        assert!(result.len() >= 512);
        assert!(result.len() <= payload.len());
        // One pass over a 1024-byte payload with 512-byte chunks probes a
        // handful of windows, nowhere near the unbounded search.
        assert!(calls < 32, "bounded minimization ran {calls} probes");
    }

    #[test]
    fn single_byte_payloads_are_handled() {
        let minimizer = Minimizer::default();
        let kept = minimizer
            .minimize(&[b'X'], |bytes| Ok(bytes.contains(&b'X')))
            .unwrap();
        assert_eq!(kept, vec![b'X']);

        let dropped = minimizer.minimize(&[b'X'], |_| Ok(true)).unwrap();
        assert!(dropped.is_empty());
    }
}
