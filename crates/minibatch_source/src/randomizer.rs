//! Pluggable sequence-order randomization policy.
//!
//! Randomization operates on whole sequences within one pulled window;
//! it never reorders elements inside a sequence. The policy is a seam:
//! callers with their own shuffling scheme implement
//! [`SequenceRandomizer`] and hand it to the source.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Decides the batch-row order of the sequences in one pulled window.
pub trait SequenceRandomizer: Send {
    /// Returns a permutation of `0..num_sequences`: position `i` of the
    /// result is the window slot placed at batch row `i`.
    fn order(&mut self, num_sequences: usize) -> Vec<usize>;
}

/// Identity policy: batch rows follow first-observation order. Used when
/// `randomize = false`; the basis of deterministic testing.
#[derive(Debug, Default)]
pub struct NoRandomizer;

impl SequenceRandomizer for NoRandomizer {
    fn order(&mut self, num_sequences: usize) -> Vec<usize> {
        (0..num_sequences).collect()
    }
}

/// Seeded shuffle of whole sequences within the pulled window.
#[derive(Debug)]
pub struct WindowRandomizer {
    rng: StdRng,
}

impl WindowRandomizer {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl SequenceRandomizer for WindowRandomizer {
    fn order(&mut self, num_sequences: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..num_sequences).collect();
        order.shuffle(&mut self.rng);
        order
    }
}
