//! Seeded random streams
//!
//! Every probabilistic decision in a simulation draws from one generator that
//! is handed to the engine at construction time, so identically seeded runs
//! replay identically.

use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Random stream shared by all components of one simulation
pub type SimRng = StdRng;

/// Build a generator from a seed
pub fn seeded(seed: u64) -> SimRng {
    StdRng::seed_from_u64(seed)
}

/// One uniform draw in `[0, 1)`
pub fn uniform(rng: &mut SimRng) -> f64 {
    rng.sample(Standard)
}

/// Yields `seed + 1, seed + 2, ...`
///
/// Used to derive independent generators for several simulations living in
/// the same process without any shared global state.
#[derive(Debug, Clone)]
pub struct SeedSequence {
    seed: u64,
}

impl SeedSequence {
    pub fn new(seed: u64) -> Self {
        SeedSequence { seed }
    }

    /// Generator for the next seed in the sequence
    pub fn next_rng(&mut self) -> SimRng {
        self.seed = self.seed.wrapping_add(1);
        seeded(self.seed)
    }
}

impl Iterator for SeedSequence {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        self.seed = self.seed.wrapping_add(1);
        Some(self.seed)
    }
}
