//! Deterministic random number generation for synthetic source data.
//!
//! RULE: Scenario generation never touches a platform RNG.
//! All randomness flows through ScenarioRng streams derived from one
//! master seed, so a (seed, ref count) pair always yields the same files.
//!
//! Each concern gets its own stream, seeded from (master_seed XOR stream index).
//! Adding a stream never shifts the values an existing stream produces.

use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;

pub struct ScenarioRng {
    pub stream: ScenarioStream,
    inner: Pcg64Mcg,
}

impl ScenarioRng {
    pub fn new(master_seed: u64, stream: ScenarioStream) -> Self {
        let derived_seed = master_seed ^ (stream as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        Self {
            stream,
            inner: Pcg64Mcg::seed_from_u64(derived_seed),
        }
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Roll a u64 in [0, n). Returns 0 when `n` is 0.
    pub fn next_u64_below(&mut self, n: u64) -> u64 {
        if n == 0 {
            return 0;
        }
        self.inner.next_u64() % n
    }

    /// Bernoulli trial: returns true with probability p.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// Uniform amount in [lo, hi), rounded to cents.
    pub fn amount(&mut self, lo: f64, hi: f64) -> f64 {
        crate::types::round2(lo + (hi - lo) * self.next_f64())
    }

    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        let idx = self.next_u64_below(items.len() as u64) as usize;
        items.get(idx)
    }
}

/// Stable stream assignments.
/// NEVER reorder or remove entries; only append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum ScenarioStream {
    Rows = 0,
    Faults = 1,
}
