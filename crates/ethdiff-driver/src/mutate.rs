//! Per-byte probabilistic mutation engine.
//!
//! Each input byte independently draws one `[0, 1)` variate from a
//! generator seeded for the iteration and looks it up in a cumulative
//! prefix array over the mutation table. The table itself is fixed for
//! the life of the process; mutation is a pure function of
//! `(input, seed)`, so any produced input can be regenerated from its
//! seed alone.

use crate::rng::Lcg64;
use rand::Rng;

/// The edits a single byte can undergo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    /// Emit one fresh random byte instead of the current one.
    Replace,
    /// Emit one fresh random byte, then the current one.
    AddBefore,
    /// Emit the current byte, then one fresh random byte.
    AddAfter,
    /// Emit nothing.
    Delete,
}

/// Per-mutation probabilities. The remaining mass (0.987) leaves the
/// byte untouched. The exact values are part of the replay contract.
pub const MUTATION_TABLE: [(Mutation, f64); 4] = [
    (Mutation::Replace, 0.01),
    (Mutation::AddBefore, 0.001),
    (Mutation::AddAfter, 0.001),
    (Mutation::Delete, 0.001),
];

/// Mutation engine holding the prefix-sum form of [`MUTATION_TABLE`].
///
/// Built once at startup and threaded to the dispatch loop; the table
/// is not process-global state.
#[derive(Debug, Clone)]
pub struct Mutator {
    /// Cumulative probability thresholds, in table order.
    prefix: Vec<(f64, Mutation)>,
}

impl Mutator {
    /// Build the cumulative prefix array over [`MUTATION_TABLE`].
    pub fn new() -> Self {
        let mut cumulative = 0.0;
        let mut prefix = Vec::with_capacity(MUTATION_TABLE.len());
        for (mutation, probability) in MUTATION_TABLE {
            if probability > 0.0 {
                cumulative += probability;
                prefix.push((cumulative, mutation));
            }
        }
        Self { prefix }
    }

    /// Find the mutation whose cumulative threshold covers `roll`, if
    /// any. Rolls beyond the total mutation mass leave the byte alone.
    fn lookup(&self, roll: f64) -> Option<Mutation> {
        let idx = self.prefix.partition_point(|&(cumulative, _)| cumulative < roll);
        self.prefix.get(idx).map(|&(_, mutation)| mutation)
    }

    /// Mutate `input` under the generator seeded with `seed`.
    ///
    /// The output length lies in `[0, 2 * input.len()]`: every byte can
    /// at most be accompanied by one inserted byte, or deleted.
    pub fn mutate(&self, input: &[u8], seed: u64) -> Vec<u8> {
        let mut rng = Lcg64::new(seed);
        let mut out = Vec::with_capacity(input.len() + input.len() / 64 + 1);
        for &byte in input {
            let roll: f64 = rng.gen();
            match self.lookup(roll) {
                Some(Mutation::Replace) => out.push(rng.gen::<u8>()),
                Some(Mutation::AddBefore) => {
                    let fresh: u8 = rng.gen();
                    out.push(fresh);
                    out.push(byte);
                }
                Some(Mutation::AddAfter) => {
                    let fresh: u8 = rng.gen();
                    out.push(byte);
                    out.push(fresh);
                }
                Some(Mutation::Delete) => {}
                None => out.push(byte),
            }
        }
        out
    }
}

impl Default for Mutator {
    fn default() -> Self {
        Self::new()
    }
}
