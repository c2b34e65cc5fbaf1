//! Pluggable randomness.
//!
//! Allocation, instance naming and chaos selection all draw through
//! [`RandomSource`] so tests can script the draws.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A source of uniform draws.
pub trait RandomSource: Send {
    /// Uniform value in `0..bound`. `bound` is never zero.
    fn below(&mut self, bound: u64) -> u64;
}

/// `rand`-backed source used outside of tests.
pub struct StdRandom {
    rng: StdRng,
}

impl StdRandom {
    /// Seeded from the operating system.
    pub fn from_os() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Deterministic source for reproducible runs.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl RandomSource for StdRandom {
    fn below(&mut self, bound: u64) -> u64 {
        self.rng.random_range(0..bound)
    }
}

/// Replays a fixed sequence of draws, each reduced modulo the bound.
///
/// Once the script runs out it keeps returning zero.
#[derive(Debug, Default, Clone)]
pub struct ScriptedRandom {
    draws: VecDeque<u64>,
}

impl ScriptedRandom {
    pub fn new(draws: impl IntoIterator<Item = u64>) -> Self {
        Self {
            draws: draws.into_iter().collect(),
        }
    }
}

impl RandomSource for ScriptedRandom {
    fn below(&mut self, bound: u64) -> u64 {
        self.draws.pop_front().unwrap_or(0) % bound
    }
}

/// Pick an index into a collection of `len` items.
pub fn choose_index(rng: &mut dyn RandomSource, len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    Some(rng.below(len as u64) as usize)
}

/// Draw `k` items uniformly without replacement (partial Fisher-Yates).
pub fn sample_without_replacement<T: Clone>(
    rng: &mut dyn RandomSource,
    items: &[T],
    k: usize,
) -> Vec<T> {
    let mut pool: Vec<T> = items.to_vec();
    let k = k.min(pool.len());
    for i in 0..k {
        let j = i + rng.below((pool.len() - i) as u64) as usize;
        pool.swap(i, j);
    }
    pool.truncate(k);
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_draws_wrap_to_bound() {
        let mut rng = ScriptedRandom::new([7, 3]);
        assert_eq!(rng.below(5), 2);
        assert_eq!(rng.below(5), 3);
        assert_eq!(rng.below(5), 0);
    }

    #[test]
    fn sample_returns_distinct_items() {
        let mut rng = StdRandom::seeded(42);
        let items: Vec<u32> = (0..20).collect();
        let mut picked = sample_without_replacement(&mut rng, &items, 8);
        assert_eq!(picked.len(), 8);
        picked.sort();
        picked.dedup();
        assert_eq!(picked.len(), 8);
    }

    #[test]
    fn sample_caps_at_population() {
        let mut rng = StdRandom::seeded(1);
        let picked = sample_without_replacement(&mut rng, &["a", "b"], 5);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn choose_index_on_empty_is_none() {
        let mut rng = ScriptedRandom::default();
        assert_eq!(choose_index(&mut rng, 0), None);
        assert_eq!(choose_index(&mut rng, 3), Some(0));
    }
}
