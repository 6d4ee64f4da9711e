//! Bounded-output selection across repeated captures.
//!
//! When a client caps the number of records below the live population, each
//! capture has to pick which tasks to return. Truncating the same prefix
//! every time would starve the tail, so two strategies are offered.
//!
//! # Rotating offset (default)
//!
//! A cursor advances by the number of records returned, modulo the
//! population. Each capture returns positions `(offset + i) % population`
//! for `i` in `0..cap`. Against a stable population of size `P > C`, two
//! consecutive captures start at different positions, and `ceil(P / C)`
//! captures cover every task.
//!
//! # Uniform random
//!
//! The whole matching population is captured and a uniformly random
//! `cap`-subset is kept, in population order. Every task has probability
//! `C / P` of appearing in each capture, with no coverage guarantee across
//! calls.

use rand::Rng;
use serde::{Deserialize, Serialize};

// =============================================================================
// Strategy
// =============================================================================

/// How a capped capture chooses which tasks to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// Deterministic rotating window.
    #[default]
    RotatingOffset,
    /// Random subset of the full population.
    UniformRandom,
}

// =============================================================================
// Rotating window
// =============================================================================

/// Positions of a rotating window of at most `take` items over a population
/// of `population`, starting at `offset % population`.
pub fn rotating_positions(
    offset: u64,
    population: usize,
    take: usize,
) -> impl Iterator<Item = usize> {
    let take = take.min(population);
    let start = if population == 0 {
        0
    } else {
        (offset % population as u64) as usize
    };
    (0..take).map(move |i| (start + i) % population)
}

/// Rotating offset state owned by one capturer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    offset: u64,
}

impl Cursor {
    /// Cursor at position zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current offset.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Move past `returned` records of a population of `population`.
    ///
    /// An empty population resets the cursor.
    pub fn advance(&mut self, returned: usize, population: usize) {
        if population == 0 {
            self.offset = 0;
            return;
        }
        let population = population as u64;
        self.offset = (self.offset % population + returned as u64 % population) % population;
    }
}

// =============================================================================
// Uniform random subset
// =============================================================================

/// Keep a uniformly random subset of at most `cap` items, preserving order.
///
/// A `cap` of zero keeps everything.
pub fn random_subset<T, R: Rng + ?Sized>(items: Vec<T>, cap: usize, rng: &mut R) -> Vec<T> {
    if cap == 0 || items.len() <= cap {
        return items;
    }
    let mut keep = vec![false; items.len()];
    for index in rand::seq::index::sample(rng, items.len(), cap).into_vec() {
        keep[index] = true;
    }
    items
        .into_iter()
        .zip(keep)
        .filter_map(|(item, kept)| kept.then_some(item))
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;

    #[test]
    fn window_wraps_around() {
        let positions: Vec<usize> = rotating_positions(8, 10, 4).collect();
        assert_eq!(positions, vec![8, 9, 0, 1]);
    }

    #[test]
    fn window_never_exceeds_population() {
        let positions: Vec<usize> = rotating_positions(3, 4, 10).collect();
        assert_eq!(positions, vec![3, 0, 1, 2]);
        assert_eq!(rotating_positions(5, 0, 10).count(), 0);
    }

    #[test]
    fn cursor_advances_modulo_population() {
        let mut cursor = Cursor::new();
        cursor.advance(4, 10);
        assert_eq!(cursor.offset(), 4);
        cursor.advance(4, 10);
        assert_eq!(cursor.offset(), 8);
        cursor.advance(4, 10);
        assert_eq!(cursor.offset(), 2);
        cursor.advance(3, 0);
        assert_eq!(cursor.offset(), 0);
    }

    #[test]
    fn ceil_p_over_c_windows_cover_everything() {
        let population: usize = 23;
        let cap = 5;
        let mut cursor = Cursor::new();
        let mut seen = HashSet::new();
        for _ in 0..population.div_ceil(cap) {
            let window: Vec<usize> = rotating_positions(cursor.offset(), population, cap).collect();
            cursor.advance(window.len(), population);
            seen.extend(window);
        }
        assert_eq!(seen.len(), population);
    }

    #[test]
    fn consecutive_windows_differ() {
        let mut cursor = Cursor::new();
        let first: Vec<usize> = rotating_positions(cursor.offset(), 10, 3).collect();
        cursor.advance(first.len(), 10);
        let second: Vec<usize> = rotating_positions(cursor.offset(), 10, 3).collect();
        assert_ne!(first, second);
    }

    #[test]
    fn random_subset_keeps_cap_in_order() {
        let mut rng = StdRng::seed_from_u64(7);
        let items: Vec<u32> = (0..100).collect();
        let kept = random_subset(items, 10, &mut rng);
        assert_eq!(kept.len(), 10);
        assert!(kept.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn random_subset_small_input_untouched() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(random_subset(vec![1, 2, 3], 10, &mut rng), vec![1, 2, 3]);
        assert_eq!(random_subset(vec![1, 2, 3], 0, &mut rng), vec![1, 2, 3]);
    }

    #[test]
    fn random_subset_is_seed_deterministic() {
        let items: Vec<u32> = (0..50).collect();
        let a = random_subset(items.clone(), 5, &mut StdRng::seed_from_u64(42));
        let b = random_subset(items, 5, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn random_subset_is_roughly_uniform() {
        let n = 20;
        let k = 5;
        let trials = 20_000u64;
        let mut counts = vec![0u64; n];
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..trials {
            for item in random_subset((0..n).collect(), k, &mut rng) {
                counts[item] += 1;
            }
        }
        let expected = trials as f64 * k as f64 / n as f64;
        for (i, &c) in counts.iter().enumerate() {
            let ratio = c as f64 / expected;
            assert!(ratio > 0.9 && ratio < 1.1, "item {i}: count={c}, ratio={ratio}");
        }
    }

    #[test]
    fn strategy_serde_is_snake_case() {
        let json = serde_json::to_string(&SamplingStrategy::UniformRandom).unwrap();
        assert_eq!(json, "\"uniform_random\"");
        assert_eq!(SamplingStrategy::default(), SamplingStrategy::RotatingOffset);
    }
}
