//! Seeded randomness for design construction, resampling and tie-breaking.
//!
//! Every caller threads an explicit `StdRng` (or a seed it derives one from);
//! there is no process-wide generator, so a fixed seed always reproduces the
//! same blocks, shuffles and bootstrap draws.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Default seed shared by configuration defaults.
pub const DEFAULT_SEED: u64 = 1337;

pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Seed for the `index`-th derived stream (per-set shuffles, per-sample refits).
pub fn offset_seed(base: u64, index: usize) -> u64 {
    base.wrapping_add(index as u64)
}

/// Decorrelated seed for parallel stream `index` (SplitMix64 finalizer over a
/// golden-ratio counter).
pub fn stream_seed(base: u64, index: usize) -> u64 {
    let mut z = base.wrapping_add((index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15));
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Shuffle a copy of `items` with a generator seeded from `seed`.
pub fn shuffled_with_seed<T: Clone>(items: &[T], seed: u64) -> Vec<T> {
    let mut out = items.to_vec();
    out.shuffle(&mut seeded(seed));
    out
}

/// Uniform pick among tied candidates. `None` only for an empty slice.
pub fn pick_tied<T: Copy>(rng: &mut StdRng, tied: &[T]) -> Option<T> {
    match tied.len() {
        0 => None,
        1 => Some(tied[0]),
        n => Some(tied[rng.gen_range(0..n)]),
    }
}
