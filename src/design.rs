//! Near-balanced incomplete block designs (near-BIBD).
//!
//! Blocks are built greedily: each block starts from the least-exposed item
//! and grows by the candidate with the fewest appearances, then the lowest
//! maximum co-occurrence with the block so far, then the lowest summed
//! co-occurrence. A randomized swap search afterwards accepts only strictly
//! improving exchanges against
//!
//! ```text
//! 1_000_000 * range(item counts) + 10_000 * range(observed pair counts) + SSD(pair counts)
//! ```
//!
//! so item balance dominates, then pair balance, then pair variance.
//!
//! Extension seeds the tallies from existing blocks and only builds (and
//! only swaps within) the new blocks; earlier blocks are never touched.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::rng::{pick_tied, seeded, DEFAULT_SEED};

const ITEM_RANGE_WEIGHT: f64 = 1_000_000.0;
const PAIR_RANGE_WEIGHT: f64 = 10_000.0;

// ---------------------------------------------------------------------
//  Parameters
// ---------------------------------------------------------------------

/// How blocks are constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesignMode {
    /// Shuffle-and-chunk rounds, no balancing search.
    Legacy,
    /// Greedy balanced construction plus swap improvement.
    #[default]
    NearBibd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DesignParams {
    /// Items per block (k). Values below 2 yield an empty design.
    pub block_size: usize,
    /// Target appearances per item (r).
    pub appearances: usize,
    pub seed: u64,
    /// Randomized swap attempts after greedy construction.
    pub improvement_iterations: usize,
    pub mode: DesignMode,
}

impl Default for DesignParams {
    fn default() -> Self {
        Self {
            block_size: 3,
            appearances: 4,
            seed: DEFAULT_SEED,
            improvement_iterations: 2_000,
            mode: DesignMode::NearBibd,
        }
    }
}

// ---------------------------------------------------------------------
//  Data model
// ---------------------------------------------------------------------

/// A fixed-size unordered set of item ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignBlock {
    pub id: usize,
    pub items: Vec<String>,
    /// Id of the block this one repeats (test-retest task).
    #[serde(default)]
    pub repeat_of: Option<usize>,
}

impl DesignBlock {
    pub fn is_repeat(&self) -> bool {
        self.repeat_of.is_some()
    }

    pub fn contains(&self, item: &str) -> bool {
        self.items.iter().any(|i| i == item)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairCount {
    pub a: String,
    pub b: String,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SummaryStats {
    pub min: f64,
    pub mean: f64,
    pub max: f64,
    /// Coefficient of variation (population std / mean), 0 when mean is 0.
    pub cv: f64,
}

impl SummaryStats {
    pub fn from_counts(counts: &[usize]) -> Self {
        if counts.is_empty() {
            return Self::default();
        }
        let n = counts.len() as f64;
        let mean = counts.iter().sum::<usize>() as f64 / n;
        let var = counts
            .iter()
            .map(|&c| {
                let d = c as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        let min = counts.iter().copied().min().unwrap_or(0) as f64;
        let max = counts.iter().copied().max().unwrap_or(0) as f64;
        let cv = if mean > 0.0 { var.sqrt() / mean } else { 0.0 };
        Self { min, mean, max, cv }
    }
}

/// Exact-BIBD parameters observed in a design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BibdCheck {
    pub v: usize,
    pub b: usize,
    pub k: usize,
    /// Common replication, when every item appears equally often.
    pub r: Option<usize>,
    /// Common concurrence, when every pair co-occurs equally often.
    pub lambda: Option<usize>,
    pub is_exact: bool,
}

/// `b·k = v·r` and `λ·(v−1) = r·(k−1)`.
pub fn bibd_parameters_hold(v: usize, b: usize, r: usize, k: usize, lambda: usize) -> bool {
    v >= 2 && k >= 2 && b > 0 && b * k == v * r && lambda * (v - 1) == r * (k - 1)
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DesignDiagnostics {
    pub item_counts: BTreeMap<String, usize>,
    /// Pairs that co-occur at least once.
    pub pair_counts: Vec<PairCount>,
    pub item_stats: SummaryStats,
    /// Over all possible pairs, including never-observed ones.
    pub pair_stats: SummaryStats,
    /// Fraction of all possible pairs observed in at least one block.
    pub coverage: f64,
    pub objective: f64,
    pub bibd: BibdCheck,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Design {
    pub blocks: Vec<DesignBlock>,
    pub diagnostics: DesignDiagnostics,
    /// Objective right after greedy construction, before swap improvement.
    pub greedy_objective: f64,
}

// ---------------------------------------------------------------------
//  Tallies
// ---------------------------------------------------------------------

/// Appearance and co-occurrence counts over an indexed item universe.
#[derive(Debug, Clone)]
struct Tally {
    n: usize,
    counts: Vec<usize>,
    pairs: Vec<usize>,
}

impl Tally {
    fn new(n: usize) -> Self {
        Self {
            n,
            counts: vec![0; n],
            pairs: vec![0; n * n],
        }
    }

    fn pair(&self, a: usize, b: usize) -> usize {
        self.pairs[a * self.n + b]
    }

    fn bump_pair(&mut self, a: usize, b: usize, add: bool) {
        for idx in [a * self.n + b, b * self.n + a] {
            if add {
                self.pairs[idx] += 1;
            } else {
                self.pairs[idx] = self.pairs[idx].saturating_sub(1);
            }
        }
    }

    fn add_block(&mut self, block: &[usize]) {
        for (pos, &a) in block.iter().enumerate() {
            self.counts[a] += 1;
            for &b in &block[pos + 1..] {
                self.bump_pair(a, b, true);
            }
        }
    }

    /// Replace `out` by `inn` inside `block` (pair counts only; item counts
    /// are handled by the caller since a swap between blocks preserves them).
    fn exchange(&mut self, block: &[usize], out: usize, inn: usize) {
        for &m in block {
            if m == out || m == inn {
                continue;
            }
            self.bump_pair(out, m, false);
            self.bump_pair(inn, m, true);
        }
    }

    fn upper_pairs(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.n * self.n.saturating_sub(1) / 2);
        for a in 0..self.n {
            for b in (a + 1)..self.n {
                out.push(self.pair(a, b));
            }
        }
        out
    }

    fn objective(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        let c_min = self.counts.iter().copied().min().unwrap_or(0);
        let c_max = self.counts.iter().copied().max().unwrap_or(0);

        let pairs = self.upper_pairs();
        let observed: Vec<usize> = pairs.iter().copied().filter(|&p| p > 0).collect();
        let pair_range = match (observed.iter().min(), observed.iter().max()) {
            (Some(lo), Some(hi)) => hi - lo,
            _ => 0,
        };
        let ssd = if pairs.is_empty() {
            0.0
        } else {
            let mean = pairs.iter().sum::<usize>() as f64 / pairs.len() as f64;
            pairs
                .iter()
                .map(|&p| {
                    let d = p as f64 - mean;
                    d * d
                })
                .sum::<f64>()
        };

        ITEM_RANGE_WEIGHT * (c_max - c_min) as f64 + PAIR_RANGE_WEIGHT * pair_range as f64 + ssd
    }
}

/// Universe of item ids with a stable index.
struct Universe {
    ids: Vec<String>,
    index: HashMap<String, usize>,
}

impl Universe {
    fn new(items: &[String], existing: &[DesignBlock]) -> Self {
        let mut ids = Vec::new();
        let mut index = HashMap::new();
        let all = items
            .iter()
            .chain(existing.iter().flat_map(|b| b.items.iter()));
        for id in all {
            if !index.contains_key(id) {
                index.insert(id.clone(), ids.len());
                ids.push(id.clone());
            }
        }
        Self { ids, index }
    }

    fn tally(&self, blocks: &[DesignBlock]) -> Tally {
        let mut tally = Tally::new(self.ids.len());
        for block in blocks {
            let idx = self.indices(block);
            tally.add_block(&idx);
        }
        tally
    }

    fn indices(&self, block: &DesignBlock) -> Vec<usize> {
        let mut seen = HashSet::new();
        block
            .items
            .iter()
            .filter_map(|id| self.index.get(id).copied())
            .filter(|i| seen.insert(*i))
            .collect()
    }
}

pub fn dedup_items(items: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------
//  Construction
// ---------------------------------------------------------------------

/// Blocks needed to give every item `r` appearances: `ceil(v·r / k)`.
pub fn block_count(items: usize, block_size: usize, appearances: usize) -> usize {
    if block_size == 0 {
        return 0;
    }
    (items * appearances).div_ceil(block_size)
}

/// Build a design over `items`.
///
/// With `existing` blocks, counts are seeded from them and only the blocks
/// missing from the `ceil(v·r/k)` target are built.
pub fn build_design(
    items: &[String],
    params: &DesignParams,
    existing: Option<&[DesignBlock]>,
) -> Design {
    let existing = existing.unwrap_or(&[]);
    let universe_size = Universe::new(&dedup_items(items), existing).ids.len();
    let k = params.block_size.min(universe_size);
    let target = block_count(universe_size, k, params.appearances);
    let already = existing.iter().filter(|b| !b.is_repeat()).count();
    extend_design(items, existing, target.saturating_sub(already), params)
}

/// Append `additional` blocks to `existing`, preserving earlier blocks verbatim.
pub fn extend_design(
    items: &[String],
    existing: &[DesignBlock],
    additional: usize,
    params: &DesignParams,
) -> Design {
    let items = dedup_items(items);
    let universe = Universe::new(&items, existing);
    let v = universe.ids.len();
    if v < 2 || params.block_size < 2 {
        return Design::default();
    }
    let k = params.block_size.min(v);

    let mut tally = universe.tally(existing);
    let mut rng = seeded(params.seed.wrapping_add(existing.len() as u64));

    let mut new_blocks: Vec<Vec<usize>> = Vec::with_capacity(additional);
    match params.mode {
        DesignMode::NearBibd => {
            for _ in 0..additional {
                let block = greedy_block(&tally, k, &mut rng);
                tally.add_block(&block);
                new_blocks.push(block);
            }
        }
        DesignMode::Legacy => {
            new_blocks = legacy_blocks(v, k, additional, &mut rng);
            for block in &new_blocks {
                tally.add_block(block);
            }
        }
    }

    let greedy_objective = tally.objective();
    if params.mode == DesignMode::NearBibd {
        improve_by_swaps(
            &mut new_blocks,
            &mut tally,
            params.improvement_iterations,
            &mut rng,
        );
    }

    let next_id = existing.iter().map(|b| b.id + 1).max().unwrap_or(0);
    let mut blocks = existing.to_vec();
    blocks.extend(new_blocks.into_iter().enumerate().map(|(offset, idx)| {
        DesignBlock {
            id: next_id + offset,
            items: idx.into_iter().map(|i| universe.ids[i].clone()).collect(),
            repeat_of: None,
        }
    }));

    let diagnostics = diagnose(&universe.ids, &blocks);
    debug!(
        items = v,
        block_size = k,
        blocks = blocks.len(),
        added = additional,
        coverage = diagnostics.coverage,
        objective = diagnostics.objective,
        "design built"
    );

    Design {
        blocks,
        diagnostics,
        greedy_objective,
    }
}

fn greedy_block(tally: &Tally, k: usize, rng: &mut StdRng) -> Vec<usize> {
    let n = tally.n;
    let mut block: Vec<usize> = Vec::with_capacity(k);

    let min_count = tally.counts.iter().copied().min().unwrap_or(0);
    let seeds: Vec<usize> = (0..n).filter(|&i| tally.counts[i] == min_count).collect();
    let Some(first) = pick_tied(rng, &seeds) else {
        return block;
    };
    block.push(first);

    while block.len() < k {
        let available: Vec<usize> = (0..n).filter(|i| !block.contains(i)).collect();
        let Some(floor) = available.iter().map(|&i| tally.counts[i]).min() else {
            break;
        };
        // Items more than one appearance above the floor would starve the rest.
        let window: Vec<usize> = available
            .into_iter()
            .filter(|&i| tally.counts[i] <= floor + 1)
            .collect();

        let key = |i: usize| {
            let max_pair = block.iter().map(|&m| tally.pair(i, m)).max().unwrap_or(0);
            let sum_pair: usize = block.iter().map(|&m| tally.pair(i, m)).sum();
            (tally.counts[i], max_pair, sum_pair)
        };
        let Some(best) = window.iter().map(|&i| key(i)).min() else {
            break;
        };
        let tied: Vec<usize> = window.into_iter().filter(|&i| key(i) == best).collect();
        match pick_tied(rng, &tied) {
            Some(next) => block.push(next),
            None => break,
        }
    }
    block
}

fn legacy_blocks(v: usize, k: usize, count: usize, rng: &mut StdRng) -> Vec<Vec<usize>> {
    let mut queue: VecDeque<usize> = VecDeque::new();
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let mut block = Vec::with_capacity(k);
        let mut deferred = Vec::new();
        while block.len() < k {
            if queue.is_empty() {
                let mut round: Vec<usize> = (0..v).collect();
                round.shuffle(rng);
                queue.extend(round);
            }
            let Some(next) = queue.pop_front() else {
                break;
            };
            if block.contains(&next) {
                deferred.push(next);
            } else {
                block.push(next);
            }
        }
        for item in deferred.into_iter().rev() {
            queue.push_front(item);
        }
        out.push(block);
    }
    out
}

fn improve_by_swaps(blocks: &mut [Vec<usize>], tally: &mut Tally, iterations: usize, rng: &mut StdRng) {
    if blocks.len() < 2 {
        return;
    }
    let mut current = tally.objective();
    for _ in 0..iterations {
        let b1 = rng.gen_range(0..blocks.len());
        let b2 = rng.gen_range(0..blocks.len());
        if b1 == b2 || blocks[b1].is_empty() || blocks[b2].is_empty() {
            continue;
        }
        let p1 = rng.gen_range(0..blocks[b1].len());
        let p2 = rng.gen_range(0..blocks[b2].len());
        let a = blocks[b1][p1];
        let c = blocks[b2][p2];
        if a == c || blocks[b1].contains(&c) || blocks[b2].contains(&a) {
            continue;
        }

        tally.exchange(&blocks[b1], a, c);
        tally.exchange(&blocks[b2], c, a);
        let candidate = tally.objective();
        if candidate < current {
            blocks[b1][p1] = c;
            blocks[b2][p2] = a;
            current = candidate;
        } else {
            tally.exchange(&blocks[b1], c, a);
            tally.exchange(&blocks[b2], a, c);
        }
    }
}

// ---------------------------------------------------------------------
//  Repeat tasks
// ---------------------------------------------------------------------

/// Number of repeat blocks for a pool of `core` blocks.
pub fn repeat_count(core: usize, fraction: f64) -> usize {
    if core == 0 || !fraction.is_finite() || fraction <= 0.0 {
        return 0;
    }
    (core as f64 * fraction).round() as usize
}

/// Duplicate `fraction` of the non-repeat blocks as test-retest blocks.
///
/// Sources are drawn without replacement until the pool is exhausted, then
/// with replacement. Returns only the new blocks; ids continue after the
/// largest id in `blocks`.
pub fn inject_repeats(blocks: &[DesignBlock], fraction: f64, seed: u64) -> Vec<DesignBlock> {
    let pool: Vec<&DesignBlock> = blocks.iter().filter(|b| !b.is_repeat()).collect();
    let wanted = repeat_count(pool.len(), fraction);
    sample_repeats(blocks, &pool, wanted, seed)
}

pub(crate) fn sample_repeats(
    blocks: &[DesignBlock],
    pool: &[&DesignBlock],
    wanted: usize,
    seed: u64,
) -> Vec<DesignBlock> {
    if wanted == 0 || pool.is_empty() {
        return Vec::new();
    }
    let mut rng = seeded(seed);
    let mut order: Vec<usize> = (0..pool.len()).collect();
    order.shuffle(&mut rng);

    let mut sources: Vec<usize> = order.into_iter().take(wanted).collect();
    while sources.len() < wanted {
        sources.push(rng.gen_range(0..pool.len()));
    }

    let next_id = blocks.iter().map(|b| b.id + 1).max().unwrap_or(0);
    sources
        .into_iter()
        .enumerate()
        .map(|(offset, src)| DesignBlock {
            id: next_id + offset,
            items: pool[src].items.clone(),
            repeat_of: Some(pool[src].id),
        })
        .collect()
}

// ---------------------------------------------------------------------
//  Diagnostics
// ---------------------------------------------------------------------

/// Appearance / co-occurrence diagnostics of `blocks` over `items`.
///
/// Items that appear in blocks but not in `items` are added to the universe.
pub fn diagnose(items: &[String], blocks: &[DesignBlock]) -> DesignDiagnostics {
    let universe = Universe::new(&dedup_items(items), blocks);
    let v = universe.ids.len();
    if v == 0 {
        return DesignDiagnostics::default();
    }
    let tally = universe.tally(blocks);

    let item_counts: BTreeMap<String, usize> = universe
        .ids
        .iter()
        .cloned()
        .zip(tally.counts.iter().copied())
        .collect();

    let mut pair_counts = Vec::new();
    for a in 0..v {
        for b in (a + 1)..v {
            let count = tally.pair(a, b);
            if count > 0 {
                pair_counts.push(PairCount {
                    a: universe.ids[a].clone(),
                    b: universe.ids[b].clone(),
                    count,
                });
            }
        }
    }

    let all_pairs = tally.upper_pairs();
    let coverage = if all_pairs.is_empty() {
        0.0
    } else {
        pair_counts.len() as f64 / all_pairs.len() as f64
    };

    let b = blocks.len();
    let k = blocks.first().map(|blk| blk.items.len()).unwrap_or(0);
    let uniform_k = blocks.iter().all(|blk| blk.items.len() == k);
    let r = uniform(&tally.counts);
    let lambda = uniform(&all_pairs);
    let is_exact = match (r, lambda) {
        (Some(r), Some(l)) => uniform_k && bibd_parameters_hold(v, b, r, k, l),
        _ => false,
    };

    DesignDiagnostics {
        item_counts,
        pair_counts,
        item_stats: SummaryStats::from_counts(&tally.counts),
        pair_stats: SummaryStats::from_counts(&all_pairs),
        coverage,
        objective: tally.objective(),
        bibd: BibdCheck {
            v,
            b,
            k,
            r,
            lambda,
            is_exact,
        },
    }
}

fn uniform(values: &[usize]) -> Option<usize> {
    let first = *values.first()?;
    values.iter().all(|&x| x == first).then_some(first)
}
