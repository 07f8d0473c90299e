//! Final choice sets: feature blocks plus one balanced voucher each.
//!
//! Core blocks receive vouchers by a min-count-first rule (ties broken by the
//! seeded generator); repeat blocks inherit the voucher of their source. Each
//! set is shuffled into presentation order with seed `base + set index`.

use std::collections::{BTreeMap, HashMap};

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::design::{
    build_design, diagnose, extend_design, inject_repeats, sample_repeats, DesignBlock,
    DesignDiagnostics, DesignMode, DesignParams,
};
use crate::items::{Feature, Voucher};
use crate::rng::{offset_seed, pick_tied, seeded, shuffled_with_seed, DEFAULT_SEED};

const VOUCHER_STREAM: u64 = 0x5654_4348;
const REPEAT_STREAM: u64 = 0x5245_5054;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyParams {
    /// Features per task; the voucher adds one more slot when present.
    pub features_per_task: usize,
    /// Target appearances per feature across core tasks.
    pub appearances: usize,
    /// Repeat tasks as a fraction of core tasks.
    pub repeat_fraction: f64,
    pub seed: u64,
    pub improvement_iterations: usize,
    pub mode: DesignMode,
}

impl Default for AssemblyParams {
    fn default() -> Self {
        Self {
            features_per_task: 3,
            appearances: 4,
            repeat_fraction: 0.1,
            seed: DEFAULT_SEED,
            improvement_iterations: 2_000,
            mode: DesignMode::NearBibd,
        }
    }
}

impl AssemblyParams {
    pub fn design_params(&self) -> DesignParams {
        DesignParams {
            block_size: self.features_per_task,
            appearances: self.appearances,
            seed: self.seed,
            improvement_iterations: self.improvement_iterations,
            mode: self.mode,
        }
    }
}

/// One task as presented to a respondent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceSet {
    pub id: usize,
    /// Presentation order, voucher included.
    pub items: Vec<String>,
    #[serde(default)]
    pub voucher: Option<String>,
    #[serde(default)]
    pub repeat_of: Option<usize>,
}

impl ChoiceSet {
    pub fn contains(&self, item: &str) -> bool {
        self.items.iter().any(|i| i == item)
    }

    pub fn is_repeat(&self) -> bool {
        self.repeat_of.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChoiceSetPlan {
    pub sets: Vec<ChoiceSet>,
    /// Feature-only blocks behind `sets`, same ids, repeats included.
    pub blocks: Vec<DesignBlock>,
    /// Diagnostics over the core feature blocks.
    pub diagnostics: DesignDiagnostics,
}

impl ChoiceSetPlan {
    pub fn core_count(&self) -> usize {
        self.sets.iter().filter(|s| !s.is_repeat()).count()
    }

    pub fn repeat_count(&self) -> usize {
        self.sets.iter().filter(|s| s.is_repeat()).count()
    }

    pub fn set(&self, id: usize) -> Option<&ChoiceSet> {
        self.sets.iter().find(|s| s.id == id)
    }

    /// Voucher appearances over all sets, repeats included.
    pub fn voucher_exposure(&self) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        for set in &self.sets {
            if let Some(v) = &set.voucher {
                *out.entry(v.clone()).or_insert(0) += 1;
            }
        }
        out
    }

    /// Content hash of the presented sets, for reproducibility audits.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for set in &self.sets {
            hasher.update(&(set.id as u64).to_le_bytes());
            for item in &set.items {
                hasher.update(item.as_bytes());
                hasher.update(&[0x1f]);
            }
            if let Some(src) = set.repeat_of {
                hasher.update(b"repeat");
                hasher.update(&(src as u64).to_le_bytes());
            }
            hasher.update(&[0x1e]);
        }
        hasher.finalize().to_hex().to_string()
    }
}

// ---------------------------------------------------------------------
//  Voucher balancing
// ---------------------------------------------------------------------

struct VoucherBalancer<'a> {
    vouchers: &'a [Voucher],
    counts: Vec<usize>,
    rng: StdRng,
}

impl<'a> VoucherBalancer<'a> {
    fn new(vouchers: &'a [Voucher], prior: &[ChoiceSet], seed: u64) -> Self {
        let position: HashMap<&str, usize> = vouchers
            .iter()
            .enumerate()
            .map(|(i, v)| (v.id.as_str(), i))
            .collect();
        let mut counts = vec![0; vouchers.len()];
        for set in prior.iter().filter(|s| !s.is_repeat()) {
            if let Some(pos) = set.voucher.as_deref().and_then(|v| position.get(v)) {
                counts[*pos] += 1;
            }
        }
        Self {
            vouchers,
            counts,
            rng: seeded(seed),
        }
    }

    fn next(&mut self) -> Option<String> {
        let min = self.counts.iter().copied().min()?;
        let tied: Vec<usize> = (0..self.counts.len())
            .filter(|&i| self.counts[i] == min)
            .collect();
        let pick = pick_tied(&mut self.rng, &tied)?;
        self.counts[pick] += 1;
        Some(self.vouchers[pick].id.clone())
    }
}

fn present(block: &DesignBlock, voucher: Option<String>, seed: u64, index: usize) -> ChoiceSet {
    let mut items = block.items.clone();
    if let Some(v) = &voucher {
        items.push(v.clone());
    }
    ChoiceSet {
        id: block.id,
        items: shuffled_with_seed(&items, offset_seed(seed, index)),
        voucher,
        repeat_of: block.repeat_of,
    }
}

/// Assign vouchers to `new_blocks` and turn them into presented sets.
///
/// `prior` supplies both the starting voucher counts and the vouchers that
/// repeat blocks inherit.
fn materialize(
    new_blocks: &[DesignBlock],
    prior: &[ChoiceSet],
    vouchers: &[Voucher],
    params: &AssemblyParams,
) -> Vec<ChoiceSet> {
    let mut balancer = VoucherBalancer::new(
        vouchers,
        prior,
        (params.seed ^ VOUCHER_STREAM).wrapping_add(prior.len() as u64),
    );
    let mut assigned: HashMap<usize, Option<String>> = prior
        .iter()
        .map(|s| (s.id, s.voucher.clone()))
        .collect();

    let mut out = Vec::with_capacity(new_blocks.len());
    for block in new_blocks.iter().filter(|b| !b.is_repeat()) {
        let voucher = balancer.next();
        assigned.insert(block.id, voucher);
    }
    for (offset, block) in new_blocks.iter().enumerate() {
        let voucher = match block.repeat_of {
            Some(src) => assigned.get(&src).cloned().flatten(),
            None => assigned.get(&block.id).cloned().flatten(),
        };
        out.push(present(block, voucher, params.seed, prior.len() + offset));
    }
    out
}

// ---------------------------------------------------------------------
//  Public API
// ---------------------------------------------------------------------

/// Build the initial task set for a study.
///
/// Fewer than two features (or fewer than two features per task) yields an
/// empty plan.
pub fn assemble_choice_sets(
    features: &[Feature],
    vouchers: &[Voucher],
    params: &AssemblyParams,
) -> ChoiceSetPlan {
    let feature_ids: Vec<String> = features.iter().map(|f| f.id.clone()).collect();
    let design = build_design(&feature_ids, &params.design_params(), None);
    if design.blocks.is_empty() {
        return ChoiceSetPlan::default();
    }

    let mut blocks = design.blocks;
    let repeats = inject_repeats(
        &blocks,
        params.repeat_fraction,
        params.seed ^ REPEAT_STREAM,
    );
    blocks.extend(repeats);

    let sets = materialize(&blocks, &[], vouchers, params);
    debug!(
        sets = sets.len(),
        repeats = sets.iter().filter(|s| s.is_repeat()).count(),
        vouchers = vouchers.len(),
        "choice sets assembled"
    );

    ChoiceSetPlan {
        sets,
        blocks,
        diagnostics: design.diagnostics,
    }
}

/// Split `additional` tasks into (core, repeat) so repeats ≈ fraction × core.
pub fn split_extension(additional: usize, repeat_fraction: f64) -> (usize, usize) {
    if additional == 0 || !repeat_fraction.is_finite() || repeat_fraction <= 0.0 {
        return (additional, 0);
    }
    let repeat = (additional as f64 * repeat_fraction / (1.0 + repeat_fraction)).round() as usize;
    let repeat = repeat.min(additional);
    (additional - repeat, repeat)
}

/// Append `additional` tasks to `plan` without disturbing existing sets.
///
/// New core blocks extend the feature design from the existing tallies and
/// receive vouchers starting from the prior voucher counts. New repeats are
/// drawn from the full existing + new core pool.
pub fn extend_choice_sets(
    plan: &ChoiceSetPlan,
    features: &[Feature],
    vouchers: &[Voucher],
    additional: usize,
    params: &AssemblyParams,
) -> ChoiceSetPlan {
    if additional == 0 {
        return plan.clone();
    }
    let (core_new, repeat_new) = split_extension(additional, params.repeat_fraction);
    let feature_ids: Vec<String> = features.iter().map(|f| f.id.clone()).collect();

    // Repeats are not design appearances; tally only core blocks.
    let existing_core: Vec<DesignBlock> = plan.blocks.iter().filter(|b| !b.is_repeat()).cloned().collect();
    let design = extend_design(&feature_ids, &existing_core, core_new, &params.design_params());
    if design.blocks.is_empty() {
        return plan.clone();
    }
    let next_id = plan.blocks.iter().map(|b| b.id + 1).max().unwrap_or(0);
    let mut blocks = plan.blocks.clone();
    blocks.extend(
        design
            .blocks
            .into_iter()
            .skip(existing_core.len())
            .enumerate()
            .map(|(offset, block)| DesignBlock {
                id: next_id + offset,
                ..block
            }),
    );

    let pool: Vec<&DesignBlock> = blocks.iter().filter(|b| !b.is_repeat()).collect();
    let repeats = sample_repeats(
        &blocks,
        &pool,
        repeat_new,
        (params.seed ^ REPEAT_STREAM).wrapping_add(plan.blocks.len() as u64),
    );
    blocks.extend(repeats);

    let new_blocks = &blocks[plan.blocks.len()..];
    let mut sets = plan.sets.clone();
    sets.extend(materialize(new_blocks, &plan.sets, vouchers, params));

    let core: Vec<DesignBlock> = blocks.iter().filter(|b| !b.is_repeat()).cloned().collect();
    let diagnostics = diagnose(&feature_ids, &core);
    debug!(
        added_core = core_new,
        added_repeats = repeat_new,
        total_sets = sets.len(),
        "choice sets extended"
    );

    ChoiceSetPlan {
        sets,
        blocks,
        diagnostics,
    }
}
