//! Closed-form Borda / net-score fallback.
//!
//! Rankings of three or more items contribute positions-from-bottom; plain
//! best/worst answers contribute +1 / -1. Scores are normalized by the largest
//! feature score and mapped onto money with the voucher scale. There are no
//! confidence intervals on this path.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::assembler::ChoiceSet;
use crate::items::ItemCatalog;
use crate::response::{index_sets, validate_response, Response};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyFeatureScore {
    pub id: String,
    pub raw_score: f64,
    /// `raw_score / max feature score`, 0 when no feature scored above 0.
    pub normalized: f64,
    /// `cost + normalized × scale`.
    pub perceived_value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyScoreReport {
    pub features: BTreeMap<String, LegacyFeatureScore>,
    /// Voucher raw scores, reported for inspection only.
    pub voucher_scores: BTreeMap<String, f64>,
    /// `max(highest voucher amount, mean feature cost)`.
    pub scale: f64,
    pub usable_tasks: usize,
    pub failed_tasks: usize,
}

impl LegacyScoreReport {
    pub fn perceived_values(&self) -> BTreeMap<String, f64> {
        self.features
            .iter()
            .map(|(id, s)| (id.clone(), s.perceived_value))
            .collect()
    }
}

fn ranking_points(ranking: &[String], set: &ChoiceSet) -> Option<Vec<(String, f64)>> {
    if ranking.len() < 3 || ranking.iter().any(|id| !set.contains(id)) {
        return None;
    }
    let n = ranking.len();
    Some(
        ranking
            .iter()
            .enumerate()
            .map(|(pos, id)| (id.clone(), (n - 1 - pos) as f64))
            .collect(),
    )
}

pub fn score_legacy(
    sets: &[ChoiceSet],
    responses: &[Response],
    catalog: &ItemCatalog,
) -> LegacyScoreReport {
    let index = index_sets(sets);
    let mut raw: BTreeMap<String, f64> = BTreeMap::new();
    let mut usable = 0;
    let mut failed = 0;

    for response in responses {
        let set = match validate_response(&index, response) {
            Ok(set) => set,
            Err(_) => {
                failed += 1;
                continue;
            }
        };
        usable += 1;

        let ranked = response
            .ranking
            .as_deref()
            .and_then(|r| ranking_points(r, set));
        match ranked {
            Some(points) => {
                for (id, p) in points {
                    *raw.entry(id).or_insert(0.0) += p;
                }
            }
            None => {
                if let (Some(best), Some(worst)) = (&response.best, &response.worst) {
                    *raw.entry(best.clone()).or_insert(0.0) += 1.0;
                    *raw.entry(worst.clone()).or_insert(0.0) -= 1.0;
                }
            }
        }
    }

    let scale = catalog.max_voucher_amount().max(catalog.mean_feature_cost());
    let max_feature = catalog
        .features()
        .iter()
        .map(|f| raw.get(&f.id).copied().unwrap_or(0.0))
        .fold(f64::NEG_INFINITY, f64::max);

    let features = catalog
        .features()
        .iter()
        .map(|f| {
            let raw_score = raw.get(&f.id).copied().unwrap_or(0.0);
            let normalized = if max_feature > 0.0 {
                raw_score / max_feature
            } else {
                0.0
            };
            let score = LegacyFeatureScore {
                id: f.id.clone(),
                raw_score,
                normalized,
                perceived_value: f.cost + normalized * scale,
            };
            (f.id.clone(), score)
        })
        .collect();

    let voucher_scores = catalog
        .vouchers()
        .iter()
        .map(|v| (v.id.clone(), raw.get(&v.id).copied().unwrap_or(0.0)))
        .collect();

    LegacyScoreReport {
        features,
        voucher_scores,
        scale,
        usable_tasks: usable,
        failed_tasks: failed,
    }
}
