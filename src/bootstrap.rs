//! Resampled WTP distributions and test–retest agreement.

use std::collections::{BTreeMap, HashMap};

use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::debug;

use crate::assembler::ChoiceSet;
use crate::bws::{fit_observations, BwsFitOptions, Observation, ObservationSet};
use crate::response::{index_sets, validate_response, Response};
use crate::rng::{seeded, stream_seed, DEFAULT_SEED};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapOptions {
    pub samples: usize,
    pub seed: u64,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            samples: 200,
            seed: DEFAULT_SEED,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootstrapSummary {
    pub mean: f64,
    pub median: f64,
    pub p2_5: f64,
    pub p97_5: f64,
    pub std_dev: f64,
    /// `std_dev / |mean|`, 0 when the mean is 0.
    pub cv: f64,
    /// `(p97.5 − p2.5) / (2 · max(1, |mean|))`.
    pub rel_ci_half_width: f64,
    pub samples: usize,
}

/// Linear-interpolated quantile of an ascending slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

impl BootstrapSummary {
    pub fn from_samples(values: &[f64]) -> Self {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return Self::default();
        }
        sorted.sort_by(|a, b| a.total_cmp(b));

        let mean = sorted.iter().mean();
        let std_dev = if sorted.len() > 1 {
            sorted.iter().std_dev()
        } else {
            0.0
        };
        let p2_5 = quantile(&sorted, 0.025);
        let p97_5 = quantile(&sorted, 0.975);
        Self {
            mean,
            median: quantile(&sorted, 0.5),
            p2_5,
            p97_5,
            std_dev,
            cv: if mean == 0.0 { 0.0 } else { std_dev / mean.abs() },
            rel_ci_half_width: (p97_5 - p2_5) / (2.0 * mean.abs().max(1.0)),
            samples: sorted.len(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootstrapReport {
    /// WTP of centred utilities.
    pub wtp: BTreeMap<String, BootstrapSummary>,
    /// WTP of voucher-anchored utilities.
    pub anchored_wtp: BTreeMap<String, BootstrapSummary>,
    pub beta: BootstrapSummary,
    pub samples_requested: usize,
    /// Samples whose fit produced finite WTP and β.
    pub samples_used: usize,
}

struct SampleFit {
    wtp: Vec<f64>,
    anchored: Vec<f64>,
    beta: f64,
}

impl SampleFit {
    fn is_finite(&self) -> bool {
        self.beta.is_finite()
            && self.wtp.iter().all(|w| w.is_finite())
            && self.anchored.iter().all(|w| w.is_finite())
    }
}

fn resample(observations: &[Observation], seed: u64) -> Vec<Observation> {
    let mut rng = seeded(seed);
    let n = observations.len();
    (0..n)
        .map(|_| observations[rng.gen_range(0..n)].clone())
        .collect()
}

/// Refit on `samples` with-replacement resamples of the observation list.
///
/// Sample `i` uses its own generator seeded from `(seed, i)`, so the result
/// does not depend on how rayon schedules the work.
pub fn bootstrap_bws(
    observations: &ObservationSet,
    fit_options: &BwsFitOptions,
    options: &BootstrapOptions,
) -> BootstrapReport {
    let n_features = observations.feature_ids.len();
    if observations.observations.is_empty() || n_features == 0 || options.samples == 0 {
        return BootstrapReport {
            samples_requested: options.samples,
            ..BootstrapReport::default()
        };
    }

    let fits: Vec<Option<SampleFit>> = (0..options.samples)
        .into_par_iter()
        .map(|i| {
            let sample = resample(&observations.observations, stream_seed(options.seed, i));
            let fit = fit_observations(&sample, n_features, fit_options);
            let out = SampleFit {
                wtp: fit.wtp(fit_options),
                anchored: fit.anchored_wtp(fit_options),
                beta: fit.beta(),
            };
            out.is_finite().then_some(out)
        })
        .collect();

    let kept: Vec<SampleFit> = fits.into_iter().flatten().collect();
    let column = |pick: fn(&SampleFit) -> &[f64]| -> BTreeMap<String, BootstrapSummary> {
        observations
            .feature_ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let values: Vec<f64> = kept.iter().map(|s| pick(s)[i]).collect();
                (id.clone(), BootstrapSummary::from_samples(&values))
            })
            .collect()
    };
    let wtp = column(|s| s.wtp.as_slice());
    let anchored_wtp = column(|s| s.anchored.as_slice());
    let betas: Vec<f64> = kept.iter().map(|s| s.beta).collect();

    debug!(
        requested = options.samples,
        used = kept.len(),
        "bootstrap finished"
    );

    BootstrapReport {
        wtp,
        anchored_wtp,
        beta: BootstrapSummary::from_samples(&betas),
        samples_requested: options.samples,
        samples_used: kept.len(),
    }
}

// ---------------------------------------------------------------------
//  Repeatability
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepeatabilityReport {
    /// Repeat tasks with a usable answer on both sides.
    pub pairs: usize,
    pub best_matches: usize,
    pub worst_matches: usize,
    pub joint_matches: usize,
    pub best_match_rate: f64,
    pub worst_match_rate: f64,
    pub joint_match_rate: f64,
}

impl RepeatabilityReport {
    /// Joint agreement, or `None` with no comparable pairs.
    pub fn joint(&self) -> Option<f64> {
        (self.pairs > 0).then_some(self.joint_match_rate)
    }
}

/// Agreement between each repeat task and its source, per respondent.
pub fn compute_repeatability(sets: &[ChoiceSet], responses: &[Response]) -> RepeatabilityReport {
    let index = index_sets(sets);
    let mut usable: HashMap<(usize, &str), &Response> = HashMap::new();
    for response in responses {
        if validate_response(&index, response).is_ok() {
            usable
                .entry((response.task_id, response.respondent.as_str()))
                .or_insert(response);
        }
    }

    let mut report = RepeatabilityReport::default();
    for set in sets {
        let Some(src) = set.repeat_of else { continue };
        for ((task_id, respondent), repeat) in &usable {
            if *task_id != set.id {
                continue;
            }
            let Some(original) = usable.get(&(src, *respondent)) else {
                continue;
            };
            report.pairs += 1;
            let best = repeat.best == original.best;
            let worst = repeat.worst == original.worst;
            report.best_matches += usize::from(best);
            report.worst_matches += usize::from(worst);
            report.joint_matches += usize::from(best && worst);
        }
    }

    if report.pairs > 0 {
        let pairs = report.pairs as f64;
        report.best_match_rate = report.best_matches as f64 / pairs;
        report.worst_match_rate = report.worst_matches as f64 / pairs;
        report.joint_match_rate = report.joint_matches as f64 / pairs;
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bws::Slot;

    #[test]
    fn summary_of_known_values() {
        let values: Vec<f64> = (1..=5).map(f64::from).collect();
        let s = BootstrapSummary::from_samples(&values);
        assert_eq!(s.samples, 5);
        assert!((s.mean - 3.0).abs() < 1e-12);
        assert!((s.median - 3.0).abs() < 1e-12);
        assert!((s.std_dev - 2.5f64.sqrt()).abs() < 1e-12);
        assert!((s.p2_5 - 1.1).abs() < 1e-12);
        assert!((s.p97_5 - 4.9).abs() < 1e-12);
        assert!((s.rel_ci_half_width - 3.8 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn summary_drops_non_finite_samples() {
        let s = BootstrapSummary::from_samples(&[f64::NAN, 2.0, f64::INFINITY]);
        assert_eq!(s.samples, 1);
        assert_eq!(s.mean, 2.0);
        assert_eq!(s.std_dev, 0.0);
    }

    #[test]
    fn bootstrap_is_reproducible_for_a_seed() {
        let obs = ObservationSet {
            feature_ids: vec!["a".into(), "b".into()],
            observations: vec![
                Observation {
                    slots: vec![Slot::Feature(0), Slot::Feature(1), Slot::Voucher { amount: 20.0 }],
                    best: 0,
                    worst: 2,
                },
                Observation {
                    slots: vec![Slot::Feature(1), Slot::Voucher { amount: 5.0 }, Slot::Feature(0)],
                    best: 2,
                    worst: 1,
                },
                Observation {
                    slots: vec![Slot::Feature(0), Slot::Voucher { amount: 50.0 }, Slot::Feature(1)],
                    best: 1,
                    worst: 2,
                },
            ],
            failed_tasks: 0,
        };
        let fit = BwsFitOptions {
            max_iterations: 200,
            ..BwsFitOptions::default()
        };
        let options = BootstrapOptions {
            samples: 8,
            seed: 9,
        };
        let a = bootstrap_bws(&obs, &fit, &options);
        let b = bootstrap_bws(&obs, &fit, &options);
        assert_eq!(a, b);
        assert_eq!(a.samples_requested, 8);
        assert!(a.samples_used <= 8);
        assert!(a.wtp.contains_key("a"));
    }

    #[test]
    fn repeatability_matches_per_respondent() {
        let set = |id: usize, repeat_of: Option<usize>| ChoiceSet {
            id,
            items: vec!["a".into(), "b".into(), "c".into()],
            voucher: None,
            repeat_of,
        };
        let sets = vec![set(0, None), set(1, None), set(2, Some(0)), set(3, Some(1))];
        let responses = vec![
            Response::answered(0, "x", "a", "c"),
            Response::answered(2, "x", "a", "c"),
            Response::answered(1, "x", "b", "c"),
            Response::answered(3, "x", "b", "a"),
            Response::answered(0, "y", "a", "b"),
            Response::failed(2, "y"),
        ];
        let report = compute_repeatability(&sets, &responses);
        assert_eq!(report.pairs, 2);
        assert_eq!(report.best_matches, 2);
        assert_eq!(report.worst_matches, 1);
        assert_eq!(report.joint_matches, 1);
        assert_eq!(report.joint(), Some(0.5));
    }
}
