//! Task-count planning and the information-sufficiency gates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::design::{block_count, repeat_count};

fn ceil_div(a: usize, b: usize) -> usize {
    if b == 0 {
        0
    } else {
        a.div_ceil(b)
    }
}

// ---------------------------------------------------------------------
//  Exposure plan
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposurePlanInput {
    pub feature_count: usize,
    pub voucher_level_count: usize,
    pub target_feature_exposures: usize,
    pub target_voucher_exposures_per_level: usize,
    pub repeat_fraction: f64,
    pub features_per_task: usize,
    pub min_tasks_floor: usize,
    #[serde(default)]
    pub max_tasks_cap: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureTaskPlan {
    /// Tasks giving every feature its target exposure.
    pub tasks_for_features: usize,
    /// Tasks giving every voucher level its target exposure, one voucher per task.
    pub tasks_for_vouchers: usize,
    /// `max(floor, tasks_for_features, tasks_for_vouchers)`, then capped.
    pub min_tasks: usize,
    pub capped: bool,
    /// Appearances per feature that realize `min_tasks` under the block-count formula.
    pub recommended_appearances: usize,
    pub estimated_core_tasks: usize,
    pub estimated_repeat_tasks: usize,
    pub estimated_total_tasks: usize,
}

pub fn compute_exposure_task_plan(input: &ExposurePlanInput) -> ExposureTaskPlan {
    let k = input.features_per_task;
    let tasks_for_features = ceil_div(input.feature_count * input.target_feature_exposures, k);
    let tasks_for_vouchers = input.voucher_level_count * input.target_voucher_exposures_per_level;

    let uncapped = input
        .min_tasks_floor
        .max(tasks_for_features)
        .max(tasks_for_vouchers);
    let (min_tasks, capped) = match input.max_tasks_cap {
        Some(cap) if cap < uncapped => (cap, true),
        _ => (uncapped, false),
    };

    let recommended_appearances = ceil_div(min_tasks * k, input.feature_count);
    let core = block_count(input.feature_count, k, recommended_appearances);
    let repeats = repeat_count(core, input.repeat_fraction);

    ExposureTaskPlan {
        tasks_for_features,
        tasks_for_vouchers,
        min_tasks,
        capped,
        recommended_appearances,
        estimated_core_tasks: core,
        estimated_repeat_tasks: repeats,
        estimated_total_tasks: core + repeats,
    }
}

// ---------------------------------------------------------------------
//  Gates
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateThresholds {
    pub min_tasks: usize,
    pub min_feature_exposure: usize,
    pub min_voucher_exposure: usize,
    pub min_repeat_tasks: usize,
    pub min_repeatability: f64,
    pub max_failure_rate: f64,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            min_tasks: 30,
            min_feature_exposure: 8,
            min_voucher_exposure: 5,
            min_repeat_tasks: 3,
            min_repeatability: 0.6,
            max_failure_rate: 0.1,
        }
    }
}

/// Measured quantities the gates compare against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateInputs {
    pub answered_tasks: usize,
    pub repeat_tasks_answered: usize,
    /// Joint best+worst agreement on repeats, `None` with no comparable pairs.
    pub joint_repeatability: Option<f64>,
    pub failure_rate: f64,
    pub feature_exposure: BTreeMap<String, usize>,
    pub voucher_exposure: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AchievedValues {
    pub answered_tasks: usize,
    pub min_feature_exposure: Option<usize>,
    pub min_voucher_exposure: Option<usize>,
    pub repeat_tasks_answered: usize,
    pub joint_repeatability: Option<f64>,
    pub failure_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityGateReport {
    pub thresholds: GateThresholds,
    pub achieved: AchievedValues,
    pub min_tasks_met: bool,
    pub min_feature_exposure_met: bool,
    pub min_voucher_exposure_met: bool,
    pub min_repeat_tasks_met: bool,
    pub repeatability_met: bool,
    pub failure_rate_met: bool,
    pub gates_met: bool,
    /// One entry per failing gate.
    pub reasons: Vec<String>,
}

fn least_exposed(exposure: &BTreeMap<String, usize>) -> Option<(&str, usize)> {
    exposure
        .iter()
        .min_by_key(|(id, count)| (**count, id.as_str()))
        .map(|(id, count)| (id.as_str(), *count))
}

pub fn evaluate_stability_gates(inputs: &GateInputs, thresholds: &GateThresholds) -> StabilityGateReport {
    let mut reasons = Vec::new();

    let min_tasks_met = inputs.answered_tasks >= thresholds.min_tasks;
    if !min_tasks_met {
        reasons.push(format!(
            "answered tasks {} below required {}",
            inputs.answered_tasks, thresholds.min_tasks
        ));
    }

    let feature_low = least_exposed(&inputs.feature_exposure);
    let min_feature_exposure_met = match feature_low {
        Some((_, count)) => count >= thresholds.min_feature_exposure,
        None => false,
    };
    if !min_feature_exposure_met {
        match feature_low {
            Some((id, count)) => reasons.push(format!(
                "feature {id} seen {count} times, below required {}",
                thresholds.min_feature_exposure
            )),
            None => reasons.push("no features to evaluate".to_string()),
        }
    }

    let voucher_low = least_exposed(&inputs.voucher_exposure);
    let min_voucher_exposure_met = match voucher_low {
        Some((_, count)) => count >= thresholds.min_voucher_exposure,
        None => true,
    };
    if let (false, Some((id, count))) = (min_voucher_exposure_met, voucher_low) {
        reasons.push(format!(
            "voucher {id} seen {count} times, below required {}",
            thresholds.min_voucher_exposure
        ));
    }

    let min_repeat_tasks_met = inputs.repeat_tasks_answered >= thresholds.min_repeat_tasks;
    if !min_repeat_tasks_met {
        reasons.push(format!(
            "answered repeat tasks {} below required {}",
            inputs.repeat_tasks_answered, thresholds.min_repeat_tasks
        ));
    }

    let repeatability_met = min_repeat_tasks_met
        && match inputs.joint_repeatability {
            Some(rate) => rate >= thresholds.min_repeatability,
            None => thresholds.min_repeat_tasks == 0,
        };
    if !repeatability_met {
        match (min_repeat_tasks_met, inputs.joint_repeatability) {
            (false, _) => reasons.push("repeatability not assessable until the repeat task gate is met".to_string()),
            (true, Some(rate)) => reasons.push(format!(
                "repeatability {rate:.2} below required {:.2}",
                thresholds.min_repeatability
            )),
            (true, None) => reasons.push("no repeat pairs with usable answers on both sides".to_string()),
        }
    }

    let failure_rate_met = inputs.failure_rate <= thresholds.max_failure_rate;
    if !failure_rate_met {
        reasons.push(format!(
            "failure rate {:.3} above allowed {:.3}",
            inputs.failure_rate, thresholds.max_failure_rate
        ));
    }

    let gates_met = min_tasks_met
        && min_feature_exposure_met
        && min_voucher_exposure_met
        && min_repeat_tasks_met
        && repeatability_met
        && failure_rate_met;

    StabilityGateReport {
        thresholds: thresholds.clone(),
        achieved: AchievedValues {
            answered_tasks: inputs.answered_tasks,
            min_feature_exposure: feature_low.map(|(_, c)| c),
            min_voucher_exposure: voucher_low.map(|(_, c)| c),
            repeat_tasks_answered: inputs.repeat_tasks_answered,
            joint_repeatability: inputs.joint_repeatability,
            failure_rate: inputs.failure_rate,
        },
        min_tasks_met,
        min_feature_exposure_met,
        min_voucher_exposure_met,
        min_repeat_tasks_met,
        repeatability_met,
        failure_rate_met,
        gates_met,
        reasons,
    }
}
