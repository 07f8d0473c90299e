use std::collections::BTreeMap;

use maxdiff_harness::stability::{
    compute_exposure_task_plan, evaluate_stability_gates, ExposurePlanInput, GateInputs, GateThresholds,
};

fn scenario() -> ExposurePlanInput {
    ExposurePlanInput {
        feature_count: 12,
        voucher_level_count: 7,
        target_feature_exposures: 12,
        target_voucher_exposures_per_level: 10,
        repeat_fraction: 0.1,
        features_per_task: 3,
        min_tasks_floor: 0,
        max_tasks_cap: None,
    }
}

fn exposure(ids: &[&str], count: usize) -> BTreeMap<String, usize> {
    ids.iter().map(|id| (id.to_string(), count)).collect()
}

fn inputs(answered: usize, repeats: usize, joint: Option<f64>, failure: f64, exposure_each: usize) -> GateInputs {
    GateInputs {
        answered_tasks: answered,
        repeat_tasks_answered: repeats,
        joint_repeatability: joint,
        failure_rate: failure,
        feature_exposure: exposure(&["a", "b", "c", "d"], exposure_each),
        voucher_exposure: exposure(&["v0", "v1"], exposure_each),
    }
}

#[test]
fn twelve_features_seven_levels_plan() {
    let plan = compute_exposure_task_plan(&scenario());
    assert_eq!(plan.tasks_for_features, 48);
    assert_eq!(plan.tasks_for_vouchers, 70);
    assert_eq!(plan.min_tasks, 70);
    assert!(!plan.capped);
    assert_eq!(plan.recommended_appearances, 18);
    assert_eq!(plan.estimated_core_tasks, 72);
    assert_eq!(plan.estimated_repeat_tasks, 7);
    assert_eq!(plan.estimated_total_tasks, 79);
}

#[test]
fn floor_and_cap_bound_the_plan() {
    let floored = compute_exposure_task_plan(&ExposurePlanInput {
        min_tasks_floor: 100,
        ..scenario()
    });
    assert_eq!(floored.min_tasks, 100);

    let capped = compute_exposure_task_plan(&ExposurePlanInput {
        max_tasks_cap: Some(60),
        ..scenario()
    });
    assert!(capped.capped);
    assert_eq!(capped.min_tasks, 60);
    assert_eq!(capped.recommended_appearances, 15);
}

#[test]
fn gates_pass_on_sufficient_data() {
    let report = evaluate_stability_gates(&inputs(60, 6, Some(0.8), 0.02, 12), &GateThresholds::default());
    assert!(report.gates_met, "{:?}", report.reasons);
    assert!(report.reasons.is_empty());
}

#[test]
fn more_data_never_turns_a_gate_off() {
    let thresholds = GateThresholds::default();
    let mut previous = evaluate_stability_gates(&inputs(5, 0, None, 0.05, 2), &thresholds);
    for step in 1..=12 {
        let current = evaluate_stability_gates(
            &inputs(5 + step * 5, step / 2, Some(0.7), 0.05, 2 + step),
            &thresholds,
        );
        for (before, after) in [
            (previous.min_tasks_met, current.min_tasks_met),
            (previous.min_feature_exposure_met, current.min_feature_exposure_met),
            (previous.min_voucher_exposure_met, current.min_voucher_exposure_met),
            (previous.min_repeat_tasks_met, current.min_repeat_tasks_met),
            (previous.repeatability_met, current.repeatability_met),
        ] {
            assert!(!before || after, "gate regressed at step {step}");
        }
        previous = current;
    }
    assert!(previous.gates_met, "{:?}", previous.reasons);
}

#[test]
fn each_failing_gate_reports_a_reason() {
    let report = evaluate_stability_gates(&inputs(10, 1, Some(0.2), 0.5, 1), &GateThresholds::default());
    assert!(!report.gates_met);
    assert!(!report.min_tasks_met);
    assert!(!report.min_feature_exposure_met);
    assert!(!report.min_voucher_exposure_met);
    assert!(!report.min_repeat_tasks_met);
    assert!(!report.repeatability_met);
    assert!(!report.failure_rate_met);
    assert_eq!(report.reasons.len(), 6);
}

#[test]
fn studies_without_vouchers_skip_the_voucher_gate() {
    let mut no_vouchers = inputs(60, 6, Some(0.8), 0.0, 12);
    no_vouchers.voucher_exposure.clear();
    let report = evaluate_stability_gates(&no_vouchers, &GateThresholds::default());
    assert!(report.min_voucher_exposure_met);
    assert_eq!(report.achieved.min_voucher_exposure, None);
    assert!(report.gates_met);
}
