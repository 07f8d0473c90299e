//! End-to-end study runs: plan, collect, estimate, extend.
//!
//! Estimation is a pure function of the plan and the response log and is
//! recomputed from scratch every round. Only [`run_study`] and
//! [`calibrate_features`] talk to an oracle.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::assembler::{assemble_choice_sets, extend_choice_sets, AssemblyParams, ChoiceSet, ChoiceSetPlan};
use crate::bootstrap::{bootstrap_bws, compute_repeatability, BootstrapReport, RepeatabilityReport};
use crate::bws::{build_observations, fit_observation_set, BwsFitResult};
use crate::calibration::{blend_wtp, CalibrationResult};
use crate::config::{EstimatorKind, StudyConfig};
use crate::error::StudyError;
use crate::items::{Feature, ItemCatalog, Voucher};
use crate::oracle::{calibrate_with_oracle, collect_responses, CashChoiceOracle, RankingOracle};
use crate::response::{exposure_counts, ExposureSummary, Response};
use crate::scoring::{score_legacy, LegacyScoreReport};
use crate::stability::{
    compute_exposure_task_plan, evaluate_stability_gates, ExposureTaskPlan, GateInputs, StabilityGateReport,
};
use crate::trace::TraceSink;
use crate::vouchers::generate_vouchers;

// ---------------------------------------------------------------------
//  Planning
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyPlan {
    pub features: Vec<Feature>,
    pub vouchers: Vec<Voucher>,
    pub exposure_plan: ExposureTaskPlan,
    /// Assembly parameters actually used, after applying the exposure plan.
    pub assembly: AssemblyParams,
    pub choice_sets: ChoiceSetPlan,
    pub fingerprint: String,
}

impl StudyPlan {
    pub fn catalog(&self) -> ItemCatalog {
        ItemCatalog::new(self.features.clone(), self.vouchers.clone())
    }

    pub fn sets(&self) -> &[ChoiceSet] {
        &self.choice_sets.sets
    }
}

/// Vouchers, exposure plan and the initial task set for `features`.
pub fn prepare_study(features: &[Feature], config: &StudyConfig) -> StudyPlan {
    let costs: Vec<f64> = features.iter().map(|f| f.cost).collect();
    let vouchers = if config.use_vouchers && !features.is_empty() {
        generate_vouchers(&costs, &config.vouchers)
    } else {
        Vec::new()
    };

    let distinct = features
        .iter()
        .map(|f| f.id.as_str())
        .collect::<HashSet<_>>()
        .len();
    let exposure_plan = compute_exposure_task_plan(&config.exposure_input(distinct, vouchers.len()));

    let mut assembly = config.assembly.clone();
    if config.plan_appearances && exposure_plan.recommended_appearances > 0 {
        assembly.appearances = exposure_plan.recommended_appearances;
    }
    let choice_sets = assemble_choice_sets(features, &vouchers, &assembly);
    let fingerprint = choice_sets.fingerprint();

    info!(
        features = distinct,
        vouchers = vouchers.len(),
        min_tasks = exposure_plan.min_tasks,
        tasks = choice_sets.sets.len(),
        coverage = choice_sets.diagnostics.coverage,
        "study prepared"
    );

    StudyPlan {
        features: features.to_vec(),
        vouchers,
        exposure_plan,
        assembly,
        choice_sets,
        fingerprint,
    }
}

/// Append `additional` tasks, leaving existing tasks untouched.
pub fn extend_study(plan: &StudyPlan, additional: usize) -> StudyPlan {
    let choice_sets = extend_choice_sets(
        &plan.choice_sets,
        &plan.features,
        &plan.vouchers,
        additional,
        &plan.assembly,
    );
    StudyPlan {
        fingerprint: choice_sets.fingerprint(),
        choice_sets,
        ..plan.clone()
    }
}

// ---------------------------------------------------------------------
//  Estimation
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyReport {
    pub estimator: EstimatorKind,
    /// Headline WTP per feature from the configured estimator. For the BWS
    /// model this is the WTP of the mean-centred utilities; the voucher-anchored
    /// values stay available on `bws.anchored_wtp`.
    pub wtp: BTreeMap<String, f64>,
    #[serde(default)]
    pub bws: Option<BwsFitResult>,
    #[serde(default)]
    pub bootstrap: Option<BootstrapReport>,
    #[serde(default)]
    pub legacy: Option<LegacyScoreReport>,
    pub repeatability: RepeatabilityReport,
    pub exposure: ExposureSummary,
    pub gates: StabilityGateReport,
}

fn estimate(plan: &StudyPlan, responses: &[Response], config: &StudyConfig, with_bootstrap: bool) -> StudyReport {
    let catalog = plan.catalog();
    let sets = plan.sets();

    let (wtp, bws, bootstrap, legacy) = match config.estimator {
        EstimatorKind::BwsMnl => {
            let observations = build_observations(sets, responses, &catalog);
            let fit = fit_observation_set(&observations, &catalog, &config.fit);
            let boot = (with_bootstrap && config.bootstrap.samples > 0)
                .then(|| bootstrap_bws(&observations, &config.fit, &config.bootstrap));
            (fit.wtp.clone(), Some(fit), boot, None)
        }
        EstimatorKind::LegacyBorda => {
            let scores = score_legacy(sets, responses, &catalog);
            (scores.perceived_values(), None, None, Some(scores))
        }
    };

    let repeatability = compute_repeatability(sets, responses);
    let exposure = exposure_counts(sets, responses, &catalog);
    let gates = evaluate_stability_gates(
        &GateInputs {
            answered_tasks: exposure.answered_tasks,
            repeat_tasks_answered: exposure.repeat_tasks_answered,
            joint_repeatability: repeatability.joint(),
            failure_rate: exposure.failure_rate,
            feature_exposure: exposure.feature_exposure.clone(),
            voucher_exposure: exposure.voucher_exposure.clone(),
        },
        &config.gates,
    );

    StudyReport {
        estimator: config.estimator,
        wtp,
        bws,
        bootstrap,
        legacy,
        repeatability,
        exposure,
        gates,
    }
}

/// Full estimation pass over a response log, bootstrap included.
pub fn estimate_study(plan: &StudyPlan, responses: &[Response], config: &StudyConfig) -> StudyReport {
    estimate(plan, responses, config, true)
}

/// Tasks to add so the failing gates can be met, at least `extension_batch`.
pub fn extension_size(plan: &StudyPlan, report: &StudyReport, config: &StudyConfig) -> usize {
    let gates = &report.gates;
    let t = &gates.thresholds;
    let k = plan.assembly.features_per_task.max(1);
    let features = report.exposure.feature_exposure.len();

    let task_gap = t.min_tasks.saturating_sub(gates.achieved.answered_tasks);
    let feature_gap = gates
        .achieved
        .min_feature_exposure
        .map(|least| (t.min_feature_exposure.saturating_sub(least) * features).div_ceil(k))
        .unwrap_or(0);
    let voucher_gap = gates
        .achieved
        .min_voucher_exposure
        .map(|least| t.min_voucher_exposure.saturating_sub(least) * plan.vouchers.len())
        .unwrap_or(0);
    let repeat_gap = {
        let missing = t.min_repeat_tasks.saturating_sub(gates.achieved.repeat_tasks_answered);
        let rf = plan.assembly.repeat_fraction;
        if missing == 0 || rf <= 0.0 {
            0
        } else {
            (missing as f64 * (1.0 + rf) / rf).ceil() as usize
        }
    };

    config
        .extension_batch
        .max(task_gap)
        .max(feature_gap)
        .max(voucher_gap)
        .max(repeat_gap)
}

// ---------------------------------------------------------------------
//  Async run
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyStopReason {
    GatesMet,
    MaxRoundsReached,
    Cancelled,
    NoTasks,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyOutcome {
    pub plan: StudyPlan,
    pub responses: Vec<Response>,
    pub report: StudyReport,
    /// Extension rounds performed after the initial collection.
    pub rounds: usize,
    pub stop_reason: StudyStopReason,
}

/// Collect, estimate and extend until the gates pass, the extension rounds
/// run out, or `cancel` is raised.
pub async fn run_study(
    oracle: &dyn RankingOracle,
    features: &[Feature],
    config: &StudyConfig,
    cancel: Option<&AtomicBool>,
    trace: Option<&dyn TraceSink>,
) -> Result<StudyOutcome, StudyError> {
    config.validate()?;
    let mut plan = prepare_study(features, config);
    let mut responses: Vec<Response> = Vec::new();
    let mut asked: HashSet<usize> = HashSet::new();
    let mut rounds = 0;

    let stop_reason = loop {
        let pending: Vec<ChoiceSet> = plan
            .sets()
            .iter()
            .filter(|s| !asked.contains(&s.id))
            .cloned()
            .collect();
        if pending.is_empty() {
            break StudyStopReason::NoTasks;
        }

        let outcome = collect_responses(oracle, &pending, &config.collection, cancel, trace).await?;
        asked.extend(outcome.responses.iter().map(|r| r.task_id));
        responses.extend(outcome.responses);

        let report = estimate(&plan, &responses, config, false);
        info!(
            round = rounds,
            answered = report.exposure.answered_tasks,
            failed = report.exposure.failed_tasks,
            gates_met = report.gates.gates_met,
            "study round finished"
        );

        if outcome.cancelled {
            break StudyStopReason::Cancelled;
        }
        if report.gates.gates_met {
            break StudyStopReason::GatesMet;
        }
        if rounds >= config.max_extension_rounds {
            break StudyStopReason::MaxRoundsReached;
        }
        let additional = extension_size(&plan, &report, config);
        plan = extend_study(&plan, additional);
        rounds += 1;
    };

    let report = estimate_study(&plan, &responses, config);
    info!(?stop_reason, rounds, gates_met = report.gates.gates_met, "study finished");
    Ok(StudyOutcome {
        plan,
        responses,
        report,
        rounds,
        stop_reason,
    })
}

/// Calibrate each feature in turn against a cash oracle.
pub async fn calibrate_features(
    oracle: &dyn CashChoiceOracle,
    feature_ids: &[String],
    config: &StudyConfig,
    cancel: Option<&AtomicBool>,
    trace: Option<&dyn TraceSink>,
) -> Result<BTreeMap<String, CalibrationResult>, StudyError> {
    let mut out = BTreeMap::new();
    for id in feature_ids {
        let result = calibrate_with_oracle(
            oracle,
            id,
            config.calibration.clone(),
            &config.collection,
            cancel,
            trace,
        )
        .await?;
        out.insert(id.clone(), result);
    }
    Ok(out)
}

/// Blend model WTP with calibration midpoints, feature by feature.
pub fn blend_report_wtp(
    model: &BTreeMap<String, f64>,
    calibrations: &BTreeMap<String, CalibrationResult>,
    weight: f64,
) -> BTreeMap<String, f64> {
    model
        .iter()
        .map(|(id, &wtp)| {
            let blended = calibrations
                .get(id)
                .map_or(wtp, |c| blend_wtp(wtp, c, weight));
            (id.clone(), blended)
        })
        .collect()
}
