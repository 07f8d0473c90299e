use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;

use maxdiff_harness::study::{calibrate_features, estimate_study, prepare_study, run_study, StudyStopReason};
use maxdiff_harness::bws::wtp_from_utility;
use maxdiff_harness::{
    EstimatorKind, Feature, ItemCatalog, StudyConfig, SyntheticConfig, SyntheticRespondent,
};

fn features() -> Vec<Feature> {
    vec![
        Feature::new("f1", "Heated seats", 60.0),
        Feature::new("f2", "Panoramic roof", 300.0),
        Feature::new("f3", "Premium audio", 150.0),
        Feature::new("f4", "Floor mats", 10.0),
        Feature::new("f5", "Tow hitch", 90.0),
        Feature::new("f6", "Roof rails", 40.0),
    ]
}

fn quiet_config() -> StudyConfig {
    let mut config = StudyConfig::default();
    config.collection.inter_call_delay_ms = 0;
    config.collection.backoff_base_ms = 0;
    config.collection.concurrency = 4;
    config.bootstrap.samples = 16;
    config.fit.max_iterations = 800;
    config
}

fn respondent(config: &StudyConfig, noise: f64) -> SyntheticRespondent {
    let plan = prepare_study(&features(), config);
    let catalog = ItemCatalog::new(plan.features.clone(), plan.vouchers.clone());
    SyntheticRespondent::from_wtp(
        &catalog,
        &BTreeMap::new(),
        SyntheticConfig {
            noise_scale: noise,
            ..SyntheticConfig::default()
        },
    )
}

#[tokio::test]
async fn consistent_respondent_meets_gates_in_first_round() {
    let config = quiet_config();
    let oracle = respondent(&config, 0.0);
    let outcome = run_study(&oracle, &features(), &config, None, None).await.unwrap();

    assert_eq!(outcome.stop_reason, StudyStopReason::GatesMet);
    assert_eq!(outcome.rounds, 0);
    assert_eq!(outcome.responses.len(), outcome.plan.sets().len());
    let report = &outcome.report;
    assert!(report.gates.gates_met, "{:?}", report.gates.reasons);
    assert_eq!(report.repeatability.joint(), Some(1.0));
    assert_eq!(report.exposure.failed_tasks, 0);
    assert!(report.bootstrap.is_some());

    let wtp = &report.wtp;
    assert!(wtp["f2"] > wtp["f3"]);
    assert!(wtp["f3"] > wtp["f5"]);
    assert!(wtp["f1"] > wtp["f4"]);
}

#[tokio::test]
async fn unreachable_gates_exhaust_extension_rounds() {
    let mut config = quiet_config();
    config.gates.min_repeatability = 1.0;
    config.max_extension_rounds = 2;
    config.extension_batch = 5;
    config.bootstrap.samples = 0;
    let oracle = respondent(&config, 1.0);

    let initial = prepare_study(&features(), &config).sets().len();
    let outcome = run_study(&oracle, &features(), &config, None, None).await.unwrap();
    assert_eq!(outcome.stop_reason, StudyStopReason::MaxRoundsReached);
    assert_eq!(outcome.rounds, 2);
    assert!(outcome.plan.sets().len() > initial);
    assert_eq!(outcome.responses.len(), outcome.plan.sets().len());
    assert_eq!(&outcome.plan.sets()[..initial], prepare_study(&features(), &config).sets());
    assert!(outcome.report.bootstrap.is_none());
}

#[tokio::test]
async fn cancelled_study_stops_after_first_collection() {
    let config = quiet_config();
    let oracle = respondent(&config, 1.0);
    let cancel = AtomicBool::new(true);
    let outcome = run_study(&oracle, &features(), &config, Some(&cancel), None).await.unwrap();
    assert_eq!(outcome.stop_reason, StudyStopReason::Cancelled);
    assert!(outcome.responses.is_empty());
    assert!(!outcome.report.gates.gates_met);
}

#[tokio::test]
async fn invalid_config_is_rejected_before_any_call() {
    let mut config = quiet_config();
    config.calibration_weight = 2.0;
    let oracle = respondent(&quiet_config(), 1.0);
    let err = run_study(&oracle, &features(), &config, None, None).await.unwrap_err();
    assert!(err.to_string().contains("calibration_weight"));
}

#[test]
fn legacy_estimator_reports_perceived_values() {
    let mut config = quiet_config();
    config.estimator = EstimatorKind::LegacyBorda;
    let plan = prepare_study(&features(), &config);
    let oracle = respondent(&config, 0.0);
    let responses = oracle.respond_all(plan.sets(), "sim");
    let report = estimate_study(&plan, &responses, &config);
    assert!(report.bws.is_none());
    let legacy = report.legacy.as_ref().unwrap();
    assert_eq!(legacy.features["f2"].normalized, 1.0);
    assert_eq!(report.wtp, legacy.perceived_values());
}

#[tokio::test]
async fn calibration_pass_covers_every_feature() {
    let config = quiet_config();
    let oracle = respondent(&config, 0.0);
    let ids: Vec<String> = features().iter().map(|f| f.id.clone()).collect();
    let results = calibrate_features(&oracle, &ids, &config, None, None).await.unwrap();
    assert_eq!(results.len(), 6);
    let roof = &results["f2"];
    assert!(roof.straddled);
    assert!(roof.lower <= 300.0 && 300.0 <= roof.upper);
}

#[test]
fn bws_headline_wtp_comes_from_centred_utilities() {
    let mut config = quiet_config();
    config.bootstrap.samples = 0;
    let plan = prepare_study(&features(), &config);
    let oracle = respondent(&config, 1.0);
    let responses = oracle.respond_all(plan.sets(), "sim");
    let report = estimate_study(&plan, &responses, &config);

    let fit = report.bws.as_ref().unwrap();
    assert_eq!(report.wtp, fit.wtp);
    for (id, &u) in &fit.utilities {
        let expected = wtp_from_utility(u, fit.beta, fit.transform, fit.money_scale);
        assert!((report.wtp[id] - expected).abs() < 1e-9, "{id}");
    }
    let mean: f64 = fit.utilities.values().sum::<f64>() / fit.utilities.len() as f64;
    assert!(mean.abs() < 1e-9);
}
