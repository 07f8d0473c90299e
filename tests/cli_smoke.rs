use std::process::Command;

use maxdiff_harness::study::StudyPlan;
use maxdiff_harness::{ExposureTaskPlan, Response, StudyReport, SyntheticConfig, SyntheticRespondent, Voucher};
use tempfile::tempdir;

fn maxdiff() -> Command {
    Command::new(env!("CARGO_BIN_EXE_maxdiff"))
}

const FEATURES: &str = r#"[
    {"id": "f1", "name": "Heated seats", "cost": 60},
    {"id": "f2", "name": "Panoramic roof", "cost": 300},
    {"id": "f3", "name": "Premium audio", "cost": 150},
    {"id": "f4", "name": "Floor mats", "cost": 10}
]"#;

#[test]
fn vouchers_command_prints_a_grid() {
    let output = maxdiff()
        .args(["vouchers", "--costs", "100,250", "--levels", "5"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let vouchers: Vec<Voucher> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(vouchers.len(), 5);
    assert_eq!(vouchers[0].amount, 0.0);
    assert!(vouchers.windows(2).all(|w| w[0].amount < w[1].amount));
    assert_eq!(vouchers.last().unwrap().amount, 300.0);
}

#[test]
fn plan_command_reports_task_counts() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("plan.json");
    let status = maxdiff()
        .args(["plan", "--features", "12", "--voucher-levels", "7"])
        .arg("--out")
        .arg(&out)
        .status()
        .unwrap();
    assert!(status.success());
    let plan: ExposureTaskPlan = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(plan.tasks_for_features, 48);
    assert_eq!(plan.tasks_for_vouchers, 70);
    assert_eq!(plan.min_tasks, 70);
}

#[test]
fn design_then_estimate_round_trip() {
    let dir = tempdir().unwrap();
    let features = dir.path().join("features.json");
    let plan_path = dir.path().join("study.json");
    let responses_path = dir.path().join("responses.jsonl");
    let report_path = dir.path().join("report.json");
    let config_path = dir.path().join("config.json");
    std::fs::write(&features, FEATURES).unwrap();
    std::fs::write(&config_path, r#"{"bootstrap": {"samples": 8}, "fit": {"max_iterations": 400}}"#).unwrap();

    let status = maxdiff()
        .arg("design")
        .arg("--features")
        .arg(&features)
        .arg("--out")
        .arg(&plan_path)
        .status()
        .unwrap();
    assert!(status.success());
    let plan: StudyPlan = serde_json::from_str(&std::fs::read_to_string(&plan_path).unwrap()).unwrap();
    assert!(!plan.sets().is_empty());
    assert_eq!(plan.fingerprint, plan.choice_sets.fingerprint());

    let respondent = SyntheticRespondent::from_wtp(
        &plan.catalog(),
        &Default::default(),
        SyntheticConfig::default(),
    );
    let responses: Vec<Response> = respondent.respond_all(plan.sets(), "sim");
    let lines: Vec<String> = responses
        .iter()
        .map(|r| serde_json::to_string(r).unwrap())
        .collect();
    std::fs::write(&responses_path, lines.join("\n")).unwrap();

    let status = maxdiff()
        .arg("estimate")
        .arg("--plan")
        .arg(&plan_path)
        .arg("--responses")
        .arg(&responses_path)
        .arg("--config")
        .arg(&config_path)
        .arg("--out")
        .arg(&report_path)
        .status()
        .unwrap();
    assert!(status.success());
    let report: StudyReport = serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report.wtp.len(), 4);
    assert_eq!(report.exposure.answered_tasks, responses.len());
    assert_eq!(report.bootstrap.as_ref().map(|b| b.samples_requested), Some(8));
}

#[test]
fn calibrate_sim_brackets_the_value() {
    let output = maxdiff()
        .args(["calibrate-sim", "--value", "140", "--min", "10", "--max", "400"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let lower = value["calibration"]["lower"].as_f64().unwrap();
    let upper = value["calibration"]["upper"].as_f64().unwrap();
    assert!(lower <= 140.0 && 140.0 <= upper);
    assert_eq!(value["calibration"]["straddled"], serde_json::Value::Bool(true));
}

#[test]
fn simulate_writes_outcome_and_trace() {
    let dir = tempdir().unwrap();
    let features = dir.path().join("features.json");
    let out = dir.path().join("outcome.json");
    let trace = dir.path().join("trace.jsonl");
    let config = dir.path().join("config.json");
    std::fs::write(&features, FEATURES).unwrap();
    std::fs::write(
        &config,
        r#"{"bootstrap": {"samples": 4}, "fit": {"max_iterations": 300}, "max_extension_rounds": 0}"#,
    )
    .unwrap();

    let status = maxdiff()
        .arg("simulate")
        .arg("--features")
        .arg(&features)
        .arg("--config")
        .arg(&config)
        .args(["--noise", "0", "--calibrate"])
        .arg("--trace")
        .arg(&trace)
        .arg("--out")
        .arg(&out)
        .status()
        .unwrap();
    assert!(status.success());

    let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    assert!(value["outcome"]["report"]["wtp"]["f2"].is_number());
    assert!(value["blended_wtp"]["f2"].is_number());
    assert!(value["calibrations"]["f1"]["straddled"].as_bool().unwrap());

    let traces = maxdiff_harness::trace::read_traces(&trace).unwrap();
    let tasks = value["outcome"]["responses"].as_array().unwrap().len();
    assert!(traces.len() > tasks);
}

#[test]
fn bad_config_fails_cleanly() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("config.json");
    std::fs::write(&config, r#"{"assembly": {"repeat_fraction": -1}}"#).unwrap();
    let output = maxdiff()
        .args(["plan", "--features", "5"])
        .arg("--config")
        .arg(&config)
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("repeat_fraction"));
}
