#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use maxdiff_harness::items::ItemCatalog;
use maxdiff_harness::study::{blend_report_wtp, calibrate_features, estimate_study, prepare_study, run_study, StudyPlan};
use maxdiff_harness::vouchers::VoucherSpacing;
use maxdiff_harness::{
    compute_exposure_task_plan, generate_vouchers, CalibrationParams, Feature, JsonlTraceSink, Response,
    StudyConfig, SyntheticConfig, SyntheticRespondent, TraceSink,
};

#[derive(Parser)]
#[command(name = "maxdiff", version, about = "MaxDiff willingness-to-pay harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a voucher grid from feature costs
    Vouchers {
        /// Comma-separated feature costs
        #[arg(long, value_delimiter = ',')]
        costs: Vec<f64>,
        #[arg(long)]
        min: Option<f64>,
        #[arg(long)]
        max: Option<f64>,
        #[arg(long)]
        levels: Option<usize>,
        /// Use evenly spaced amounts instead of a log grid
        #[arg(long)]
        linear: bool,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Build a study plan (vouchers, exposure plan, choice sets) from a feature list
    Design {
        /// JSON array of features
        #[arg(long)]
        features: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Recommend task counts for exposure targets
    Plan {
        #[arg(long)]
        features: usize,
        #[arg(long, default_value_t = 7)]
        voucher_levels: usize,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Estimate WTP from a plan and a response log (JSON array or JSONL)
    Estimate {
        #[arg(long)]
        plan: PathBuf,
        #[arg(long)]
        responses: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Calibrate a synthetic feature of known value against cash
    CalibrateSim {
        /// True value of the feature
        #[arg(long)]
        value: f64,
        #[arg(long, default_value_t = 10.0)]
        min: f64,
        #[arg(long, default_value_t = 1000.0)]
        max: f64,
        #[arg(long, default_value_t = 8)]
        steps: usize,
        #[arg(long, default_value_t = 0.0)]
        noise: f64,
        #[arg(long, default_value_t = 1337)]
        seed: u64,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run a full study against a synthetic respondent
    Simulate {
        /// JSON array of features
        #[arg(long)]
        features: PathBuf,
        /// JSON object of true WTP per feature id (defaults to feature cost)
        #[arg(long)]
        truth: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 1.0)]
        beta: f64,
        #[arg(long, default_value_t = 1.0)]
        noise: f64,
        #[arg(long, default_value_t = 1337)]
        seed: u64,
        /// Also calibrate every feature against cash and blend
        #[arg(long)]
        calibrate: bool,
        /// JSONL trace of every oracle call
        #[arg(long)]
        trace: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct CalibrateSimOutput {
    value: f64,
    calibration: maxdiff_harness::CalibrationResult,
}

#[derive(Serialize)]
struct SimulateOutput {
    outcome: maxdiff_harness::StudyOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    calibrations: Option<BTreeMap<String, maxdiff_harness::CalibrationResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blended_wtp: Option<BTreeMap<String, f64>>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Vouchers {
            costs,
            min,
            max,
            levels,
            linear,
            out,
        } => {
            let options = maxdiff_harness::VoucherGridOptions {
                min,
                max,
                levels,
                spacing: linear.then_some(VoucherSpacing::Linear),
                include_zero: None,
            };
            let vouchers = generate_vouchers(&costs, &options);
            emit(out.as_deref(), &vouchers)?;
        }
        Commands::Design {
            features,
            config,
            out,
        } => {
            let features: Vec<Feature> = read_json(&features)?;
            let config = load_config(config.as_deref())?;
            let plan = prepare_study(&features, &config);
            emit(out.as_deref(), &plan)?;
        }
        Commands::Plan {
            features,
            voucher_levels,
            config,
            out,
        } => {
            let config = load_config(config.as_deref())?;
            let plan = compute_exposure_task_plan(&config.exposure_input(features, voucher_levels));
            emit(out.as_deref(), &plan)?;
        }
        Commands::Estimate {
            plan,
            responses,
            config,
            out,
        } => {
            let plan: StudyPlan = read_json(&plan)?;
            let responses = read_responses(&responses)?;
            let config = load_config(config.as_deref())?;
            let report = estimate_study(&plan, &responses, &config);
            emit(out.as_deref(), &report)?;
        }
        Commands::CalibrateSim {
            value,
            min,
            max,
            steps,
            noise,
            seed,
            out,
        } => {
            if !(value.is_finite() && value >= 0.0) {
                return Err("--value must be a finite amount >= 0".into());
            }
            let catalog = ItemCatalog::new(vec![Feature::new("feature", "Feature", value)], Vec::new());
            let respondent = SyntheticRespondent::from_wtp(
                &catalog,
                &BTreeMap::new(),
                SyntheticConfig {
                    noise_scale: noise,
                    seed,
                    ..SyntheticConfig::default()
                },
            );
            let params = CalibrationParams {
                min_amount: min,
                max_amount: max,
                search_steps: steps,
                ..CalibrationParams::default()
            };
            let calibration = maxdiff_harness::calibrate(params, |amount, _, _| {
                respondent
                    .compare_with_cash("feature", amount)
                    .unwrap_or(maxdiff_harness::CashChoice::B)
            });
            emit(out.as_deref(), &CalibrateSimOutput { value, calibration })?;
        }
        Commands::Simulate {
            features,
            truth,
            config,
            beta,
            noise,
            seed,
            calibrate,
            trace,
            out,
        } => {
            let features: Vec<Feature> = read_json(&features)?;
            let truth: BTreeMap<String, f64> = match truth {
                Some(path) => read_json(&path)?,
                None => BTreeMap::new(),
            };
            let mut config = load_config(config.as_deref())?;
            config.collection.inter_call_delay_ms = 0;
            config.collection.backoff_base_ms = 0;

            let synthetic = SyntheticConfig {
                beta,
                transform: config.fit.transform,
                money_scale: config.fit.money_scale,
                noise_scale: noise,
                seed,
                ..SyntheticConfig::default()
            };
            let costs: Vec<f64> = features.iter().map(|f| f.cost).collect();
            let vouchers = if config.use_vouchers {
                generate_vouchers(&costs, &config.vouchers)
            } else {
                Vec::new()
            };
            let catalog = ItemCatalog::new(features.clone(), vouchers);
            let respondent = SyntheticRespondent::from_wtp(&catalog, &truth, synthetic);

            let (trace_sink, trace_worker) = if let Some(path) = trace {
                let (sink, worker) = JsonlTraceSink::new(path)?;
                (Some(sink), Some(worker))
            } else {
                (None, None)
            };
            let trace_ref = trace_sink.as_ref().map(|sink| sink as &dyn TraceSink);

            let outcome = run_study(&respondent, &features, &config, None, trace_ref).await?;
            let (calibrations, blended_wtp) = if calibrate {
                let ids: Vec<String> = features.iter().map(|f| f.id.clone()).collect();
                let calibrations = calibrate_features(&respondent, &ids, &config, None, trace_ref).await?;
                let blended = blend_report_wtp(&outcome.report.wtp, &calibrations, config.calibration_weight);
                (Some(calibrations), Some(blended))
            } else {
                (None, None)
            };

            drop(trace_sink);
            if let Some(worker) = trace_worker {
                worker.join()?;
            }

            emit(
                out.as_deref(),
                &SimulateOutput {
                    outcome,
                    calibrations,
                    blended_wtp,
                },
            )?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<StudyConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(StudyConfig::from_path(path)?),
        None => Ok(StudyConfig::default()),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// A JSON array of responses, or one response per line.
fn read_responses(path: &Path) -> Result<Vec<Response>, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    if raw.trim_start().starts_with('[') {
        return Ok(serde_json::from_str(&raw)?);
    }
    let mut out = Vec::new();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        out.push(serde_json::from_str(line)?);
    }
    Ok(out)
}

/// Pretty JSON to `out`, or stdout when no path is given.
fn emit<T: Serialize>(out: Option<&Path>, value: &T) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(value)?;
    match out {
        Some(path) => std::fs::write(path, json)?,
        None => {
            let mut stdout = io::stdout().lock();
            writeln!(stdout, "{json}")?;
        }
    }
    Ok(())
}
