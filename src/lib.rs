#![forbid(unsafe_code)]

//! # maxdiff-harness
//!
//! Willingness-to-pay estimation from best–worst (MaxDiff) choice tasks.
//!
//! Each task shows a few product features next to one cash voucher and asks
//! for the most and least valuable item. Vouchers put money on the same
//! utility scale as the features, so a best–worst multinomial logit fitted to
//! the answers yields a price for every feature. Designs are near-balanced
//! incomplete blocks with embedded repeat tasks; bootstrap intervals and
//! repeatability feed stability gates that decide when a study has enough
//! data. A bisection probe against cash offers calibrates individual features.
//!
//! Respondents sit behind the [`RankingOracle`] and [`CashChoiceOracle`]
//! traits; [`SyntheticRespondent`] answers from known utilities.

pub mod assembler;
pub mod bootstrap;
pub mod bws;
pub mod calibration;
pub mod config;
pub mod design;
pub mod error;
pub mod items;
pub mod oracle;
pub mod response;
pub mod rng;
pub mod scoring;
pub mod simulate;
pub mod stability;
pub mod study;
pub mod trace;
pub mod vouchers;

pub use assembler::{assemble_choice_sets, extend_choice_sets, AssemblyParams, ChoiceSet, ChoiceSetPlan};
pub use bootstrap::{bootstrap_bws, compute_repeatability, BootstrapReport, RepeatabilityReport};
pub use bws::{fit_bws_mnl_money, BwsFitOptions, BwsFitResult, MoneyTransform};
pub use calibration::{blend_wtp, calibrate, CalibrationParams, CalibrationResult, CashChoice};
pub use config::{EstimatorKind, StudyConfig};
pub use design::{build_design, extend_design, Design, DesignMode, DesignParams};
pub use error::{ConfigError, OracleError, StudyError};
pub use items::{Feature, ItemCatalog, Voucher};
pub use oracle::{
    calibrate_with_oracle, collect_responses, CashChoiceOracle, CollectOptions, RankingOracle, RankingPayload,
};
pub use response::{exposure_counts, Response};
pub use scoring::{score_legacy, LegacyScoreReport};
pub use simulate::{SyntheticConfig, SyntheticRespondent};
pub use stability::{compute_exposure_task_plan, evaluate_stability_gates, ExposureTaskPlan, StabilityGateReport};
pub use study::{estimate_study, prepare_study, run_study, StudyOutcome, StudyPlan, StudyReport};
pub use trace::{JsonlTraceSink, OracleTrace, TraceError, TraceSink, TraceWorker};
pub use vouchers::{generate_vouchers, VoucherGridOptions};
