//! Study configuration, loaded from JSON with every field defaulted.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::assembler::AssemblyParams;
use crate::bootstrap::BootstrapOptions;
use crate::bws::BwsFitOptions;
use crate::calibration::CalibrationParams;
use crate::error::ConfigError;
use crate::oracle::CollectOptions;
use crate::stability::{ExposurePlanInput, GateThresholds};
use crate::vouchers::VoucherGridOptions;

/// Which estimator produces the headline WTP for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    #[default]
    BwsMnl,
    LegacyBorda,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureTargets {
    pub target_feature_exposures: usize,
    pub target_voucher_exposures_per_level: usize,
    pub min_tasks_floor: usize,
    pub max_tasks_cap: Option<usize>,
}

impl Default for ExposureTargets {
    fn default() -> Self {
        Self {
            target_feature_exposures: 12,
            target_voucher_exposures_per_level: 10,
            min_tasks_floor: 0,
            max_tasks_cap: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyConfig {
    pub assembly: AssemblyParams,
    pub vouchers: VoucherGridOptions,
    /// Mix one voucher into every task.
    pub use_vouchers: bool,
    pub exposure: ExposureTargets,
    /// Replace `assembly.appearances` with the exposure plan's recommendation.
    pub plan_appearances: bool,
    pub estimator: EstimatorKind,
    pub fit: BwsFitOptions,
    pub bootstrap: BootstrapOptions,
    pub gates: GateThresholds,
    pub collection: CollectOptions,
    pub calibration: CalibrationParams,
    /// Calibration share when blending with model WTP.
    pub calibration_weight: f64,
    /// Extension rounds after the first collection before giving up.
    pub max_extension_rounds: usize,
    /// Minimum tasks added per extension round.
    pub extension_batch: usize,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            assembly: AssemblyParams::default(),
            vouchers: VoucherGridOptions::default(),
            use_vouchers: true,
            exposure: ExposureTargets::default(),
            plan_appearances: true,
            estimator: EstimatorKind::BwsMnl,
            fit: BwsFitOptions::default(),
            bootstrap: BootstrapOptions::default(),
            gates: GateThresholds::default(),
            collection: CollectOptions::default(),
            calibration: CalibrationParams::default(),
            calibration_weight: 0.5,
            max_extension_rounds: 3,
            extension_batch: 10,
        }
    }
}

fn check(ok: bool, message: &str) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::invalid(message))
    }
}

fn unit_interval(x: f64) -> bool {
    (0.0..=1.0).contains(&x)
}

impl StudyConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let a = &self.assembly;
        check(a.features_per_task >= 2, "assembly.features_per_task must be >= 2")?;
        check(
            a.repeat_fraction.is_finite() && a.repeat_fraction >= 0.0,
            "assembly.repeat_fraction must be a finite value >= 0",
        )?;
        check(
            self.vouchers.levels != Some(0),
            "vouchers.levels must be >= 1 when set",
        )?;
        if let (Some(min), Some(max)) = (self.vouchers.min, self.vouchers.max) {
            check(min <= max, "vouchers.min must not exceed vouchers.max")?;
        }

        let f = &self.fit;
        check(
            f.money_scale.is_finite() && f.money_scale > 0.0,
            "fit.money_scale must be > 0",
        )?;
        check(
            f.learning_rate.is_finite() && f.learning_rate > 0.0,
            "fit.learning_rate must be > 0",
        )?;
        check(f.ridge.is_finite() && f.ridge >= 0.0, "fit.ridge must be >= 0")?;
        check(
            f.log_beta_min.is_finite() && f.log_beta_max.is_finite() && f.log_beta_min < f.log_beta_max,
            "fit.log_beta_min must be below fit.log_beta_max",
        )?;

        let g = &self.gates;
        check(
            unit_interval(g.min_repeatability),
            "gates.min_repeatability must be within [0, 1]",
        )?;
        check(
            unit_interval(g.max_failure_rate),
            "gates.max_failure_rate must be within [0, 1]",
        )?;

        let c = &self.calibration;
        check(
            c.min_amount.is_finite() && c.max_amount.is_finite() && 0.0 <= c.min_amount && c.min_amount <= c.max_amount,
            "calibration bounds must satisfy 0 <= min_amount <= max_amount",
        )?;
        check(
            unit_interval(self.calibration_weight),
            "calibration_weight must be within [0, 1]",
        )?;

        check(
            self.collection.max_attempts >= 1,
            "collection.max_attempts must be >= 1",
        )?;
        check(
            self.collection.concurrency >= 1,
            "collection.concurrency must be >= 1",
        )?;
        Ok(())
    }

    /// Exposure-plan inputs for `feature_count` features and `voucher_levels` levels.
    pub fn exposure_input(&self, feature_count: usize, voucher_levels: usize) -> ExposurePlanInput {
        ExposurePlanInput {
            feature_count,
            voucher_level_count: voucher_levels,
            target_feature_exposures: self.exposure.target_feature_exposures,
            target_voucher_exposures_per_level: self.exposure.target_voucher_exposures_per_level,
            repeat_fraction: self.assembly.repeat_fraction,
            features_per_task: self.assembly.features_per_task,
            min_tasks_floor: self.exposure.min_tasks_floor,
            max_tasks_cap: self.exposure.max_tasks_cap,
        }
    }
}
