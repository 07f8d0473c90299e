//! Monetary anchor levels derived from feature costs.

use serde::{Deserialize, Serialize};

use crate::items::Voucher;

/// Lower positive log-grid bound, as a fraction of the max, when `min` is 0.
const LOG_FLOOR_FRACTION: f64 = 0.02;
const DEFAULT_LEVELS: usize = 7;
const DEFAULT_MAX_FLOOR: f64 = 50.0;
const DEFAULT_MAX_COST_MULTIPLIER: f64 = 1.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoucherSpacing {
    #[default]
    Log,
    Linear,
}

/// Explicit overrides; unset fields fall back to the cost-derived defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoucherGridOptions {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub levels: Option<usize>,
    pub spacing: Option<VoucherSpacing>,
    pub include_zero: Option<bool>,
}

/// Fully resolved grid bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoucherGrid {
    pub min: f64,
    pub max: f64,
    pub levels: usize,
    pub spacing: VoucherSpacing,
    pub include_zero: bool,
}

impl VoucherGridOptions {
    /// Defaults: min 0, max `max(50, 1.2 × highest cost)`, 7 levels, log, zero included.
    pub fn resolve(&self, feature_costs: &[f64]) -> VoucherGrid {
        let max_cost = feature_costs
            .iter()
            .copied()
            .filter(|c| c.is_finite())
            .fold(0.0, f64::max);
        let min = self.min.filter(|m| m.is_finite()).unwrap_or(0.0).max(0.0);
        let max = self
            .max
            .filter(|m| m.is_finite())
            .unwrap_or_else(|| DEFAULT_MAX_FLOOR.max(DEFAULT_MAX_COST_MULTIPLIER * max_cost))
            .max(min);
        VoucherGrid {
            min,
            max,
            levels: self.levels.unwrap_or(DEFAULT_LEVELS).max(1),
            spacing: self.spacing.unwrap_or_default(),
            include_zero: self.include_zero.unwrap_or(true),
        }
    }
}

/// Strictly increasing, integer-rounded voucher amounts.
///
/// A log grid that collapses under rounding (fewer distinct levels than
/// requested) is replaced by a linear grid over the same bounds.
pub fn voucher_amounts(grid: &VoucherGrid) -> Vec<f64> {
    match grid.spacing {
        VoucherSpacing::Log => {
            let amounts = log_grid(grid);
            if amounts.len() < grid.levels {
                linear_grid(grid)
            } else {
                amounts
            }
        }
        VoucherSpacing::Linear => linear_grid(grid),
    }
}

fn log_grid(grid: &VoucherGrid) -> Vec<f64> {
    let mut raw = Vec::with_capacity(grid.levels);
    let positive_levels = if grid.include_zero {
        raw.push(0.0);
        grid.levels.saturating_sub(1)
    } else {
        grid.levels
    };

    let lo = if grid.min > 0.0 {
        grid.min
    } else {
        (grid.max * LOG_FLOOR_FRACTION).max(1.0)
    };
    let hi = grid.max.max(lo);
    match positive_levels {
        0 => {}
        1 => raw.push(hi),
        n => {
            let ratio = hi / lo;
            for i in 0..n {
                let t = i as f64 / (n - 1) as f64;
                raw.push(lo * ratio.powf(t));
            }
        }
    }
    finalize(raw, grid.include_zero)
}

fn linear_grid(grid: &VoucherGrid) -> Vec<f64> {
    let mut raw = Vec::with_capacity(grid.levels);
    let (start, n) = match (grid.include_zero, grid.min > 0.0) {
        (true, true) => {
            raw.push(0.0);
            (grid.min, grid.levels.saturating_sub(1))
        }
        (true, false) => (0.0, grid.levels),
        (false, true) => (grid.min, grid.levels),
        (false, false) => (grid.max / grid.levels as f64, grid.levels),
    };
    match n {
        0 => {}
        1 => raw.push(grid.max),
        n => {
            let step = (grid.max - start) / (n - 1) as f64;
            for i in 0..n {
                raw.push(start + step * i as f64);
            }
        }
    }
    finalize(raw, grid.include_zero)
}

fn finalize(raw: Vec<f64>, include_zero: bool) -> Vec<f64> {
    let mut out: Vec<f64> = raw
        .into_iter()
        .filter(|v| v.is_finite())
        .map(|v| v.round().max(0.0))
        .filter(|&v| include_zero || v > 0.0)
        .collect();
    out.sort_by(|a, b| a.total_cmp(b));
    out.dedup();
    out
}

/// One voucher item per amount, ids encoding level and amount.
pub fn vouchers_from_amounts(amounts: &[f64]) -> Vec<Voucher> {
    let n = amounts.len();
    amounts
        .iter()
        .enumerate()
        .map(|(level, &amount)| Voucher {
            id: format!("voucher_L{level}_{amount:.0}"),
            amount,
            level,
            description: format!(
                "Cash voucher worth ${amount:.0} (level {} of {n})",
                level + 1
            ),
        })
        .collect()
}

/// Cost-derived voucher grid as catalog items.
pub fn generate_vouchers(feature_costs: &[f64], options: &VoucherGridOptions) -> Vec<Voucher> {
    let grid = options.resolve(feature_costs);
    vouchers_from_amounts(&voucher_amounts(&grid))
}
