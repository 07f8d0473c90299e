//! Synthetic respondents with known utilities.
//!
//! Answers follow the same sequential best-then-worst logit the estimator
//! fits: Gumbel noise on each utility, best = argmax, then worst = argmin of
//! fresh noise among the rest. Used for recovery tests and the CLI's dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::assembler::ChoiceSet;
use crate::bws::{utility_from_wtp, MoneyTransform};
use crate::calibration::{CalibrationPhase, CashChoice};
use crate::error::OracleError;
use crate::items::ItemCatalog;
use crate::oracle::{CashChoiceOracle, RankingOracle, RankingPayload};
use crate::response::Response;
use crate::rng::{seeded, DEFAULT_SEED};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub beta: f64,
    pub transform: MoneyTransform,
    pub money_scale: f64,
    /// Gumbel scale; 0 gives a deterministic respondent.
    pub noise_scale: f64,
    /// Probability that a ranking call fails with a retryable transport error.
    pub failure_rate: f64,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            beta: 1.0,
            transform: MoneyTransform::Log1p,
            money_scale: 1.0,
            noise_scale: 1.0,
            failure_rate: 0.0,
            seed: DEFAULT_SEED,
        }
    }
}

pub struct SyntheticRespondent {
    utilities: HashMap<String, f64>,
    config: SyntheticConfig,
    rng: Mutex<StdRng>,
}

fn gumbel(rng: &mut StdRng) -> f64 {
    let u: f64 = rng.gen_range(f64::EPSILON..1.0);
    -(-u.ln()).ln()
}

impl SyntheticRespondent {
    /// Respondent whose feature values are `true_wtp` (feature cost when absent).
    pub fn from_wtp(
        catalog: &ItemCatalog,
        true_wtp: &BTreeMap<String, f64>,
        config: SyntheticConfig,
    ) -> Self {
        let mut utilities = HashMap::new();
        for f in catalog.features() {
            let wtp = true_wtp.get(&f.id).copied().unwrap_or(f.cost).max(0.0);
            let u = utility_from_wtp(wtp, config.beta, config.transform, config.money_scale);
            utilities.entry(f.id.clone()).or_insert(u);
        }
        for v in catalog.vouchers() {
            let u = config.beta * config.transform.apply(v.amount / config.money_scale);
            utilities.entry(v.id.clone()).or_insert(u);
        }
        Self {
            utilities,
            rng: Mutex::new(seeded(config.seed)),
            config,
        }
    }

    pub fn utility(&self, id: &str) -> Option<f64> {
        self.utilities.get(id).copied()
    }

    /// Noisy (best, worst) for a task; `None` if it holds unknown items.
    pub fn choose(&self, task: &ChoiceSet) -> Option<(String, String)> {
        let utils: Option<Vec<f64>> = task.items.iter().map(|id| self.utility(id)).collect();
        let utils = utils?;
        if utils.len() < 2 {
            return None;
        }
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let s = self.config.noise_scale;

        let best = (0..utils.len())
            .map(|i| (i, utils[i] + s * gumbel(&mut rng)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)?;
        let worst = (0..utils.len())
            .filter(|&i| i != best)
            .map(|i| (i, -utils[i] + s * gumbel(&mut rng)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)?;
        Some((task.items[best].clone(), task.items[worst].clone()))
    }

    /// `A` when the feature beats `amount` in cash under noise.
    pub fn compare_with_cash(&self, feature_id: &str, amount: f64) -> Option<CashChoice> {
        let feature = self.utility(feature_id)?;
        let cash = self.config.beta * self.config.transform.apply(amount / self.config.money_scale);
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let s = self.config.noise_scale;
        let a = feature + s * gumbel(&mut rng);
        let b = cash + s * gumbel(&mut rng);
        Some(if a > b { CashChoice::A } else { CashChoice::B })
    }

    fn draw_failure(&self) -> bool {
        if self.config.failure_rate <= 0.0 {
            return false;
        }
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.gen_bool(self.config.failure_rate.min(1.0))
    }

    /// Answer every task synchronously, as respondent `respondent`.
    pub fn respond_all(&self, sets: &[ChoiceSet], respondent: &str) -> Vec<Response> {
        sets.iter()
            .map(|task| match self.choose(task) {
                Some((best, worst)) => Response::answered(task.id, respondent, best, worst),
                None => Response::failed(task.id, respondent),
            })
            .collect()
    }
}

#[async_trait]
impl RankingOracle for SyntheticRespondent {
    async fn rank(&self, task: &ChoiceSet) -> Result<RankingPayload, OracleError> {
        if self.draw_failure() {
            return Err(OracleError::transport("synthetic failure", true));
        }
        match self.choose(task) {
            Some((best, worst)) => Ok(RankingPayload::best_worst(best, worst)),
            None => Err(OracleError::Refused(format!("task {} has unknown items", task.id))),
        }
    }
}

#[async_trait]
impl CashChoiceOracle for SyntheticRespondent {
    async fn choose_feature_vs_cash(
        &self,
        feature_id: &str,
        amount: f64,
        _step: usize,
        _phase: CalibrationPhase,
    ) -> Result<CashChoice, OracleError> {
        self.compare_with_cash(feature_id, amount)
            .ok_or_else(|| OracleError::Refused(format!("unknown feature {feature_id}")))
    }
}
