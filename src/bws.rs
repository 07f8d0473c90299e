//! Best–worst multinomial logit with one shared money coefficient.
//!
//! A task's best pick is a softmax over item utilities; with the best removed,
//! the worst pick is a softmax over negated utilities of the rest. Features
//! carry free utilities, vouchers carry `β · f(amount / money_scale)`. The
//! fit is maximum likelihood by Adam over `(θ, log β)`, keeping the best
//! iterate seen. Reported feature utilities are mean-centred after fitting.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::assembler::ChoiceSet;
use crate::items::{ItemCatalog, ItemKind};
use crate::response::{index_sets, validate_response, Response};

// ---------------------------------------------------------------------
//  Money transform
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoneyTransform {
    #[default]
    Log1p,
    Linear,
}

impl MoneyTransform {
    pub fn apply(self, x: f64) -> f64 {
        match self {
            MoneyTransform::Log1p => x.ln_1p(),
            MoneyTransform::Linear => x,
        }
    }

    pub fn invert(self, y: f64) -> f64 {
        match self {
            MoneyTransform::Log1p => y.exp_m1(),
            MoneyTransform::Linear => y,
        }
    }
}

/// Currency value of a utility: `scale · (exp(u/β) − 1)` or `scale · u/β`.
pub fn wtp_from_utility(utility: f64, beta: f64, transform: MoneyTransform, money_scale: f64) -> f64 {
    money_scale * transform.invert(utility / beta)
}

/// Inverse of [`wtp_from_utility`].
pub fn utility_from_wtp(wtp: f64, beta: f64, transform: MoneyTransform, money_scale: f64) -> f64 {
    beta * transform.apply(wtp / money_scale)
}

// ---------------------------------------------------------------------
//  Options
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BwsFitOptions {
    pub transform: MoneyTransform,
    /// Currency divisor applied before the transform.
    pub money_scale: f64,
    pub learning_rate: f64,
    pub max_iterations: usize,
    /// Relative objective improvement below which an iteration counts as stalled.
    pub tolerance: f64,
    /// Consecutive stalled iterations before stopping.
    pub patience: usize,
    /// L2 penalty `ridge · Σθ²` on raw feature utilities.
    ///
    /// Any positive value makes the fit penalised rather than pure maximum
    /// likelihood: raw utilities shrink toward the zero voucher, which pulls
    /// WTP magnitudes slightly toward zero. The default keeps utilities finite
    /// when every answer is perfectly consistent or no vouchers are shown. Set
    /// it to 0 for the unpenalised estimate.
    pub ridge: f64,
    pub log_beta_min: f64,
    pub log_beta_max: f64,
}

impl Default for BwsFitOptions {
    fn default() -> Self {
        Self {
            transform: MoneyTransform::Log1p,
            money_scale: 1.0,
            learning_rate: 0.05,
            max_iterations: 2_000,
            tolerance: 1e-7,
            patience: 50,
            ridge: 1e-3,
            log_beta_min: -10.0,
            log_beta_max: 10.0,
        }
    }
}

// ---------------------------------------------------------------------
//  Observations
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Slot {
    Feature(usize),
    Voucher { amount: f64 },
}

/// One usable best/worst answer, positions index into `slots`.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub slots: Vec<Slot>,
    pub best: usize,
    pub worst: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationSet {
    /// Parameter order for `Slot::Feature`.
    pub feature_ids: Vec<String>,
    pub observations: Vec<Observation>,
    pub failed_tasks: usize,
}

impl ObservationSet {
    pub fn usable_tasks(&self) -> usize {
        self.observations.len()
    }
}

pub fn build_observations(
    sets: &[ChoiceSet],
    responses: &[Response],
    catalog: &ItemCatalog,
) -> ObservationSet {
    let mut feature_ids: Vec<String> = Vec::new();
    let mut position: HashMap<&str, usize> = HashMap::new();
    for f in catalog.features() {
        if !position.contains_key(f.id.as_str()) {
            position.insert(f.id.as_str(), feature_ids.len());
            feature_ids.push(f.id.clone());
        }
    }

    let index = index_sets(sets);
    let mut observations = Vec::new();
    let mut failed = 0;

    for response in responses {
        let Ok(set) = validate_response(&index, response) else {
            failed += 1;
            continue;
        };
        let slots: Option<Vec<Slot>> = set
            .items
            .iter()
            .map(|id| match catalog.kind(id)? {
                ItemKind::Feature => position.get(id.as_str()).map(|&p| Slot::Feature(p)),
                ItemKind::Voucher => catalog.voucher(id).map(|v| Slot::Voucher { amount: v.amount }),
            })
            .collect();
        let best = response
            .best
            .as_deref()
            .and_then(|b| set.items.iter().position(|i| i == b));
        let worst = response
            .worst
            .as_deref()
            .and_then(|w| set.items.iter().position(|i| i == w));
        match (slots, best, worst) {
            (Some(slots), Some(best), Some(worst)) => observations.push(Observation { slots, best, worst }),
            _ => failed += 1,
        }
    }

    ObservationSet {
        feature_ids,
        observations,
        failed_tasks: failed,
    }
}

// ---------------------------------------------------------------------
//  Likelihood
// ---------------------------------------------------------------------

fn log_sum_exp(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let max = values.clone().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.map(|v| (v - max).exp()).sum::<f64>().ln()
}

struct Evaluation {
    data_nll: f64,
    penalty: f64,
    grad: Vec<f64>,
}

/// Negative log-likelihood, ridge penalty and gradient at `params = [θ.., log β]`.
fn evaluate(params: &[f64], observations: &[Observation], opts: &BwsFitOptions) -> Evaluation {
    let n = params.len() - 1;
    let theta = &params[..n];
    let beta = params[n].clamp(opts.log_beta_min, opts.log_beta_max).exp();
    let mut grad = vec![0.0; n + 1];
    let mut data_nll = 0.0;
    let mut u: Vec<f64> = Vec::new();

    for ob in observations {
        u.clear();
        u.extend(ob.slots.iter().map(|slot| match *slot {
            Slot::Feature(f) => theta[f],
            Slot::Voucher { amount } => beta * opts.transform.apply(amount / opts.money_scale),
        }));
        let lse_best = log_sum_exp(u.iter().copied());
        let lse_worst = log_sum_exp(
            u.iter()
                .enumerate()
                .filter(|(i, _)| *i != ob.best)
                .map(|(_, x)| -x),
        );
        data_nll -= u[ob.best] - lse_best - u[ob.worst] - lse_worst;

        for (i, &ui) in u.iter().enumerate() {
            let mut d = (ui - lse_best).exp();
            if i == ob.best {
                d -= 1.0;
            } else {
                d -= (-ui - lse_worst).exp();
                if i == ob.worst {
                    d += 1.0;
                }
            }
            match ob.slots[i] {
                Slot::Feature(f) => grad[f] += d,
                // du/dlogβ = u for voucher slots
                Slot::Voucher { .. } => grad[n] += d * ui,
            }
        }
    }

    let mut penalty = 0.0;
    for (g, &t) in grad.iter_mut().zip(theta) {
        penalty += opts.ridge * t * t;
        *g += 2.0 * opts.ridge * t;
    }

    Evaluation {
        data_nll,
        penalty,
        grad,
    }
}

// ---------------------------------------------------------------------
//  Optimizer
// ---------------------------------------------------------------------

/// Unlabelled fit over an observation list, reused by the bootstrap.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RawFit {
    pub theta: Vec<f64>,
    pub log_beta: f64,
    pub converged: bool,
    pub iterations: usize,
    pub data_nll: f64,
}

impl RawFit {
    fn zero(n: usize) -> Self {
        Self {
            theta: vec![0.0; n],
            log_beta: 0.0,
            converged: false,
            iterations: 0,
            data_nll: 0.0,
        }
    }

    pub fn beta(&self) -> f64 {
        self.log_beta.exp()
    }

    pub fn mean_theta(&self) -> f64 {
        if self.theta.is_empty() {
            0.0
        } else {
            self.theta.iter().sum::<f64>() / self.theta.len() as f64
        }
    }

    pub fn centered(&self) -> Vec<f64> {
        let mean = self.mean_theta();
        self.theta.iter().map(|t| t - mean).collect()
    }

    /// WTP of each centred feature utility.
    pub fn wtp(&self, opts: &BwsFitOptions) -> Vec<f64> {
        let beta = self.beta();
        self.centered()
            .into_iter()
            .map(|u| wtp_from_utility(u, beta, opts.transform, opts.money_scale))
            .collect()
    }

    /// WTP of each raw (voucher-anchored) feature utility.
    pub fn anchored_wtp(&self, opts: &BwsFitOptions) -> Vec<f64> {
        let beta = self.beta();
        self.theta
            .iter()
            .map(|&u| wtp_from_utility(u, beta, opts.transform, opts.money_scale))
            .collect()
    }
}

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;
const GRAD_NORM_FLOOR: f64 = 1e-9;

pub(crate) fn fit_observations(
    observations: &[Observation],
    n_features: usize,
    opts: &BwsFitOptions,
) -> RawFit {
    if n_features == 0 || observations.is_empty() {
        return RawFit::zero(n_features);
    }

    let dim = n_features + 1;
    let mut params = vec![0.0; dim];
    let mut m = vec![0.0; dim];
    let mut v = vec![0.0; dim];

    let mut best_params = params.clone();
    let mut best_objective = f64::INFINITY;
    let mut best_nll = f64::INFINITY;
    let mut stall = 0;
    let mut converged = false;
    let mut iterations = 0;

    for t in 1..=opts.max_iterations {
        let eval = evaluate(&params, observations, opts);
        let objective = eval.data_nll + eval.penalty;
        if !objective.is_finite() || eval.grad.iter().any(|g| !g.is_finite()) {
            warn!(iteration = t, "non-finite likelihood; keeping best iterate");
            break;
        }
        iterations = t;

        if objective < best_objective {
            let improvement = if best_objective.is_finite() {
                (best_objective - objective) / best_objective.abs().max(1.0)
            } else {
                f64::INFINITY
            };
            stall = if improvement < opts.tolerance { stall + 1 } else { 0 };
            best_objective = objective;
            best_nll = eval.data_nll;
            best_params.copy_from_slice(&params);
        } else {
            stall += 1;
        }

        let grad_norm = eval.grad.iter().map(|g| g * g).sum::<f64>().sqrt();
        if stall >= opts.patience || grad_norm < GRAD_NORM_FLOOR {
            converged = true;
            break;
        }

        let bias1 = 1.0 - ADAM_BETA1.powi(t as i32);
        let bias2 = 1.0 - ADAM_BETA2.powi(t as i32);
        for i in 0..dim {
            let g = eval.grad[i];
            m[i] = ADAM_BETA1 * m[i] + (1.0 - ADAM_BETA1) * g;
            v[i] = ADAM_BETA2 * v[i] + (1.0 - ADAM_BETA2) * g * g;
            let m_hat = m[i] / bias1;
            let v_hat = v[i] / bias2;
            params[i] -= opts.learning_rate * m_hat / (v_hat.sqrt() + ADAM_EPS);
        }
        params[n_features] = params[n_features].clamp(opts.log_beta_min, opts.log_beta_max);
    }

    if !best_objective.is_finite() {
        return RawFit {
            iterations,
            ..RawFit::zero(n_features)
        };
    }

    RawFit {
        log_beta: best_params[n_features],
        theta: best_params[..n_features].to_vec(),
        converged,
        iterations,
        data_nll: best_nll,
    }
}

// ---------------------------------------------------------------------
//  Public fit
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BwsFitResult {
    /// Mean-centred feature utilities.
    pub utilities: BTreeMap<String, f64>,
    /// Mean raw utility removed by centring.
    pub utility_offset: f64,
    pub voucher_utilities: BTreeMap<String, f64>,
    /// WTP of the centred utilities.
    pub wtp: BTreeMap<String, f64>,
    /// WTP of the uncentred utilities, on the scale the vouchers anchor.
    pub anchored_wtp: BTreeMap<String, f64>,
    pub beta: f64,
    pub log_beta: f64,
    pub converged: bool,
    pub iterations: usize,
    pub log_likelihood: f64,
    pub usable_tasks: usize,
    pub failed_tasks: usize,
    pub transform: MoneyTransform,
    pub money_scale: f64,
}

impl BwsFitResult {
    /// Feature ids ordered by descending WTP.
    pub fn ranking(&self) -> Vec<String> {
        let mut ids: Vec<(&String, f64)> = self.wtp.iter().map(|(k, v)| (k, *v)).collect();
        ids.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ids.into_iter().map(|(k, _)| k.clone()).collect()
    }
}

pub fn fit_observation_set(
    observations: &ObservationSet,
    catalog: &ItemCatalog,
    options: &BwsFitOptions,
) -> BwsFitResult {
    let n = observations.feature_ids.len();
    let raw = fit_observations(&observations.observations, n, options);
    let beta = raw.beta();
    let offset = raw.mean_theta();
    let centered = raw.centered();

    let mut utilities = BTreeMap::new();
    let mut wtp = BTreeMap::new();
    let mut anchored_wtp = BTreeMap::new();
    for (i, id) in observations.feature_ids.iter().enumerate() {
        utilities.insert(id.clone(), centered[i]);
        wtp.insert(
            id.clone(),
            wtp_from_utility(centered[i], beta, options.transform, options.money_scale),
        );
        anchored_wtp.insert(
            id.clone(),
            wtp_from_utility(raw.theta[i], beta, options.transform, options.money_scale),
        );
    }
    let voucher_utilities = catalog
        .vouchers()
        .iter()
        .map(|v| {
            let u = beta * options.transform.apply(v.amount / options.money_scale);
            (v.id.clone(), u)
        })
        .collect();

    debug!(
        features = n,
        usable = observations.usable_tasks(),
        failed = observations.failed_tasks,
        beta,
        converged = raw.converged,
        iterations = raw.iterations,
        "bws fit finished"
    );

    BwsFitResult {
        utilities,
        utility_offset: offset,
        voucher_utilities,
        wtp,
        anchored_wtp,
        beta,
        log_beta: raw.log_beta,
        converged: raw.converged,
        iterations: raw.iterations,
        log_likelihood: -raw.data_nll,
        usable_tasks: observations.usable_tasks(),
        failed_tasks: observations.failed_tasks,
        transform: options.transform,
        money_scale: options.money_scale,
    }
}

/// Fit feature utilities and the money coefficient from a response log.
pub fn fit_bws_mnl_money(
    sets: &[ChoiceSet],
    responses: &[Response],
    catalog: &ItemCatalog,
    options: &BwsFitOptions,
) -> BwsFitResult {
    let observations = build_observations(sets, responses, catalog);
    fit_observation_set(&observations, catalog, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::{Feature, Voucher};

    fn observations() -> Vec<Observation> {
        vec![
            Observation {
                slots: vec![Slot::Feature(0), Slot::Feature(1), Slot::Voucher { amount: 40.0 }],
                best: 0,
                worst: 2,
            },
            Observation {
                slots: vec![Slot::Feature(2), Slot::Voucher { amount: 5.0 }, Slot::Feature(1)],
                best: 1,
                worst: 0,
            },
            Observation {
                slots: vec![Slot::Feature(1), Slot::Feature(2), Slot::Feature(0)],
                best: 2,
                worst: 1,
            },
        ]
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let opts = BwsFitOptions::default();
        let params = vec![0.3, -0.2, 0.5, 0.1];
        let obs = observations();
        let eval = evaluate(&params, &obs, &opts);
        let h = 1e-6;
        for i in 0..params.len() {
            let mut up = params.clone();
            let mut down = params.clone();
            up[i] += h;
            down[i] -= h;
            let fu = evaluate(&up, &obs, &opts);
            let fd = evaluate(&down, &obs, &opts);
            let numeric = ((fu.data_nll + fu.penalty) - (fd.data_nll + fd.penalty)) / (2.0 * h);
            assert!(
                (numeric - eval.grad[i]).abs() < 1e-5,
                "param {i}: numeric {numeric} analytic {}",
                eval.grad[i]
            );
        }
    }

    #[test]
    fn zero_ridge_is_plain_likelihood() {
        let params = vec![0.3, -0.2, 0.5, 0.1];
        let obs = observations();
        let plain = evaluate(
            &params,
            &obs,
            &BwsFitOptions {
                ridge: 0.0,
                ..BwsFitOptions::default()
            },
        );
        assert_eq!(plain.penalty, 0.0);

        let ridged = evaluate(&params, &obs, &BwsFitOptions::default());
        let sum_sq: f64 = params[..3].iter().map(|t| t * t).sum();
        assert!((ridged.penalty - 1e-3 * sum_sq).abs() < 1e-15);
        assert_eq!(ridged.data_nll, plain.data_nll);
        assert!((ridged.grad[0] - plain.grad[0] - 2e-3 * 0.3).abs() < 1e-12);
        assert_eq!(ridged.grad[3], plain.grad[3]);
    }

    #[test]
    fn log_sum_exp_is_stable() {
        let v = [1000.0, 1000.0];
        let lse = log_sum_exp(v.iter().copied());
        assert!((lse - (1000.0 + 2f64.ln())).abs() < 1e-9);
    }

    #[test]
    fn empty_features_cannot_fit() {
        let catalog = ItemCatalog::new(Vec::new(), Vec::new());
        let fit = fit_bws_mnl_money(&[], &[], &catalog, &BwsFitOptions::default());
        assert!(!fit.converged);
        assert!(fit.utilities.is_empty());
        assert_eq!(fit.usable_tasks, 0);
        assert_eq!(fit.beta, 1.0);
    }

    #[test]
    fn invalid_answers_are_counted_not_fitted() {
        let catalog = ItemCatalog::new(
            vec![Feature::new("a", "A", 1.0), Feature::new("b", "B", 1.0)],
            vec![Voucher {
                id: "v".into(),
                amount: 10.0,
                level: 0,
                description: String::new(),
            }],
        );
        let sets = vec![ChoiceSet {
            id: 0,
            items: vec!["a".into(), "v".into(), "b".into()],
            voucher: Some("v".into()),
            repeat_of: None,
        }];
        let responses = vec![
            Response::answered(0, "r", "a", "b"),
            Response::answered(0, "r", "a", "a"),
            Response::answered(4, "r", "a", "b"),
            Response::failed(0, "r"),
        ];
        let obs = build_observations(&sets, &responses, &catalog);
        assert_eq!(obs.usable_tasks(), 1);
        assert_eq!(obs.failed_tasks, 3);
        assert_eq!(obs.observations[0].best, 0);
        assert_eq!(obs.observations[0].worst, 2);
        assert_eq!(obs.observations[0].slots[1], Slot::Voucher { amount: 10.0 });
    }

    #[test]
    fn fit_prefers_the_chosen_feature() {
        let obs = vec![
            Observation {
                slots: vec![Slot::Feature(0), Slot::Feature(1), Slot::Feature(2)],
                best: 0,
                worst: 2,
            };
            20
        ];
        let fit = fit_observations(&obs, 3, &BwsFitOptions::default());
        let u = fit.centered();
        assert!(u[0] > u[1] && u[1] > u[2], "{u:?}");
        assert!(u.iter().sum::<f64>().abs() < 1e-9);
    }
}
