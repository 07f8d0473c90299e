//! Direct feature-vs-cash calibration by bracket-and-bisect.
//!
//! [`CalibrationSearch`] is a pure state machine: it proposes the next amount,
//! the caller asks an oracle, and the answer is fed back with
//! [`CalibrationSearch::record`]. The synchronous [`calibrate`] driver and the
//! async oracle driver in `oracle` both run the same machine.

use serde::{Deserialize, Serialize};

/// `A` prefers the feature, `B` prefers the cash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CashChoice {
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationPhase {
    Bracket,
    Search,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationParams {
    /// First probe; defaults to the midpoint of the bounds.
    pub initial_guess: Option<f64>,
    pub min_amount: f64,
    pub max_amount: f64,
    /// Bisection steps after bracketing.
    pub search_steps: usize,
    /// Doublings (or halvings) tried while bracketing.
    pub max_bracket_probes: usize,
    /// Stop once `high − low <= max(relative_tolerance · low, absolute_tolerance)`.
    pub relative_tolerance: f64,
    pub absolute_tolerance: f64,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            initial_guess: None,
            min_amount: 10.0,
            max_amount: 1_000.0,
            search_steps: 8,
            max_bracket_probes: 4,
            relative_tolerance: 0.01,
            absolute_tolerance: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStep {
    pub step: usize,
    pub amount: f64,
    pub choice: CashChoice,
    pub phase: CalibrationPhase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub lower: f64,
    pub upper: f64,
    /// Geometric midpoint of the bracket (arithmetic when a bound is <= 0).
    pub midpoint: f64,
    /// Both an `A` amount and a `B` amount were observed.
    pub straddled: bool,
    pub steps: Vec<CalibrationStep>,
}

impl CalibrationResult {
    pub fn search_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.phase == CalibrationPhase::Search)
            .count()
    }
}

/// Geometric mean, or the arithmetic mean when either bound is non-positive.
pub fn bracket_midpoint(low: f64, high: f64) -> f64 {
    if low <= 0.0 || high <= 0.0 {
        (low + high) / 2.0
    } else {
        (low * high).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Stage {
    ProbeUp(f64),
    ProbeDown(f64),
    Search,
    Done,
}

#[derive(Debug, Clone)]
pub struct CalibrationSearch {
    params: CalibrationParams,
    low: Option<f64>,
    high: Option<f64>,
    stage: Stage,
    up_probes: usize,
    down_probes: usize,
    search_done: usize,
    steps: Vec<CalibrationStep>,
}

impl CalibrationSearch {
    pub fn new(params: CalibrationParams) -> Self {
        let min = params.min_amount.max(0.0);
        let max = params.max_amount.max(min);
        let guess = params
            .initial_guess
            .filter(|g| g.is_finite())
            .unwrap_or_else(|| bracket_midpoint(min, max))
            .clamp(min, max);
        Self {
            params: CalibrationParams {
                min_amount: min,
                max_amount: max,
                ..params
            },
            low: None,
            high: None,
            stage: Stage::ProbeUp(guess),
            up_probes: 0,
            down_probes: 0,
            search_done: 0,
            steps: Vec::new(),
        }
    }

    fn narrow_enough(&self, low: f64, high: f64) -> bool {
        let tol = (self.params.relative_tolerance * low.abs()).max(self.params.absolute_tolerance);
        high - low <= tol
    }

    /// Amount and phase of the next query, `None` once finished.
    pub fn next_query(&mut self) -> Option<(f64, CalibrationPhase)> {
        match self.stage {
            Stage::ProbeUp(amount) | Stage::ProbeDown(amount) => Some((amount, CalibrationPhase::Bracket)),
            Stage::Search => {
                let (Some(low), Some(high)) = (self.low, self.high) else {
                    self.stage = Stage::Done;
                    return None;
                };
                if self.search_done >= self.params.search_steps || self.narrow_enough(low, high) {
                    self.stage = Stage::Done;
                    return None;
                }
                Some((bracket_midpoint(low, high), CalibrationPhase::Search))
            }
            Stage::Done => None,
        }
    }

    /// Feed the oracle's answer for the amount last returned by [`next_query`].
    ///
    /// [`next_query`]: CalibrationSearch::next_query
    pub fn record(&mut self, choice: CashChoice) {
        let (amount, phase) = match self.stage {
            Stage::ProbeUp(a) | Stage::ProbeDown(a) => (a, CalibrationPhase::Bracket),
            Stage::Search => match (self.low, self.high) {
                (Some(low), Some(high)) => (bracket_midpoint(low, high), CalibrationPhase::Search),
                _ => return,
            },
            Stage::Done => return,
        };
        self.steps.push(CalibrationStep {
            step: self.steps.len() + 1,
            amount,
            choice,
            phase,
        });

        let min = self.params.min_amount;
        let max = self.params.max_amount;
        self.stage = match (self.stage, choice) {
            (Stage::ProbeUp(a), CashChoice::A) => {
                self.low = Some(a);
                self.up_probes += 1;
                if a >= max || self.up_probes > self.params.max_bracket_probes {
                    Stage::Done
                } else if a > 0.0 {
                    Stage::ProbeUp((a * 2.0).min(max))
                } else {
                    Stage::ProbeUp(max)
                }
            }
            (Stage::ProbeUp(a), CashChoice::B) | (Stage::ProbeDown(a), CashChoice::B) => {
                self.high = Some(a);
                if self.low.is_some() {
                    Stage::Search
                } else {
                    self.down_probes += 1;
                    if a <= min || self.down_probes > self.params.max_bracket_probes {
                        Stage::Done
                    } else {
                        Stage::ProbeDown((a / 2.0).max(min))
                    }
                }
            }
            (Stage::ProbeDown(a), CashChoice::A) => {
                self.low = Some(a);
                Stage::Search
            }
            (Stage::Search, c) => {
                let mid = amount;
                match c {
                    CashChoice::A => self.low = Some(mid),
                    CashChoice::B => self.high = Some(mid),
                }
                self.search_done += 1;
                Stage::Search
            }
            (Stage::Done, _) => Stage::Done,
        };
    }

    pub fn finish(self) -> CalibrationResult {
        let straddled = self.low.is_some() && self.high.is_some();
        let lower = self.low.unwrap_or(self.params.min_amount);
        let upper = self.high.unwrap_or(self.params.max_amount).max(lower);
        CalibrationResult {
            lower,
            upper,
            midpoint: bracket_midpoint(lower, upper),
            straddled,
            steps: self.steps,
        }
    }
}

/// Run the search against a synchronous oracle `(amount, step, phase) -> choice`.
pub fn calibrate<F>(params: CalibrationParams, mut oracle: F) -> CalibrationResult
where
    F: FnMut(f64, usize, CalibrationPhase) -> CashChoice,
{
    let mut search = CalibrationSearch::new(params);
    let mut step = 0;
    while let Some((amount, phase)) = search.next_query() {
        step += 1;
        let choice = oracle(amount, step, phase);
        search.record(choice);
    }
    search.finish()
}

/// Weighted blend of model WTP with a straddled calibration midpoint.
///
/// `weight` is the calibration's share, clamped to `[0, 1]`. A calibration
/// that never straddled leaves the model value as is.
pub fn blend_wtp(model_wtp: f64, calibration: &CalibrationResult, weight: f64) -> f64 {
    if !calibration.straddled || !calibration.midpoint.is_finite() {
        return model_wtp;
    }
    let w = if weight.is_finite() { weight.clamp(0.0, 1.0) } else { 0.0 };
    if !model_wtp.is_finite() {
        return calibration.midpoint;
    }
    (1.0 - w) * model_wtp + w * calibration.midpoint
}
