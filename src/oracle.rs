//! The external choice oracle and the loops that drive it.
//!
//! Oracles answer ranking tasks and feature-vs-cash queries. Their payloads
//! come in a handful of shapes; [`RankingPayload`] is the closed set we
//! accept and [`normalize_ranking`] turns any of them into a [`Response`].
//! Retries, pacing and cancellation live here, never in the numeric core.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::assembler::ChoiceSet;
use crate::calibration::{CalibrationParams, CalibrationPhase, CalibrationResult, CalibrationSearch, CashChoice};
use crate::error::{OracleError, StudyError};
use crate::response::Response;
use crate::trace::{OracleTrace, TraceError, TraceSink};

// ---------------------------------------------------------------------
//  Oracle traits
// ---------------------------------------------------------------------

#[async_trait]
pub trait RankingOracle: Send + Sync {
    async fn rank(&self, task: &ChoiceSet) -> Result<RankingPayload, OracleError>;
}

#[async_trait]
pub trait CashChoiceOracle: Send + Sync {
    async fn choose_feature_vs_cash(
        &self,
        feature_id: &str,
        amount: f64,
        step: usize,
        phase: CalibrationPhase,
    ) -> Result<CashChoice, OracleError>;
}

// ---------------------------------------------------------------------
//  Payloads
// ---------------------------------------------------------------------

/// Accepted answer shapes for a ranking task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RankingPayload {
    BestWorst {
        best: String,
        worst: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ranking: Option<Vec<String>>,
    },
    MostLeast {
        most: String,
        least: String,
    },
    Valued {
        most_valued: String,
        least_valued: String,
    },
    Ids {
        best_id: String,
        worst_id: String,
    },
    Ranking {
        ranking: Vec<String>,
    },
}

impl RankingPayload {
    pub fn best_worst(best: impl Into<String>, worst: impl Into<String>) -> Self {
        Self::BestWorst {
            best: best.into(),
            worst: worst.into(),
            ranking: None,
        }
    }

    /// Parse an oracle reply, tolerating prose around the JSON object.
    pub fn parse(raw: &str) -> Result<Self, OracleError> {
        let json = extract_json(raw).ok_or_else(|| OracleError::malformed("no JSON object found"))?;
        serde_json::from_str(json).map_err(|e| OracleError::malformed(e.to_string()))
    }

    fn parts(&self) -> (Option<&str>, Option<&str>, Option<&[String]>) {
        match self {
            Self::BestWorst {
                best,
                worst,
                ranking,
            } => (Some(best.as_str()), Some(worst.as_str()), ranking.as_deref()),
            Self::MostLeast { most, least } => (Some(most.as_str()), Some(least.as_str()), None),
            Self::Valued {
                most_valued,
                least_valued,
            } => (Some(most_valued.as_str()), Some(least_valued.as_str()), None),
            Self::Ids { best_id, worst_id } => (Some(best_id.as_str()), Some(worst_id.as_str()), None),
            Self::Ranking { ranking } if ranking.len() >= 2 => (
                ranking.first().map(String::as_str),
                ranking.last().map(String::as_str),
                Some(ranking.as_slice()),
            ),
            Self::Ranking { .. } => (None, None, None),
        }
    }
}

/// First balanced `{...}` object in `raw`.
pub fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let remainder = &raw[start..];
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in remainder.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&remainder[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Canonical response for `task`, or a failed one if the payload doesn't fit.
///
/// A ranking is kept only when it lists distinct items of the task.
pub fn normalize_ranking(task: &ChoiceSet, respondent: &str, payload: &RankingPayload) -> Response {
    let (best, worst, ranking) = payload.parts();
    let (Some(best), Some(worst)) = (best.map(str::trim), worst.map(str::trim)) else {
        return Response::failed(task.id, respondent);
    };
    if best == worst || !task.contains(best) || !task.contains(worst) {
        return Response::failed(task.id, respondent);
    }

    let ranking = ranking.and_then(|r| {
        let trimmed: Vec<String> = r.iter().map(|s| s.trim().to_string()).collect();
        let valid = {
            let mut seen = HashSet::new();
            trimmed.iter().all(|id| task.contains(id) && seen.insert(id.as_str()))
        };
        valid.then_some(trimmed)
    });

    Response {
        task_id: task.id,
        respondent: respondent.to_string(),
        best: Some(best.to_string()),
        worst: Some(worst.to_string()),
        ranking,
        failed: false,
    }
}

#[derive(Deserialize)]
struct CashChoicePayload {
    choice: String,
}

/// Parse a `{"choice": "A" | "B"}` reply.
pub fn parse_cash_choice(raw: &str) -> Result<CashChoice, OracleError> {
    let json = extract_json(raw).ok_or_else(|| OracleError::malformed("no JSON object found"))?;
    let payload: CashChoicePayload =
        serde_json::from_str(json).map_err(|e| OracleError::malformed(e.to_string()))?;
    match payload.choice.trim().to_ascii_uppercase().as_str() {
        "A" => Ok(CashChoice::A),
        "B" => Ok(CashChoice::B),
        other => Err(OracleError::malformed(format!("unknown choice {other:?}"))),
    }
}

// ---------------------------------------------------------------------
//  Collection
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectOptions {
    /// Respondent id stamped on collected responses.
    pub respondent: String,
    pub max_attempts: u32,
    /// Linear backoff: attempt `n` waits `n × backoff_base_ms` before retrying.
    pub backoff_base_ms: u64,
    /// Pause after every oracle call.
    pub inter_call_delay_ms: u64,
    /// Tasks in flight at once; each task has at most one attempt in flight.
    pub concurrency: usize,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            respondent: "oracle".to_string(),
            max_attempts: 3,
            backoff_base_ms: 500,
            inter_call_delay_ms: 250,
            concurrency: 1,
        }
    }
}

impl CollectOptions {
    fn backoff(&self, attempt: u32, err: &OracleError) -> Duration {
        let linear = Duration::from_millis(self.backoff_base_ms.saturating_mul(u64::from(attempt)));
        err.retry_after().map_or(linear, |r| r.max(linear))
    }

    async fn pace(&self) {
        if self.inter_call_delay_ms > 0 {
            sleep(Duration::from_millis(self.inter_call_delay_ms)).await;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionOutcome {
    /// Answered and failed responses, by task id. Skipped tasks are absent.
    pub responses: Vec<Response>,
    pub answered: usize,
    pub failed: usize,
    /// Tasks never attempted successfully because of cancellation.
    pub skipped: usize,
    pub attempts: u32,
    pub cancelled: bool,
}

enum TaskOutcome {
    Answered(Response),
    Failed(Response),
    Skipped,
}

fn is_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|flag| flag.load(Ordering::Relaxed))
}

async fn run_task(
    oracle: &dyn RankingOracle,
    task: &ChoiceSet,
    options: &CollectOptions,
    cancel: Option<&AtomicBool>,
    trace: Option<&dyn TraceSink>,
) -> Result<(TaskOutcome, u32), TraceError> {
    let max_attempts = options.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        if is_cancelled(cancel) {
            return Ok((TaskOutcome::Skipped, attempt - 1));
        }
        let result = oracle.rank(task).await;
        options.pace().await;

        match result {
            Ok(payload) => {
                let response = normalize_ranking(task, &options.respondent, &payload);
                if let Some(sink) = trace {
                    let mut event = OracleTrace::rank(&options.respondent, task.id, &task.items, attempt);
                    event.best = response.best.clone();
                    event.worst = response.worst.clone();
                    event.invalid = response.failed;
                    sink.record(event)?;
                }
                if response.failed {
                    warn!(task_id = task.id, attempt, "oracle answer rejected");
                    return Ok((TaskOutcome::Failed(response), attempt));
                }
                return Ok((TaskOutcome::Answered(response), attempt));
            }
            Err(OracleError::Cancelled) => return Ok((TaskOutcome::Skipped, attempt)),
            Err(err) => {
                if let Some(sink) = trace {
                    sink.record(
                        OracleTrace::rank(&options.respondent, task.id, &task.items, attempt)
                            .with_error(err.to_string()),
                    )?;
                }
                warn!(task_id = task.id, attempt, code = err.code(), error = %err, "oracle call failed");
                if !err.is_retryable() || attempt == max_attempts {
                    return Ok((
                        TaskOutcome::Failed(Response::failed(task.id, &options.respondent)),
                        attempt,
                    ));
                }
                sleep(options.backoff(attempt, &err)).await;
            }
        }
    }
    Ok((
        TaskOutcome::Failed(Response::failed(task.id, &options.respondent)),
        max_attempts,
    ))
}

/// Ask `oracle` for every task, with bounded retries and concurrency.
///
/// Cancellation is checked before each attempt; tasks that never got an
/// answer are left out of the result rather than recorded as failures.
pub async fn collect_responses(
    oracle: &dyn RankingOracle,
    tasks: &[ChoiceSet],
    options: &CollectOptions,
    cancel: Option<&AtomicBool>,
    trace: Option<&dyn TraceSink>,
) -> Result<CollectionOutcome, TraceError> {
    let results = stream::iter(
        tasks
            .iter()
            .map(|task| run_task(oracle, task, options, cancel, trace)),
    )
    .buffer_unordered(options.concurrency.max(1))
    .collect::<Vec<_>>()
    .await;

    let mut outcome = CollectionOutcome::default();
    for result in results {
        let (task_outcome, attempts) = result?;
        outcome.attempts += attempts;
        match task_outcome {
            TaskOutcome::Answered(r) => {
                outcome.answered += 1;
                outcome.responses.push(r);
            }
            TaskOutcome::Failed(r) => {
                outcome.failed += 1;
                outcome.responses.push(r);
            }
            TaskOutcome::Skipped => outcome.skipped += 1,
        }
    }
    outcome.responses.sort_by_key(|r| r.task_id);
    outcome.cancelled = is_cancelled(cancel);

    info!(
        tasks = tasks.len(),
        answered = outcome.answered,
        failed = outcome.failed,
        skipped = outcome.skipped,
        attempts = outcome.attempts,
        "response collection finished"
    );
    Ok(outcome)
}

// ---------------------------------------------------------------------
//  Calibration
// ---------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn ask_cash_choice(
    oracle: &dyn CashChoiceOracle,
    feature_id: &str,
    amount: f64,
    step: usize,
    phase: CalibrationPhase,
    options: &CollectOptions,
    cancel: Option<&AtomicBool>,
    trace: Option<&dyn TraceSink>,
) -> Result<CashChoice, StudyError> {
    let max_attempts = options.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        if is_cancelled(cancel) {
            return Err(OracleError::Cancelled.into());
        }
        let result = oracle
            .choose_feature_vs_cash(feature_id, amount, step, phase)
            .await;
        options.pace().await;

        let event = trace.map(|_| {
            OracleTrace::calibration(&options.respondent, feature_id, amount, step, phase, attempt)
        });
        match result {
            Ok(choice) => {
                if let (Some(sink), Some(mut event)) = (trace, event) {
                    event.choice = Some(choice);
                    sink.record(event)?;
                }
                return Ok(choice);
            }
            Err(err) => {
                if let (Some(sink), Some(event)) = (trace, event) {
                    sink.record(event.with_error(err.to_string()))?;
                }
                warn!(feature_id, step, attempt, code = err.code(), error = %err, "calibration query failed");
                if !err.is_retryable() || attempt >= max_attempts {
                    return Err(err.into());
                }
                sleep(options.backoff(attempt, &err)).await;
                attempt += 1;
            }
        }
    }
}

/// Run the bracket-and-bisect search for one feature against `oracle`.
///
/// Queries are strictly sequential; each amount depends on the last answer.
pub async fn calibrate_with_oracle(
    oracle: &dyn CashChoiceOracle,
    feature_id: &str,
    params: CalibrationParams,
    options: &CollectOptions,
    cancel: Option<&AtomicBool>,
    trace: Option<&dyn TraceSink>,
) -> Result<CalibrationResult, StudyError> {
    let mut search = CalibrationSearch::new(params);
    let mut step = 0;
    while let Some((amount, phase)) = search.next_query() {
        step += 1;
        let choice = ask_cash_choice(oracle, feature_id, amount, step, phase, options, cancel, trace).await?;
        search.record(choice);
    }
    let result = search.finish();
    debug!(
        feature_id,
        lower = result.lower,
        upper = result.upper,
        straddled = result.straddled,
        steps = result.steps.len(),
        "calibration finished"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> ChoiceSet {
        ChoiceSet {
            id: 7,
            items: vec!["a".into(), "b".into(), "c".into(), "voucher_L0_0".into()],
            voucher: Some("voucher_L0_0".into()),
            repeat_of: None,
        }
    }

    #[test]
    fn every_accepted_shape_normalizes() {
        let shapes = [
            r#"{"best": "a", "worst": "c"}"#,
            r#"{"most": "a", "least": "c"}"#,
            r#"{"most_valued": "a", "least_valued": "c"}"#,
            r#"{"best_id": "a", "worst_id": "c"}"#,
            r#"{"ranking": ["a", "b", "voucher_L0_0", "c"]}"#,
        ];
        for raw in shapes {
            let payload = RankingPayload::parse(raw).unwrap();
            let response = normalize_ranking(&task(), "r1", &payload);
            assert!(!response.failed, "{raw}");
            assert_eq!(response.best.as_deref(), Some("a"));
            assert_eq!(response.worst.as_deref(), Some("c"));
            assert_eq!(response.task_id, 7);
        }
    }

    #[test]
    fn json_is_found_inside_prose() {
        let raw = "Sure! Here you go:\n```json\n{\"best\": \"b\", \"worst\": \"a\", \"note\": \"}\"}\n```";
        let payload = RankingPayload::parse(raw).unwrap();
        assert_eq!(payload, RankingPayload::best_worst("b", "a"));
    }

    #[test]
    fn rejects_answers_that_do_not_fit_the_task() {
        let same = RankingPayload::best_worst("a", "a");
        assert!(normalize_ranking(&task(), "r", &same).failed);
        let outside = RankingPayload::best_worst("a", "zzz");
        assert!(normalize_ranking(&task(), "r", &outside).failed);
        let short = RankingPayload::Ranking {
            ranking: vec!["a".into()],
        };
        assert!(normalize_ranking(&task(), "r", &short).failed);
        assert!(RankingPayload::parse("no json here").is_err());
        assert!(RankingPayload::parse(r#"{"favourite": "a"}"#).is_err());
    }

    #[test]
    fn invalid_ranking_is_dropped_but_choice_kept() {
        let payload = RankingPayload::BestWorst {
            best: " a ".into(),
            worst: "c".into(),
            ranking: Some(vec!["a".into(), "a".into(), "c".into()]),
        };
        let response = normalize_ranking(&task(), "r", &payload);
        assert!(!response.failed);
        assert_eq!(response.best.as_deref(), Some("a"));
        assert!(response.ranking.is_none());
    }

    #[test]
    fn cash_choice_parsing() {
        assert_eq!(parse_cash_choice(r#"{"choice": "a"}"#).unwrap(), CashChoice::A);
        assert_eq!(parse_cash_choice(r#"I pick {"choice":"B"}"#).unwrap(), CashChoice::B);
        assert!(parse_cash_choice(r#"{"choice": "C"}"#).is_err());
    }
}
