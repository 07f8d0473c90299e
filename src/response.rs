//! Best/worst answers and the exposure they produce.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::assembler::ChoiceSet;
use crate::items::{ItemCatalog, ItemKind};

/// One respondent's answer to one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub task_id: usize,
    #[serde(default)]
    pub respondent: String,
    /// Item chosen as most valued.
    #[serde(default)]
    pub best: Option<String>,
    /// Item chosen as least valued.
    #[serde(default)]
    pub worst: Option<String>,
    /// Full ranking, most valued first, when the respondent gave one.
    #[serde(default)]
    pub ranking: Option<Vec<String>>,
    #[serde(default)]
    pub failed: bool,
}

impl Response {
    pub fn answered(
        task_id: usize,
        respondent: impl Into<String>,
        best: impl Into<String>,
        worst: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            respondent: respondent.into(),
            best: Some(best.into()),
            worst: Some(worst.into()),
            ranking: None,
            failed: false,
        }
    }

    pub fn failed(task_id: usize, respondent: impl Into<String>) -> Self {
        Self {
            task_id,
            respondent: respondent.into(),
            best: None,
            worst: None,
            ranking: None,
            failed: true,
        }
    }

    pub fn with_ranking(mut self, ranking: Vec<String>) -> Self {
        self.ranking = Some(ranking);
        self
    }
}

/// Why a response cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseIssue {
    UnknownTask,
    Failed,
    MissingChoice,
    SameBestWorst,
    OutsideTask,
}

/// Index of tasks by id.
pub fn index_sets(sets: &[ChoiceSet]) -> HashMap<usize, &ChoiceSet> {
    sets.iter().map(|s| (s.id, s)).collect()
}

/// The referenced task, if the response is usable.
pub fn validate_response<'a>(
    sets: &HashMap<usize, &'a ChoiceSet>,
    response: &Response,
) -> Result<&'a ChoiceSet, ResponseIssue> {
    let set = *sets.get(&response.task_id).ok_or(ResponseIssue::UnknownTask)?;
    if response.failed {
        return Err(ResponseIssue::Failed);
    }
    let (Some(best), Some(worst)) = (response.best.as_deref(), response.worst.as_deref()) else {
        return Err(ResponseIssue::MissingChoice);
    };
    if best == worst {
        return Err(ResponseIssue::SameBestWorst);
    }
    if !set.contains(best) || !set.contains(worst) {
        return Err(ResponseIssue::OutsideTask);
    }
    Ok(set)
}

/// Exposure and failure accounting over a response log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExposureSummary {
    /// Usable responses.
    pub answered_tasks: usize,
    /// Usable responses to repeat tasks.
    pub repeat_tasks_answered: usize,
    /// Responses excluded for any [`ResponseIssue`].
    pub failed_tasks: usize,
    /// `failed / (answered + failed)`, 0 for an empty log.
    pub failure_rate: f64,
    pub feature_exposure: BTreeMap<String, usize>,
    pub voucher_exposure: BTreeMap<String, usize>,
}

pub fn exposure_counts(
    sets: &[ChoiceSet],
    responses: &[Response],
    catalog: &ItemCatalog,
) -> ExposureSummary {
    let index = index_sets(sets);
    let mut summary = ExposureSummary {
        feature_exposure: catalog.feature_ids().into_iter().map(|id| (id, 0)).collect(),
        voucher_exposure: catalog.voucher_ids().into_iter().map(|id| (id, 0)).collect(),
        ..ExposureSummary::default()
    };

    for response in responses {
        let Ok(set) = validate_response(&index, response) else {
            summary.failed_tasks += 1;
            continue;
        };
        summary.answered_tasks += 1;
        if set.is_repeat() {
            summary.repeat_tasks_answered += 1;
        }
        for item in &set.items {
            let bucket = match catalog.kind(item) {
                Some(ItemKind::Feature) => &mut summary.feature_exposure,
                Some(ItemKind::Voucher) => &mut summary.voucher_exposure,
                None => continue,
            };
            *bucket.entry(item.clone()).or_insert(0) += 1;
        }
    }

    let total = summary.answered_tasks + summary.failed_tasks;
    summary.failure_rate = if total == 0 {
        0.0
    } else {
        summary.failed_tasks as f64 / total as f64
    };
    summary
}
