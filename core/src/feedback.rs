//! Human feedback on AI review steps, and the aggregate metrics over it.

use crate::review::ReviewStage;
use crate::types::{round2, ExceptionId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackType {
    Accept,
    Reject,
    EditApply,
    NeedsEvidence,
}

impl FeedbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::EditApply => "edit_apply",
            Self::NeedsEvidence => "needs_evidence",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accept" => Some(Self::Accept),
            "reject" => Some(Self::Reject),
            "edit_apply" => Some(Self::EditApply),
            "needs_evidence" => Some(Self::NeedsEvidence),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AIFeedback {
    pub id: String,
    pub exception_id: ExceptionId,
    pub run_id: RunId,
    pub user_id: String,
    pub stage: ReviewStage,
    pub step_id: Option<String>,
    pub feedback_type: FeedbackType,
    pub reason_codes: Vec<String>,
    pub edited_action: Option<String>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for recording feedback; ids and timestamps are assigned by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackInput {
    pub exception_id: ExceptionId,
    pub user_id: String,
    pub stage: ReviewStage,
    #[serde(default)]
    pub step_id: Option<String>,
    pub feedback_type: FeedbackType,
    #[serde(default)]
    pub reason_codes: Vec<String>,
    #[serde(default)]
    pub edited_action: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasonCount {
    pub reason: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackMetrics {
    pub total_feedback: usize,
    /// Percentage of accepts, rounded to two decimals.
    pub acceptance_rate: f64,
    pub by_type: BTreeMap<String, usize>,
    pub top_reject_reasons: Vec<ReasonCount>,
}

const TOP_REJECT_REASONS: usize = 5;

pub fn compute_metrics(rows: &[AIFeedback]) -> FeedbackMetrics {
    let total_feedback = rows.len();
    let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
    let mut rejects: HashMap<&str, usize> = HashMap::new();
    for row in rows {
        *by_type.entry(row.feedback_type.as_str().to_string()).or_default() += 1;
        if row.feedback_type == FeedbackType::Reject {
            for reason in &row.reason_codes {
                *rejects.entry(reason.as_str()).or_default() += 1;
            }
        }
    }
    let accepted = by_type.get(FeedbackType::Accept.as_str()).copied().unwrap_or(0);
    let acceptance_rate = if total_feedback == 0 {
        0.0
    } else {
        round2(accepted as f64 * 100.0 / total_feedback as f64)
    };
    let mut top: Vec<ReasonCount> = rejects
        .into_iter()
        .map(|(reason, count)| ReasonCount { reason: reason.to_string(), count })
        .collect();
    top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.reason.cmp(&b.reason)));
    top.truncate(TOP_REJECT_REASONS);
    FeedbackMetrics { total_feedback, acceptance_rate, by_type, top_reject_reasons: top }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fb(t: FeedbackType, reasons: &[&str]) -> AIFeedback {
        AIFeedback {
            id: "f".into(),
            exception_id: "e".into(),
            run_id: "r".into(),
            user_id: "u".into(),
            stage: ReviewStage::Intern,
            step_id: None,
            feedback_type: t,
            reason_codes: reasons.iter().map(|s| s.to_string()).collect(),
            edited_action: None,
            comment: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn empty_metrics_are_zero() {
        let m = compute_metrics(&[]);
        assert_eq!(m.total_feedback, 0);
        assert_eq!(m.acceptance_rate, 0.0);
        assert!(m.top_reject_reasons.is_empty());
    }

    #[test]
    fn acceptance_rate_and_reject_ranking() {
        let rows = vec![
            fb(FeedbackType::Accept, &[]),
            fb(FeedbackType::Accept, &[]),
            fb(FeedbackType::Reject, &["wrong_root_cause", "missing_context"]),
            fb(FeedbackType::Reject, &["wrong_root_cause"]),
            fb(FeedbackType::EditApply, &["ignored"]),
            fb(FeedbackType::NeedsEvidence, &[]),
        ];
        let m = compute_metrics(&rows);
        assert_eq!(m.total_feedback, 6);
        assert_eq!(m.acceptance_rate, 33.33);
        assert_eq!(m.by_type["reject"], 2);
        assert_eq!(m.top_reject_reasons[0], ReasonCount { reason: "wrong_root_cause".into(), count: 2 });
        assert_eq!(m.top_reject_reasons.len(), 2);
    }
}
