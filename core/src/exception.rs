//! Exception cases: one per doubtful merchant reference per run.
//!
//! RULE: Every state change goes through `ExceptionState::apply`.
//!   open ──verify──▶ verified ──approve──▶ approved ──resolve──▶ resolved
//!                              └─reject──▶ rejected ──resolve──▶ resolved
//!
//! Re-evaluating a run upserts: an existing case keeps its id and state,
//! its reason codes and severity follow the latest decision, and a
//! resolved case is never reopened.

use crate::config::SeverityPolicy;
use crate::decision::{MatchDecision, ReasonCode};
use crate::error::{ReconError, ReconResult};
use crate::types::{new_id, ExceptionId, MerchantRef, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionState {
    Open,
    Verified,
    Approved,
    Rejected,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionAction {
    Verify,
    Approve,
    Reject,
    Resolve,
}

impl fmt::Display for ExceptionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Verify => "verify",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Resolve => "resolve",
        })
    }
}

impl ExceptionState {
    pub fn apply(self, action: ExceptionAction) -> ReconResult<Self> {
        use ExceptionAction as A;
        use ExceptionState as S;
        match (self, action) {
            (S::Open, A::Verify) => Ok(S::Verified),
            (S::Verified, A::Approve) => Ok(S::Approved),
            (S::Verified, A::Reject) => Ok(S::Rejected),
            (S::Approved, A::Resolve) | (S::Rejected, A::Resolve) => Ok(S::Resolved),
            (from, action) => Err(ReconError::transition("exception", from, action)),
        }
    }

    /// Approved, rejected and resolved cases no longer block a daily close.
    pub fn is_addressed(self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Resolved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Verified => "verified",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "verified" => Some(Self::Verified),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

impl fmt::Display for ExceptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the daily "address doubtful" command settles open cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    #[default]
    Approve,
    Reject,
}

impl Disposition {
    /// Actions that move a case from its current state to addressed.
    pub fn path_from(self, state: ExceptionState) -> Vec<ExceptionAction> {
        let settle = match self {
            Self::Approve => ExceptionAction::Approve,
            Self::Reject => ExceptionAction::Reject,
        };
        match state {
            ExceptionState::Open => vec![ExceptionAction::Verify, settle],
            ExceptionState::Verified => vec![settle],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Highest rank among the codes. Adding a code never lowers the result.
pub fn severity_for(codes: &[ReasonCode], policy: &SeverityPolicy) -> Severity {
    codes
        .iter()
        .map(|&c| policy.severity_of(c))
        .max()
        .unwrap_or(policy.default)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionCase {
    pub id: ExceptionId,
    pub run_id: RunId,
    pub merchant_ref: MerchantRef,
    pub severity: Severity,
    pub reason_codes: Vec<ReasonCode>,
    pub state: ExceptionState,
    pub evaluation_seq: u32,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExceptionUpsert {
    Opened(ExceptionCase),
    Refreshed { case: ExceptionCase, previous: Severity },
    /// Resolved cases keep their final codes; the new evaluation is ignored.
    KeptResolved(ExceptionCase),
}

/// Decide what a doubtful decision does to the case for its reference.
/// Good decisions never touch cases.
pub fn plan_upsert(
    existing: Option<&ExceptionCase>,
    decision: &MatchDecision,
    policy: &SeverityPolicy,
    now: DateTime<Utc>,
) -> Option<ExceptionUpsert> {
    if !decision.is_doubtful() {
        return None;
    }
    let severity = severity_for(&decision.reason_codes, policy);
    Some(match existing {
        None => ExceptionUpsert::Opened(ExceptionCase {
            id: new_id(),
            run_id: decision.run_id.clone(),
            merchant_ref: decision.merchant_ref.clone(),
            severity,
            reason_codes: decision.reason_codes.clone(),
            state: ExceptionState::Open,
            evaluation_seq: decision.evaluation_seq,
            opened_at: now,
            updated_at: now,
        }),
        Some(case) if case.state == ExceptionState::Resolved => {
            ExceptionUpsert::KeptResolved(case.clone())
        }
        Some(case) => {
            let mut refreshed = case.clone();
            refreshed.severity = severity;
            refreshed.reason_codes = decision.reason_codes.clone();
            refreshed.evaluation_seq = decision.evaluation_seq;
            refreshed.updated_at = now;
            ExceptionUpsert::Refreshed { case: refreshed, previous: case.severity }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExceptionAction as A;
    use ExceptionState as S;

    #[test]
    fn legal_paths_reach_resolved() {
        let s = S::Open.apply(A::Verify).unwrap();
        let s = s.apply(A::Reject).unwrap();
        assert!(s.is_addressed());
        assert_eq!(s.apply(A::Resolve).unwrap(), S::Resolved);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        assert!(S::Open.apply(A::Approve).is_err());
        assert!(S::Open.apply(A::Resolve).is_err());
        assert!(S::Resolved.apply(A::Verify).is_err());
        assert!(S::Approved.apply(A::Reject).is_err());
        match S::Verified.apply(A::Verify) {
            Err(ReconError::InvalidTransition { entity, from, action }) => {
                assert_eq!(entity, "exception");
                assert_eq!(from, "verified");
                assert_eq!(action, "verify");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn severity_is_monotonic_in_codes() {
        let policy = SeverityPolicy::standard();
        let mut codes = vec![ReasonCode::ExactHashMismatch];
        let mut last = severity_for(&codes, &policy);
        for extra in [ReasonCode::BackdatedGapExceeded, ReasonCode::FxInsufficient, ReasonCode::ThreeWayFail] {
            codes.push(extra);
            let next = severity_for(&codes, &policy);
            assert!(next >= last);
            last = next;
        }
        assert_eq!(last, Severity::High);
    }

    #[test]
    fn disposition_paths() {
        assert_eq!(Disposition::Approve.path_from(S::Open), vec![A::Verify, A::Approve]);
        assert_eq!(Disposition::Reject.path_from(S::Verified), vec![A::Reject]);
        assert!(Disposition::Approve.path_from(S::Rejected).is_empty());
    }
}
