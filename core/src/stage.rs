//! Matching stage trait and per-stage traces.
//!
//! RULE: Every matching stage implements MatchStage.
//! The matching engine calls evaluate() on each registered stage in
//! registration order, for every merchant reference.
//! Execution order is fixed and documented in matcher.rs.
//!
//! Stages never see each other's verdicts. Combining verdicts is the
//! decision aggregator's job (decision.rs).

use crate::config::MatchingConfig;
use crate::decision::ReasonCode;
use crate::transaction::{CandidateSet, SourceType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    ExactHash,
    Fuzzy,
    ThreeWay,
    Backdated,
    Fx,
}

impl StageKind {
    pub const ORDER: [StageKind; 5] = [
        StageKind::ExactHash,
        StageKind::Fuzzy,
        StageKind::ThreeWay,
        StageKind::Backdated,
        StageKind::Fx,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ExactHash => "exact_hash",
            Self::Fuzzy => "fuzzy",
            Self::ThreeWay => "three_way",
            Self::Backdated => "backdated",
            Self::Fx => "fx",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

/// The contract every matching stage must fulfill.
pub trait MatchStage: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Pure over its inputs. A panic here is caught by the engine and
    /// recorded as a crashed stage; it never aborts the run.
    fn evaluate(&self, set: &CandidateSet, cfg: &MatchingConfig) -> StageVerdict;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageVerdict {
    pub passed: bool,
    pub trace: StageTrace,
}

impl StageVerdict {
    pub fn crashed(stage: StageKind, message: impl Into<String>) -> Self {
        Self {
            passed: false,
            trace: StageTrace::Crashed(CrashTrace { stage, message: message.into() }),
        }
    }

    /// Codes this verdict contributes, in emission order. A passing verdict
    /// contributes nothing.
    pub fn reason_codes(&self) -> Vec<ReasonCode> {
        if self.passed {
            return Vec::new();
        }
        match &self.trace {
            StageTrace::ExactHash(_) => vec![ReasonCode::ExactHashMismatch],
            StageTrace::Fuzzy(_) => vec![ReasonCode::FuzzyThresholdNotMet],
            StageTrace::ThreeWay(t) => {
                let mut codes: Vec<ReasonCode> =
                    t.missing.iter().map(|&s| ReasonCode::missing(s)).collect();
                codes.push(ReasonCode::ThreeWayFail);
                if t.present_sources >= 2 && !t.amount_check {
                    codes.push(ReasonCode::AmountMismatch);
                }
                if t.present_sources >= 2 && !t.identity_check {
                    codes.push(ReasonCode::IdentityMismatch);
                }
                codes
            }
            StageTrace::Backdated(_) => vec![ReasonCode::BackdatedGapExceeded],
            StageTrace::Fx(t) => match t.detail {
                FxDetail::ConvertedAmountMismatch => vec![ReasonCode::FxConversionMismatch],
                _ => vec![ReasonCode::FxInsufficient],
            },
            StageTrace::Crashed(_) => vec![ReasonCode::InternalError],
        }
    }
}

// ── Traces ─────────────────────────────────────────────────────────

/// Closed set of per-stage traces, persisted as JSON on each decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageTrace {
    ExactHash(ExactHashTrace),
    Fuzzy(FuzzyTrace),
    ThreeWay(ThreeWayTrace),
    Backdated(BackdatedTrace),
    Fx(FxTrace),
    Crashed(CrashTrace),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHash {
    pub source: SourceType,
    /// First 12 hex chars of the sha256 digest.
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExactHashTrace {
    pub compared_sources: usize,
    pub hashes: Vec<SourceHash>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairScore {
    pub left: SourceType,
    pub right: SourceType,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzyTrace {
    /// Minimum pairwise score; None when fewer than two sources are present.
    pub score: Option<f64>,
    pub threshold: f64,
    /// Every present source carries the same canonical hash; score is pinned to 1.0.
    #[serde(default)]
    pub hash_agreement: bool,
    pub pairs: Vec<PairScore>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreeWayTrace {
    pub present_sources: usize,
    pub missing: Vec<SourceType>,
    pub amount_check: bool,
    pub identity_check: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairGap {
    pub left: SourceType,
    pub right: SourceType,
    pub transaction_days: i64,
    pub settlement_days: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackdatedTrace {
    pub window_days: i64,
    pub max_gap_days: Option<i64>,
    pub pairs: Vec<PairGap>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FxDetail {
    NoConversionRequired,
    ConvertedWithinTolerance,
    MissingRate,
    ConvertedAmountMismatch,
}

impl FxDetail {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoConversionRequired => "no_conversion_required",
            Self::ConvertedWithinTolerance => "converted_within_tolerance",
            Self::MissingRate => "missing_rate",
            Self::ConvertedAmountMismatch => "converted_amount_mismatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCurrency {
    pub source: SourceType,
    pub currency: String,
    pub fx_rate: Option<f64>,
    /// Gross amount multiplied by the rate, when a conversion applies.
    pub converted_gross: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FxTrace {
    pub detail: FxDetail,
    pub currencies: Vec<SourceCurrency>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashTrace {
    pub stage: StageKind,
    pub message: String,
}
