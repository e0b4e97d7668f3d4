//! Decision aggregation: folds five stage verdicts into one final status.
//!
//! RULE: A transaction is GOOD iff
//!   three_way passes AND (exact_hash OR fuzzy passes)
//!   AND backdated passes AND fx passes.
//! Everything else is DOUBTFUL. `aggregate()` is a pure function of the
//! verdicts; it reads no config and no clock.

use crate::stage::{StageKind, StageTrace, StageVerdict};
use crate::transaction::{SourceError, SourceType};
use crate::types::{MerchantRef, MonthKey, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    ExactHashMismatch,
    FuzzyThresholdNotMet,
    MissingInternal,
    MissingErp,
    MissingPsp,
    ThreeWayFail,
    AmountMismatch,
    IdentityMismatch,
    BackdatedGapExceeded,
    FxInsufficient,
    FxConversionMismatch,
    InternalError,
}

impl ReasonCode {
    pub fn missing(source: SourceType) -> Self {
        match source {
            SourceType::Internal => Self::MissingInternal,
            SourceType::Erp => Self::MissingErp,
            SourceType::Psp => Self::MissingPsp,
        }
    }

    pub fn missing_source(&self) -> Option<SourceType> {
        match self {
            Self::MissingInternal => Some(SourceType::Internal),
            Self::MissingErp => Some(SourceType::Erp),
            Self::MissingPsp => Some(SourceType::Psp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExactHashMismatch => "EXACT_HASH_MISMATCH",
            Self::FuzzyThresholdNotMet => "FUZZY_THRESHOLD_NOT_MET",
            Self::MissingInternal => "MISSING_INTERNAL",
            Self::MissingErp => "MISSING_ERP",
            Self::MissingPsp => "MISSING_PSP",
            Self::ThreeWayFail => "THREE_WAY_FAIL",
            Self::AmountMismatch => "AMOUNT_MISMATCH",
            Self::IdentityMismatch => "IDENTITY_MISMATCH",
            Self::BackdatedGapExceeded => "BACKDATED_GAP_EXCEEDED",
            Self::FxInsufficient => "FX_INSUFFICIENT",
            Self::FxConversionMismatch => "FX_CONVERSION_MISMATCH",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    GoodTransaction,
    DoubtfulTransaction,
}

impl FinalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GoodTransaction => "good_transaction",
            Self::DoubtfulTransaction => "doubtful_transaction",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "good_transaction" => Some(Self::GoodTransaction),
            "doubtful_transaction" => Some(Self::DoubtfulTransaction),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResults {
    pub exact_hash: bool,
    pub fuzzy: bool,
    pub three_way: bool,
    pub backdated: bool,
    pub fx_handled: bool,
}

impl StageResults {
    pub fn is_good(&self) -> bool {
        self.three_way && (self.exact_hash || self.fuzzy) && self.backdated && self.fx_handled
    }
}

/// One verdict per stage, indexed by `StageKind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageVerdicts {
    pub exact_hash: StageVerdict,
    pub fuzzy: StageVerdict,
    pub three_way: StageVerdict,
    pub backdated: StageVerdict,
    pub fx: StageVerdict,
}

impl StageVerdicts {
    pub fn get(&self, kind: StageKind) -> &StageVerdict {
        match kind {
            StageKind::ExactHash => &self.exact_hash,
            StageKind::Fuzzy => &self.fuzzy,
            StageKind::ThreeWay => &self.three_way,
            StageKind::Backdated => &self.backdated,
            StageKind::Fx => &self.fx,
        }
    }

    pub fn results(&self) -> StageResults {
        StageResults {
            exact_hash: self.exact_hash.passed,
            fuzzy: self.fuzzy.passed,
            three_way: self.three_way.passed,
            backdated: self.backdated.passed,
            fx_handled: self.fx.passed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregated {
    pub status: FinalStatus,
    pub results: StageResults,
    pub reason_codes: Vec<ReasonCode>,
}

pub fn aggregate(verdicts: &StageVerdicts) -> Aggregated {
    let results = verdicts.results();
    let mut reason_codes: Vec<ReasonCode> = Vec::new();
    for kind in StageKind::ORDER {
        for code in verdicts.get(kind).reason_codes() {
            if !reason_codes.contains(&code) {
                reason_codes.push(code);
            }
        }
    }
    let status = if results.is_good() {
        FinalStatus::GoodTransaction
    } else {
        FinalStatus::DoubtfulTransaction
    };
    Aggregated { status, results, reason_codes }
}

// ── Persisted decision ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePresence {
    pub source: SourceType,
    pub found: bool,
    pub error: Option<SourceError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchTrace {
    pub sources: Vec<SourcePresence>,
    pub stages: Vec<StageTrace>,
}

/// Immutable per-reference outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchDecision {
    pub run_id: RunId,
    pub merchant_ref: MerchantRef,
    pub evaluation_seq: u32,
    pub final_status: FinalStatus,
    pub reason_codes: Vec<ReasonCode>,
    pub stage_results: StageResults,
    pub transaction_month: MonthKey,
    pub fuzzy_score: Option<f64>,
    pub backdated_gap_days: Option<i64>,
    pub fx_detail: Option<String>,
    pub trace: MatchTrace,
    pub evaluated_at: DateTime<Utc>,
}

impl MatchDecision {
    pub fn is_doubtful(&self) -> bool {
        self.final_status == FinalStatus::DoubtfulTransaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::*;

    fn pass(trace: StageTrace) -> StageVerdict {
        StageVerdict { passed: true, trace }
    }

    fn fail(trace: StageTrace) -> StageVerdict {
        StageVerdict { passed: false, trace }
    }

    fn exact() -> StageTrace {
        StageTrace::ExactHash(ExactHashTrace { compared_sources: 3, hashes: vec![] })
    }
    fn fuzzy() -> StageTrace {
        StageTrace::Fuzzy(FuzzyTrace { score: Some(0.8), threshold: 0.9, hash_agreement: false, pairs: vec![] })
    }
    fn three_way(missing: Vec<SourceType>, amounts: bool) -> StageTrace {
        StageTrace::ThreeWay(ThreeWayTrace {
            present_sources: 3 - missing.len(),
            missing,
            amount_check: amounts,
            identity_check: true,
        })
    }
    fn backdated() -> StageTrace {
        StageTrace::Backdated(BackdatedTrace { window_days: 3, max_gap_days: Some(0), pairs: vec![] })
    }
    fn fx() -> StageTrace {
        StageTrace::Fx(FxTrace { detail: FxDetail::NoConversionRequired, currencies: vec![] })
    }

    fn all_pass() -> StageVerdicts {
        StageVerdicts {
            exact_hash: pass(exact()),
            fuzzy: pass(fuzzy()),
            three_way: pass(three_way(vec![], true)),
            backdated: pass(backdated()),
            fx: pass(fx()),
        }
    }

    #[test]
    fn decision_rule_matches_truth_table() {
        for bits in 0u8..32 {
            let mut v = all_pass();
            v.exact_hash.passed = bits & 1 != 0;
            v.fuzzy.passed = bits & 2 != 0;
            v.three_way.passed = bits & 4 != 0;
            v.backdated.passed = bits & 8 != 0;
            v.fx.passed = bits & 16 != 0;
            let expected_good = v.three_way.passed
                && (v.exact_hash.passed || v.fuzzy.passed)
                && v.backdated.passed
                && v.fx.passed;
            let agg = aggregate(&v);
            assert_eq!(
                agg.status == FinalStatus::GoodTransaction,
                expected_good,
                "bits {bits:05b}"
            );
        }
    }

    #[test]
    fn fuzzy_rescue_keeps_exact_mismatch_code() {
        let mut v = all_pass();
        v.exact_hash = fail(exact());
        let agg = aggregate(&v);
        assert_eq!(agg.status, FinalStatus::GoodTransaction);
        assert_eq!(agg.reason_codes, vec![ReasonCode::ExactHashMismatch]);
    }

    #[test]
    fn missing_source_codes_precede_three_way_fail() {
        let mut v = all_pass();
        v.three_way = fail(three_way(vec![SourceType::Psp], true));
        let agg = aggregate(&v);
        assert_eq!(agg.status, FinalStatus::DoubtfulTransaction);
        assert_eq!(agg.reason_codes, vec![ReasonCode::MissingPsp, ReasonCode::ThreeWayFail]);
    }

    #[test]
    fn crashed_stage_becomes_internal_error() {
        let mut v = all_pass();
        v.fx = StageVerdict::crashed(StageKind::Fx, "boom");
        let agg = aggregate(&v);
        assert_eq!(agg.status, FinalStatus::DoubtfulTransaction);
        assert_eq!(agg.reason_codes, vec![ReasonCode::InternalError]);
    }

    #[test]
    fn codes_are_deduplicated() {
        let mut v = all_pass();
        v.three_way = StageVerdict::crashed(StageKind::ThreeWay, "a");
        v.fx = StageVerdict::crashed(StageKind::Fx, "b");
        assert_eq!(aggregate(&v).reason_codes, vec![ReasonCode::InternalError]);
    }
}
