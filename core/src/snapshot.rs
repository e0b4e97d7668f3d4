//! Transaction snapshot: what each source says about one reference,
//! side by side with the consistency checks and the latest decision.

use crate::decision::MatchDecision;
use crate::matcher::{amounts_consistent, identity_consistent};
use crate::transaction::{CandidateSet, NormalizedTransaction, SourceError, SourceType};
use crate::types::{MerchantRef, RunId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub source: SourceType,
    pub found: bool,
    pub error: Option<SourceError>,
    pub row: Option<NormalizedTransaction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChecks {
    pub compared_sources: usize,
    pub amount_consistency: bool,
    pub identity_consistency: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSnapshot {
    pub run_id: RunId,
    pub merchant_ref: MerchantRef,
    pub sources: Vec<SourceSnapshot>,
    pub checks: SnapshotChecks,
    pub decision: Option<MatchDecision>,
}

impl TransactionSnapshot {
    pub fn build(run_id: &str, set: CandidateSet, decision: Option<MatchDecision>, epsilon: f64) -> Self {
        let rows: Vec<&NormalizedTransaction> = set.present().into_iter().map(|(_, r)| r).collect();
        let comparable = rows.len() >= 2;
        let checks = SnapshotChecks {
            compared_sources: rows.len(),
            amount_consistency: comparable && amounts_consistent(&rows, epsilon),
            identity_consistency: comparable && identity_consistent(&rows),
        };
        let merchant_ref = set.merchant_ref.clone();
        let sources = [set.internal, set.erp, set.psp]
            .into_iter()
            .map(|c| SourceSnapshot {
                source: c.source,
                found: c.row.is_some(),
                error: c.error,
                row: c.row,
            })
            .collect();
        Self { run_id: run_id.to_string(), merchant_ref, sources, checks, decision }
    }

    pub fn source(&self, source: SourceType) -> Option<&SourceSnapshot> {
        self.sources.iter().find(|s| s.source == source)
    }
}
