//! Monthly close: pools closed days of one calendar month into an ERP batch.
//!
//! Membership: runs whose business date falls in the month and whose day is
//! closed. Completed runs of the month that are not yet closed are listed as
//! pending and block the batch.
//!
//! ERP state (centralized in `ErpState::apply`):
//!   pending ──create_journal──▶ journaled ──submit──▶ submitted
//!   pending ──submit (no good rows)────────────────▶ submitted
//!   submitted ──revert──▶ journaled | pending
//! Revert clears the submission timestamp only; the archived payload stays.

use crate::daily_ops::DailyOpsSummary;
use crate::error::{ReconError, ReconResult};
use crate::transaction::NormalizedTransaction;
use crate::types::{round2, MerchantRef, MonthKey, RunId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchAction {
    CreateJournal,
    SubmitToErp,
    RevertSubmission,
}

impl BatchAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateJournal => "create journal",
            Self::SubmitToErp => "submit to erp",
            Self::RevertSubmission => "revert submission",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ErpState {
    Pending,
    Journaled {
        journal_created_at: DateTime<Utc>,
    },
    Submitted {
        journal_created_at: Option<DateTime<Utc>>,
        submitted_at: DateTime<Utc>,
    },
}

impl ErpState {
    pub fn from_columns(journal: Option<DateTime<Utc>>, submitted: Option<DateTime<Utc>>) -> Self {
        match (journal, submitted) {
            (j, Some(submitted_at)) => Self::Submitted { journal_created_at: j, submitted_at },
            (Some(journal_created_at), None) => Self::Journaled { journal_created_at },
            (None, None) => Self::Pending,
        }
    }

    pub fn journal_created_at(&self) -> Option<DateTime<Utc>> {
        match *self {
            Self::Pending => None,
            Self::Journaled { journal_created_at } => Some(journal_created_at),
            Self::Submitted { journal_created_at, .. } => journal_created_at,
        }
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        match *self {
            Self::Submitted { submitted_at, .. } => Some(submitted_at),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Journaled { .. } => "journaled",
            Self::Submitted { .. } => "submitted",
        }
    }

    /// State legality only; batch readiness is checked by `MonthlyCloseBatch::guard`.
    pub fn apply(self, action: BatchAction, now: DateTime<Utc>) -> ReconResult<ErpState> {
        match (self, action) {
            (Self::Pending, BatchAction::CreateJournal) => Ok(Self::Journaled { journal_created_at: now }),
            (Self::Pending, BatchAction::SubmitToErp) => {
                Ok(Self::Submitted { journal_created_at: None, submitted_at: now })
            }
            (Self::Journaled { journal_created_at }, BatchAction::SubmitToErp) => Ok(Self::Submitted {
                journal_created_at: Some(journal_created_at),
                submitted_at: now,
            }),
            (Self::Submitted { journal_created_at, .. }, BatchAction::RevertSubmission) => {
                Ok(Self::from_columns(journal_created_at, None))
            }
            (state, action) => Err(ReconError::transition("monthly close", state.name(), action.as_str())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchNextAction {
    WaitForDailyClose,
    AddressDoubtful,
    NotifySources,
    CreateJournal,
    SubmitToErp,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRun {
    pub run_id: RunId,
    pub run_number: String,
    pub business_date: NaiveDate,
    pub total: u32,
    pub good: u32,
    pub doubtful: u32,
    pub unresolved: u32,
    pub notifications_required: u32,
    pub notifications_sent: u32,
    pub closed_at: Option<DateTime<Utc>>,
}

impl From<&DailyOpsSummary> for MemberRun {
    fn from(s: &DailyOpsSummary) -> Self {
        Self {
            run_id: s.run_id.clone(),
            run_number: s.run_number.clone(),
            business_date: s.business_date,
            total: s.total,
            good: s.good,
            doubtful: s.doubtful,
            unresolved: s.unresolved_doubtful,
            notifications_required: s.notifications_required,
            notifications_sent: s.notifications_sent,
            closed_at: s.closed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErpSubmissionRecord {
    pub id: i64,
    pub month: MonthKey,
    pub payload: ErpSubmissionPayload,
    pub submitted_at: DateTime<Utc>,
    pub submitted_by: String,
    pub reverted_at: Option<DateTime<Utc>>,
    pub reverted_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyCloseBatch {
    pub month: MonthKey,
    pub source_run_ids: Vec<RunId>,
    pub source_run_count: u32,
    pub source_runs: Vec<MemberRun>,
    pub pending_run_ids: Vec<RunId>,
    pub total: u32,
    pub good: u32,
    pub doubtful: u32,
    pub unresolved: u32,
    pub notifications_required: u32,
    pub notifications_sent: u32,
    pub ready_for_erp: bool,
    pub journal_created: bool,
    pub journal_created_at: Option<DateTime<Utc>>,
    pub submitted_to_erp: bool,
    pub submitted_at: Option<DateTime<Utc>>,
    pub erp_state: ErpState,
    pub next_action: BatchNextAction,
    /// Latest archived submission, kept after a revert.
    pub last_submission: Option<ErpSubmissionRecord>,
}

impl MonthlyCloseBatch {
    pub fn build(
        month: &str,
        members: Vec<MemberRun>,
        pending_run_ids: Vec<RunId>,
        erp_state: ErpState,
        last_submission: Option<ErpSubmissionRecord>,
    ) -> Self {
        let sum = |f: fn(&MemberRun) -> u32| members.iter().map(f).sum::<u32>();
        let total = sum(|m| m.total);
        let good = sum(|m| m.good);
        let doubtful = sum(|m| m.doubtful);
        let unresolved = sum(|m| m.unresolved);
        let required = sum(|m| m.notifications_required);
        let sent = sum(|m| m.notifications_sent);
        let count = members.len() as u32;
        let ready_for_erp = count > 0 && pending_run_ids.is_empty() && unresolved == 0 && sent >= required;
        let journal_created_at = erp_state.journal_created_at();
        let submitted_at = erp_state.submitted_at();

        let next_action = if submitted_at.is_some() {
            BatchNextAction::Completed
        } else if count == 0 || !pending_run_ids.is_empty() {
            BatchNextAction::WaitForDailyClose
        } else if unresolved > 0 {
            BatchNextAction::AddressDoubtful
        } else if sent < required {
            BatchNextAction::NotifySources
        } else if good > 0 && journal_created_at.is_none() {
            BatchNextAction::CreateJournal
        } else {
            BatchNextAction::SubmitToErp
        };

        Self {
            month: month.to_string(),
            source_run_ids: members.iter().map(|m| m.run_id.clone()).collect(),
            source_run_count: count,
            source_runs: members,
            pending_run_ids,
            total,
            good,
            doubtful,
            unresolved,
            notifications_required: required,
            notifications_sent: sent,
            ready_for_erp,
            journal_created: journal_created_at.is_some(),
            journal_created_at,
            submitted_to_erp: submitted_at.is_some(),
            submitted_at,
            erp_state,
            next_action,
            last_submission,
        }
    }

    fn not_ready(&self, action: BatchAction) -> ReconError {
        let why = if self.source_run_count == 0 {
            "no closed runs in the month".to_string()
        } else if !self.pending_run_ids.is_empty() {
            format!("{} run(s) of the month are not closed yet", self.pending_run_ids.len())
        } else if self.unresolved > 0 {
            format!("{} doubtful transaction(s) unresolved", self.unresolved)
        } else {
            format!(
                "source notifications incomplete ({}/{})",
                self.notifications_sent, self.notifications_required
            )
        };
        ReconError::PreconditionFailed(format!("cannot {} for {}: {why}", action.as_str(), self.month))
    }

    /// Batch-level preconditions, then state legality. Returns the next state.
    pub fn guard(&self, action: BatchAction, now: DateTime<Utc>) -> ReconResult<ErpState> {
        match action {
            BatchAction::CreateJournal => {
                if !self.ready_for_erp {
                    return Err(self.not_ready(action));
                }
                if self.good == 0 {
                    return Err(ReconError::PreconditionFailed(format!(
                        "cannot create journal for {}: no good transactions",
                        self.month
                    )));
                }
            }
            BatchAction::SubmitToErp => {
                if !self.ready_for_erp {
                    return Err(self.not_ready(action));
                }
                if self.good > 0 && !self.journal_created {
                    return Err(ReconError::PreconditionFailed(format!(
                        "cannot submit {} to ERP before the journal is created",
                        self.month
                    )));
                }
            }
            BatchAction::RevertSubmission => {}
        }
        self.erp_state.apply(action, now)
    }
}

// ── ERP payload ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmountTotals {
    pub transactions: u32,
    /// Sum of gross amounts settled.
    pub settlement_total: f64,
    pub fee_total: f64,
    /// Sum of net payouts withdrawn to the merchant.
    pub withdrawal_total: f64,
}

impl AmountTotals {
    fn empty() -> Self {
        Self { transactions: 0, settlement_total: 0.0, fee_total: 0.0, withdrawal_total: 0.0 }
    }

    fn add(&mut self, row: &NormalizedTransaction) {
        self.transactions += 1;
        self.settlement_total = round2(self.settlement_total + row.gross_amount);
        self.fee_total = round2(self.fee_total + row.processing_fee);
        self.withdrawal_total = round2(self.withdrawal_total + row.net_payout);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunBreakdown {
    pub run_id: RunId,
    pub run_number: String,
    pub business_date: NaiveDate,
    pub by_currency: BTreeMap<String, AmountTotals>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErpSubmissionPayload {
    pub month: MonthKey,
    pub expected_good_transactions: u32,
    pub source_run_ids: Vec<RunId>,
    pub runs: Vec<RunBreakdown>,
    pub by_currency: BTreeMap<String, AmountTotals>,
    pub warnings: Vec<String>,
}

/// Good rows of one member run, already picked from the preferred source.
pub struct GoodRows<'a> {
    pub member: &'a MemberRun,
    pub rows: Vec<(MerchantRef, NormalizedTransaction)>,
}

pub fn build_payload(batch: &MonthlyCloseBatch, runs: &[GoodRows<'_>], epsilon: f64) -> ErpSubmissionPayload {
    let mut by_currency: BTreeMap<String, AmountTotals> = BTreeMap::new();
    let mut warnings = Vec::new();
    let mut breakdowns = Vec::new();
    let mut counted = 0u32;
    for run in runs {
        let mut run_totals: BTreeMap<String, AmountTotals> = BTreeMap::new();
        for (merchant_ref, row) in &run.rows {
            let currency = row.currency.trim().to_ascii_uppercase();
            run_totals.entry(currency.clone()).or_insert_with(AmountTotals::empty).add(row);
            by_currency.entry(currency).or_insert_with(AmountTotals::empty).add(row);
            counted += 1;
            let delta = row.gross_amount - row.processing_fee - row.net_payout;
            if delta.abs() > epsilon {
                warnings.push(format!(
                    "{} {merchant_ref}: gross - fee - net = {delta:.2}",
                    run.member.run_number
                ));
            }
        }
        breakdowns.push(RunBreakdown {
            run_id: run.member.run_id.clone(),
            run_number: run.member.run_number.clone(),
            business_date: run.member.business_date,
            by_currency: run_totals,
        });
    }
    if counted != batch.good {
        warnings.push(format!(
            "expected {} good transactions but found {counted} source rows",
            batch.good
        ));
    }
    ErpSubmissionPayload {
        month: batch.month.clone(),
        expected_good_transactions: batch.good,
        source_run_ids: batch.source_run_ids.clone(),
        runs: breakdowns,
        by_currency,
        warnings,
    }
}
