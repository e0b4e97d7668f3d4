//! Daily operations: the per-run close-out workflow.
//!
//! A completed run is worked through:
//!   address doubtful → notify sources (per month with doubtful rows) → close day
//!
//! RULES:
//!   - The summary is derived, never stored: it is recomputed from the
//!     run's latest decisions, its cases, its notifications and its close record.
//!   - Commands whose precondition fails are rejected with the reason;
//!     nothing is silently skipped.
//!   - A closed day is terminal.

use crate::decision::{MatchDecision, ReasonCode};
use crate::error::{ReconError, ReconResult};
use crate::exception::{ExceptionCase, ExceptionState, Severity};
use crate::notification::{derive_recipients, group_targets, Recipient, RecipientTarget};
use crate::run::{ReconRun, RunStatus};
use crate::transaction::SourceType;
use crate::types::{ExceptionId, MerchantRef, MonthKey, RunId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthNotification {
    pub run_id: RunId,
    pub month: MonthKey,
    pub notified_at: DateTime<Utc>,
    pub notified_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyCloseRecord {
    pub run_id: RunId,
    pub closed_at: DateTime<Utc>,
    pub closed_by: String,
}

/// Everything persisted about one run that the daily view is derived from.
#[derive(Debug, Clone)]
pub struct RunLedger {
    pub run: ReconRun,
    /// Latest evaluation generation only.
    pub decisions: Vec<MatchDecision>,
    pub exceptions: Vec<ExceptionCase>,
    pub notifications: Vec<MonthNotification>,
    pub close: Option<DailyCloseRecord>,
    /// The monthly batch of the run's business month has been submitted.
    pub month_submitted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseState {
    Open,
    ReadyToClose,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DailyNextAction {
    WaitRunCompletion,
    AddressDoubtful,
    SendNotifications,
    CloseDay,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionNextAction {
    AddressDoubtful,
    NotifySources,
    CloseDay,
    MonthlyClose,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoubtfulDetail {
    pub merchant_ref: MerchantRef,
    pub exception_id: Option<ExceptionId>,
    pub state: ExceptionState,
    pub severity: Option<Severity>,
    pub reason_codes: Vec<ReasonCode>,
    pub missing_sources: Vec<SourceType>,
    pub recipients: Vec<Recipient>,
}

/// Per (run, transaction month) work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlySubmission {
    pub run_id: RunId,
    pub month: MonthKey,
    pub total: u32,
    pub good: u32,
    pub doubtful: u32,
    pub addressed: u32,
    pub unresolved: u32,
    pub notified_to_source: bool,
    pub notified_at: Option<DateTime<Utc>>,
    pub next_action: SubmissionNextAction,
    pub alert_recipients: Vec<RecipientTarget>,
    pub doubtful_details: Vec<DoubtfulDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyOpsSummary {
    pub run_id: RunId,
    pub run_number: String,
    pub run_status: RunStatus,
    pub business_date: NaiveDate,
    pub total: u32,
    pub good: u32,
    pub doubtful: u32,
    pub unresolved_doubtful: u32,
    pub addressed_doubtful: u32,
    pub notifications_required: u32,
    pub notifications_sent: u32,
    pub close_state: CloseState,
    pub next_action: DailyNextAction,
    pub closed_at: Option<DateTime<Utc>>,
    pub closed_by: Option<String>,
    pub notification_targets: Vec<RecipientTarget>,
    pub monthly_items: Vec<MonthlySubmission>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DailyAction {
    AddressDoubtful,
    SendNotifications,
    CloseDay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonthAction {
    Address,
    Notify,
}

fn detail_for(decision: &MatchDecision, case: Option<&ExceptionCase>) -> DoubtfulDetail {
    DoubtfulDetail {
        merchant_ref: decision.merchant_ref.clone(),
        exception_id: case.map(|c| c.id.clone()),
        state: case.map_or(ExceptionState::Open, |c| c.state),
        severity: case.map(|c| c.severity),
        reason_codes: decision.reason_codes.clone(),
        missing_sources: decision.reason_codes.iter().filter_map(|c| c.missing_source()).collect(),
        recipients: derive_recipients(&decision.reason_codes),
    }
}

fn targets_for(details: &[DoubtfulDetail]) -> Vec<RecipientTarget> {
    group_targets(details.iter().map(|d| (&d.merchant_ref, d.recipients.as_slice())))
}

impl RunLedger {
    fn case_index(&self) -> HashMap<&str, &ExceptionCase> {
        self.exceptions.iter().map(|c| (c.merchant_ref.as_str(), c)).collect()
    }

    pub fn notified_months(&self) -> BTreeMap<&str, &MonthNotification> {
        self.notifications.iter().map(|n| (n.month.as_str(), n)).collect()
    }

    pub fn monthly_submissions(&self) -> Vec<MonthlySubmission> {
        let cases = self.case_index();
        let notified = self.notified_months();
        let mut by_month: BTreeMap<&str, Vec<&MatchDecision>> = BTreeMap::new();
        for d in &self.decisions {
            by_month.entry(d.transaction_month.as_str()).or_default().push(d);
        }
        by_month
            .into_iter()
            .map(|(month, decisions)| {
                let details: Vec<DoubtfulDetail> = decisions
                    .iter()
                    .filter(|d| d.is_doubtful())
                    .map(|d| detail_for(d, cases.get(d.merchant_ref.as_str()).copied()))
                    .collect();
                let total = decisions.len() as u32;
                let doubtful = details.len() as u32;
                let addressed = details.iter().filter(|d| d.state.is_addressed()).count() as u32;
                let unresolved = doubtful - addressed;
                let note = notified.get(month);
                let next_action = if unresolved > 0 {
                    SubmissionNextAction::AddressDoubtful
                } else if doubtful > 0 && note.is_none() {
                    SubmissionNextAction::NotifySources
                } else if self.close.is_none() {
                    SubmissionNextAction::CloseDay
                } else if !self.month_submitted {
                    SubmissionNextAction::MonthlyClose
                } else {
                    SubmissionNextAction::Done
                };
                MonthlySubmission {
                    run_id: self.run.id.clone(),
                    month: month.to_string(),
                    total,
                    good: total - doubtful,
                    doubtful,
                    addressed,
                    unresolved,
                    notified_to_source: note.is_some(),
                    notified_at: note.map(|n| n.notified_at),
                    next_action,
                    alert_recipients: targets_for(&details),
                    doubtful_details: details,
                }
            })
            .collect()
    }

    pub fn summary(&self) -> DailyOpsSummary {
        let monthly_items = self.monthly_submissions();
        let sum = |f: fn(&MonthlySubmission) -> u32| monthly_items.iter().map(f).sum::<u32>();
        let total = sum(|m| m.total);
        let good = sum(|m| m.good);
        let doubtful = sum(|m| m.doubtful);
        let unresolved = sum(|m| m.unresolved);
        let addressed = sum(|m| m.addressed);
        let required = monthly_items.iter().filter(|m| m.doubtful > 0).count() as u32;
        let sent = monthly_items
            .iter()
            .filter(|m| m.doubtful > 0 && m.notified_to_source)
            .count() as u32;

        let completed = self.run.status == RunStatus::Completed;
        let (close_state, next_action) = if self.close.is_some() {
            (CloseState::Closed, DailyNextAction::Closed)
        } else if !completed {
            (CloseState::Open, DailyNextAction::WaitRunCompletion)
        } else if unresolved > 0 {
            (CloseState::Open, DailyNextAction::AddressDoubtful)
        } else if sent < required {
            (CloseState::Open, DailyNextAction::SendNotifications)
        } else {
            (CloseState::ReadyToClose, DailyNextAction::CloseDay)
        };

        let all_details: Vec<DoubtfulDetail> = monthly_items
            .iter()
            .flat_map(|m| m.doubtful_details.iter().cloned())
            .collect();

        DailyOpsSummary {
            run_id: self.run.id.clone(),
            run_number: self.run.run_number.clone(),
            run_status: self.run.status,
            business_date: self.run.business_date,
            total,
            good,
            doubtful,
            unresolved_doubtful: unresolved,
            addressed_doubtful: addressed,
            notifications_required: required,
            notifications_sent: sent,
            close_state,
            next_action,
            closed_at: self.close.as_ref().map(|c| c.closed_at),
            closed_by: self.close.as_ref().map(|c| c.closed_by.clone()),
            notification_targets: targets_for(&all_details),
            monthly_items,
        }
    }
}

impl DailyOpsSummary {
    fn guard_open(&self, action: &str) -> ReconResult<()> {
        if self.close_state == CloseState::Closed {
            return Err(ReconError::transition("daily close", "closed", action));
        }
        if self.run_status != RunStatus::Completed {
            return Err(ReconError::PreconditionFailed(format!(
                "run {} is {}; daily operations need a completed run",
                self.run_number, self.run_status
            )));
        }
        Ok(())
    }

    /// Centralized precondition check for the run-level daily commands.
    pub fn guard(&self, action: DailyAction) -> ReconResult<()> {
        match action {
            DailyAction::AddressDoubtful => {
                self.guard_open("address doubtful")?;
                if self.unresolved_doubtful == 0 {
                    return Err(ReconError::PreconditionFailed(
                        "no unresolved doubtful transactions to address".into(),
                    ));
                }
            }
            DailyAction::SendNotifications => {
                self.guard_open("send notifications")?;
                if self.unresolved_doubtful > 0 {
                    return Err(ReconError::PreconditionFailed(format!(
                        "{} doubtful transaction(s) still unresolved",
                        self.unresolved_doubtful
                    )));
                }
                if self.notifications_sent >= self.notifications_required {
                    return Err(ReconError::PreconditionFailed("no notifications pending".into()));
                }
            }
            DailyAction::CloseDay => {
                self.guard_open("close day")?;
                if self.close_state != CloseState::ReadyToClose {
                    return Err(ReconError::PreconditionFailed(format!(
                        "day is not ready to close; next action is {:?}",
                        self.next_action
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn month(&self, month: &str) -> ReconResult<&MonthlySubmission> {
        self.monthly_items
            .iter()
            .find(|m| m.month == month)
            .ok_or_else(|| ReconError::InvalidInput(format!("run {} has no transactions in {month}", self.run_number)))
    }

    pub fn guard_month(&self, month: &str, action: MonthAction) -> ReconResult<&MonthlySubmission> {
        let item = self.month(month)?;
        match action {
            MonthAction::Address => {
                self.guard_open("address month")?;
                if item.unresolved == 0 {
                    return Err(ReconError::PreconditionFailed(format!(
                        "month {month} has no unresolved doubtful transactions"
                    )));
                }
            }
            MonthAction::Notify => {
                self.guard_open("notify month")?;
                if item.doubtful == 0 {
                    return Err(ReconError::PreconditionFailed(format!(
                        "month {month} has no doubtful transactions to notify"
                    )));
                }
                if item.unresolved > 0 {
                    return Err(ReconError::PreconditionFailed(format!(
                        "month {month} still has {} unresolved doubtful transaction(s)",
                        item.unresolved
                    )));
                }
                if item.notified_to_source {
                    return Err(ReconError::PreconditionFailed(format!(
                        "month {month} was already notified"
                    )));
                }
            }
        }
        Ok(item)
    }
}
