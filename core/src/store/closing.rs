use super::{json_col, opt_ts_col, ts_col, ReconStore};
use crate::daily_ops::{DailyCloseRecord, MonthNotification, RunLedger};
use crate::error::ReconResult;
use crate::monthly_close::{ErpState, ErpSubmissionPayload, ErpSubmissionRecord};
use crate::types::month_key;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

impl ReconStore {
    // ── Daily close-out ────────────────────────────────────────

    pub fn insert_month_notification(&self, n: &MonthNotification) -> ReconResult<()> {
        self.conn.execute(
            "INSERT INTO month_notification (run_id, month, notified_at, notified_by)
             VALUES (?1, ?2, ?3, ?4)",
            params![n.run_id, n.month, n.notified_at.to_rfc3339(), n.notified_by],
        )?;
        Ok(())
    }

    pub fn month_notifications(&self, run_id: &str) -> ReconResult<Vec<MonthNotification>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, month, notified_at, notified_by
             FROM month_notification WHERE run_id = ?1 ORDER BY month ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(MonthNotification {
                    run_id: row.get(0)?,
                    month: row.get(1)?,
                    notified_at: ts_col(row, 2)?,
                    notified_by: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn insert_daily_close(&self, close: &DailyCloseRecord) -> ReconResult<()> {
        self.conn.execute(
            "INSERT INTO daily_close (run_id, closed_at, closed_by) VALUES (?1, ?2, ?3)",
            params![close.run_id, close.closed_at.to_rfc3339(), close.closed_by],
        )?;
        Ok(())
    }

    pub fn daily_close(&self, run_id: &str) -> ReconResult<Option<DailyCloseRecord>> {
        let found = self
            .conn
            .query_row(
                "SELECT run_id, closed_at, closed_by FROM daily_close WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok(DailyCloseRecord {
                        run_id: row.get(0)?,
                        closed_at: ts_col(row, 1)?,
                        closed_by: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(found)
    }

    /// Everything the daily view of one run is derived from.
    pub fn run_ledger(&self, run_id: &str) -> ReconResult<RunLedger> {
        let run = self.get_run(run_id)?;
        let month_submitted = self.erp_state(&month_key(run.business_date))?.submitted_at().is_some();
        Ok(RunLedger {
            decisions: self.latest_decisions(run_id)?,
            exceptions: self.exceptions_for_run(run_id)?,
            notifications: self.month_notifications(run_id)?,
            close: self.daily_close(run_id)?,
            month_submitted,
            run,
        })
    }

    // ── Monthly close ──────────────────────────────────────────

    pub fn erp_state(&self, month: &str) -> ReconResult<ErpState> {
        let found = self
            .conn
            .query_row(
                "SELECT journal_created_at, submitted_at FROM monthly_close WHERE month = ?1",
                params![month],
                |row| Ok((opt_ts_col(row, 0)?, opt_ts_col(row, 1)?)),
            )
            .optional()?;
        Ok(match found {
            Some((journal, submitted)) => ErpState::from_columns(journal, submitted),
            None => ErpState::Pending,
        })
    }

    pub fn save_erp_state(&self, month: &str, state: &ErpState, at: DateTime<Utc>) -> ReconResult<()> {
        self.conn.execute(
            "INSERT INTO monthly_close (month, journal_created_at, submitted_at, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(month) DO UPDATE SET
               journal_created_at = excluded.journal_created_at,
               submitted_at = excluded.submitted_at,
               updated_at = excluded.updated_at",
            params![
                month,
                state.journal_created_at().map(|t| t.to_rfc3339()),
                state.submitted_at().map(|t| t.to_rfc3339()),
                at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn insert_erp_submission(
        &self,
        month: &str,
        payload: &ErpSubmissionPayload,
        at: DateTime<Utc>,
        by: &str,
    ) -> ReconResult<i64> {
        self.conn.execute(
            "INSERT INTO erp_submission (month, payload_json, submitted_at, submitted_by)
             VALUES (?1, ?2, ?3, ?4)",
            params![month, serde_json::to_string(payload)?, at.to_rfc3339(), by],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn mark_submission_reverted(&self, id: i64, at: DateTime<Utc>, by: &str) -> ReconResult<()> {
        self.conn.execute(
            "UPDATE erp_submission SET reverted_at = ?2, reverted_by = ?3 WHERE id = ?1",
            params![id, at.to_rfc3339(), by],
        )?;
        Ok(())
    }

    pub fn submissions(&self, month: &str) -> ReconResult<Vec<ErpSubmissionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, month, payload_json, submitted_at, submitted_by, reverted_at, reverted_by
             FROM erp_submission WHERE month = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![month], |row| {
                Ok(ErpSubmissionRecord {
                    id: row.get(0)?,
                    month: row.get(1)?,
                    payload: json_col(row, 2)?,
                    submitted_at: ts_col(row, 3)?,
                    submitted_by: row.get(4)?,
                    reverted_at: opt_ts_col(row, 5)?,
                    reverted_by: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn latest_submission(&self, month: &str) -> ReconResult<Option<ErpSubmissionRecord>> {
        Ok(self.submissions(month)?.pop())
    }
}
