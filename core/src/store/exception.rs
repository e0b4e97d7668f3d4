use super::{enum_col, json_col, not_found_as, ts_col, ReconStore};
use crate::error::{ReconError, ReconResult};
use crate::exception::{ExceptionCase, ExceptionState, Severity};
use crate::feedback::{AIFeedback, FeedbackType};
use crate::review::{AIReviewStep, ReviewStage};
use rusqlite::{params, OptionalExtension, Row};

const CASE_COLUMNS: &str = "exception_id, run_id, merchant_ref, severity, reason_codes, state,
     evaluation_seq, opened_at, updated_at";

const STEP_COLUMNS: &str = "step_id, exception_id, chain_seq, stage, confidence, output_json, engine, created_at";

const FEEDBACK_COLUMNS: &str = "feedback_id, exception_id, run_id, user_id, stage, step_id,
     feedback_type, reason_codes, edited_action, comment, created_at";

impl ReconStore {
    // ── Exception cases ────────────────────────────────────────

    pub fn insert_exception(&self, case: &ExceptionCase) -> ReconResult<()> {
        self.conn.execute(
            "INSERT INTO exception_case
             (exception_id, run_id, merchant_ref, severity, reason_codes, state,
              evaluation_seq, opened_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                case.id,
                case.run_id,
                case.merchant_ref,
                case.severity.as_str(),
                serde_json::to_string(&case.reason_codes)?,
                case.state.as_str(),
                case.evaluation_seq,
                case.opened_at.to_rfc3339(),
                case.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Overwrite the mutable columns of an existing case.
    pub fn update_exception(&self, case: &ExceptionCase) -> ReconResult<()> {
        let changed = self.conn.execute(
            "UPDATE exception_case
             SET severity = ?2, reason_codes = ?3, state = ?4, evaluation_seq = ?5, updated_at = ?6
             WHERE exception_id = ?1",
            params![
                case.id,
                case.severity.as_str(),
                serde_json::to_string(&case.reason_codes)?,
                case.state.as_str(),
                case.evaluation_seq,
                case.updated_at.to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(ReconError::ExceptionNotFound(case.id.clone()));
        }
        Ok(())
    }

    pub fn get_exception(&self, exception_id: &str) -> ReconResult<ExceptionCase> {
        let sql = format!("SELECT {CASE_COLUMNS} FROM exception_case WHERE exception_id = ?1");
        not_found_as(
            self.conn.query_row(&sql, params![exception_id], Self::map_case_row),
            || ReconError::ExceptionNotFound(exception_id.to_string()),
        )
    }

    pub fn exception_for_ref(&self, run_id: &str, merchant_ref: &str) -> ReconResult<Option<ExceptionCase>> {
        let sql = format!("SELECT {CASE_COLUMNS} FROM exception_case WHERE run_id = ?1 AND merchant_ref = ?2");
        let found = self
            .conn
            .query_row(&sql, params![run_id, merchant_ref], Self::map_case_row)
            .optional()?;
        Ok(found)
    }

    pub fn exceptions_for_run(&self, run_id: &str) -> ReconResult<Vec<ExceptionCase>> {
        let sql = format!("SELECT {CASE_COLUMNS} FROM exception_case WHERE run_id = ?1 ORDER BY merchant_ref ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![run_id], Self::map_case_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn map_case_row(row: &Row<'_>) -> rusqlite::Result<ExceptionCase> {
        Ok(ExceptionCase {
            id: row.get(0)?,
            run_id: row.get(1)?,
            merchant_ref: row.get(2)?,
            severity: enum_col(row, 3, Severity::parse)?,
            reason_codes: json_col(row, 4)?,
            state: enum_col(row, 5, ExceptionState::parse)?,
            evaluation_seq: row.get(6)?,
            opened_at: ts_col(row, 7)?,
            updated_at: ts_col(row, 8)?,
        })
    }

    // ── Review steps ───────────────────────────────────────────

    /// Append-only. The (exception, chain, position) key rejects a second
    /// step for the same slot.
    pub fn append_review_step(&self, step: &AIReviewStep) -> ReconResult<()> {
        self.conn.execute(
            "INSERT INTO ai_review_step
             (step_id, exception_id, chain_seq, position, stage, confidence, output_json, engine, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                step.id,
                step.exception_id,
                step.chain_seq,
                step.stage.position(),
                step.stage.as_str(),
                step.confidence,
                serde_json::to_string(&step.output)?,
                step.engine,
                step.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Full history, ordered by chain then stage position.
    pub fn review_steps(&self, exception_id: &str) -> ReconResult<Vec<AIReviewStep>> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM ai_review_step
             WHERE exception_id = ?1 ORDER BY chain_seq ASC, position ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![exception_id], Self::map_step_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_review_step(&self, step_id: &str) -> ReconResult<Option<AIReviewStep>> {
        let sql = format!("SELECT {STEP_COLUMNS} FROM ai_review_step WHERE step_id = ?1");
        let found = self
            .conn
            .query_row(&sql, params![step_id], Self::map_step_row)
            .optional()?;
        Ok(found)
    }

    fn map_step_row(row: &Row<'_>) -> rusqlite::Result<AIReviewStep> {
        Ok(AIReviewStep {
            id: row.get(0)?,
            exception_id: row.get(1)?,
            chain_seq: row.get(2)?,
            stage: enum_col(row, 3, ReviewStage::parse)?,
            confidence: row.get(4)?,
            output: json_col(row, 5)?,
            engine: row.get(6)?,
            created_at: ts_col(row, 7)?,
        })
    }

    // ── Feedback ───────────────────────────────────────────────

    pub fn insert_feedback(&self, fb: &AIFeedback) -> ReconResult<()> {
        self.conn.execute(
            "INSERT INTO ai_feedback
             (feedback_id, exception_id, run_id, user_id, stage, step_id,
              feedback_type, reason_codes, edited_action, comment, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                fb.id,
                fb.exception_id,
                fb.run_id,
                fb.user_id,
                fb.stage.as_str(),
                fb.step_id,
                fb.feedback_type.as_str(),
                serde_json::to_string(&fb.reason_codes)?,
                fb.edited_action,
                fb.comment,
                fb.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// All feedback, or only one run's when `run_id` is given.
    pub fn feedback(&self, run_id: Option<&str>) -> ReconResult<Vec<AIFeedback>> {
        let sql = format!(
            "SELECT {FEEDBACK_COLUMNS} FROM ai_feedback
             WHERE ?1 IS NULL OR run_id = ?1
             ORDER BY created_at ASC, feedback_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(AIFeedback {
                    id: row.get(0)?,
                    exception_id: row.get(1)?,
                    run_id: row.get(2)?,
                    user_id: row.get(3)?,
                    stage: enum_col(row, 4, ReviewStage::parse)?,
                    step_id: row.get(5)?,
                    feedback_type: enum_col(row, 6, FeedbackType::parse)?,
                    reason_codes: json_col(row, 7)?,
                    edited_action: row.get(8)?,
                    comment: row.get(9)?,
                    created_at: ts_col(row, 10)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
