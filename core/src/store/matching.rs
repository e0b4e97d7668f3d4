use super::{enum_col, json_col, ts_col, ReconStore};
use crate::decision::{FinalStatus, MatchDecision};
use crate::error::ReconResult;
use rusqlite::{params, OptionalExtension, Row};

const DECISION_COLUMNS: &str = "run_id, merchant_ref, evaluation_seq, final_status, reason_codes,
     stage_results, transaction_month, fuzzy_score, backdated_gap_days, fx_detail,
     trace_json, evaluated_at";

impl ReconStore {
    pub fn insert_decisions(&self, decisions: &[MatchDecision]) -> ReconResult<()> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO match_decision
             (run_id, merchant_ref, evaluation_seq, final_status, reason_codes,
              stage_results, transaction_month, fuzzy_score, backdated_gap_days, fx_detail,
              trace_json, evaluated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
        )?;
        for d in decisions {
            stmt.execute(params![
                d.run_id,
                d.merchant_ref,
                d.evaluation_seq,
                d.final_status.as_str(),
                serde_json::to_string(&d.reason_codes)?,
                serde_json::to_string(&d.stage_results)?,
                d.transaction_month,
                d.fuzzy_score,
                d.backdated_gap_days,
                d.fx_detail,
                serde_json::to_string(&d.trace)?,
                d.evaluated_at.to_rfc3339(),
            ])?;
        }
        Ok(())
    }

    /// Decisions of the run's current evaluation generation, by reference.
    pub fn latest_decisions(&self, run_id: &str) -> ReconResult<Vec<MatchDecision>> {
        let sql = format!(
            "SELECT {DECISION_COLUMNS} FROM match_decision
             WHERE run_id = ?1
               AND evaluation_seq = (SELECT evaluation_seq FROM recon_run WHERE run_id = ?1)
             ORDER BY merchant_ref ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![run_id], Self::map_decision_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every generation for one reference, oldest first.
    pub fn decision_history(&self, run_id: &str, merchant_ref: &str) -> ReconResult<Vec<MatchDecision>> {
        let sql = format!(
            "SELECT {DECISION_COLUMNS} FROM match_decision
             WHERE run_id = ?1 AND merchant_ref = ?2
             ORDER BY evaluation_seq ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![run_id, merchant_ref], Self::map_decision_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn latest_decision(&self, run_id: &str, merchant_ref: &str) -> ReconResult<Option<MatchDecision>> {
        let sql = format!(
            "SELECT {DECISION_COLUMNS} FROM match_decision
             WHERE run_id = ?1 AND merchant_ref = ?2
             ORDER BY evaluation_seq DESC LIMIT 1"
        );
        let found = self
            .conn
            .query_row(&sql, params![run_id, merchant_ref], Self::map_decision_row)
            .optional()?;
        Ok(found)
    }

    fn map_decision_row(row: &Row<'_>) -> rusqlite::Result<MatchDecision> {
        Ok(MatchDecision {
            run_id: row.get(0)?,
            merchant_ref: row.get(1)?,
            evaluation_seq: row.get(2)?,
            final_status: enum_col(row, 3, FinalStatus::parse)?,
            reason_codes: json_col(row, 4)?,
            stage_results: json_col(row, 5)?,
            transaction_month: row.get(6)?,
            fuzzy_score: row.get(7)?,
            backdated_gap_days: row.get(8)?,
            fx_detail: row.get(9)?,
            trace: json_col(row, 10)?,
            evaluated_at: ts_col(row, 11)?,
        })
    }
}
