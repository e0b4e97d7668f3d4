use super::{date_col, enum_col, json_col, not_found_as, ts_col, ReconStore};
use crate::error::{ReconError, ReconResult};
use crate::run::{ReconRun, RunCounters, RunStatus};
use crate::transaction::{NormalizedTransaction, RawSourceFile, SourceLoad, SourceType};
use crate::types::new_id;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::BTreeMap;

/// Metadata of one uploaded source file (content excluded).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SourceFileRow {
    pub file_id: String,
    pub run_id: String,
    pub source: SourceType,
    pub filename: String,
    pub format: String,
    pub checksum: String,
    pub parse_status: String,
    pub parse_error: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

const RUN_COLUMNS: &str = "run_id, run_number, status, stage, initiated_by, business_date,
     total, good, doubtful, exceptions, evaluation_seq, created_at, updated_at";

impl ReconStore {
    // ── Runs ───────────────────────────────────────────────────

    pub fn insert_run(&self, run: &ReconRun) -> ReconResult<()> {
        self.conn.execute(
            "INSERT INTO recon_run
             (run_id, run_number, status, stage, initiated_by, business_date,
              total, good, doubtful, exceptions, evaluation_seq, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            params![
                run.id,
                run.run_number,
                run.status.as_str(),
                run.stage,
                run.initiated_by,
                run.business_date.to_string(),
                run.counters.total,
                run.counters.good,
                run.counters.doubtful,
                run.counters.exceptions,
                run.evaluation_seq,
                run.created_at.to_rfc3339(),
                run.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> ReconResult<ReconRun> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM recon_run WHERE run_id = ?1");
        not_found_as(
            self.conn.query_row(&sql, params![run_id], Self::map_run_row),
            || ReconError::RunNotFound(run_id.to_string()),
        )
    }

    pub fn list_runs(&self) -> ReconResult<Vec<ReconRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM recon_run ORDER BY business_date DESC, created_at DESC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], Self::map_run_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Runs whose business date falls in `month` (`YYYY-MM`), oldest first.
    pub fn runs_in_month(&self, month: &str) -> ReconResult<Vec<ReconRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM recon_run
             WHERE substr(business_date, 1, 7) = ?1
             ORDER BY business_date ASC, created_at ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![month], Self::map_run_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every month that has a run or a monthly close record, newest first.
    pub fn business_months(&self) -> ReconResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT substr(business_date, 1, 7) AS m FROM recon_run
             UNION
             SELECT month AS m FROM monthly_close
             ORDER BY m DESC",
        )?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        stage: &str,
        at: DateTime<Utc>,
    ) -> ReconResult<()> {
        self.conn.execute(
            "UPDATE recon_run SET status = ?2, stage = ?3, updated_at = ?4 WHERE run_id = ?1",
            params![run_id, status.as_str(), stage, at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn update_run_evaluation(
        &self,
        run_id: &str,
        counters: &RunCounters,
        evaluation_seq: u32,
        at: DateTime<Utc>,
    ) -> ReconResult<()> {
        self.conn.execute(
            "UPDATE recon_run
             SET total = ?2, good = ?3, doubtful = ?4, exceptions = ?5,
                 evaluation_seq = ?6, updated_at = ?7
             WHERE run_id = ?1",
            params![
                run_id,
                counters.total,
                counters.good,
                counters.doubtful,
                counters.exceptions,
                evaluation_seq,
                at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn update_business_date(&self, run_id: &str, date: NaiveDate, at: DateTime<Utc>) -> ReconResult<()> {
        self.conn.execute(
            "UPDATE recon_run SET business_date = ?2, updated_at = ?3 WHERE run_id = ?1",
            params![run_id, date.to_string(), at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn map_run_row(row: &Row<'_>) -> rusqlite::Result<ReconRun> {
        Ok(ReconRun {
            id: row.get(0)?,
            run_number: row.get(1)?,
            status: enum_col(row, 2, RunStatus::parse)?,
            stage: row.get(3)?,
            initiated_by: row.get(4)?,
            business_date: date_col(row, 5)?,
            counters: RunCounters {
                total: row.get(6)?,
                good: row.get(7)?,
                doubtful: row.get(8)?,
                exceptions: row.get(9)?,
            },
            evaluation_seq: row.get(10)?,
            created_at: ts_col(row, 11)?,
            updated_at: ts_col(row, 12)?,
        })
    }

    // ── Source files ───────────────────────────────────────────

    /// Store (or replace) the run's file for `source`. Returns the file id.
    pub fn upsert_source_file(
        &self,
        run_id: &str,
        source: SourceType,
        file: &RawSourceFile,
        checksum: &str,
        at: DateTime<Utc>,
    ) -> ReconResult<String> {
        let file_id = new_id();
        self.conn.execute(
            "INSERT INTO source_file
             (file_id, run_id, source_type, filename, format_type, checksum, content,
              parse_status, parse_error, uploaded_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,'pending',NULL,?8)
             ON CONFLICT(run_id, source_type) DO UPDATE SET
               file_id = excluded.file_id,
               filename = excluded.filename,
               format_type = excluded.format_type,
               checksum = excluded.checksum,
               content = excluded.content,
               parse_status = 'pending',
               parse_error = NULL,
               uploaded_at = excluded.uploaded_at",
            params![
                file_id,
                run_id,
                source.as_str(),
                file.filename,
                file.format,
                checksum,
                file.bytes,
                at.to_rfc3339(),
            ],
        )?;
        Ok(file_id)
    }

    pub fn source_files(&self, run_id: &str) -> ReconResult<Vec<SourceFileRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT file_id, run_id, source_type, filename, format_type, checksum,
                    parse_status, parse_error, uploaded_at
             FROM source_file WHERE run_id = ?1 ORDER BY source_type ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(SourceFileRow {
                    file_id: row.get(0)?,
                    run_id: row.get(1)?,
                    source: enum_col(row, 2, SourceType::parse)?,
                    filename: row.get(3)?,
                    format: row.get(4)?,
                    checksum: row.get(5)?,
                    parse_status: row.get(6)?,
                    parse_error: row.get(7)?,
                    uploaded_at: ts_col(row, 8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn source_content(&self, run_id: &str, source: SourceType) -> ReconResult<Option<RawSourceFile>> {
        let found = self
            .conn
            .query_row(
                "SELECT filename, content FROM source_file WHERE run_id = ?1 AND source_type = ?2",
                params![run_id, source.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()?;
        Ok(found.map(|(filename, bytes)| RawSourceFile::new(filename, bytes)))
    }

    pub fn mark_source_parse(&self, run_id: &str, source: SourceType, error: Option<&str>) -> ReconResult<()> {
        let status = if error.is_some() { "failed" } else { "parsed" };
        self.conn.execute(
            "UPDATE source_file SET parse_status = ?3, parse_error = ?4
             WHERE run_id = ?1 AND source_type = ?2",
            params![run_id, source.as_str(), status, error],
        )?;
        Ok(())
    }

    // ── Normalized rows ────────────────────────────────────────

    pub fn replace_normalized_rows(
        &self,
        run_id: &str,
        source: SourceType,
        rows: &[NormalizedTransaction],
    ) -> ReconResult<()> {
        self.conn.execute(
            "DELETE FROM normalized_txn WHERE run_id = ?1 AND source_type = ?2",
            params![run_id, source.as_str()],
        )?;
        let mut stmt = self.conn.prepare(
            "INSERT OR REPLACE INTO normalized_txn (run_id, source_type, merchant_ref, row_json)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for row in rows {
            stmt.execute(params![run_id, source.as_str(), row.merchant_ref, serde_json::to_string(row)?])?;
        }
        Ok(())
    }

    pub fn normalized_rows(&self, run_id: &str, source: SourceType) -> ReconResult<Vec<NormalizedTransaction>> {
        let mut stmt = self.conn.prepare(
            "SELECT row_json FROM normalized_txn
             WHERE run_id = ?1 AND source_type = ?2 ORDER BY merchant_ref ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id, source.as_str()], |row| json_col(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// What the run currently knows about each source.
    pub fn source_loads(&self, run_id: &str) -> ReconResult<BTreeMap<SourceType, SourceLoad>> {
        let files = self.source_files(run_id)?;
        let mut loads = BTreeMap::new();
        for source in SourceType::ALL {
            let load = match files.iter().find(|f| f.source == source) {
                None => SourceLoad::NotUploaded,
                Some(f) if f.parse_status == "failed" => {
                    SourceLoad::ParseFailed(f.parse_error.clone().unwrap_or_default())
                }
                Some(_) => SourceLoad::Parsed(self.normalized_rows(run_id, source)?),
            };
            loads.insert(source, load);
        }
        Ok(loads)
    }
}
