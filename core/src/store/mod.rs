//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! The engine calls store methods; it never executes SQL directly.
//! Multi-row mutations run inside `atomically()` so a command either
//! lands completely (with its audit event) or not at all.

mod closing;
mod exception;
mod matching;
mod run;

pub use run::SourceFileRow;

use crate::error::{ReconError, ReconResult};
use crate::event::{EventLogEntry, ReconEvent};
use crate::types::{parse_date, parse_ts};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, types::Type, Connection, Row};
use serde::de::DeserializeOwned;

const MIGRATIONS: [(&str, &str); 5] = [
    ("001_foundation", include_str!("../../../migrations/001_foundation.sql")),
    ("002_sources", include_str!("../../../migrations/002_sources.sql")),
    ("003_matching", include_str!("../../../migrations/003_matching.sql")),
    ("004_exceptions", include_str!("../../../migrations/004_exceptions.sql")),
    ("005_closing", include_str!("../../../migrations/005_closing.sql")),
];

pub struct ReconStore {
    conn: Connection,
}

impl ReconStore {
    pub fn open(path: &str) -> ReconResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Private in-memory database; the runner's default and every test's.
    pub fn in_memory() -> ReconResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Apply every schema file in order. Each file is idempotent.
    pub fn migrate(&self) -> ReconResult<()> {
        for (name, sql) in MIGRATIONS {
            log::debug!("applying migration {name}");
            self.conn.execute_batch(sql)?;
        }
        Ok(())
    }

    /// Run `f` inside one write transaction. Not re-entrant.
    pub fn atomically<T>(&self, f: impl FnOnce(&Self) -> ReconResult<T>) -> ReconResult<T> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    log::error!("rollback failed after {e}: {rollback}");
                }
                Err(e)
            }
        }
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn record_event(&self, actor: &str, event: &ReconEvent, at: DateTime<Utc>) -> ReconResult<()> {
        let entry = EventLogEntry::new(event, actor, at)?;
        self.append_event(&entry)
    }

    pub fn append_event(&self, entry: &EventLogEntry) -> ReconResult<()> {
        self.conn.execute(
            "INSERT INTO event_log (run_id, entity_type, entity_id, event_type, actor, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.run_id,
                entry.entity_type,
                entry.entity_id,
                entry.event_type,
                entry.actor,
                entry.payload,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn events_for_run(&self, run_id: &str) -> ReconResult<Vec<EventLogEntry>> {
        self.query_events(
            "SELECT id, run_id, entity_type, entity_id, event_type, actor, payload, created_at
             FROM event_log WHERE run_id = ?1 ORDER BY id ASC",
            params![run_id],
        )
    }

    pub fn events_for_entity(&self, entity_type: &str, entity_id: &str) -> ReconResult<Vec<EventLogEntry>> {
        self.query_events(
            "SELECT id, run_id, entity_type, entity_id, event_type, actor, payload, created_at
             FROM event_log WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY id ASC",
            params![entity_type, entity_id],
        )
    }

    fn query_events(&self, sql: &str, args: impl rusqlite::Params) -> ReconResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(sql)?;
        let entries = stmt
            .query_map(args, |row| {
                Ok(EventLogEntry {
                    id: Some(row.get(0)?),
                    run_id: row.get(1)?,
                    entity_type: row.get(2)?,
                    entity_id: row.get(3)?,
                    event_type: row.get(4)?,
                    actor: row.get(5)?,
                    payload: row.get(6)?,
                    created_at: ts_col(row, 7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

// ── Column helpers ─────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
#[error("unknown value '{0}'")]
struct UnknownValue(String);

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

pub(crate) fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| conversion_err(idx, e))
}

pub(crate) fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(&s).map_err(|e| conversion_err(idx, e))).transpose()
}

pub(crate) fn date_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    parse_date(&raw).map_err(|e| conversion_err(idx, e))
}

pub(crate) fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_err(idx, e))
}

pub(crate) fn enum_col<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_err(idx, UnknownValue(raw)))
}

pub(crate) fn not_found_as<T>(result: rusqlite::Result<T>, err: impl FnOnce() -> ReconError) -> ReconResult<T> {
    match result {
        Ok(v) => Ok(v),
        Err(rusqlite::Error::QueryReturnedNoRows) => Err(err()),
        Err(e) => Err(e.into()),
    }
}
