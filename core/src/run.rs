//! Reconciliation runs and their lifecycle.
//!
//! RULE: Run status only changes through `RunStatus::advance`.
//!   draft ──▶ ready ──▶ queued ──▶ running ──▶ completed
//!     └──────────────────▶ queued      └──▶ format_failed | failed
//! Completed, format_failed and failed are terminal.

use crate::error::{ReconError, ReconResult};
use crate::types::RunId;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Draft,
    Ready,
    Queued,
    Running,
    Completed,
    FormatFailed,
    Failed,
}

impl RunStatus {
    pub fn advance(self, to: RunStatus) -> ReconResult<RunStatus> {
        use RunStatus::*;
        let allowed = matches!(
            (self, to),
            (Draft, Ready)
                | (Draft, Queued)
                | (Ready, Queued)
                | (Queued, Running)
                | (Running, Completed)
                | (Running, FormatFailed)
                | (Running, Failed)
        );
        if allowed {
            Ok(to)
        } else {
            Err(ReconError::transition("run", self, format!("move to {to}")))
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::FormatFailed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Ready => "ready",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::FormatFailed => "format_failed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "ready" => Some(Self::Ready),
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "format_failed" => Some(Self::FormatFailed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub total: u32,
    pub good: u32,
    pub doubtful: u32,
    /// Cases whose reference is doubtful in the latest evaluation.
    pub exceptions: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconRun {
    pub id: RunId,
    pub run_number: String,
    pub status: RunStatus,
    /// Free-text progress marker, e.g. `matching` or `missing_sources:erp`.
    pub stage: String,
    pub initiated_by: String,
    pub business_date: NaiveDate,
    pub counters: RunCounters,
    /// Latest evaluation generation; 0 before the first evaluation.
    pub evaluation_seq: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
