//! The audit log: every state change the core makes.
//!
//! RULE: Each mutation appends exactly one ReconEvent in the same store
//! transaction as the change it describes.
//! Variants are only appended, never removed or reordered.

use crate::decision::ReasonCode;
use crate::exception::{ExceptionState, Severity};
use crate::feedback::FeedbackType;
use crate::monthly_close::BatchAction;
use crate::review::ReviewStage;
use crate::run::RunStatus;
use crate::transaction::SourceType;
use crate::types::{ExceptionId, MonthKey, RunId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReconEvent {
    // ── Run lifecycle ──────────────────────────────
    RunCreated {
        run_id: RunId,
        run_number: String,
        business_date: NaiveDate,
    },
    SourceAttached {
        run_id: RunId,
        source: SourceType,
        filename: String,
        checksum: String,
    },
    RunStatusChanged {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
        stage: String,
    },
    RunEvaluated {
        run_id: RunId,
        evaluation_seq: u32,
        total: u32,
        good: u32,
        doubtful: u32,
        exceptions: u32,
    },
    BusinessDateSet {
        run_id: RunId,
        from: NaiveDate,
        to: NaiveDate,
    },

    // ── Exceptions and review ──────────────────────
    ExceptionOpened {
        run_id: RunId,
        exception_id: ExceptionId,
        merchant_ref: String,
        severity: Severity,
    },
    ExceptionRefreshed {
        run_id: RunId,
        exception_id: ExceptionId,
        severity: Severity,
        reason_codes: Vec<ReasonCode>,
    },
    ExceptionTransitioned {
        run_id: RunId,
        exception_id: ExceptionId,
        from: ExceptionState,
        to: ExceptionState,
    },
    ReviewStepAppended {
        run_id: RunId,
        exception_id: ExceptionId,
        chain_seq: u32,
        stage: ReviewStage,
        engine: String,
    },
    ReviewRetriggered {
        run_id: RunId,
        exception_id: ExceptionId,
        chain_seq: u32,
    },
    FeedbackRecorded {
        run_id: RunId,
        exception_id: ExceptionId,
        feedback_id: String,
        feedback_type: FeedbackType,
    },

    // ── Daily operations ───────────────────────────
    SourcesNotified {
        run_id: RunId,
        month: MonthKey,
    },
    DayClosed {
        run_id: RunId,
        closed_at: DateTime<Utc>,
    },

    // ── Monthly close ──────────────────────────────
    MonthlyCloseChanged {
        month: MonthKey,
        action: BatchAction,
        submission_id: Option<i64>,
    },
}

impl ReconEvent {
    /// (entity type, entity id, owning run) for indexing the log.
    pub fn entity(&self) -> (&'static str, String, Option<RunId>) {
        use ReconEvent::*;
        match self {
            RunCreated { run_id, .. }
            | SourceAttached { run_id, .. }
            | RunStatusChanged { run_id, .. }
            | RunEvaluated { run_id, .. }
            | BusinessDateSet { run_id, .. }
            | SourcesNotified { run_id, .. }
            | DayClosed { run_id, .. } => ("run", run_id.clone(), Some(run_id.clone())),
            ExceptionOpened { run_id, exception_id, .. }
            | ExceptionRefreshed { run_id, exception_id, .. }
            | ExceptionTransitioned { run_id, exception_id, .. }
            | ReviewStepAppended { run_id, exception_id, .. }
            | ReviewRetriggered { run_id, exception_id, .. }
            | FeedbackRecorded { run_id, exception_id, .. } => {
                ("exception", exception_id.clone(), Some(run_id.clone()))
            }
            MonthlyCloseChanged { month, .. } => ("month", month.clone(), None),
        }
    }
}

/// Persisted form of an event, one row in `event_log`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: Option<i64>,
    pub run_id: Option<RunId>,
    pub entity_type: String,
    pub entity_id: String,
    pub event_type: String,
    pub actor: String,
    pub payload: String, // JSON-serialized ReconEvent
    pub created_at: DateTime<Utc>,
}

impl EventLogEntry {
    pub fn new(event: &ReconEvent, actor: &str, at: DateTime<Utc>) -> serde_json::Result<Self> {
        let (entity_type, entity_id, run_id) = event.entity();
        Ok(Self {
            id: None,
            run_id,
            entity_type: entity_type.to_string(),
            entity_id,
            event_type: event_type_name(event).to_string(),
            actor: actor.to_string(),
            payload: serde_json::to_string(event)?,
            created_at: at,
        })
    }

    pub fn event(&self) -> serde_json::Result<ReconEvent> {
        serde_json::from_str(&self.payload)
    }
}

pub fn event_type_name(event: &ReconEvent) -> &'static str {
    match event {
        ReconEvent::RunCreated { .. } => "run_created",
        ReconEvent::SourceAttached { .. } => "source_attached",
        ReconEvent::RunStatusChanged { .. } => "run_status_changed",
        ReconEvent::RunEvaluated { .. } => "run_evaluated",
        ReconEvent::BusinessDateSet { .. } => "business_date_set",
        ReconEvent::ExceptionOpened { .. } => "exception_opened",
        ReconEvent::ExceptionRefreshed { .. } => "exception_refreshed",
        ReconEvent::ExceptionTransitioned { .. } => "exception_transitioned",
        ReconEvent::ReviewStepAppended { .. } => "review_step_appended",
        ReconEvent::ReviewRetriggered { .. } => "review_retriggered",
        ReconEvent::FeedbackRecorded { .. } => "feedback_recorded",
        ReconEvent::SourcesNotified { .. } => "sources_notified",
        ReconEvent::DayClosed { .. } => "day_closed",
        ReconEvent::MonthlyCloseChanged { .. } => "monthly_close_changed",
    }
}
