use crate::exception::{Disposition, ExceptionAction};
use crate::feedback::FeedbackInput;
use crate::types::{ExceptionId, MonthKey, RunId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Operator commands accepted by `ReconEngine::apply`.
/// Variants are only appended, never removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum OperatorCommand {
    // ── Run setup ─────────────────────────────────
    SetBusinessDate {
        run_id: RunId,
        business_date: NaiveDate,
    },

    // ── Exceptions ────────────────────────────────
    ExceptionAction {
        exception_id: ExceptionId,
        action: ExceptionAction,
    },
    RetriggerReview {
        exception_id: ExceptionId,
    },
    RecordFeedback {
        #[serde(flatten)]
        input: FeedbackInput,
    },

    // ── Daily operations ──────────────────────────
    AddressDoubtful {
        run_id: RunId,
        #[serde(default)]
        disposition: Disposition,
    },
    SendNotifications {
        run_id: RunId,
    },
    CloseDay {
        run_id: RunId,
    },
    AddressMonth {
        run_id: RunId,
        month: MonthKey,
        #[serde(default)]
        disposition: Disposition,
    },
    NotifyMonth {
        run_id: RunId,
        month: MonthKey,
    },

    // ── Monthly close ─────────────────────────────
    CreateJournal {
        month: MonthKey,
    },
    SubmitToErp {
        month: MonthKey,
    },
    RevertSubmission {
        month: MonthKey,
    },
}
