//! AI review chain: an append-only, strictly ordered escalation per case.
//!
//! ORDER (per chain generation):
//!   intern → manager → supervisor → announcer (optional, terminal)
//!
//! RULES:
//!   - A stage may only be appended after its predecessor in the same chain.
//!   - Steps are never rewritten; a retrigger starts a new chain_seq at intern.
//!   - When the collaborator errors, a deterministic fallback step is
//!     recorded instead, so the chain always completes.

use crate::config::{FallbackConfidence, ReviewConfig};
use crate::decision::{MatchDecision, ReasonCode};
use crate::error::{ReconError, ReconResult};
use crate::exception::ExceptionCase;
use crate::types::{new_id, ExceptionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStage {
    Intern,
    Manager,
    Supervisor,
    Announcer,
}

impl ReviewStage {
    /// The stage that must come next in a chain whose last step is `last`.
    pub fn next_after(last: Option<ReviewStage>, include_announcer: bool) -> Option<ReviewStage> {
        match last {
            None => Some(Self::Intern),
            Some(Self::Intern) => Some(Self::Manager),
            Some(Self::Manager) => Some(Self::Supervisor),
            Some(Self::Supervisor) if include_announcer => Some(Self::Announcer),
            Some(Self::Supervisor) | Some(Self::Announcer) => None,
        }
    }

    pub fn position(&self) -> u32 {
        *self as u32
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intern => "intern",
            Self::Manager => "manager",
            Self::Supervisor => "supervisor",
            Self::Announcer => "announcer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "intern" => Some(Self::Intern),
            "manager" => Some(Self::Manager),
            "supervisor" => Some(Self::Supervisor),
            "announcer" => Some(Self::Announcer),
            _ => None,
        }
    }
}

impl fmt::Display for ReviewStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured output; the variant always matches the step's stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum ReviewOutput {
    Intern {
        summary: String,
        root_cause: String,
    },
    Manager {
        second_opinion: String,
        agreement_with_intern: bool,
    },
    Supervisor {
        suggested_action: String,
        note: String,
    },
    Announcer {
        title: String,
        message: String,
    },
}

impl ReviewOutput {
    pub fn stage(&self) -> ReviewStage {
        match self {
            Self::Intern { .. } => ReviewStage::Intern,
            Self::Manager { .. } => ReviewStage::Manager,
            Self::Supervisor { .. } => ReviewStage::Supervisor,
            Self::Announcer { .. } => ReviewStage::Announcer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AIReviewStep {
    pub id: String,
    pub exception_id: ExceptionId,
    pub chain_seq: u32,
    pub stage: ReviewStage,
    pub confidence: f64,
    pub output: ReviewOutput,
    /// Which reviewer produced the step (`fallback` for the deterministic one).
    pub engine: String,
    pub created_at: DateTime<Utc>,
}

/// Check that `stage` may be appended to `chain` (steps of one chain_seq,
/// in append order).
pub fn validate_append(chain: &[AIReviewStep], stage: ReviewStage, include_announcer: bool) -> ReconResult<()> {
    let last = chain.last().map(|s| s.stage);
    match ReviewStage::next_after(last, include_announcer) {
        Some(expected) if expected == stage => Ok(()),
        Some(expected) => Err(ReconError::OutOfOrderReview {
            expected: expected.to_string(),
            got: stage.to_string(),
        }),
        None => Err(ReconError::OutOfOrderReview {
            expected: "end of chain".to_string(),
            got: stage.to_string(),
        }),
    }
}

// ── Collaborators ──────────────────────────────────────────────────

pub struct ReviewContext<'a> {
    pub exception: &'a ExceptionCase,
    pub decision: Option<&'a MatchDecision>,
    /// Earlier steps of the same chain, in order.
    pub prior: &'a [AIReviewStep],
    pub stage: ReviewStage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewResponse {
    pub confidence: f64,
    pub output: ReviewOutput,
}

/// External reviewer. Implementations may call out to a model service;
/// the core only requires the output variant to match the requested stage.
pub trait ReviewCollaborator: Send + Sync {
    fn name(&self) -> &str;
    fn review(&self, ctx: &ReviewContext<'_>) -> anyhow::Result<ReviewResponse>;
}

pub struct FallbackReviewer {
    confidence: FallbackConfidence,
}

impl FallbackReviewer {
    pub const NAME: &'static str = "fallback";

    pub fn new(config: &ReviewConfig) -> Self {
        Self { confidence: config.fallback.clone() }
    }

    fn reasons(codes: &[ReasonCode]) -> String {
        if codes.is_empty() {
            return "unknown".to_string();
        }
        codes.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", ")
    }

    pub fn respond(&self, ctx: &ReviewContext<'_>) -> ReviewResponse {
        let reasons = Self::reasons(&ctx.exception.reason_codes);
        let (confidence, output) = match ctx.stage {
            ReviewStage::Intern => (
                self.confidence.intern,
                ReviewOutput::Intern {
                    summary: format!("Initial verification suggests mismatch due to: {reasons}"),
                    root_cause: "source_discrepancy".to_string(),
                },
            ),
            ReviewStage::Manager => (
                self.confidence.manager,
                ReviewOutput::Manager {
                    second_opinion: "Evidence is sufficient to keep as doubtful pending manual resolution."
                        .to_string(),
                    agreement_with_intern: true,
                },
            ),
            ReviewStage::Supervisor => (
                self.confidence.supervisor,
                ReviewOutput::Supervisor {
                    suggested_action: "verify".to_string(),
                    note: "Request supporting documents or source correction.".to_string(),
                },
            ),
            ReviewStage::Announcer => (
                self.confidence.announcer,
                ReviewOutput::Announcer {
                    title: format!("Doubtful transaction {}", ctx.exception.merchant_ref),
                    message: format!(
                        "{} severity exception awaiting manual resolution ({reasons}).",
                        ctx.exception.severity.as_str()
                    ),
                },
            ),
        };
        ReviewResponse { confidence, output }
    }
}

impl ReviewCollaborator for FallbackReviewer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn review(&self, ctx: &ReviewContext<'_>) -> anyhow::Result<ReviewResponse> {
        Ok(self.respond(ctx))
    }
}

/// Ask `reviewer` for the next stage, falling back on error or on a
/// response whose variant does not match the stage.
pub fn produce_step(
    reviewer: &dyn ReviewCollaborator,
    fallback: &FallbackReviewer,
    ctx: &ReviewContext<'_>,
    chain_seq: u32,
    now: DateTime<Utc>,
) -> AIReviewStep {
    let (engine, response) = match reviewer.review(ctx) {
        Ok(r) if r.output.stage() == ctx.stage => (reviewer.name().to_string(), r),
        Ok(r) => {
            log::warn!(
                "reviewer {} returned {} output for {} stage on {}; using fallback",
                reviewer.name(),
                r.output.stage(),
                ctx.stage,
                ctx.exception.id
            );
            (FallbackReviewer::NAME.to_string(), fallback.respond(ctx))
        }
        Err(e) => {
            log::warn!(
                "reviewer {} failed at {} stage on {}: {e:#}; using fallback",
                reviewer.name(),
                ctx.stage,
                ctx.exception.id
            );
            (FallbackReviewer::NAME.to_string(), fallback.respond(ctx))
        }
    };
    AIReviewStep {
        id: new_id(),
        exception_id: ctx.exception.id.clone(),
        chain_seq,
        stage: ctx.stage,
        confidence: response.confidence.clamp(0.0, 1.0),
        output: response.output,
        engine,
        created_at: now,
    }
}

/// Run a whole chain from its current position to its end.
#[allow(clippy::too_many_arguments)]
pub fn complete_chain(
    reviewer: &dyn ReviewCollaborator,
    fallback: &FallbackReviewer,
    exception: &ExceptionCase,
    decision: Option<&MatchDecision>,
    existing: &[AIReviewStep],
    chain_seq: u32,
    include_announcer: bool,
    now: DateTime<Utc>,
) -> Vec<AIReviewStep> {
    let mut chain: Vec<AIReviewStep> = existing.to_vec();
    let mut appended = Vec::new();
    while let Some(stage) = ReviewStage::next_after(chain.last().map(|s| s.stage), include_announcer) {
        let ctx = ReviewContext { exception, decision, prior: &chain, stage };
        let step = produce_step(reviewer, fallback, &ctx, chain_seq, now);
        chain.push(step.clone());
        appended.push(step);
    }
    appended
}
