//! Exception cases: severity, state machine, escalation chain, feedback.

use chrono::{NaiveDate, TimeZone, Utc};
use recon_core::{
    clock::FixedClock,
    command::OperatorCommand,
    config::ReconConfig,
    engine::{CommandOutcome, ReconEngine},
    error::ReconError,
    exception::{ExceptionAction, ExceptionCase, ExceptionState, Severity},
    feedback::{FeedbackInput, FeedbackType},
    review::{ReviewCollaborator, ReviewContext, ReviewOutput, ReviewResponse, ReviewStage},
    run::ReconRun,
    scenario::scenario3,
    store::ReconStore,
};
use std::sync::Arc;

const OPERATOR: &str = "ops-bob";

fn build_with(config: ReconConfig) -> ReconEngine {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = ReconStore::in_memory().expect("in-memory store");
    store.migrate().expect("migration");
    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 3, 17, 9, 0, 0).unwrap()));
    ReconEngine::new(store, config, Box::new(clock))
}

fn build() -> ReconEngine {
    build_with(ReconConfig::default_test())
}

fn seeded(engine: &ReconEngine) -> (ReconRun, ExceptionCase, ExceptionCase) {
    let date = NaiveDate::from_ymd_opt(2026, 3, 16).unwrap();
    let run = scenario3(date).run_through(engine, OPERATOR).unwrap();
    let cases = engine.list_exceptions(&run.id).unwrap();
    let find = |r: &str| cases.iter().find(|c| c.merchant_ref == r).unwrap().clone();
    let drift = find("SCENARIO3-REF-001");
    let late = find("SCENARIO3-REF-010");
    (run, drift, late)
}

// ── Severity and state ────────────────────────────────────────────

/// Amount mismatches rank high; a lone backdate gap ranks medium.
#[test]
fn severity_follows_policy() {
    let engine = build();
    let (_, drift, late) = seeded(&engine);
    assert_eq!(drift.severity, Severity::High);
    assert_eq!(late.severity, Severity::Medium);
    assert_eq!(drift.state, ExceptionState::Open);
}

/// open → verified → approved → resolved, nothing skipped.
#[test]
fn exception_actions_follow_the_table() {
    let engine = build();
    let (_, drift, _) = seeded(&engine);

    let err = engine.apply_exception_action(&drift.id, ExceptionAction::Approve, OPERATOR).unwrap_err();
    assert!(matches!(err, ReconError::InvalidTransition { entity: "exception", .. }));

    let c = engine.apply_exception_action(&drift.id, ExceptionAction::Verify, OPERATOR).unwrap();
    assert_eq!(c.state, ExceptionState::Verified);
    let c = engine.apply_exception_action(&drift.id, ExceptionAction::Reject, OPERATOR).unwrap();
    assert_eq!(c.state, ExceptionState::Rejected);
    let c = engine.apply_exception_action(&drift.id, ExceptionAction::Resolve, OPERATOR).unwrap();
    assert_eq!(c.state, ExceptionState::Resolved);
    assert!(engine.apply_exception_action(&drift.id, ExceptionAction::Verify, OPERATOR).is_err());

    let transitions = engine
        .events_for_entity("exception", &drift.id)
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == "exception_transitioned")
        .count();
    assert_eq!(transitions, 3);
    assert!(matches!(engine.get_exception("missing"), Err(ReconError::ExceptionNotFound(_))));
}

/// Commands arriving as JSON reach the same transition table.
#[test]
fn exception_action_via_command() {
    let engine = build();
    let (_, drift, _) = seeded(&engine);
    let json = format!(r#"{{"cmd":"exception_action","exception_id":"{}","action":"verify"}}"#, drift.id);
    let cmd: OperatorCommand = serde_json::from_str(&json).unwrap();
    match engine.apply(cmd, OPERATOR).unwrap() {
        CommandOutcome::Exception(c) => assert_eq!(c.state, ExceptionState::Verified),
        other => panic!("unexpected outcome {other:?}"),
    }
}

// ── Escalation chain ──────────────────────────────────────────────

/// Fallback steps carry the configured confidences in stage order.
#[test]
fn chain_is_ordered_with_fallback_confidences() {
    let engine = build();
    let (_, drift, _) = seeded(&engine);
    let steps = engine.review_history(&drift.id).unwrap();
    let stages: Vec<ReviewStage> = steps.iter().map(|s| s.stage).collect();
    assert_eq!(stages, vec![ReviewStage::Intern, ReviewStage::Manager, ReviewStage::Supervisor]);
    let confidences: Vec<f64> = steps.iter().map(|s| s.confidence).collect();
    assert_eq!(confidences, vec![0.72, 0.78, 0.81]);
    match &steps[0].output {
        ReviewOutput::Intern { summary, .. } => assert!(summary.contains("AMOUNT_MISMATCH")),
        other => panic!("intern step carried {other:?}"),
    }
}

/// The announcer runs last when enabled.
#[test]
fn announcer_closes_the_chain_when_enabled() {
    let mut config = ReconConfig::default_test();
    config.review.include_announcer = true;
    let engine = build_with(config);
    let (_, drift, _) = seeded(&engine);
    let steps = engine.review_history(&drift.id).unwrap();
    assert_eq!(steps.len(), 4);
    assert_eq!(steps[3].stage, ReviewStage::Announcer);
    assert_eq!(steps[3].confidence, 0.85);
}

/// Retrigger appends a fresh chain and keeps the old one.
#[test]
fn retrigger_appends_a_new_generation() {
    let engine = build();
    let (_, drift, _) = seeded(&engine);
    let fresh = engine.retrigger_review(&drift.id, OPERATOR).unwrap();
    assert_eq!(fresh.len(), 3);
    assert!(fresh.iter().all(|s| s.chain_seq == 2));

    let history = engine.review_history(&drift.id).unwrap();
    assert_eq!(history.len(), 6);
    assert_eq!(history.iter().filter(|s| s.chain_seq == 1).count(), 3);
    assert_eq!(history[3].stage, ReviewStage::Intern);

    engine.retrigger_review(&drift.id, OPERATOR).unwrap();
    assert_eq!(engine.review_history(&drift.id).unwrap().len(), 9);
}

struct Scripted;

impl ReviewCollaborator for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn review(&self, ctx: &ReviewContext<'_>) -> anyhow::Result<ReviewResponse> {
        let output = match ctx.stage {
            ReviewStage::Intern => ReviewOutput::Intern {
                summary: format!("{} looks off", ctx.exception.merchant_ref),
                root_cause: "erp_rounding".into(),
            },
            ReviewStage::Manager => {
                // A wrong variant must be replaced by the fallback text.
                ReviewOutput::Supervisor { suggested_action: "approve".into(), note: "skip".into() }
            }
            ReviewStage::Supervisor => anyhow::bail!("model timeout"),
            ReviewStage::Announcer => ReviewOutput::Announcer { title: "t".into(), message: "m".into() },
        };
        Ok(ReviewResponse { confidence: 1.7, output })
    }
}

/// Collaborator output is used when valid; errors and wrong variants fall back.
#[test]
fn collaborator_failures_fall_back_per_step() {
    let engine = build().with_reviewer(Box::new(Scripted));
    let (_, drift, _) = seeded(&engine);
    let steps = engine.review_history(&drift.id).unwrap();
    let engines: Vec<&str> = steps.iter().map(|s| s.engine.as_str()).collect();
    assert_eq!(engines, vec!["scripted", "fallback", "fallback"]);
    assert_eq!(steps[0].confidence, 1.0);
    assert!(matches!(steps[1].output, ReviewOutput::Manager { .. }));
    assert_eq!(steps[2].confidence, 0.81);
}

// ── Feedback ──────────────────────────────────────────────────────

fn input(case: &ExceptionCase, t: FeedbackType, reasons: &[&str]) -> FeedbackInput {
    FeedbackInput {
        exception_id: case.id.clone(),
        user_id: "analyst-1".into(),
        stage: ReviewStage::Intern,
        step_id: None,
        feedback_type: t,
        reason_codes: reasons.iter().map(|r| r.to_string()).collect(),
        edited_action: None,
        comment: None,
    }
}

/// Feedback never moves the case; it only feeds the metrics.
#[test]
fn feedback_metrics_roll_up() {
    let engine = build();
    let (run, drift, late) = seeded(&engine);
    engine.record_feedback(input(&drift, FeedbackType::Accept, &[])).unwrap();
    engine.record_feedback(input(&drift, FeedbackType::Reject, &["wrong_root_cause", "too_vague"])).unwrap();
    engine.record_feedback(input(&late, FeedbackType::Reject, &["wrong_root_cause"])).unwrap();

    let metrics = engine.feedback_metrics(Some(&run.id)).unwrap();
    assert_eq!(metrics.total_feedback, 3);
    assert_eq!(metrics.acceptance_rate, 33.33);
    assert_eq!(metrics.by_type.get("reject"), Some(&2));
    assert_eq!(metrics.top_reject_reasons[0].reason, "wrong_root_cause");
    assert_eq!(metrics.top_reject_reasons[0].count, 2);

    assert_eq!(engine.get_exception(&drift.id).unwrap().state, ExceptionState::Open);
    assert_eq!(engine.feedback_metrics(Some("other-run")).unwrap().total_feedback, 0);
    assert_eq!(engine.feedback_metrics(None).unwrap().total_feedback, 3);
}

/// Feedback pinned to a step must name a step of the same case and stage.
#[test]
fn feedback_step_must_belong_to_the_case() {
    let engine = build();
    let (_, drift, late) = seeded(&engine);
    let late_intern = engine.review_history(&late.id).unwrap().remove(0);

    let mut fb = input(&drift, FeedbackType::Accept, &[]);
    fb.step_id = Some(late_intern.id.clone());
    assert!(matches!(engine.record_feedback(fb), Err(ReconError::InvalidInput(_))));

    let mut fb = input(&late, FeedbackType::EditApply, &[]);
    fb.step_id = Some(late_intern.id.clone());
    fb.edited_action = Some("approve".into());
    let saved = engine.record_feedback(fb).unwrap();
    assert_eq!(saved.step_id.as_deref(), Some(late_intern.id.as_str()));
    assert_eq!(saved.run_id, late.run_id);
}
