//! Run lifecycle: ingestion, five-stage matching, counters, re-evaluation.

use chrono::{NaiveDate, TimeZone, Utc};
use recon_core::{
    clock::FixedClock,
    config::{MatchingConfig, ReconConfig},
    decision::{FinalStatus, ReasonCode},
    engine::ReconEngine,
    error::ReconError,
    exception::{ExceptionAction, ExceptionState},
    matcher::MatchingEngine,
    run::RunStatus,
    scenario::{scenario3, Fault, ScenarioBuilder},
    stage::{MatchStage, StageKind, StageVerdict},
    store::ReconStore,
    transaction::{CandidateSet, RawSourceFile, SourceError, SourceType},
};
use std::sync::Arc;

const OPERATOR: &str = "ops-alice";

fn business_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 16).unwrap()
}

fn build() -> ReconEngine {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = ReconStore::in_memory().expect("in-memory store");
    store.migrate().expect("migration");
    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 3, 17, 9, 0, 0).unwrap()));
    ReconEngine::new(store, ReconConfig::default_test(), Box::new(clock))
}

// ── Scenario 3 ────────────────────────────────────────────────────

/// Ten references, two broken: 10 total / 8 good / 2 doubtful, two cases.
#[test]
fn scenario3_counters_and_cases() {
    let engine = build();
    let run = scenario3(business_date()).run_through(&engine, OPERATOR).unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.total, 10);
    assert_eq!(run.counters.good, 8);
    assert_eq!(run.counters.doubtful, 2);
    assert_eq!(run.counters.exceptions, 2);
    assert_eq!(run.evaluation_seq, 1);

    let mut refs: Vec<String> = engine
        .list_exceptions(&run.id)
        .unwrap()
        .into_iter()
        .map(|c| c.merchant_ref)
        .collect();
    refs.sort();
    assert_eq!(refs, vec!["SCENARIO3-REF-001", "SCENARIO3-REF-010"]);
}

/// Amount drift fails three-way; a six-day PSP lag fails the backdate window;
/// one to three days of internal lag is rescued by fuzzy.
#[test]
fn scenario3_reason_codes() {
    let engine = build();
    let run = scenario3(business_date()).run_through(&engine, OPERATOR).unwrap();
    let decisions = engine.decisions(&run.id).unwrap();
    let by_ref = |r: &str| decisions.iter().find(|d| d.merchant_ref == r).unwrap().clone();

    let drift = by_ref("SCENARIO3-REF-001");
    assert_eq!(drift.final_status, FinalStatus::DoubtfulTransaction);
    assert!(drift.reason_codes.contains(&ReasonCode::ThreeWayFail));
    assert!(drift.reason_codes.contains(&ReasonCode::AmountMismatch));
    assert!(drift.fuzzy_score.unwrap() < 0.9);

    let late = by_ref("SCENARIO3-REF-010");
    assert_eq!(late.final_status, FinalStatus::DoubtfulTransaction);
    assert!(late.reason_codes.contains(&ReasonCode::BackdatedGapExceeded));
    assert_eq!(late.backdated_gap_days, Some(6));

    for r in ["SCENARIO3-REF-006", "SCENARIO3-REF-007", "SCENARIO3-REF-008"] {
        let d = by_ref(r);
        assert_eq!(d.final_status, FinalStatus::GoodTransaction, "{r} should be rescued");
        assert!(!d.stage_results.exact_hash);
        assert!(d.stage_results.fuzzy);
    }
    assert!(by_ref("SCENARIO3-REF-002").stage_results.exact_hash);
}

/// Every new case gets a full intern → manager → supervisor chain.
#[test]
fn new_cases_get_a_review_chain() {
    let engine = build();
    let run = scenario3(business_date()).run_through(&engine, OPERATOR).unwrap();
    for case in engine.list_exceptions(&run.id).unwrap() {
        let steps = engine.review_history(&case.id).unwrap();
        assert_eq!(steps.len(), 3);
        assert!(steps.iter().all(|s| s.chain_seq == 1 && s.engine == "fallback"));
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────

/// Draft until all three sources are attached, then ready.
#[test]
fn attaching_all_sources_makes_the_run_ready() {
    let engine = build();
    let scenario = ScenarioBuilder::new(5, business_date()).refs(4).build();
    let run = engine.create_run(OPERATOR, business_date()).unwrap();
    assert_eq!(run.status, RunStatus::Draft);
    assert!(run.run_number.starts_with("RUN-"));

    let files = scenario.files().unwrap();
    for (i, (source, file)) in files.into_iter().enumerate() {
        let run = engine.attach_source(&run.id, source, file, OPERATOR).unwrap();
        let expected = if i < 2 { RunStatus::Draft } else { RunStatus::Ready };
        assert_eq!(run.status, expected);
    }
    let summary = engine.run_summary(&run.id).unwrap();
    assert_eq!(summary.source_files.len(), 3);
    assert!(summary.source_files.iter().all(|f| f.format == "json" && f.checksum.len() == 64));
}

/// Only queued runs execute; a draft cannot skip the queue.
#[test]
fn execute_requires_a_queued_run() {
    let engine = build();
    let run = engine.create_run(OPERATOR, business_date()).unwrap();
    let err = engine.execute_run(&run.id, OPERATOR).unwrap_err();
    assert!(matches!(err, ReconError::InvalidTransition { .. }));
    assert!(matches!(engine.get_run("nope"), Err(ReconError::RunNotFound(_))));
}

/// A run queued without a PSP file ends in format_failed naming the source.
#[test]
fn missing_source_is_format_failed() {
    let engine = build();
    let scenario = ScenarioBuilder::new(5, business_date()).refs(4).build();
    let run = engine.create_run(OPERATOR, business_date()).unwrap();
    for (source, file) in scenario.files().unwrap() {
        if source != SourceType::Psp {
            engine.attach_source(&run.id, source, file, OPERATOR).unwrap();
        }
    }
    engine.queue_run(&run.id, OPERATOR).unwrap();
    assert!(engine.execute_run(&run.id, OPERATOR).is_err());

    let run = engine.get_run(&run.id).unwrap();
    assert_eq!(run.status, RunStatus::FormatFailed);
    assert_eq!(run.stage, "missing_sources:psp");
}

/// An unreadable file fails the run with the source and reason in its stage.
#[test]
fn parse_failure_is_format_failed() {
    let engine = build();
    let scenario = ScenarioBuilder::new(5, business_date()).refs(4).build();
    let run = engine.create_run(OPERATOR, business_date()).unwrap();
    for (source, file) in scenario.files().unwrap() {
        let file = if source == SourceType::Erp {
            RawSourceFile::new("erp_export.json", b"{ not json".to_vec())
        } else {
            file
        };
        engine.attach_source(&run.id, source, file, OPERATOR).unwrap();
    }
    engine.queue_run(&run.id, OPERATOR).unwrap();
    assert!(engine.execute_run(&run.id, OPERATOR).is_err());

    let run = engine.get_run(&run.id).unwrap();
    assert_eq!(run.status, RunStatus::FormatFailed);
    assert!(run.stage.starts_with("format_failed_erp:invalid_json"), "stage was {}", run.stage);
    let erp = engine
        .run_summary(&run.id)
        .unwrap()
        .source_files
        .into_iter()
        .find(|f| f.source == SourceType::Erp)
        .unwrap();
    assert_eq!(erp.parse_status, "failed");
}

/// Non-JSON uploads are rejected by the canonical parser.
#[test]
fn unsupported_format_is_format_failed() {
    let engine = build();
    let scenario = ScenarioBuilder::new(5, business_date()).refs(2).build();
    let run = engine.create_run(OPERATOR, business_date()).unwrap();
    for (source, file) in scenario.files().unwrap() {
        let file = if source == SourceType::Psp { RawSourceFile::new("psp.csv", file.bytes) } else { file };
        engine.attach_source(&run.id, source, file, OPERATOR).unwrap();
    }
    engine.queue_run(&run.id, OPERATOR).unwrap();
    assert!(engine.execute_run(&run.id, OPERATOR).is_err());
    assert_eq!(engine.get_run(&run.id).unwrap().stage, "format_failed_psp:unsupported_format_csv");
}

// ── Re-evaluation ─────────────────────────────────────────────────

/// Re-running a completed run appends a generation and never duplicates cases.
#[test]
fn reevaluation_is_idempotent() {
    let engine = build();
    let run = scenario3(business_date()).run_through(&engine, OPERATOR).unwrap();
    let again = engine.execute_run(&run.id, OPERATOR).unwrap();

    assert_eq!(again.evaluation_seq, 2);
    assert_eq!(again.counters, run.counters);
    assert_eq!(engine.list_exceptions(&run.id).unwrap().len(), 2);
    assert_eq!(engine.decisions(&run.id).unwrap().len(), 10);
    let history = engine.decision_history(&run.id, "SCENARIO3-REF-001").unwrap();
    assert_eq!(history.iter().map(|d| d.evaluation_seq).collect::<Vec<_>>(), vec![1, 2]);

    // Existing cases are refreshed, not re-reviewed.
    for case in engine.list_exceptions(&run.id).unwrap() {
        assert_eq!(case.evaluation_seq, 2);
        assert_eq!(engine.review_history(&case.id).unwrap().len(), 3);
    }
}

/// A resolved case stays resolved through re-evaluation.
#[test]
fn resolved_cases_are_not_reopened() {
    let engine = build();
    let run = scenario3(business_date()).run_through(&engine, OPERATOR).unwrap();
    let case = engine.list_exceptions(&run.id).unwrap().remove(0);
    for action in [ExceptionAction::Verify, ExceptionAction::Approve, ExceptionAction::Resolve] {
        engine.apply_exception_action(&case.id, action, OPERATOR).unwrap();
    }
    engine.execute_run(&run.id, OPERATOR).unwrap();
    let after = engine.get_exception(&case.id).unwrap();
    assert_eq!(after.state, ExceptionState::Resolved);
    assert_eq!(engine.list_exceptions(&run.id).unwrap().len(), 2);
}

/// A reference that re-evaluates to good drops out of the exception counter.
#[test]
fn reevaluation_recounts_live_exceptions() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = std::env::temp_dir().join(format!("recon-recount-{}.db", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let path = path.to_str().unwrap().to_string();
    let open = |config: ReconConfig| {
        let store = ReconStore::open(&path).unwrap();
        store.migrate().unwrap();
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 3, 17, 9, 0, 0).unwrap()));
        ReconEngine::new(store, config, Box::new(clock))
    };

    let run = scenario3(business_date()).run_through(&open(ReconConfig::default_test()), OPERATOR).unwrap();
    assert_eq!(run.counters.exceptions, 2);

    // A wider window absorbs the six-day late settlement on REF-010.
    let mut wide = ReconConfig::default_test();
    wide.matching.backdate_window_days = 7;
    let engine = open(wide);
    let again = engine.execute_run(&run.id, OPERATOR).unwrap();
    assert_eq!(again.counters.good, 9);
    assert_eq!(again.counters.doubtful, 1);
    assert_eq!(again.counters.exceptions, 1);
    assert_eq!(engine.list_exceptions(&run.id).unwrap().len(), 2);

    drop(engine);
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{path}{suffix}"));
    }
}

/// Once the day is closed the run is frozen.
#[test]
fn closed_run_rejects_reevaluation() {
    let engine = build();
    let run = ScenarioBuilder::new(11, business_date()).refs(5).build().run_through(&engine, OPERATOR).unwrap();
    engine.close_day(&run.id, OPERATOR).unwrap();
    let err = engine.execute_run(&run.id, OPERATOR).unwrap_err();
    assert!(matches!(err, ReconError::InvalidTransition { .. }));
    let err = engine.set_business_date(&run.id, business_date(), OPERATOR).unwrap_err();
    assert!(matches!(err, ReconError::InvalidTransition { .. }));
}

// ── Stage isolation ───────────────────────────────────────────────

struct ExplodingFx;

impl MatchStage for ExplodingFx {
    fn kind(&self) -> StageKind {
        StageKind::Fx
    }

    fn evaluate(&self, _set: &CandidateSet, _cfg: &MatchingConfig) -> StageVerdict {
        panic!("rate feed unavailable")
    }
}

/// A panicking stage marks every reference INTERNAL_ERROR but the run completes.
#[test]
fn stage_panic_becomes_internal_error() {
    let config = ReconConfig::default_test();
    let mut matcher = MatchingEngine::build(config.matching.clone());
    matcher.register(Box::new(ExplodingFx));
    let engine = build().with_matcher(matcher);

    let run = ScenarioBuilder::new(2, business_date()).refs(3).build().run_through(&engine, OPERATOR).unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.doubtful, 3);
    for d in engine.decisions(&run.id).unwrap() {
        assert!(d.reason_codes.contains(&ReasonCode::InternalError));
        assert!(d.stage_results.three_way);
    }
}

// ── Snapshot and audit ────────────────────────────────────────────

/// The snapshot shows each source side by side with the checks and decision.
#[test]
fn transaction_snapshot_lines_up_sources() {
    let engine = build();
    let scenario = ScenarioBuilder::new(8, business_date())
        .refs(3)
        .fault(1, Fault::AmountDrift)
        .fault(3, Fault::MissingSource { source: SourceType::Internal })
        .build();
    let run = scenario.run_through(&engine, OPERATOR).unwrap();
    let prefix = "SEED8-REF";

    let drift = engine.transaction_snapshot(&run.id, &format!("{prefix}-001")).unwrap();
    assert!(drift.sources.iter().all(|s| s.found));
    assert_eq!(drift.checks.compared_sources, 3);
    assert!(!drift.checks.amount_consistency);
    assert!(drift.checks.identity_consistency);
    assert!(drift.decision.is_some());

    let gap = engine.transaction_snapshot(&run.id, &format!("{prefix}-003")).unwrap();
    let internal = gap.source(SourceType::Internal).unwrap();
    assert!(!internal.found);
    assert_eq!(internal.error, Some(SourceError::MerchantRefNotFound));
    assert_eq!(gap.checks.compared_sources, 2);

    let unknown = engine.transaction_snapshot(&run.id, "NO-SUCH-REF").unwrap();
    assert!(unknown.sources.iter().all(|s| !s.found));
    assert!(unknown.decision.is_none());
    assert!(!unknown.checks.amount_consistency);
}

/// Every state change leaves an audit row.
#[test]
fn run_events_are_recorded() {
    let engine = build();
    let run = scenario3(business_date()).run_through(&engine, OPERATOR).unwrap();
    let types: Vec<String> = engine.events_for_run(&run.id).unwrap().into_iter().map(|e| e.event_type).collect();
    for expected in ["run_created", "source_attached", "run_status_changed", "run_evaluated", "exception_opened"] {
        assert!(types.iter().any(|t| t == expected), "missing {expected} in {types:?}");
    }
    assert_eq!(types.iter().filter(|t| *t == "source_attached").count(), 3);
    assert_eq!(types.iter().filter(|t| *t == "review_step_appended").count(), 6);
}
