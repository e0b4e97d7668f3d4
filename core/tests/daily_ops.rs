//! Daily operations: address → notify → close, recipient routing,
//! per-month commands and single-writer close.

use chrono::{NaiveDate, TimeZone, Utc};
use recon_core::{
    clock::FixedClock,
    config::ReconConfig,
    daily_ops::{CloseState, DailyNextAction, SubmissionNextAction},
    engine::ReconEngine,
    error::ReconError,
    exception::{Disposition, ExceptionState},
    notification::Recipient,
    run::ReconRun,
    scenario::{scenario3, Fault, ScenarioBuilder},
    store::ReconStore,
    transaction::SourceType,
};
use std::sync::Arc;

const OPERATOR: &str = "ops-carol";

fn business_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 16).unwrap()
}

fn build() -> ReconEngine {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = ReconStore::in_memory().expect("in-memory store");
    store.migrate().expect("migration");
    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 3, 17, 18, 30, 0).unwrap()));
    ReconEngine::new(store, ReconConfig::default_test(), Box::new(clock))
}

fn scenario3_run(engine: &ReconEngine) -> ReconRun {
    scenario3(business_date()).run_through(engine, OPERATOR).unwrap()
}

// ── Close-out path ────────────────────────────────────────────────

/// A clean day is ready to close straight after completion.
#[test]
fn zero_doubtful_run_is_ready_immediately() {
    let engine = build();
    let run = ScenarioBuilder::new(21, business_date()).refs(12).build().run_through(&engine, OPERATOR).unwrap();
    let daily = engine.daily_ops(&run.id).unwrap();
    assert_eq!(daily.doubtful, 0);
    assert_eq!(daily.notifications_required, 0);
    assert_eq!(daily.close_state, CloseState::ReadyToClose);
    assert_eq!(daily.next_action, DailyNextAction::CloseDay);

    let err = engine.send_notifications(&run.id, OPERATOR).unwrap_err();
    assert!(matches!(err, ReconError::PreconditionFailed(_)));

    let closed = engine.close_day(&run.id, OPERATOR).unwrap();
    assert_eq!(closed.close_state, CloseState::Closed);
    assert_eq!(closed.closed_by.as_deref(), Some(OPERATOR));
}

/// Scenario 3 walks address → notify → close, each gate enforced.
#[test]
fn doubtful_day_walks_the_gates() {
    let engine = build();
    let run = scenario3_run(&engine);

    let daily = engine.daily_ops(&run.id).unwrap();
    assert_eq!(daily.next_action, DailyNextAction::AddressDoubtful);
    assert_eq!(daily.unresolved_doubtful, 2);
    assert_eq!(daily.notifications_required, 1);
    assert!(matches!(engine.send_notifications(&run.id, OPERATOR), Err(ReconError::PreconditionFailed(_))));
    assert!(matches!(engine.close_day(&run.id, OPERATOR), Err(ReconError::PreconditionFailed(_))));

    let daily = engine.address_doubtful(&run.id, Disposition::Approve, OPERATOR).unwrap();
    assert_eq!(daily.unresolved_doubtful, 0);
    assert_eq!(daily.addressed_doubtful, 2);
    assert_eq!(daily.next_action, DailyNextAction::SendNotifications);
    for case in engine.list_exceptions(&run.id).unwrap() {
        assert_eq!(case.state, ExceptionState::Approved);
    }
    assert!(engine.address_doubtful(&run.id, Disposition::Approve, OPERATOR).is_err());

    let daily = engine.send_notifications(&run.id, OPERATOR).unwrap();
    assert_eq!(daily.notifications_sent, 1);
    assert_eq!(daily.close_state, CloseState::ReadyToClose);

    let daily = engine.close_day(&run.id, OPERATOR).unwrap();
    assert_eq!(daily.next_action, DailyNextAction::Closed);
    assert_eq!(daily.monthly_items[0].next_action, SubmissionNextAction::MonthlyClose);

    let err = engine.close_day(&run.id, OPERATOR).unwrap_err();
    assert!(matches!(err, ReconError::InvalidTransition { entity: "daily close", .. }));
    let types: Vec<String> = engine.events_for_run(&run.id).unwrap().into_iter().map(|e| e.event_type).collect();
    assert!(types.contains(&"sources_notified".to_string()));
    assert!(types.contains(&"day_closed".to_string()));
}

/// Rejecting routes cases through verified → rejected.
#[test]
fn address_with_reject_disposition() {
    let engine = build();
    let run = scenario3_run(&engine);
    engine.address_doubtful(&run.id, Disposition::Reject, OPERATOR).unwrap();
    for case in engine.list_exceptions(&run.id).unwrap() {
        assert_eq!(case.state, ExceptionState::Rejected);
    }
}

/// Daily commands need a completed run.
#[test]
fn daily_commands_need_a_completed_run() {
    let engine = build();
    let run = engine.create_run(OPERATOR, business_date()).unwrap();
    let daily = engine.daily_ops(&run.id).unwrap();
    assert_eq!(daily.next_action, DailyNextAction::WaitRunCompletion);
    assert!(matches!(engine.close_day(&run.id, OPERATOR), Err(ReconError::PreconditionFailed(_))));
}

// ── Routing ───────────────────────────────────────────────────────

/// Amount drift goes to backoffice; a backdate gap goes to recon ops.
#[test]
fn mismatch_routing() {
    let engine = build();
    let run = scenario3_run(&engine);
    let daily = engine.daily_ops(&run.id).unwrap();
    let target = |r: Recipient| daily.notification_targets.iter().find(|t| t.recipient == r).cloned();

    let backoffice = target(Recipient::InternalBackoffice).unwrap();
    assert_eq!(backoffice.merchant_refs, vec!["SCENARIO3-REF-001"]);
    let ops = target(Recipient::ReconciliationOps).unwrap();
    assert_eq!(ops.merchant_refs, vec!["SCENARIO3-REF-010"]);
    assert!(target(Recipient::PspProvider).is_none());
}

/// A missing source notifies only that source's owner.
#[test]
fn missing_source_routes_to_owner() {
    let engine = build();
    let run = ScenarioBuilder::new(4, business_date())
        .refs(6)
        .fault(2, Fault::MissingSource { source: SourceType::Psp })
        .fault(5, Fault::MissingSource { source: SourceType::Erp })
        .build()
        .run_through(&engine, OPERATOR)
        .unwrap();
    let daily = engine.daily_ops(&run.id).unwrap();
    let recipients: Vec<Recipient> = daily.notification_targets.iter().map(|t| t.recipient).collect();
    assert_eq!(recipients.len(), 2);
    assert!(recipients.contains(&Recipient::PspProvider));
    assert!(recipients.contains(&Recipient::CashierErp));

    let detail = daily.monthly_items[0]
        .doubtful_details
        .iter()
        .find(|d| d.merchant_ref == "SEED4-REF-002")
        .unwrap();
    assert_eq!(detail.missing_sources, vec![SourceType::Psp]);
    assert_eq!(detail.recipients, vec![Recipient::PspProvider]);
}

// ── Per-month commands ────────────────────────────────────────────

/// address_month and notify_month act on one month bucket.
#[test]
fn month_scoped_commands() {
    let engine = build();
    let run = scenario3_run(&engine);
    let month = "2026-03";

    let err = engine.notify_month(&run.id, month, OPERATOR).unwrap_err();
    assert!(matches!(err, ReconError::PreconditionFailed(_)));
    assert!(matches!(
        engine.address_month(&run.id, "2026-01", Disposition::Approve, OPERATOR),
        Err(ReconError::InvalidInput(_))
    ));

    let daily = engine.address_month(&run.id, month, Disposition::Approve, OPERATOR).unwrap();
    assert_eq!(daily.monthly_items[0].next_action, SubmissionNextAction::NotifySources);

    let daily = engine.notify_month(&run.id, month, OPERATOR).unwrap();
    let item = &daily.monthly_items[0];
    assert!(item.notified_to_source);
    assert!(item.notified_at.is_some());
    assert_eq!(item.next_action, SubmissionNextAction::CloseDay);

    assert!(engine.notify_month(&run.id, month, OPERATOR).is_err());
    assert_eq!(engine.monthly_submissions(&run.id).unwrap().len(), 1);
}

// ── Concurrency ───────────────────────────────────────────────────

/// Two operators closing the same day at once: exactly one wins.
#[test]
fn concurrent_close_is_single_writer() {
    let engine = build();
    let run = ScenarioBuilder::new(31, business_date()).refs(8).build().run_through(&engine, OPERATOR).unwrap();

    let results: Vec<bool> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let engine = &engine;
                let run_id = run.id.clone();
                s.spawn(move || engine.close_day(&run_id, &format!("ops-{i}")).is_ok())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(results.iter().filter(|ok| **ok).count(), 1);
    let closes = engine
        .events_for_run(&run.id)
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == "day_closed")
        .count();
    assert_eq!(closes, 1);
}

/// The run list carries one daily summary per run.
#[test]
fn list_daily_ops_covers_every_run() {
    let engine = build();
    scenario3_run(&engine);
    ScenarioBuilder::new(9, business_date()).refs(3).build().run_through(&engine, OPERATOR).unwrap();
    assert_eq!(engine.list_daily_ops().unwrap().len(), 2);
}
