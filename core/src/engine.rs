//! The reconciliation engine: the single entry point for every operation.
//!
//! RUN PIPELINE (fixed, documented, never reordered):
//!   1. Load sources    : all three files present, each parsed to canonical rows
//!   2. Match           : five stages per reference, on worker threads
//!   3. Persist         : decisions, exception upserts, counters, in one transaction
//!   4. Review          : escalation chain for every newly opened case
//!
//! LOCKING:
//!   - A per-run mutex serializes every command that touches one run.
//!   - The store mutex is always taken after the run mutex, never before.
//!   - Matching and reviewer calls run with the store mutex released.
//!   - Daily and monthly commands hold the store mutex from guard to write,
//!     so they always act on a consistent view.

use crate::clock::{Clock, SystemClock};
use crate::command::OperatorCommand;
use crate::config::ReconConfig;
use crate::daily_ops::{
    DailyAction, DailyCloseRecord, DailyOpsSummary, MonthAction, MonthNotification, MonthlySubmission,
};
use crate::decision::{FinalStatus, MatchDecision};
use crate::error::{ReconError, ReconResult};
use crate::event::{EventLogEntry, ReconEvent};
use crate::exception::{plan_upsert, Disposition, ExceptionAction, ExceptionCase, ExceptionUpsert};
use crate::feedback::{compute_metrics, AIFeedback, FeedbackInput, FeedbackMetrics};
use crate::matcher::MatchingEngine;
use crate::monthly_close::{build_payload, BatchAction, GoodRows, MemberRun, MonthlyCloseBatch};
use crate::review::{complete_chain, validate_append, AIReviewStep, FallbackReviewer, ReviewCollaborator};
use crate::run::{ReconRun, RunCounters, RunStatus};
use crate::snapshot::TransactionSnapshot;
use crate::store::{ReconStore, SourceFileRow};
use crate::transaction::{
    build_candidate_sets, candidate_set_for, CanonicalJsonParser, NormalizedTransaction, RawSourceFile,
    SourceLoad, SourceParser, SourceType,
};
use crate::types::{month_key, new_id, new_run_number, parse_month_key, MerchantRef, RunId};
use crate::workers::parallel_map;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Operator id used by the engine itself for automated steps.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run: ReconRun,
    pub source_files: Vec<SourceFileRow>,
    pub decisions: Vec<MatchDecision>,
    pub exceptions: Vec<ExceptionCase>,
    pub daily: DailyOpsSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CommandOutcome {
    Run(ReconRun),
    Exception(ExceptionCase),
    Reviews(Vec<AIReviewStep>),
    Feedback(AIFeedback),
    Daily(DailyOpsSummary),
    Monthly(MonthlyCloseBatch),
}

pub struct ReconEngine {
    config: ReconConfig,
    store: Mutex<ReconStore>,
    run_locks: Mutex<HashMap<RunId, Arc<Mutex<()>>>>,
    matcher: MatchingEngine,
    parser: Box<dyn SourceParser>,
    reviewer: Box<dyn ReviewCollaborator>,
    fallback: FallbackReviewer,
    clock: Box<dyn Clock>,
}

impl ReconEngine {
    pub fn new(store: ReconStore, config: ReconConfig, clock: Box<dyn Clock>) -> Self {
        let fallback = FallbackReviewer::new(&config.review);
        Self {
            matcher: MatchingEngine::build(config.matching.clone()),
            reviewer: Box::new(FallbackReviewer::new(&config.review)),
            parser: Box::new(CanonicalJsonParser),
            store: Mutex::new(store),
            run_locks: Mutex::new(HashMap::new()),
            fallback,
            clock,
            config,
        }
    }

    /// Build a fully wired engine on a migrated store with the system clock.
    pub fn build(store: ReconStore, config: ReconConfig) -> ReconResult<Self> {
        store.migrate()?;
        Ok(Self::new(store, config, Box::new(SystemClock)))
    }

    pub fn with_parser(mut self, parser: Box<dyn SourceParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_reviewer(mut self, reviewer: Box<dyn ReviewCollaborator>) -> Self {
        self.reviewer = reviewer;
        self
    }

    pub fn with_matcher(mut self, matcher: MatchingEngine) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn config(&self) -> &ReconConfig {
        &self.config
    }

    fn store(&self) -> ReconResult<MutexGuard<'_, ReconStore>> {
        self.store.lock().map_err(|_| ReconError::LockPoisoned("store"))
    }

    fn run_lock(&self, run_id: &str) -> ReconResult<Arc<Mutex<()>>> {
        let mut locks = self.run_locks.lock().map_err(|_| ReconError::LockPoisoned("run registry"))?;
        Ok(locks.entry(run_id.to_string()).or_default().clone())
    }

    /// Hold the run's mutex for the duration of `f`.
    fn with_run<T>(&self, run_id: &str, f: impl FnOnce() -> ReconResult<T>) -> ReconResult<T> {
        let lock = self.run_lock(run_id)?;
        let _guard = lock.lock().map_err(|_| ReconError::LockPoisoned("run"))?;
        f()
    }

    // ── Run lifecycle ──────────────────────────────────────────

    pub fn create_run(&self, initiated_by: &str, business_date: NaiveDate) -> ReconResult<ReconRun> {
        let now = self.clock.now();
        let run = ReconRun {
            id: new_id(),
            run_number: new_run_number(),
            status: RunStatus::Draft,
            stage: "awaiting_sources".to_string(),
            initiated_by: initiated_by.to_string(),
            business_date,
            counters: RunCounters::default(),
            evaluation_seq: 0,
            created_at: now,
            updated_at: now,
        };
        let store = self.store()?;
        store.atomically(|s| {
            s.insert_run(&run)?;
            s.record_event(
                initiated_by,
                &ReconEvent::RunCreated {
                    run_id: run.id.clone(),
                    run_number: run.run_number.clone(),
                    business_date,
                },
                now,
            )
        })?;
        log::info!("created run {} for {business_date}", run.run_number);
        Ok(run)
    }

    /// Attach (or replace) one source file. A draft run becomes ready once
    /// all three sources are attached.
    pub fn attach_source(
        &self,
        run_id: &str,
        source: SourceType,
        file: RawSourceFile,
        actor: &str,
    ) -> ReconResult<ReconRun> {
        self.with_run(run_id, || {
            let store = self.store()?;
            let run = store.get_run(run_id)?;
            if !matches!(run.status, RunStatus::Draft | RunStatus::Ready) {
                return Err(ReconError::transition("run", run.status, "attach source"));
            }
            let now = self.clock.now();
            let checksum = file.checksum();
            store.atomically(|s| {
                s.upsert_source_file(run_id, source, &file, &checksum, now)?;
                s.record_event(
                    actor,
                    &ReconEvent::SourceAttached {
                        run_id: run_id.to_string(),
                        source,
                        filename: file.filename.clone(),
                        checksum: checksum.clone(),
                    },
                    now,
                )?;
                let attached = s.source_files(run_id)?.len();
                if run.status == RunStatus::Draft && attached == SourceType::ALL.len() {
                    let to = run.status.advance(RunStatus::Ready)?;
                    s.update_run_status(run_id, to, "ready", now)?;
                    s.record_event(
                        actor,
                        &ReconEvent::RunStatusChanged {
                            run_id: run_id.to_string(),
                            from: run.status,
                            to,
                            stage: "ready".to_string(),
                        },
                        now,
                    )?;
                }
                Ok(())
            })?;
            store.get_run(run_id)
        })
    }

    /// Allowed until the run's day is closed.
    pub fn set_business_date(&self, run_id: &str, business_date: NaiveDate, actor: &str) -> ReconResult<ReconRun> {
        self.with_run(run_id, || {
            let store = self.store()?;
            let run = store.get_run(run_id)?;
            if store.daily_close(run_id)?.is_some() {
                return Err(ReconError::transition("daily close", "closed", "set business date"));
            }
            Self::ensure_month_unsubmitted(&store, business_date)?;
            let now = self.clock.now();
            store.atomically(|s| {
                s.update_business_date(run_id, business_date, now)?;
                s.record_event(
                    actor,
                    &ReconEvent::BusinessDateSet {
                        run_id: run_id.to_string(),
                        from: run.business_date,
                        to: business_date,
                    },
                    now,
                )
            })?;
            store.get_run(run_id)
        })
    }

    pub fn queue_run(&self, run_id: &str, actor: &str) -> ReconResult<ReconRun> {
        self.with_run(run_id, || {
            let store = self.store()?;
            let run = store.get_run(run_id)?;
            let to = run.status.advance(RunStatus::Queued)?;
            Self::change_status(&store, &run, to, "queued", actor, self.clock.now())?;
            store.get_run(run_id)
        })
    }

    fn change_status(
        store: &ReconStore,
        run: &ReconRun,
        to: RunStatus,
        stage: &str,
        actor: &str,
        at: chrono::DateTime<chrono::Utc>,
    ) -> ReconResult<()> {
        store.atomically(|s| {
            s.update_run_status(&run.id, to, stage, at)?;
            s.record_event(
                actor,
                &ReconEvent::RunStatusChanged {
                    run_id: run.id.clone(),
                    from: run.status,
                    to,
                    stage: stage.to_string(),
                },
                at,
            )
        })
    }

    /// Move a running run to a failure state and hand back the error to return.
    fn fail_run(&self, run: &ReconRun, to: RunStatus, stage: String, actor: &str, err: ReconError) -> ReconError {
        log::warn!("run {} -> {to}: {stage}", run.run_number);
        let running = ReconRun { status: RunStatus::Running, ..run.clone() };
        let recorded = self
            .store()
            .and_then(|store| Self::change_status(&store, &running, to, &stage, actor, self.clock.now()));
        if let Err(e) = recorded {
            log::error!("could not record failure of run {}: {e}", run.run_number);
        }
        err
    }

    /// Evaluate a queued run, or re-evaluate a completed run whose day is
    /// still open. Re-evaluation writes a new decision generation.
    pub fn execute_run(&self, run_id: &str, actor: &str) -> ReconResult<ReconRun> {
        self.with_run(run_id, || {
            let (run, first) = {
                let store = self.store()?;
                let run = store.get_run(run_id)?;
                match run.status {
                    RunStatus::Queued => {
                        let to = run.status.advance(RunStatus::Running)?;
                        Self::change_status(&store, &run, to, "loading_sources", actor, self.clock.now())?;
                        (run, true)
                    }
                    RunStatus::Completed => {
                        if store.daily_close(run_id)?.is_some() {
                            return Err(ReconError::transition("daily close", "closed", "re-evaluate run"));
                        }
                        (run, false)
                    }
                    other => return Err(ReconError::transition("run", other, "execute")),
                }
            };

            let loads = if first {
                self.load_sources(&run, actor)?
            } else {
                self.store()?.source_loads(run_id)?
            };

            let seq = run.evaluation_seq + 1;
            let sets = build_candidate_sets(&loads);
            log::info!("run {}: evaluating {} reference(s), generation {seq}", run.run_number, sets.len());
            let now = self.clock.now();
            let decisions = match self.matcher.decide_all(&run.id, seq, &sets, now) {
                Ok(decisions) => decisions,
                Err(e) if first => {
                    return Err(self.fail_run(&run, RunStatus::Failed, format!("failed:{e}"), actor, e.into()));
                }
                Err(e) => return Err(e.into()),
            };

            let opened = match self.persist_evaluation(&run, first, seq, &decisions, actor) {
                Ok(opened) => opened,
                Err(e) if first => {
                    return Err(self.fail_run(&run, RunStatus::Failed, format!("failed:{e}"), actor, e));
                }
                Err(e) => return Err(e),
            };

            self.review_new_cases(&opened, actor)?;
            self.store()?.get_run(run_id)
        })
    }

    fn load_sources(&self, run: &ReconRun, actor: &str) -> ReconResult<BTreeMap<SourceType, SourceLoad>> {
        let files = match self.store().and_then(|s| s.source_files(&run.id)) {
            Ok(f) => f,
            Err(e) => return Err(self.fail_run(run, RunStatus::Failed, format!("failed:{e}"), actor, e)),
        };
        let missing: Vec<&str> = SourceType::ALL
            .iter()
            .filter(|s| !files.iter().any(|f| f.source == **s))
            .map(|s| s.as_str())
            .collect();
        if !missing.is_empty() {
            let stage = format!("missing_sources:{}", missing.join(","));
            let err = ReconError::InvalidInput(stage.clone());
            return Err(self.fail_run(run, RunStatus::FormatFailed, stage, actor, err));
        }

        let mut loads = BTreeMap::new();
        for source in SourceType::ALL {
            let content = match self.store().and_then(|s| s.source_content(&run.id, source)) {
                Ok(Some(c)) => c,
                Ok(None) => {
                    let stage = format!("missing_sources:{source}");
                    let err = ReconError::InvalidInput(stage.clone());
                    return Err(self.fail_run(run, RunStatus::FormatFailed, stage, actor, err));
                }
                Err(e) => return Err(self.fail_run(run, RunStatus::Failed, format!("failed:{e}"), actor, e)),
            };
            match self.parser.parse(source, &content) {
                Ok(rows) => {
                    let stored = self.store().and_then(|s| {
                        s.atomically(|s| {
                            s.replace_normalized_rows(&run.id, source, &rows)?;
                            s.mark_source_parse(&run.id, source, None)
                        })
                    });
                    if let Err(e) = stored {
                        return Err(self.fail_run(run, RunStatus::Failed, format!("failed:{e}"), actor, e));
                    }
                    log::debug!("run {}: {source} parsed {} row(s)", run.run_number, rows.len());
                    loads.insert(source, SourceLoad::Parsed(rows));
                }
                Err(reason) => {
                    if let Err(e) = self.store().and_then(|s| s.mark_source_parse(&run.id, source, Some(&reason))) {
                        log::error!("could not mark {source} parse failure: {e}");
                    }
                    let stage = format!("format_failed_{source}:{reason}");
                    let err = ReconError::InvalidInput(stage.clone());
                    return Err(self.fail_run(run, RunStatus::FormatFailed, stage, actor, err));
                }
            }
        }
        Ok(loads)
    }

    /// Returns the cases opened by this evaluation, paired with their decision.
    fn persist_evaluation(
        &self,
        run: &ReconRun,
        first: bool,
        seq: u32,
        decisions: &[MatchDecision],
        actor: &str,
    ) -> ReconResult<Vec<(ExceptionCase, MatchDecision)>> {
        let now = self.clock.now();
        let policy = &self.config.severity;
        let store = self.store()?;
        store.atomically(|s| {
            s.insert_decisions(decisions)?;
            let mut opened = Vec::new();
            for d in decisions {
                let existing = s.exception_for_ref(&run.id, &d.merchant_ref)?;
                match plan_upsert(existing.as_ref(), d, policy, now) {
                    Some(ExceptionUpsert::Opened(case)) => {
                        s.insert_exception(&case)?;
                        s.record_event(
                            actor,
                            &ReconEvent::ExceptionOpened {
                                run_id: run.id.clone(),
                                exception_id: case.id.clone(),
                                merchant_ref: case.merchant_ref.clone(),
                                severity: case.severity,
                            },
                            now,
                        )?;
                        opened.push((case, d.clone()));
                    }
                    Some(ExceptionUpsert::Refreshed { case, previous }) => {
                        s.update_exception(&case)?;
                        if previous != case.severity {
                            log::info!("{}: severity {previous:?} -> {:?}", case.merchant_ref, case.severity);
                        }
                        s.record_event(
                            actor,
                            &ReconEvent::ExceptionRefreshed {
                                run_id: run.id.clone(),
                                exception_id: case.id.clone(),
                                severity: case.severity,
                                reason_codes: case.reason_codes.clone(),
                            },
                            now,
                        )?;
                    }
                    Some(ExceptionUpsert::KeptResolved(case)) => {
                        log::debug!("{}: case {} already resolved; left as is", case.merchant_ref, case.id);
                    }
                    None => {}
                }
            }

            let good = decisions.iter().filter(|d| d.final_status == FinalStatus::GoodTransaction).count() as u32;
            // Cases of references that re-evaluated to good stay on file but no longer count.
            let doubtful_refs: HashSet<&str> =
                decisions.iter().filter(|d| d.is_doubtful()).map(|d| d.merchant_ref.as_str()).collect();
            let live_cases = s
                .exceptions_for_run(&run.id)?
                .iter()
                .filter(|c| doubtful_refs.contains(c.merchant_ref.as_str()))
                .count() as u32;
            let counters = RunCounters {
                total: decisions.len() as u32,
                good,
                doubtful: decisions.len() as u32 - good,
                exceptions: live_cases,
            };
            s.update_run_evaluation(&run.id, &counters, seq, now)?;
            if first {
                let to = RunStatus::Running.advance(RunStatus::Completed)?;
                s.update_run_status(&run.id, to, "completed", now)?;
                s.record_event(
                    actor,
                    &ReconEvent::RunStatusChanged {
                        run_id: run.id.clone(),
                        from: RunStatus::Running,
                        to,
                        stage: "completed".to_string(),
                    },
                    now,
                )?;
            } else {
                s.update_run_status(&run.id, RunStatus::Completed, &format!("reevaluated:{seq}"), now)?;
            }
            s.record_event(
                actor,
                &ReconEvent::RunEvaluated {
                    run_id: run.id.clone(),
                    evaluation_seq: seq,
                    total: counters.total,
                    good: counters.good,
                    doubtful: counters.doubtful,
                    exceptions: counters.exceptions,
                },
                now,
            )?;
            log::info!(
                "run {} generation {seq}: {} total, {} good, {} doubtful, {} exception(s)",
                run.run_number,
                counters.total,
                counters.good,
                counters.doubtful,
                counters.exceptions
            );
            Ok(opened)
        })
    }

    fn review_new_cases(&self, opened: &[(ExceptionCase, MatchDecision)], actor: &str) -> ReconResult<()> {
        if opened.is_empty() {
            return Ok(());
        }
        let now = self.clock.now();
        let include_announcer = self.config.review.include_announcer;
        let chains = parallel_map(opened, self.config.matching.workers, |(case, decision)| {
            complete_chain(
                self.reviewer.as_ref(),
                &self.fallback,
                case,
                Some(decision),
                &[],
                1,
                include_announcer,
                now,
            )
        })?;
        let store = self.store()?;
        store.atomically(|s| {
            for ((case, _), steps) in opened.iter().zip(&chains) {
                Self::persist_steps(s, case, steps, include_announcer, actor)?;
            }
            Ok(())
        })
    }

    fn persist_steps(
        store: &ReconStore,
        case: &ExceptionCase,
        steps: &[AIReviewStep],
        include_announcer: bool,
        actor: &str,
    ) -> ReconResult<()> {
        let history = store.review_steps(&case.id)?;
        for step in steps {
            let chain: Vec<AIReviewStep> = history
                .iter()
                .chain(steps.iter().take_while(|s| s.id != step.id))
                .filter(|s| s.chain_seq == step.chain_seq)
                .cloned()
                .collect();
            validate_append(&chain, step.stage, include_announcer)?;
            store.append_review_step(step)?;
            store.record_event(
                actor,
                &ReconEvent::ReviewStepAppended {
                    run_id: case.run_id.clone(),
                    exception_id: case.id.clone(),
                    chain_seq: step.chain_seq,
                    stage: step.stage,
                    engine: step.engine.clone(),
                },
                step.created_at,
            )?;
        }
        Ok(())
    }

    // ── Queries ────────────────────────────────────────────────

    pub fn get_run(&self, run_id: &str) -> ReconResult<ReconRun> {
        self.store()?.get_run(run_id)
    }

    pub fn list_runs(&self) -> ReconResult<Vec<ReconRun>> {
        self.store()?.list_runs()
    }

    pub fn run_summary(&self, run_id: &str) -> ReconResult<RunSummary> {
        let store = self.store()?;
        let ledger = store.run_ledger(run_id)?;
        Ok(RunSummary {
            source_files: store.source_files(run_id)?,
            daily: ledger.summary(),
            decisions: ledger.decisions,
            exceptions: ledger.exceptions,
            run: ledger.run,
        })
    }

    pub fn decisions(&self, run_id: &str) -> ReconResult<Vec<MatchDecision>> {
        let store = self.store()?;
        store.get_run(run_id)?;
        store.latest_decisions(run_id)
    }

    pub fn decision_history(&self, run_id: &str, merchant_ref: &str) -> ReconResult<Vec<MatchDecision>> {
        self.store()?.decision_history(run_id, merchant_ref)
    }

    pub fn transaction_snapshot(&self, run_id: &str, merchant_ref: &str) -> ReconResult<TransactionSnapshot> {
        let store = self.store()?;
        store.get_run(run_id)?;
        let loads = store.source_loads(run_id)?;
        let set = candidate_set_for(&loads, merchant_ref);
        let decision = store.latest_decision(run_id, merchant_ref)?;
        Ok(TransactionSnapshot::build(run_id, set, decision, self.config.matching.amount_epsilon))
    }

    pub fn list_exceptions(&self, run_id: &str) -> ReconResult<Vec<ExceptionCase>> {
        let store = self.store()?;
        store.get_run(run_id)?;
        store.exceptions_for_run(run_id)
    }

    pub fn get_exception(&self, exception_id: &str) -> ReconResult<ExceptionCase> {
        self.store()?.get_exception(exception_id)
    }

    pub fn review_history(&self, exception_id: &str) -> ReconResult<Vec<AIReviewStep>> {
        let store = self.store()?;
        store.get_exception(exception_id)?;
        store.review_steps(exception_id)
    }

    pub fn events_for_run(&self, run_id: &str) -> ReconResult<Vec<EventLogEntry>> {
        self.store()?.events_for_run(run_id)
    }

    pub fn events_for_entity(&self, entity_type: &str, entity_id: &str) -> ReconResult<Vec<EventLogEntry>> {
        self.store()?.events_for_entity(entity_type, entity_id)
    }

    // ── Exceptions and review ──────────────────────────────────

    fn run_of_exception(&self, exception_id: &str) -> ReconResult<RunId> {
        Ok(self.store()?.get_exception(exception_id)?.run_id)
    }

    fn transition_case(
        store: &ReconStore,
        case: &mut ExceptionCase,
        action: ExceptionAction,
        actor: &str,
        at: chrono::DateTime<chrono::Utc>,
    ) -> ReconResult<()> {
        let from = case.state;
        let to = from.apply(action)?;
        case.state = to;
        case.updated_at = at;
        store.update_exception(case)?;
        store.record_event(
            actor,
            &ReconEvent::ExceptionTransitioned {
                run_id: case.run_id.clone(),
                exception_id: case.id.clone(),
                from,
                to,
            },
            at,
        )
    }

    pub fn apply_exception_action(
        &self,
        exception_id: &str,
        action: ExceptionAction,
        actor: &str,
    ) -> ReconResult<ExceptionCase> {
        let run_id = self.run_of_exception(exception_id)?;
        self.with_run(&run_id, || {
            let store = self.store()?;
            let mut case = store.get_exception(exception_id)?;
            let now = self.clock.now();
            store.atomically(|s| Self::transition_case(s, &mut case, action, actor, now))?;
            Ok(case)
        })
    }

    /// Start a new chain generation at intern and run it to the end.
    pub fn retrigger_review(&self, exception_id: &str, actor: &str) -> ReconResult<Vec<AIReviewStep>> {
        let run_id = self.run_of_exception(exception_id)?;
        self.with_run(&run_id, || {
            let (case, decision, chain_seq) = {
                let store = self.store()?;
                let case = store.get_exception(exception_id)?;
                let decision = store.latest_decision(&case.run_id, &case.merchant_ref)?;
                let chain_seq = store
                    .review_steps(exception_id)?
                    .iter()
                    .map(|s| s.chain_seq)
                    .max()
                    .unwrap_or(0)
                    + 1;
                (case, decision, chain_seq)
            };
            let include_announcer = self.config.review.include_announcer;
            let now = self.clock.now();
            let steps = complete_chain(
                self.reviewer.as_ref(),
                &self.fallback,
                &case,
                decision.as_ref(),
                &[],
                chain_seq,
                include_announcer,
                now,
            );
            let store = self.store()?;
            store.atomically(|s| {
                s.record_event(
                    actor,
                    &ReconEvent::ReviewRetriggered {
                        run_id: case.run_id.clone(),
                        exception_id: case.id.clone(),
                        chain_seq,
                    },
                    now,
                )?;
                Self::persist_steps(s, &case, &steps, include_announcer, actor)
            })?;
            Ok(steps)
        })
    }

    pub fn record_feedback(&self, input: FeedbackInput) -> ReconResult<AIFeedback> {
        let store = self.store()?;
        let case = store.get_exception(&input.exception_id)?;
        if let Some(step_id) = &input.step_id {
            match store.get_review_step(step_id)? {
                Some(step) if step.exception_id == case.id && step.stage == input.stage => {}
                Some(_) => {
                    return Err(ReconError::InvalidInput(format!(
                        "review step {step_id} does not belong to {} at stage {}",
                        case.id, input.stage
                    )))
                }
                None => return Err(ReconError::InvalidInput(format!("review step {step_id} not found"))),
            }
        }
        let now = self.clock.now();
        let fb = AIFeedback {
            id: new_id(),
            exception_id: case.id.clone(),
            run_id: case.run_id.clone(),
            user_id: input.user_id,
            stage: input.stage,
            step_id: input.step_id,
            feedback_type: input.feedback_type,
            reason_codes: input.reason_codes,
            edited_action: input.edited_action,
            comment: input.comment,
            created_at: now,
        };
        store.atomically(|s| {
            s.insert_feedback(&fb)?;
            s.record_event(
                &fb.user_id,
                &ReconEvent::FeedbackRecorded {
                    run_id: fb.run_id.clone(),
                    exception_id: fb.exception_id.clone(),
                    feedback_id: fb.id.clone(),
                    feedback_type: fb.feedback_type,
                },
                now,
            )
        })?;
        Ok(fb)
    }

    /// Metrics over all feedback, or one run's.
    pub fn feedback_metrics(&self, run_id: Option<&str>) -> ReconResult<FeedbackMetrics> {
        Ok(compute_metrics(&self.store()?.feedback(run_id)?))
    }

    // ── Daily operations ───────────────────────────────────────

    pub fn daily_ops(&self, run_id: &str) -> ReconResult<DailyOpsSummary> {
        Ok(self.store()?.run_ledger(run_id)?.summary())
    }

    pub fn list_daily_ops(&self) -> ReconResult<Vec<DailyOpsSummary>> {
        let store = self.store()?;
        store
            .list_runs()?
            .iter()
            .map(|r| Ok(store.run_ledger(&r.id)?.summary()))
            .collect()
    }

    pub fn monthly_submissions(&self, run_id: &str) -> ReconResult<Vec<MonthlySubmission>> {
        Ok(self.store()?.run_ledger(run_id)?.monthly_submissions())
    }

    /// Settle every unaddressed doubtful case of the run (or of one month).
    fn address(
        &self,
        run_id: &str,
        month: Option<&str>,
        disposition: Disposition,
        actor: &str,
    ) -> ReconResult<DailyOpsSummary> {
        self.with_run(run_id, || {
            let store = self.store()?;
            let summary = store.run_ledger(run_id)?.summary();
            let items: Vec<&MonthlySubmission> = match month {
                Some(m) => vec![summary.guard_month(m, MonthAction::Address)?],
                None => {
                    summary.guard(DailyAction::AddressDoubtful)?;
                    summary.monthly_items.iter().collect()
                }
            };
            let targets: Vec<String> = items
                .iter()
                .flat_map(|m| m.doubtful_details.iter())
                .filter(|d| !d.state.is_addressed())
                .filter_map(|d| d.exception_id.clone())
                .collect();
            let now = self.clock.now();
            store.atomically(|s| {
                for id in &targets {
                    let mut case = s.get_exception(id)?;
                    for action in disposition.path_from(case.state) {
                        Self::transition_case(s, &mut case, action, actor, now)?;
                    }
                }
                Ok(())
            })?;
            log::info!("run {}: addressed {} doubtful case(s)", summary.run_number, targets.len());
            Ok(store.run_ledger(run_id)?.summary())
        })
    }

    pub fn address_doubtful(&self, run_id: &str, disposition: Disposition, actor: &str) -> ReconResult<DailyOpsSummary> {
        self.address(run_id, None, disposition, actor)
    }

    pub fn address_month(
        &self,
        run_id: &str,
        month: &str,
        disposition: Disposition,
        actor: &str,
    ) -> ReconResult<DailyOpsSummary> {
        self.address(run_id, Some(month), disposition, actor)
    }

    fn notify(&self, run_id: &str, month: Option<&str>, actor: &str) -> ReconResult<DailyOpsSummary> {
        self.with_run(run_id, || {
            let store = self.store()?;
            let summary = store.run_ledger(run_id)?.summary();
            let months: Vec<String> = match month {
                Some(m) => vec![summary.guard_month(m, MonthAction::Notify)?.month.clone()],
                None => {
                    summary.guard(DailyAction::SendNotifications)?;
                    summary
                        .monthly_items
                        .iter()
                        .filter(|m| m.doubtful > 0 && !m.notified_to_source)
                        .map(|m| m.month.clone())
                        .collect()
                }
            };
            let now = self.clock.now();
            store.atomically(|s| {
                for m in &months {
                    s.insert_month_notification(&MonthNotification {
                        run_id: run_id.to_string(),
                        month: m.clone(),
                        notified_at: now,
                        notified_by: actor.to_string(),
                    })?;
                    s.record_event(
                        actor,
                        &ReconEvent::SourcesNotified { run_id: run_id.to_string(), month: m.clone() },
                        now,
                    )?;
                }
                Ok(())
            })?;
            Ok(store.run_ledger(run_id)?.summary())
        })
    }

    pub fn send_notifications(&self, run_id: &str, actor: &str) -> ReconResult<DailyOpsSummary> {
        self.notify(run_id, None, actor)
    }

    pub fn notify_month(&self, run_id: &str, month: &str, actor: &str) -> ReconResult<DailyOpsSummary> {
        self.notify(run_id, Some(month), actor)
    }

    pub fn close_day(&self, run_id: &str, actor: &str) -> ReconResult<DailyOpsSummary> {
        self.with_run(run_id, || {
            let store = self.store()?;
            let summary = store.run_ledger(run_id)?.summary();
            summary.guard(DailyAction::CloseDay)?;
            Self::ensure_month_unsubmitted(&store, summary.business_date)?;
            let now = self.clock.now();
            store.atomically(|s| {
                s.insert_daily_close(&DailyCloseRecord {
                    run_id: run_id.to_string(),
                    closed_at: now,
                    closed_by: actor.to_string(),
                })?;
                s.record_event(actor, &ReconEvent::DayClosed { run_id: run_id.to_string(), closed_at: now }, now)
            })?;
            log::info!("run {}: day closed by {actor}", summary.run_number);
            Ok(store.run_ledger(run_id)?.summary())
        })
    }

    // ── Monthly close ──────────────────────────────────────────

    /// A submitted month's membership is frozen until the submission is reverted.
    fn ensure_month_unsubmitted(store: &ReconStore, business_date: NaiveDate) -> ReconResult<()> {
        let month = month_key(business_date);
        if store.erp_state(&month)?.submitted_at().is_some() {
            return Err(ReconError::PreconditionFailed(format!(
                "month {month} is already submitted to ERP; revert the submission first"
            )));
        }
        Ok(())
    }

    fn build_batch(store: &ReconStore, month: &str) -> ReconResult<MonthlyCloseBatch> {
        if parse_month_key(month).is_none() {
            return Err(ReconError::InvalidInput(format!("'{month}' is not a YYYY-MM month")));
        }
        let runs = store.runs_in_month(month)?;
        let erp_state = store.erp_state(month)?;
        let last_submission = store.latest_submission(month)?;
        if runs.is_empty() && last_submission.is_none() {
            return Err(ReconError::MonthNotFound(month.to_string()));
        }
        let mut members = Vec::new();
        let mut pending = Vec::new();
        for run in &runs {
            let ledger = store.run_ledger(&run.id)?;
            if ledger.close.is_some() {
                members.push(MemberRun::from(&ledger.summary()));
            } else if run.status == RunStatus::Completed {
                pending.push(run.id.clone());
            }
        }
        Ok(MonthlyCloseBatch::build(month, members, pending, erp_state, last_submission))
    }

    pub fn monthly_close(&self, month: &str) -> ReconResult<MonthlyCloseBatch> {
        Self::build_batch(&*self.store()?, month)
    }

    pub fn list_monthly_close(&self) -> ReconResult<Vec<MonthlyCloseBatch>> {
        let store = self.store()?;
        store
            .business_months()?
            .iter()
            .filter(|m| parse_month_key(m).is_some())
            .map(|m| Self::build_batch(&store, m))
            .collect()
    }

    /// Good rows of one member run, PSP row preferred, then internal, then ERP.
    fn good_rows(store: &ReconStore, run_id: &str) -> ReconResult<Vec<(MerchantRef, NormalizedTransaction)>> {
        let mut by_source: HashMap<SourceType, HashMap<String, NormalizedTransaction>> = HashMap::new();
        for source in SourceType::ALL {
            let rows = store.normalized_rows(run_id, source)?;
            by_source.insert(source, rows.into_iter().map(|r| (r.merchant_ref.clone(), r)).collect());
        }
        let preference = [SourceType::Psp, SourceType::Internal, SourceType::Erp];
        let rows = store
            .latest_decisions(run_id)?
            .into_iter()
            .filter(|d| d.final_status == FinalStatus::GoodTransaction)
            .filter_map(|d| {
                preference
                    .iter()
                    .find_map(|s| by_source.get(s).and_then(|m| m.get(&d.merchant_ref)).cloned())
                    .map(|row| (d.merchant_ref, row))
            })
            .collect();
        Ok(rows)
    }

    fn batch_command(&self, month: &str, action: BatchAction, actor: &str) -> ReconResult<MonthlyCloseBatch> {
        let store = self.store()?;
        let batch = Self::build_batch(&store, month)?;
        let now = self.clock.now();
        let next = batch.guard(action, now)?;
        store.atomically(|s| {
            let submission_id = match action {
                BatchAction::CreateJournal => None,
                BatchAction::SubmitToErp => {
                    let runs = batch
                        .source_runs
                        .iter()
                        .map(|member| Ok(GoodRows { member, rows: Self::good_rows(s, &member.run_id)? }))
                        .collect::<ReconResult<Vec<_>>>()?;
                    let payload = build_payload(&batch, &runs, self.config.matching.amount_epsilon);
                    for w in &payload.warnings {
                        log::warn!("{month}: {w}");
                    }
                    Some(s.insert_erp_submission(month, &payload, now, actor)?)
                }
                BatchAction::RevertSubmission => {
                    let active = s.latest_submission(month)?.filter(|r| r.reverted_at.is_none());
                    match active {
                        Some(record) => {
                            s.mark_submission_reverted(record.id, now, actor)?;
                            Some(record.id)
                        }
                        None => None,
                    }
                }
            };
            s.save_erp_state(month, &next, now)?;
            s.record_event(
                actor,
                &ReconEvent::MonthlyCloseChanged { month: month.to_string(), action, submission_id },
                now,
            )
        })?;
        log::info!("{month}: {} by {actor}", action.as_str());
        Self::build_batch(&store, month)
    }

    pub fn create_journal(&self, month: &str, actor: &str) -> ReconResult<MonthlyCloseBatch> {
        self.batch_command(month, BatchAction::CreateJournal, actor)
    }

    pub fn submit_to_erp(&self, month: &str, actor: &str) -> ReconResult<MonthlyCloseBatch> {
        self.batch_command(month, BatchAction::SubmitToErp, actor)
    }

    pub fn revert_submission(&self, month: &str, actor: &str) -> ReconResult<MonthlyCloseBatch> {
        self.batch_command(month, BatchAction::RevertSubmission, actor)
    }

    // ── Command dispatch ───────────────────────────────────────

    pub fn apply(&self, command: OperatorCommand, actor: &str) -> ReconResult<CommandOutcome> {
        log::debug!("{actor}: {command:?}");
        Ok(match command {
            OperatorCommand::SetBusinessDate { run_id, business_date } => {
                CommandOutcome::Run(self.set_business_date(&run_id, business_date, actor)?)
            }
            OperatorCommand::ExceptionAction { exception_id, action } => {
                CommandOutcome::Exception(self.apply_exception_action(&exception_id, action, actor)?)
            }
            OperatorCommand::RetriggerReview { exception_id } => {
                CommandOutcome::Reviews(self.retrigger_review(&exception_id, actor)?)
            }
            OperatorCommand::RecordFeedback { input } => CommandOutcome::Feedback(self.record_feedback(input)?),
            OperatorCommand::AddressDoubtful { run_id, disposition } => {
                CommandOutcome::Daily(self.address_doubtful(&run_id, disposition, actor)?)
            }
            OperatorCommand::SendNotifications { run_id } => {
                CommandOutcome::Daily(self.send_notifications(&run_id, actor)?)
            }
            OperatorCommand::CloseDay { run_id } => CommandOutcome::Daily(self.close_day(&run_id, actor)?),
            OperatorCommand::AddressMonth { run_id, month, disposition } => {
                CommandOutcome::Daily(self.address_month(&run_id, &month, disposition, actor)?)
            }
            OperatorCommand::NotifyMonth { run_id, month } => {
                CommandOutcome::Daily(self.notify_month(&run_id, &month, actor)?)
            }
            OperatorCommand::CreateJournal { month } => CommandOutcome::Monthly(self.create_journal(&month, actor)?),
            OperatorCommand::SubmitToErp { month } => CommandOutcome::Monthly(self.submit_to_erp(&month, actor)?),
            OperatorCommand::RevertSubmission { month } => {
                CommandOutcome::Monthly(self.revert_submission(&month, actor)?)
            }
        })
    }
}
