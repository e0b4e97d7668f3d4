//! The matching engine: evaluates every merchant reference of a run.
//!
//! EXECUTION ORDER (fixed, documented, never reordered):
//!   1. Exact hash  : canonical key digests agree across present sources
//!   2. Fuzzy       : weighted similarity, minimum over source pairs
//!   3. Three-way   : all sources present, amounts and identity agree
//!   4. Backdated   : date gaps between sources within the window
//!   5. FX          : currencies agree or every source carries a usable rate
//!
//! RULES:
//!   - Every stage runs for every reference; none short-circuits another.
//!   - A panicking stage is isolated and becomes INTERNAL_ERROR for that
//!     reference only.
//!   - References are independent and evaluated on scoped worker threads.

use crate::config::MatchingConfig;
use crate::decision::{aggregate, MatchDecision, MatchTrace, SourcePresence, StageVerdicts};
use crate::stage::*;
use crate::transaction::{CandidateSet, NormalizedTransaction, SourceType};
use crate::types::{round4, within, RunId};
use crate::workers::{parallel_map, WorkerPanic};
use chrono::{DateTime, Utc};
use std::panic::{catch_unwind, AssertUnwindSafe};
use strsim::jaro_winkler;

pub struct MatchingEngine {
    config: MatchingConfig,
    stages: Vec<Box<dyn MatchStage>>,
}

impl MatchingEngine {
    pub fn new(config: MatchingConfig) -> Self {
        Self { config, stages: Vec::new() }
    }

    /// Build an engine with the five standard stages registered.
    pub fn build(config: MatchingConfig) -> Self {
        let mut engine = Self::new(config);
        // EXECUTION ORDER: fixed, documented, never reordered.
        engine.register(Box::new(ExactHashStage));
        engine.register(Box::new(FuzzyStage));
        engine.register(Box::new(ThreeWayStage));
        engine.register(Box::new(BackdatedStage));
        engine.register(Box::new(FxStage));
        engine
    }

    /// Register a stage. A later stage of the same kind replaces the earlier one.
    pub fn register(&mut self, stage: Box<dyn MatchStage>) {
        let kind = stage.kind();
        self.stages.retain(|s| s.kind() != kind);
        self.stages.push(stage);
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    /// Run all stages for one reference.
    pub fn evaluate(&self, set: &CandidateSet) -> StageVerdicts {
        let mut slots: [Option<StageVerdict>; 5] = Default::default();
        for stage in &self.stages {
            let kind = stage.kind();
            let verdict = match catch_unwind(AssertUnwindSafe(|| stage.evaluate(set, &self.config))) {
                Ok(v) => v,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    log::error!(
                        "stage {} crashed on {}: {message}",
                        kind.name(),
                        set.merchant_ref
                    );
                    StageVerdict::crashed(kind, message)
                }
            };
            slots[kind.index()] = Some(verdict);
        }
        let mut take = |kind: StageKind| {
            slots[kind.index()]
                .take()
                .unwrap_or_else(|| StageVerdict::crashed(kind, "stage not registered"))
        };
        StageVerdicts {
            exact_hash: take(StageKind::ExactHash),
            fuzzy: take(StageKind::Fuzzy),
            three_way: take(StageKind::ThreeWay),
            backdated: take(StageKind::Backdated),
            fx: take(StageKind::Fx),
        }
    }

    /// Evaluate every set and build decisions, preserving input order.
    pub fn decide_all(
        &self,
        run_id: &RunId,
        evaluation_seq: u32,
        sets: &[CandidateSet],
        evaluated_at: DateTime<Utc>,
    ) -> Result<Vec<MatchDecision>, WorkerPanic> {
        parallel_map(sets, self.config.workers, |set| {
            let verdicts = self.evaluate(set);
            build_decision(run_id, evaluation_seq, set, &verdicts, evaluated_at)
        })
    }
}

pub fn build_decision(
    run_id: &RunId,
    evaluation_seq: u32,
    set: &CandidateSet,
    verdicts: &StageVerdicts,
    evaluated_at: DateTime<Utc>,
) -> MatchDecision {
    let agg = aggregate(verdicts);
    let fuzzy_score = match &verdicts.fuzzy.trace {
        StageTrace::Fuzzy(t) => t.score,
        _ => None,
    };
    let backdated_gap_days = match &verdicts.backdated.trace {
        StageTrace::Backdated(t) => t.max_gap_days,
        _ => None,
    };
    let fx_detail = match &verdicts.fx.trace {
        StageTrace::Fx(t) => Some(t.detail.as_str().to_string()),
        _ => None,
    };
    let sources = set
        .candidates()
        .into_iter()
        .map(|c| SourcePresence {
            source: c.source,
            found: c.row.is_some(),
            error: c.error.clone(),
        })
        .collect();
    let stages = StageKind::ORDER
        .iter()
        .map(|&k| verdicts.get(k).trace.clone())
        .collect();
    MatchDecision {
        run_id: run_id.clone(),
        merchant_ref: set.merchant_ref.clone(),
        evaluation_seq,
        final_status: agg.status,
        reason_codes: agg.reason_codes,
        stage_results: agg.results,
        transaction_month: set.transaction_month(),
        fuzzy_score,
        backdated_gap_days,
        fx_detail,
        trace: MatchTrace { sources, stages },
        evaluated_at,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "stage panicked".to_string()
    }
}

fn pairs<'a>(
    present: &'a [(SourceType, &'a NormalizedTransaction)],
) -> impl Iterator<Item = (&'a (SourceType, &'a NormalizedTransaction), &'a (SourceType, &'a NormalizedTransaction))> {
    present
        .iter()
        .enumerate()
        .flat_map(move |(i, a)| present[i + 1..].iter().map(move |b| (a, b)))
}

// ── Shared checks ──────────────────────────────────────────────────

/// Gross, fee and net agree pairwise within `epsilon`.
pub fn amounts_consistent(rows: &[&NormalizedTransaction], epsilon: f64) -> bool {
    rows.iter().enumerate().all(|(i, a)| {
        rows[i + 1..].iter().all(|b| {
            within(a.gross_amount, b.gross_amount, epsilon)
                && within(a.processing_fee, b.processing_fee, epsilon)
                && within(a.net_payout, b.net_payout, epsilon)
        })
    })
}

/// At least two present sources, all with the same canonical hash.
fn hashes_agree(present: &[(SourceType, &NormalizedTransaction)]) -> bool {
    let mut hashes = present.iter().map(|(_, row)| row.canonical_hash());
    match hashes.next() {
        Some(first) if present.len() >= 2 => hashes.all(|h| h == first),
        _ => false,
    }
}

fn same_text(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Client id, client name, currency and bank country agree.
pub fn identity_consistent(rows: &[&NormalizedTransaction]) -> bool {
    rows.windows(2).all(|w| {
        same_text(&w[0].client_id, &w[1].client_id)
            && same_text(&w[0].client_name, &w[1].client_name)
            && same_text(&w[0].currency, &w[1].currency)
            && same_text(&w[0].bank_country, &w[1].bank_country)
    })
}

// ── Stage 1: exact hash ────────────────────────────────────────────

pub struct ExactHashStage;

impl MatchStage for ExactHashStage {
    fn kind(&self) -> StageKind {
        StageKind::ExactHash
    }

    fn evaluate(&self, set: &CandidateSet, _cfg: &MatchingConfig) -> StageVerdict {
        let full: Vec<(SourceType, String)> = set
            .present()
            .into_iter()
            .map(|(source, row)| (source, row.canonical_hash()))
            .collect();
        let passed = full.len() >= 2 && full.iter().all(|(_, h)| *h == full[0].1);
        let hashes = full
            .iter()
            .map(|(source, h)| SourceHash { source: *source, hash: h[..12].to_string() })
            .collect();
        StageVerdict {
            passed,
            trace: StageTrace::ExactHash(ExactHashTrace { compared_sources: full.len(), hashes }),
        }
    }
}

// ── Stage 2: fuzzy ─────────────────────────────────────────────────

pub struct FuzzyStage;

impl FuzzyStage {
    pub fn pair_score(a: &NormalizedTransaction, b: &NormalizedTransaction, cfg: &MatchingConfig) -> f64 {
        let w = &cfg.fuzzy_weights;
        let mut score = w.merchant_ref * jaro_winkler(a.merchant_ref.trim(), b.merchant_ref.trim());
        if amounts_consistent(&[a, b], cfg.amount_epsilon) {
            score += w.amounts;
        }
        if a.normalized_status() == b.normalized_status() {
            score += w.status;
        }
        score += w.client_id * jaro_winkler(a.client_id.trim(), b.client_id.trim());
        if same_text(&a.payment_method, &b.payment_method) {
            score += w.payment_method;
        }
        let total = w.total();
        if total <= 0.0 {
            return 0.0;
        }
        round4(score / total)
    }
}

impl MatchStage for FuzzyStage {
    fn kind(&self) -> StageKind {
        StageKind::Fuzzy
    }

    fn evaluate(&self, set: &CandidateSet, cfg: &MatchingConfig) -> StageVerdict {
        let present = set.present();
        let scored: Vec<PairScore> = pairs(&present)
            .map(|((ls, l), (rs, r))| PairScore {
                left: *ls,
                right: *rs,
                score: Self::pair_score(l, r, cfg),
            })
            .collect();
        // Rows that agree on the full hash key are a perfect match, whatever
        // the cosmetic fields say.
        let hash_agreement = hashes_agree(&present);
        let score = if hash_agreement {
            Some(1.0)
        } else {
            scored.iter().map(|p| p.score).reduce(f64::min)
        };
        let passed = score.is_some_and(|s| s >= cfg.fuzzy_threshold);
        StageVerdict {
            passed,
            trace: StageTrace::Fuzzy(FuzzyTrace {
                score,
                threshold: cfg.fuzzy_threshold,
                hash_agreement,
                pairs: scored,
            }),
        }
    }
}

// ── Stage 3: three-way ─────────────────────────────────────────────

pub struct ThreeWayStage;

impl MatchStage for ThreeWayStage {
    fn kind(&self) -> StageKind {
        StageKind::ThreeWay
    }

    fn evaluate(&self, set: &CandidateSet, cfg: &MatchingConfig) -> StageVerdict {
        let rows: Vec<&NormalizedTransaction> = set.present().into_iter().map(|(_, r)| r).collect();
        let missing = set.missing_sources();
        let comparable = rows.len() >= 2;
        let amount_check = comparable && amounts_consistent(&rows, cfg.amount_epsilon);
        let identity_check = comparable && identity_consistent(&rows);
        let passed = missing.is_empty() && amount_check && identity_check;
        StageVerdict {
            passed,
            trace: StageTrace::ThreeWay(ThreeWayTrace {
                present_sources: rows.len(),
                missing,
                amount_check,
                identity_check,
            }),
        }
    }
}

// ── Stage 4: backdated ─────────────────────────────────────────────

pub struct BackdatedStage;

impl MatchStage for BackdatedStage {
    fn kind(&self) -> StageKind {
        StageKind::Backdated
    }

    fn evaluate(&self, set: &CandidateSet, cfg: &MatchingConfig) -> StageVerdict {
        let present = set.present();
        let gaps: Vec<PairGap> = pairs(&present)
            .map(|((ls, l), (rs, r))| PairGap {
                left: *ls,
                right: *rs,
                transaction_days: (l.transaction_date - r.transaction_date).num_days().abs(),
                settlement_days: (l.settlement_date - r.settlement_date).num_days().abs(),
            })
            .collect();
        let max_gap_days = gaps
            .iter()
            .map(|g| g.transaction_days.max(g.settlement_days))
            .max();
        let passed = max_gap_days.map_or(true, |g| g <= cfg.backdate_window_days);
        StageVerdict {
            passed,
            trace: StageTrace::Backdated(BackdatedTrace {
                window_days: cfg.backdate_window_days,
                max_gap_days,
                pairs: gaps,
            }),
        }
    }
}

// ── Stage 5: FX ────────────────────────────────────────────────────

pub struct FxStage;

impl MatchStage for FxStage {
    fn kind(&self) -> StageKind {
        StageKind::Fx
    }

    fn evaluate(&self, set: &CandidateSet, cfg: &MatchingConfig) -> StageVerdict {
        let present = set.present();
        let needs_conversion = present
            .windows(2)
            .any(|w| !same_text(&w[0].1.currency, &w[1].1.currency));

        let currencies: Vec<SourceCurrency> = present
            .iter()
            .map(|(source, row)| SourceCurrency {
                source: *source,
                currency: row.currency.trim().to_ascii_uppercase(),
                fx_rate: row.fx_rate,
                converted_gross: match (needs_conversion, row.fx_rate) {
                    (true, Some(rate)) if rate > 0.0 => Some(round4(row.gross_amount * rate)),
                    _ => None,
                },
            })
            .collect();

        let detail = if !needs_conversion {
            FxDetail::NoConversionRequired
        } else if currencies.iter().any(|c| c.converted_gross.is_none()) {
            FxDetail::MissingRate
        } else {
            let converted: Vec<f64> = currencies.iter().filter_map(|c| c.converted_gross).collect();
            let base = converted[0];
            let tolerance = (base.abs() * cfg.fx_tolerance).max(cfg.amount_epsilon);
            if converted.iter().all(|&v| within(v, base, tolerance)) {
                FxDetail::ConvertedWithinTolerance
            } else {
                FxDetail::ConvertedAmountMismatch
            }
        };
        let passed = matches!(
            detail,
            FxDetail::NoConversionRequired | FxDetail::ConvertedWithinTolerance
        );
        StageVerdict { passed, trace: StageTrace::Fx(FxTrace { detail, currencies }) }
    }
}
