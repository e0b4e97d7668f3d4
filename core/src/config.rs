//! Runtime configuration, loaded from `data/recon_config.json`.
//!
//! Every tunable the matching engine, severity policy and review chain read
//! lives here. Tests use `ReconConfig::default_test()`.

use crate::decision::ReasonCode;
use crate::exception::Severity;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconConfig {
    pub matching: MatchingConfig,
    pub severity: SeverityPolicy,
    pub review: ReviewConfig,
}

// ── Matching ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Minimum pairwise fuzzy score for the fuzzy stage to pass.
    pub fuzzy_threshold: f64,
    pub fuzzy_weights: FuzzyWeights,
    /// Max allowed gap in days between any two sources' dates.
    pub backdate_window_days: i64,
    /// Absolute tolerance for amount comparisons.
    pub amount_epsilon: f64,
    /// Relative tolerance for converted amounts across currencies.
    pub fx_tolerance: f64,
    /// Worker threads used to evaluate merchant references.
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzyWeights {
    pub merchant_ref: f64,
    pub amounts: f64,
    pub status: f64,
    pub client_id: f64,
    pub payment_method: f64,
}

impl FuzzyWeights {
    pub fn total(&self) -> f64 {
        self.merchant_ref + self.amounts + self.status + self.client_id + self.payment_method
    }
}

// ── Severity ───────────────────────────────────────────────────────

/// Maps reason codes to a severity rank. A case takes the highest rank
/// among its codes; codes without a rule fall back to `default`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeverityPolicy {
    pub default: Severity,
    pub rules: Vec<SeverityRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeverityRule {
    pub reason: ReasonCode,
    pub severity: Severity,
}

impl SeverityPolicy {
    pub fn severity_of(&self, code: ReasonCode) -> Severity {
        self.rules
            .iter()
            .filter(|r| r.reason == code)
            .map(|r| r.severity)
            .max()
            .unwrap_or(self.default)
    }

    pub fn standard() -> Self {
        use ReasonCode::*;
        let high = [
            MissingInternal,
            MissingErp,
            MissingPsp,
            ThreeWayFail,
            AmountMismatch,
            IdentityMismatch,
            InternalError,
        ];
        let medium = [BackdatedGapExceeded, FxInsufficient, FxConversionMismatch];
        let rules = high
            .iter()
            .map(|&reason| SeverityRule { reason, severity: Severity::High })
            .chain(medium.iter().map(|&reason| SeverityRule { reason, severity: Severity::Medium }))
            .collect();
        Self { default: Severity::Low, rules }
    }
}

// ── Review chain ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Append an announcer step after the supervisor.
    pub include_announcer: bool,
    pub fallback: FallbackConfidence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfidence {
    pub intern: f64,
    pub manager: f64,
    pub supervisor: f64,
    pub announcer: f64,
}

impl ReconConfig {
    /// Load from the data/ directory.
    /// In tests, use ReconConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let path = format!("{data_dir}/recon_config.json");
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Cannot read {path}"))?;
        let cfg: ReconConfig = serde_json::from_str(&content)
            .with_context(|| format!("Cannot parse {path}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let m = &self.matching;
        if !(0.0..=1.0).contains(&m.fuzzy_threshold) {
            bail!("fuzzy_threshold must be within [0, 1], got {}", m.fuzzy_threshold);
        }
        if m.fuzzy_weights.total() <= 0.0 {
            bail!("fuzzy weights must sum to a positive value");
        }
        if m.backdate_window_days < 0 {
            bail!("backdate_window_days must be non-negative");
        }
        if m.amount_epsilon < 0.0 || m.fx_tolerance < 0.0 {
            bail!("tolerances must be non-negative");
        }
        if m.workers == 0 {
            bail!("workers must be at least 1");
        }
        let f = &self.review.fallback;
        for (name, c) in [
            ("intern", f.intern),
            ("manager", f.manager),
            ("supervisor", f.supervisor),
            ("announcer", f.announcer),
        ] {
            if !(0.0..=1.0).contains(&c) {
                bail!("fallback confidence for {name} must be within [0, 1], got {c}");
            }
        }
        Ok(())
    }

    pub fn default_test() -> Self {
        Self {
            matching: MatchingConfig {
                fuzzy_threshold: 0.9,
                fuzzy_weights: FuzzyWeights {
                    merchant_ref: 0.5,
                    amounts: 0.2,
                    status: 0.1,
                    client_id: 0.1,
                    payment_method: 0.1,
                },
                backdate_window_days: 3,
                amount_epsilon: 0.01,
                fx_tolerance: 0.005,
                workers: 4,
            },
            severity: SeverityPolicy::standard(),
            review: ReviewConfig {
                include_announcer: false,
                fallback: FallbackConfidence {
                    intern: 0.72,
                    manager: 0.78,
                    supervisor: 0.81,
                    announcer: 0.85,
                },
            },
        }
    }
}
