//! Synthetic three-source scenarios.
//!
//! RULE: Same (seed, refs, business date, fault rate) ⇒ byte-identical files.
//! Row values come from the Rows stream, fault placement from the Faults
//! stream, so raising the fault rate never changes the clean amounts.
//!
//! Faults model the ways real feeds drift apart:
//!   - AmountDrift:    ERP books a different net payout
//!   - LateSettlement: PSP reports the sale 6 days later
//!   - IdentityDrift:  ERP carries another client name
//!   - MissingSource:  one feed never saw the reference
//!   - EarlyBooking:   internal books 1 to 3 days early (inside the window)

use crate::engine::ReconEngine;
use crate::error::ReconResult;
use crate::rng::{ScenarioRng, ScenarioStream};
use crate::run::ReconRun;
use crate::transaction::{NormalizedTransaction, RawSourceFile, SourceType};
use crate::types::{round2, MerchantRef};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const CLIENTS: &[(&str, &str, &str)] = &[
    ("CL-1001", "Northwind Traders", "US"),
    ("CL-1002", "Blue Harbor Retail", "US"),
    ("CL-1003", "Kestrel Outfitters", "GB"),
    ("CL-1004", "Lumen Home Goods", "DE"),
    ("CL-1005", "Orchard Street Cafe", "US"),
];
const METHODS: &[&str] = &["card", "bank_transfer", "wallet"];
const BANKS: &[&str] = &["First Meridian Bank", "Harbor Trust", "Crown Settlement Bank"];
const FEE_RATE: f64 = 0.029;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fault", rename_all = "snake_case")]
pub enum Fault {
    AmountDrift,
    LateSettlement,
    IdentityDrift,
    MissingSource { source: SourceType },
    EarlyBooking { days: i64 },
}

impl Fault {
    /// Whether the matching engine should flag the reference.
    pub fn is_doubtful(&self) -> bool {
        !matches!(self, Fault::EarlyBooking { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub seed: u64,
    pub business_date: NaiveDate,
    pub rows: BTreeMap<SourceType, Vec<NormalizedTransaction>>,
    pub faults: BTreeMap<MerchantRef, Fault>,
    pub total_refs: usize,
}

impl Scenario {
    pub fn expected_doubtful(&self) -> Vec<&str> {
        self.faults
            .iter()
            .filter(|(_, f)| f.is_doubtful())
            .map(|(r, _)| r.as_str())
            .collect()
    }

    pub fn expected_good(&self) -> usize {
        self.total_refs - self.expected_doubtful().len()
    }

    /// One JSON file per source, named `<source>_<date>.json`.
    pub fn files(&self) -> ReconResult<Vec<(SourceType, RawSourceFile)>> {
        SourceType::ALL
            .iter()
            .map(|s| {
                let rows = self.rows.get(s).map(Vec::as_slice).unwrap_or(&[]);
                let name = format!("{s}_{}.json", self.business_date.format("%Y%m%d"));
                Ok((*s, RawSourceFile::new(name, serde_json::to_vec_pretty(rows)?)))
            })
            .collect()
    }

    /// Create a run for the scenario, attach all three files, queue and execute it.
    pub fn run_through(&self, engine: &ReconEngine, actor: &str) -> ReconResult<ReconRun> {
        let run = engine.create_run(actor, self.business_date)?;
        for (source, file) in self.files()? {
            engine.attach_source(&run.id, source, file, actor)?;
        }
        engine.queue_run(&run.id, actor)?;
        engine.execute_run(&run.id, actor)
    }
}

pub struct ScenarioBuilder {
    seed: u64,
    refs: usize,
    business_date: NaiveDate,
    fault_rate: f64,
    prefix: String,
    forced: BTreeMap<usize, Fault>,
}

impl ScenarioBuilder {
    pub fn new(seed: u64, business_date: NaiveDate) -> Self {
        Self {
            seed,
            refs: 10,
            business_date,
            fault_rate: 0.0,
            prefix: format!("SEED{seed}-REF"),
            forced: BTreeMap::new(),
        }
    }

    pub fn refs(mut self, refs: usize) -> Self {
        self.refs = refs;
        self
    }

    pub fn fault_rate(mut self, rate: f64) -> Self {
        self.fault_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Pin a fault on the 1-based reference number `n`.
    pub fn fault(mut self, n: usize, fault: Fault) -> Self {
        self.forced.insert(n, fault);
        self
    }

    fn random_fault(rng: &mut ScenarioRng) -> Fault {
        match rng.next_u64_below(5) {
            0 => Fault::AmountDrift,
            1 => Fault::LateSettlement,
            2 => Fault::IdentityDrift,
            3 => Fault::MissingSource {
                source: SourceType::ALL[rng.next_u64_below(3) as usize],
            },
            _ => Fault::EarlyBooking { days: 1 + rng.next_u64_below(3) as i64 },
        }
    }

    fn base_row(&self, rng: &mut ScenarioRng, merchant_ref: &str) -> NormalizedTransaction {
        let (client_id, client_name, country) = *rng.pick(CLIENTS).unwrap_or(&CLIENTS[0]);
        let gross = rng.amount(25.0, 2_500.0);
        let fee = round2(gross * FEE_RATE);
        let transaction_date = self.business_date - Duration::days(1 + rng.next_u64_below(2) as i64);
        NormalizedTransaction {
            psp_txn_id: format!("PSP-{merchant_ref}"),
            merchant_ref: merchant_ref.to_string(),
            gross_amount: gross,
            currency: "USD".to_string(),
            processing_fee: fee,
            net_payout: round2(gross - fee),
            transaction_date,
            settlement_date: transaction_date + Duration::days(2),
            client_id: client_id.to_string(),
            client_name: client_name.to_string(),
            description: format!("Order {merchant_ref}"),
            status: String::new(),
            payment_method: rng.pick(METHODS).copied().unwrap_or("card").to_string(),
            settlement_bank: rng.pick(BANKS).copied().unwrap_or(BANKS[0]).to_string(),
            bank_country: country.to_string(),
            fx_rate: None,
        }
    }

    pub fn build(self) -> Scenario {
        let mut rows_rng = ScenarioRng::new(self.seed, ScenarioStream::Rows);
        let mut fault_rng = ScenarioRng::new(self.seed, ScenarioStream::Faults);
        let mut rows: BTreeMap<SourceType, Vec<NormalizedTransaction>> =
            SourceType::ALL.iter().map(|s| (*s, Vec::new())).collect();
        let mut faults = BTreeMap::new();

        for n in 1..=self.refs {
            let merchant_ref = format!("{}-{n:03}", self.prefix);
            let base = self.base_row(&mut rows_rng, &merchant_ref);
            // Always roll both so forcing one fault leaves the rest of the stream intact.
            let hit = fault_rng.chance(self.fault_rate);
            let rolled = Self::random_fault(&mut fault_rng);
            let fault = self.forced.get(&n).copied().or(hit.then_some(rolled));

            for source in SourceType::ALL {
                let mut row = base.clone();
                row.status = match source {
                    SourceType::Internal => "success",
                    SourceType::Erp => "settled",
                    SourceType::Psp => "captured",
                }
                .to_string();
                match (fault, source) {
                    (Some(Fault::MissingSource { source: s }), _) if s == source => continue,
                    (Some(Fault::AmountDrift), SourceType::Erp) => {
                        row.net_payout = round2(row.net_payout + 7.35);
                    }
                    (Some(Fault::LateSettlement), SourceType::Psp) => {
                        row.transaction_date += Duration::days(6);
                        row.settlement_date += Duration::days(6);
                    }
                    (Some(Fault::IdentityDrift), SourceType::Erp) => {
                        row.client_name = format!("{} Holdings", row.client_name);
                    }
                    (Some(Fault::EarlyBooking { days }), SourceType::Internal) => {
                        row.transaction_date -= Duration::days(days);
                    }
                    _ => {}
                }
                if let Some(v) = rows.get_mut(&source) {
                    v.push(row);
                }
            }
            if let Some(f) = fault {
                faults.insert(merchant_ref, f);
            }
        }

        Scenario {
            seed: self.seed,
            business_date: self.business_date,
            rows,
            faults,
            total_refs: self.refs,
        }
    }
}

/// The reference ten-row day: REF-001 drifts on amount, REF-010 is booked
/// six days late by the PSP, REF-006..008 are booked early by internal but
/// stay within the backdate window.
pub fn scenario3(business_date: NaiveDate) -> Scenario {
    ScenarioBuilder::new(3, business_date)
        .prefix("SCENARIO3-REF")
        .refs(10)
        .fault(1, Fault::AmountDrift)
        .fault(6, Fault::EarlyBooking { days: 1 })
        .fault(7, Fault::EarlyBooking { days: 2 })
        .fault(8, Fault::EarlyBooking { days: 3 })
        .fault(10, Fault::LateSettlement)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 16).unwrap()
    }

    #[test]
    fn same_seed_same_files() {
        let a = ScenarioBuilder::new(7, day()).refs(25).fault_rate(0.3).build();
        let b = ScenarioBuilder::new(7, day()).refs(25).fault_rate(0.3).build();
        let fa: Vec<_> = a.files().unwrap().into_iter().map(|(_, f)| f.bytes).collect();
        let fb: Vec<_> = b.files().unwrap().into_iter().map(|(_, f)| f.bytes).collect();
        assert_eq!(fa, fb);
        assert_eq!(a.faults, b.faults);
    }

    #[test]
    fn scenario3_layout() {
        let s = scenario3(day());
        assert_eq!(s.total_refs, 10);
        assert_eq!(s.expected_doubtful(), vec!["SCENARIO3-REF-001", "SCENARIO3-REF-010"]);
        assert_eq!(s.expected_good(), 8);
        for rows in s.rows.values() {
            assert_eq!(rows.len(), 10);
        }
        let internal = &s.rows[&SourceType::Internal];
        let psp = &s.rows[&SourceType::Psp];
        assert_eq!((psp[7].transaction_date - internal[7].transaction_date).num_days(), 3);
    }

    #[test]
    fn missing_source_drops_the_row() {
        let s = ScenarioBuilder::new(1, day())
            .refs(3)
            .fault(2, Fault::MissingSource { source: SourceType::Psp })
            .build();
        assert_eq!(s.rows[&SourceType::Psp].len(), 2);
        assert_eq!(s.rows[&SourceType::Erp].len(), 3);
    }

    #[test]
    fn zero_fault_rate_is_clean() {
        let s = ScenarioBuilder::new(99, day()).refs(40).build();
        assert!(s.faults.is_empty());
        assert_eq!(s.expected_good(), 40);
    }
}
