//! Source notification routing.
//!
//! Each doubtful reference is routed to the parties that can fix it:
//! a missing source goes to that source's owner, and mismatches with every
//! source present go to the internal backoffice. Anything else lands with
//! reconciliation ops.

use crate::decision::ReasonCode;
use crate::types::MerchantRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    PspProvider,
    InternalBackoffice,
    CashierErp,
    ReconciliationOps,
}

impl Recipient {
    pub fn key(&self) -> &'static str {
        match self {
            Self::PspProvider => "psp_provider",
            Self::InternalBackoffice => "internal_backoffice",
            Self::CashierErp => "cashier_erp",
            Self::ReconciliationOps => "reconciliation_ops",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::PspProvider => "PSP Provider",
            Self::InternalBackoffice => "Internal Backoffice",
            Self::CashierErp => "Cashier (ERP)",
            Self::ReconciliationOps => "Reconciliation Ops",
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::PspProvider => "Missing or inconsistent PSP statement entry.",
            Self::InternalBackoffice => "Missing or inconsistent internal backoffice record.",
            Self::CashierErp => "Missing or inconsistent cashier/ERP posting.",
            Self::ReconciliationOps => "Manual reconciliation review required.",
        }
    }
}

/// Routing table, one arm per reason code.
pub fn recipients_for(code: ReasonCode) -> &'static [Recipient] {
    use ReasonCode::*;
    match code {
        MissingPsp => &[Recipient::PspProvider],
        MissingInternal => &[Recipient::InternalBackoffice],
        MissingErp => &[Recipient::CashierErp],
        ThreeWayFail | AmountMismatch | IdentityMismatch => &[Recipient::InternalBackoffice],
        ExactHashMismatch | FuzzyThresholdNotMet | BackdatedGapExceeded | FxInsufficient
        | FxConversionMismatch | InternalError => &[Recipient::ReconciliationOps],
    }
}

/// Recipients for one doubtful reference, sorted and deduplicated.
///
/// When a source is missing, only its owner is told; the three-way codes
/// that ride along are a consequence, not a second problem.
pub fn derive_recipients(codes: &[ReasonCode]) -> Vec<Recipient> {
    let has_missing = codes.iter().any(|c| c.missing_source().is_some());
    let mut out: Vec<Recipient> = if has_missing {
        codes
            .iter()
            .filter(|c| c.missing_source().is_some())
            .flat_map(|&c| recipients_for(c).iter().copied())
            .collect()
    } else {
        let mismatch = codes.iter().any(|c| {
            matches!(c, ReasonCode::ThreeWayFail | ReasonCode::AmountMismatch | ReasonCode::IdentityMismatch)
        });
        codes
            .iter()
            // Exact and fuzzy misses are symptoms of the mismatch, not a separate route.
            .filter(|c| {
                !(mismatch && matches!(c, ReasonCode::ExactHashMismatch | ReasonCode::FuzzyThresholdNotMet))
            })
            .flat_map(|&c| recipients_for(c).iter().copied())
            .collect()
    };
    if out.is_empty() {
        out.push(Recipient::ReconciliationOps);
    }
    out.sort();
    out.dedup();
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientTarget {
    pub recipient: Recipient,
    pub label: String,
    pub reason: String,
    pub count: usize,
    pub merchant_refs: Vec<MerchantRef>,
}

/// Group routed references per recipient; busiest recipient first.
pub fn group_targets<'a, I>(routed: I) -> Vec<RecipientTarget>
where
    I: IntoIterator<Item = (&'a MerchantRef, &'a [Recipient])>,
{
    let mut grouped: BTreeMap<Recipient, Vec<MerchantRef>> = BTreeMap::new();
    for (merchant_ref, recipients) in routed {
        for &r in recipients {
            let refs = grouped.entry(r).or_default();
            if !refs.contains(merchant_ref) {
                refs.push(merchant_ref.clone());
            }
        }
    }
    let mut targets: Vec<RecipientTarget> = grouped
        .into_iter()
        .map(|(recipient, mut merchant_refs)| {
            merchant_refs.sort();
            RecipientTarget {
                recipient,
                label: recipient.label().to_string(),
                reason: recipient.reason().to_string(),
                count: merchant_refs.len(),
                merchant_refs,
            }
        })
        .collect();
    targets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.recipient.cmp(&b.recipient)));
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReasonCode::*;

    #[test]
    fn missing_sources_route_to_owners_only() {
        assert_eq!(derive_recipients(&[MissingPsp, ThreeWayFail]), vec![Recipient::PspProvider]);
        assert_eq!(
            derive_recipients(&[MissingInternal, MissingErp, ThreeWayFail]),
            vec![Recipient::InternalBackoffice, Recipient::CashierErp]
        );
    }

    #[test]
    fn mismatches_with_all_sources_go_to_backoffice() {
        assert_eq!(
            derive_recipients(&[ExactHashMismatch, FuzzyThresholdNotMet, ThreeWayFail, AmountMismatch]),
            vec![Recipient::InternalBackoffice]
        );
    }

    #[test]
    fn everything_else_goes_to_ops() {
        assert_eq!(
            derive_recipients(&[ExactHashMismatch, BackdatedGapExceeded]),
            vec![Recipient::ReconciliationOps]
        );
        assert_eq!(derive_recipients(&[]), vec![Recipient::ReconciliationOps]);
    }

    #[test]
    fn targets_are_grouped_and_counted() {
        let a = "REF-A".to_string();
        let b = "REF-B".to_string();
        let psp = [Recipient::PspProvider];
        let both = [Recipient::PspProvider, Recipient::ReconciliationOps];
        let targets = group_targets(vec![(&a, &psp[..]), (&b, &both[..])]);
        assert_eq!(targets[0].recipient, Recipient::PspProvider);
        assert_eq!(targets[0].count, 2);
        assert_eq!(targets[0].label, "PSP Provider");
        assert_eq!(targets[1].merchant_refs, vec!["REF-B".to_string()]);
    }
}
