//! Canonical transaction rows and the per-reference candidate sets the
//! matching engine consumes.
//!
//! Raw file parsing is an external collaborator behind `SourceParser`.
//! The core only ever sees `NormalizedTransaction` rows.

use crate::types::{month_key, MerchantRef, MonthKey, UNKNOWN_MONTH};
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Internal,
    Erp,
    Psp,
}

impl SourceType {
    /// Fixed evaluation order. The first present source also decides the
    /// transaction month.
    pub const ALL: [SourceType; 3] = [SourceType::Internal, SourceType::Erp, SourceType::Psp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::Erp => "erp",
            Self::Psp => "psp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "internal" => Some(Self::Internal),
            "erp" => Some(Self::Erp),
            "psp" => Some(Self::Psp),
            _ => None,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTransaction {
    pub psp_txn_id: String,
    pub merchant_ref: MerchantRef,
    pub gross_amount: f64,
    pub currency: String,
    pub processing_fee: f64,
    pub net_payout: f64,
    pub transaction_date: NaiveDate,
    pub settlement_date: NaiveDate,
    pub client_id: String,
    pub client_name: String,
    #[serde(default)]
    pub description: String,
    pub status: String,
    pub payment_method: String,
    #[serde(default)]
    pub settlement_bank: String,
    #[serde(default)]
    pub bank_country: String,
    #[serde(default)]
    pub fx_rate: Option<f64>,
}

impl NormalizedTransaction {
    /// Source systems disagree on success vocabulary; fold it to one form.
    pub fn normalized_status(&self) -> String {
        let s = self.status.trim().to_ascii_uppercase();
        match s.as_str() {
            "CAPTURED" | "CONFIRMED" | "SETTLED" | "SUCCESS" | "SUCCEEDED" | "PAID" => {
                "SUCCESS".to_string()
            }
            _ => s,
        }
    }

    /// The pipe-joined canonical key the exact-hash stage digests.
    pub fn canonical_key(&self) -> String {
        format!(
            "{}|{:.2}|{}|{:.2}|{:.2}|{}|{}",
            self.merchant_ref.trim(),
            self.gross_amount,
            self.currency.trim().to_ascii_uppercase(),
            self.processing_fee,
            self.net_payout,
            self.transaction_date.format("%Y-%m-%d"),
            self.client_id.trim(),
        )
    }

    pub fn canonical_hash(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_key().as_bytes()))
    }
}

// ── Source lookup outcomes ─────────────────────────────────────────

/// Why a source contributed no row for a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    FileNotUploaded,
    MerchantRefNotFound,
    FileParseFailed(String),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileNotUploaded => f.write_str("file_not_uploaded"),
            Self::MerchantRefNotFound => f.write_str("merchant_ref_not_found"),
            Self::FileParseFailed(detail) => write!(f, "file_parse_failed:{detail}"),
        }
    }
}

impl SourceError {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file_not_uploaded" => Some(Self::FileNotUploaded),
            "merchant_ref_not_found" => Some(Self::MerchantRefNotFound),
            other => other
                .strip_prefix("file_parse_failed:")
                .map(|d| Self::FileParseFailed(d.to_string())),
        }
    }
}

impl Serialize for SourceError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SourceError {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        SourceError::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown source error '{raw}'")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCandidate {
    pub source: SourceType,
    pub row: Option<NormalizedTransaction>,
    pub error: Option<SourceError>,
}

impl SourceCandidate {
    pub fn found(source: SourceType, row: NormalizedTransaction) -> Self {
        Self { source, row: Some(row), error: None }
    }

    pub fn missing(source: SourceType, error: SourceError) -> Self {
        Self { source, row: None, error: Some(error) }
    }
}

/// Everything the three sources say about one merchant reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSet {
    pub merchant_ref: MerchantRef,
    pub internal: SourceCandidate,
    pub erp: SourceCandidate,
    pub psp: SourceCandidate,
}

impl CandidateSet {
    pub fn candidates(&self) -> [&SourceCandidate; 3] {
        [&self.internal, &self.erp, &self.psp]
    }

    pub fn candidate(&self, source: SourceType) -> &SourceCandidate {
        match source {
            SourceType::Internal => &self.internal,
            SourceType::Erp => &self.erp,
            SourceType::Psp => &self.psp,
        }
    }

    /// Present rows in fixed source order.
    pub fn present(&self) -> Vec<(SourceType, &NormalizedTransaction)> {
        self.candidates()
            .into_iter()
            .filter_map(|c| c.row.as_ref().map(|r| (c.source, r)))
            .collect()
    }

    pub fn missing_sources(&self) -> Vec<SourceType> {
        self.candidates()
            .into_iter()
            .filter(|c| c.row.is_none())
            .map(|c| c.source)
            .collect()
    }

    /// Month of the first present source's transaction date.
    pub fn transaction_month(&self) -> MonthKey {
        self.present()
            .first()
            .map(|(_, row)| month_key(row.transaction_date))
            .unwrap_or_else(|| UNKNOWN_MONTH.to_string())
    }
}

// ── Source loads ───────────────────────────────────────────────────

/// What a run knows about one source file.
#[derive(Debug, Clone)]
pub enum SourceLoad {
    NotUploaded,
    ParseFailed(String),
    Parsed(Vec<NormalizedTransaction>),
}

/// Build one candidate set per merchant reference found in any source.
/// Refs are returned sorted; within a source a later duplicate row wins.
pub fn build_candidate_sets(loads: &BTreeMap<SourceType, SourceLoad>) -> Vec<CandidateSet> {
    let mut indexes: HashMap<SourceType, HashMap<&str, &NormalizedTransaction>> = HashMap::new();
    let mut refs: BTreeSet<&str> = BTreeSet::new();
    for (&source, load) in loads {
        if let SourceLoad::Parsed(rows) = load {
            let index = indexes.entry(source).or_default();
            for row in rows {
                if index.insert(row.merchant_ref.as_str(), row).is_some() {
                    log::debug!("duplicate merchant_ref {} in {source}; keeping last row", row.merchant_ref);
                }
                refs.insert(row.merchant_ref.as_str());
            }
        }
    }

    let lookup = |source: SourceType, merchant_ref: &str| -> SourceCandidate {
        match loads.get(&source) {
            None | Some(SourceLoad::NotUploaded) => {
                SourceCandidate::missing(source, SourceError::FileNotUploaded)
            }
            Some(SourceLoad::ParseFailed(detail)) => {
                SourceCandidate::missing(source, SourceError::FileParseFailed(detail.clone()))
            }
            Some(SourceLoad::Parsed(_)) => match indexes.get(&source).and_then(|i| i.get(merchant_ref)) {
                Some(row) => SourceCandidate::found(source, (*row).clone()),
                None => SourceCandidate::missing(source, SourceError::MerchantRefNotFound),
            },
        }
    };

    refs.into_iter()
        .map(|r| CandidateSet {
            merchant_ref: r.to_string(),
            internal: lookup(SourceType::Internal, r),
            erp: lookup(SourceType::Erp, r),
            psp: lookup(SourceType::Psp, r),
        })
        .collect()
}

/// Candidate set for a single reference, used by transaction snapshots.
pub fn candidate_set_for(loads: &BTreeMap<SourceType, SourceLoad>, merchant_ref: &str) -> CandidateSet {
    let narrowed: BTreeMap<SourceType, SourceLoad> = loads
        .iter()
        .map(|(&source, load)| {
            let load = match load {
                SourceLoad::Parsed(rows) => SourceLoad::Parsed(
                    rows.iter().filter(|r| r.merchant_ref == merchant_ref).cloned().collect(),
                ),
                other => other.clone(),
            };
            (source, load)
        })
        .collect();
    build_candidate_sets(&narrowed)
        .into_iter()
        .next()
        .unwrap_or_else(|| {
            let missing = |source| match narrowed.get(&source) {
                Some(SourceLoad::ParseFailed(d)) => {
                    SourceCandidate::missing(source, SourceError::FileParseFailed(d.clone()))
                }
                Some(SourceLoad::Parsed(_)) => SourceCandidate::missing(source, SourceError::MerchantRefNotFound),
                _ => SourceCandidate::missing(source, SourceError::FileNotUploaded),
            };
            CandidateSet {
                merchant_ref: merchant_ref.to_string(),
                internal: missing(SourceType::Internal),
                erp: missing(SourceType::Erp),
                psp: missing(SourceType::Psp),
            }
        })
}

// ── Raw files and the parser seam ──────────────────────────────────

#[derive(Debug, Clone)]
pub struct RawSourceFile {
    pub filename: String,
    /// Lower-cased file extension, e.g. `csv`, `json`.
    pub format: String,
    pub bytes: Vec<u8>,
}

impl RawSourceFile {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        let filename = filename.into();
        let format = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        Self { filename, format, bytes }
    }

    pub fn checksum(&self) -> String {
        hex::encode(Sha256::digest(&self.bytes))
    }
}

/// Turns an uploaded file into canonical rows. Errors carry a short reason
/// that ends up in the run's `format_failed_<source>:<reason>` stage.
pub trait SourceParser: Send + Sync {
    fn parse(&self, source: SourceType, file: &RawSourceFile) -> Result<Vec<NormalizedTransaction>, String>;
}

/// Reads files that are already a JSON array of canonical rows.
pub struct CanonicalJsonParser;

impl SourceParser for CanonicalJsonParser {
    fn parse(&self, _source: SourceType, file: &RawSourceFile) -> Result<Vec<NormalizedTransaction>, String> {
        if file.format != "json" {
            return Err(format!("unsupported_format_{}", if file.format.is_empty() { "none" } else { file.format.as_str() }));
        }
        serde_json::from_slice(&file.bytes).map_err(|e| format!("invalid_json: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(merchant_ref: &str) -> NormalizedTransaction {
        NormalizedTransaction {
            psp_txn_id: format!("PSP-{merchant_ref}"),
            merchant_ref: merchant_ref.into(),
            gross_amount: 100.0,
            currency: "USD".into(),
            processing_fee: 2.5,
            net_payout: 97.5,
            transaction_date: NaiveDate::from_ymd_opt(2026, 2, 10).unwrap(),
            settlement_date: NaiveDate::from_ymd_opt(2026, 2, 11).unwrap(),
            client_id: "C-1".into(),
            client_name: "Acme".into(),
            description: String::new(),
            status: "captured".into(),
            payment_method: "card".into(),
            settlement_bank: "First Bank".into(),
            bank_country: "US".into(),
            fx_rate: None,
        }
    }

    #[test]
    fn status_vocabulary_folds_to_success() {
        for s in ["captured", "Confirmed", " settled "] {
            let mut r = row("A");
            r.status = s.into();
            assert_eq!(r.normalized_status(), "SUCCESS");
        }
        let mut r = row("A");
        r.status = "refunded".into();
        assert_eq!(r.normalized_status(), "REFUNDED");
    }

    #[test]
    fn canonical_key_formats_amounts() {
        let r = row("REF-1");
        assert_eq!(r.canonical_key(), "REF-1|100.00|USD|2.50|97.50|2026-02-10|C-1");
        assert_eq!(r.canonical_hash().len(), 64);
    }

    #[test]
    fn candidate_sets_cover_union_of_refs() {
        let mut loads = BTreeMap::new();
        loads.insert(SourceType::Internal, SourceLoad::Parsed(vec![row("B"), row("A")]));
        loads.insert(SourceType::Erp, SourceLoad::Parsed(vec![row("A")]));
        loads.insert(SourceType::Psp, SourceLoad::ParseFailed("bad header".into()));
        let sets = build_candidate_sets(&loads);
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].merchant_ref, "A");
        assert_eq!(sets[1].erp.error, Some(SourceError::MerchantRefNotFound));
        assert_eq!(sets[1].psp.error, Some(SourceError::FileParseFailed("bad header".into())));
        assert_eq!(sets[1].missing_sources(), vec![SourceType::Erp, SourceType::Psp]);
        assert_eq!(sets[0].transaction_month(), "2026-02");
    }

    #[test]
    fn source_error_serializes_as_string() {
        let json = serde_json::to_string(&SourceError::FileParseFailed("x".into())).unwrap();
        assert_eq!(json, "\"file_parse_failed:x\"");
        let back: SourceError = serde_json::from_str("\"merchant_ref_not_found\"").unwrap();
        assert_eq!(back, SourceError::MerchantRefNotFound);
    }

    #[test]
    fn json_parser_rejects_other_formats() {
        let file = RawSourceFile::new("psp.CSV", b"a,b".to_vec());
        assert_eq!(file.format, "csv");
        let err = CanonicalJsonParser.parse(SourceType::Psp, &file).unwrap_err();
        assert_eq!(err, "unsupported_format_csv");
    }
}
