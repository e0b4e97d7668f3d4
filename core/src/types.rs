//! Shared primitive types used across the reconciliation core.

use chrono::{DateTime, NaiveDate, Utc};

/// The canonical run identifier (uuid v4 string).
pub type RunId = String;

/// Identifier of an exception case.
pub type ExceptionId = String;

/// The join key shared by all three sources.
pub type MerchantRef = String;

/// Calendar month key, formatted `YYYY-MM`.
pub type MonthKey = String;

/// Month key used when a transaction carries no usable date.
pub const UNKNOWN_MONTH: &str = "unknown";

/// Tolerance applied on top of configured epsilons to absorb float noise.
pub const FLOAT_SLACK: f64 = 1e-9;

pub fn month_key(date: NaiveDate) -> MonthKey {
    date.format("%Y-%m").to_string()
}

/// Parse a `YYYY-MM` key. Returns None for anything else, including `unknown`.
pub fn parse_month_key(key: &str) -> Option<(i32, u32)> {
    let (y, m) = key.split_once('-')?;
    if y.len() != 4 || m.len() != 2 {
        return None;
    }
    let year: i32 = y.parse().ok()?;
    let month: u32 = m.parse().ok()?;
    (1..=12).contains(&month).then_some((year, month))
}

/// Round a money amount to cents.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

pub fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

pub fn within(a: f64, b: f64, epsilon: f64) -> bool {
    (a - b).abs() <= epsilon + FLOAT_SLACK
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Human-facing run number, e.g. `RUN-1A2B3C4D`.
pub fn new_run_number() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("RUN-{}", id[..8].to_uppercase())
}

pub fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

pub fn parse_date(s: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
}
