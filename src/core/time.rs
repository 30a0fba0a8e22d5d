//! Shared timestamp helpers for chain entries, citations and lenient expiry.

use chrono::{DateTime, Utc};

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Parses an RFC3339 timestamp, falling back to the current instant on empty
/// or invalid input.
pub fn parse_time_or_now(raw: &str) -> DateTime<Utc> {
    let raw = raw.trim();
    if raw.is_empty() {
        return now_utc();
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| now_utc())
}

/// Returns `chain-<unix seconds>`.
pub fn generate_chain_id() -> String {
    format!("chain-{}", now_utc().timestamp())
}

/// Human-readable day count used in expiry warnings.
pub fn format_days(days: i64) -> String {
    match days {
        0 => "today".to_string(),
        1 => "1 day".to_string(),
        n => format!("{} days", n),
    }
}

/// Fractional days from `now` until `target`; negative once `target` has passed.
pub fn days_until(target: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (target - now).num_seconds() as f64 / 86_400.0
}
