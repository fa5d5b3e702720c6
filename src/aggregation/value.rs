//! Value extraction
//!
//! Maps a raw record to its numeric contribution. Score-like kinds parse
//! the record's value; count-like kinds contribute 1 per record.

use serde_json::Value;

use crate::types::{RawRecord, RecordKind, ValueRule};

/// Result of extracting a record's value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractedValue {
    /// Numeric contribution to `sum`, `None` if unparseable
    pub value: Option<f64>,

    /// Whether the value counts toward the `avg` denominator
    pub is_valid: bool,
}

impl ExtractedValue {
    fn valid(value: f64) -> Self {
        Self {
            value: Some(value),
            is_valid: true,
        }
    }

    fn invalid() -> Self {
        Self {
            value: None,
            is_valid: false,
        }
    }
}

/// Extract the numeric contribution of `record` for `kind`
pub fn extract(kind: RecordKind, record: &RawRecord) -> ExtractedValue {
    match kind.value_rule() {
        ValueRule::Count => ExtractedValue::valid(1.0),
        ValueRule::Score => match record.value.as_ref() {
            Some(value) => extract_json(value),
            None => ExtractedValue::invalid(),
        },
    }
}

fn extract_json(value: &Value) -> ExtractedValue {
    match value {
        Value::Number(n) => n
            .as_f64()
            .filter(|v| v.is_finite())
            .map(ExtractedValue::valid)
            .unwrap_or_else(ExtractedValue::invalid),
        Value::Bool(b) => ExtractedValue::valid(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => match parse_score(s) {
            Some(v) => ExtractedValue::valid(v),
            None => ExtractedValue::invalid(),
        },
        _ => ExtractedValue::invalid(),
    }
}

/// Parse a score string
///
/// `yes`/`no` (any case) map to 1/0, `85%` maps to 0.85, anything else is
/// parsed as a float.
pub fn parse_score(raw: &str) -> Option<f64> {
    let s = raw.trim();
    if s.eq_ignore_ascii_case("yes") {
        return Some(1.0);
    }
    if s.eq_ignore_ascii_case("no") {
        return Some(0.0);
    }
    if let Some(prefix) = s.strip_suffix('%') {
        return parse_leading_float(prefix).map(|v| v / 100.0);
    }
    parse_leading_float(s)
}

/// Parse the longest numeric prefix of `s`
///
/// Accepts trailing garbage the way lenient float parsers do, so `"0.75 (high)"`
/// still yields 0.75.
fn parse_leading_float(s: &str) -> Option<f64> {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;

    while end < bytes.len() {
        let c = bytes[end];
        match c {
            b'0'..=b'9' => seen_digit = true,
            b'+' | b'-' => {
                let at_start = end == 0;
                let after_exp = end > 0 && matches!(bytes[end - 1], b'e' | b'E');
                if !at_start && !after_exp {
                    break;
                }
            }
            b'.' if !seen_dot && !seen_exp => seen_dot = true,
            b'e' | b'E' if seen_digit && !seen_exp => seen_exp = true,
            _ => break,
        }
        end += 1;
    }

    // Back off a dangling exponent marker or sign ("1e", "1e-")
    while end > 0 && matches!(bytes[end - 1], b'e' | b'E' | b'+' | b'-') {
        end -= 1;
    }

    if !seen_digit {
        return None;
    }
    s[..end].parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(value: impl Into<Value>) -> RawRecord {
        RawRecord::new("r", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()).with_value(value)
    }

    #[test]
    fn test_yes_no_case_insensitive() {
        assert_eq!(parse_score("Yes"), Some(1.0));
        assert_eq!(parse_score("YES"), Some(1.0));
        assert_eq!(parse_score("no"), Some(0.0));
        assert_eq!(parse_score(" No "), Some(0.0));
    }

    #[test]
    fn test_percent_and_float() {
        assert_eq!(parse_score("85%"), Some(0.85));
        assert_eq!(parse_score("0.75"), Some(0.75));
        assert_eq!(parse_score("3"), Some(3.0));
        assert_eq!(parse_score("-2.5e1"), Some(-25.0));
        assert_eq!(parse_score("0.75 (high)"), Some(0.75));
    }

    #[test]
    fn test_unparseable() {
        assert_eq!(parse_score("invalid"), None);
        assert_eq!(parse_score(""), None);
        assert_eq!(parse_score("%"), None);
        assert_eq!(parse_score("."), None);
    }

    #[test]
    fn test_score_kind_extraction() {
        let kind = RecordKind::ScoreResults;
        assert_eq!(extract(kind, &record("Yes")).value, Some(1.0));
        assert_eq!(extract(kind, &record(0.5)).value, Some(0.5));
        assert_eq!(extract(kind, &record(true)).value, Some(1.0));

        let invalid = extract(kind, &record("maybe"));
        assert!(!invalid.is_valid);
        assert_eq!(invalid.value, None);

        let missing = RawRecord::new("r", Utc::now());
        assert!(!extract(kind, &missing).is_valid);
    }

    #[test]
    fn test_count_kind_ignores_value() {
        let extracted = extract(RecordKind::Items, &record("invalid"));
        assert_eq!(extracted, ExtractedValue::valid(1.0));
    }
}
