//! Lenient numeric parsing for upstream feed fields.

/// Placeholder strings that upstream feeds use for "no value".
const EMPTY_MARKERS: &[&str] = &["", "-", "--", "None", "null", "nan", "NaN"];

/// Parse a loosely formatted numeric field.
///
/// Returns `None` for placeholder markers, unparsable text and non-finite values.
pub fn parse_lenient_f64(s: &str) -> Option<f64> {
    let s = s.trim();
    if EMPTY_MARKERS.contains(&s) {
        return None;
    }
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Same as [`parse_lenient_f64`] for a JSON value that may be a number or a string.
pub fn json_lenient_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        serde_json::Value::String(s) => parse_lenient_f64(s),
        _ => None,
    }
}
