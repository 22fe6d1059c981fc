//! Response validation
//!
//! Checks a captured response against a testcase's expectations:
//! status equality, header matching (Content-Type by substring, others
//! exact), JSON subset matching, and trimmed-text equality.

use serde_json::Value;

use crate::http::CapturedResponse;
use crate::models::Expectation;

/// Validate a response against an expectation.
///
/// Returns the first mismatch as an error message; the message always
/// names the offending field so it is actionable in `last_error`.
pub fn validate(expect: &Expectation, response: &CapturedResponse) -> Result<(), String> {
    if response.status != expect.status {
        return Err(format!(
            "status: expected {}, got {}",
            expect.status, response.status
        ));
    }

    for (name, want) in &expect.headers {
        let got = response
            .header(name)
            .ok_or_else(|| format!("header \"{name}\": missing"))?;
        if !header_matches(name, want, got) {
            return Err(format!(
                "header \"{name}\": expected \"{want}\", got \"{got}\""
            ));
        }
    }

    if let Some(expected) = &expect.body {
        let actual: Value = serde_json::from_slice(&response.body)
            .map_err(|e| format!("body: invalid JSON ({e})"))?;
        if !json_subset(expected, &actual) {
            return Err(format!(
                "body: expected subset {expected}, got {actual}"
            ));
        }
    } else if let Some(expected) = &expect.text {
        let actual = response.text();
        if actual.trim() != expected.trim() {
            return Err(format!(
                "text: expected \"{}\", got \"{}\"",
                expected.trim(),
                actual.trim()
            ));
        }
    }

    Ok(())
}

/// `Content-Type` matches by substring so charset suffixes pass; all
/// other headers match exactly after trimming.
pub fn header_matches(name: &str, want: &str, got: &str) -> bool {
    if name.eq_ignore_ascii_case("content-type") {
        got.contains(want.trim())
    } else {
        got.trim() == want.trim()
    }
}

/// Recursive JSON subset: every key of an expected object must exist in
/// the actual object with a subset-matching value; arrays must have
/// equal length and pairwise-subset elements; primitives must be equal.
pub fn json_subset(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Object(e), Value::Object(a)) => e
            .iter()
            .all(|(k, ev)| a.get(k).map(|av| json_subset(ev, av)).unwrap_or(false)),
        (Value::Array(e), Value::Array(a)) => {
            e.len() == a.len() && e.iter().zip(a.iter()).all(|(ev, av)| json_subset(ev, av))
        }
        _ => expected == actual,
    }
}
