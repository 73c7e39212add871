//! Best-effort decoders for model replies.
//!
//! Replies are untrusted free text. Every decoder here has a defined
//! "nothing found" result instead of an error.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::issue::{extract_location, infer_severity, Issue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed,
}

fn marker_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]*\[([A-Z]+)_(PASSED|FAILED)\]").ok())
        .as_ref()
}

/// First `[<PREFIX>_PASSED]` / `[<PREFIX>_FAILED]` marker at the start of a line.
pub fn marker_verdict(text: &str, prefix: &str) -> Option<Verdict> {
    marker_re()?
        .captures_iter(text)
        .find(|c| &c[1] == prefix)
        .map(|c| match &c[2] {
            "PASSED" => Verdict::Passed,
            _ => Verdict::Failed,
        })
}

/// Parse the span from the first `{` to the last `}` as JSON.
///
/// Prose and code fences around the object are ignored. Returns `None` when
/// there is no such span or it does not parse.
pub fn extract_json_block(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let block = &text[start..=end];
    match serde_json::from_str::<Value>(block) {
        Ok(v) if v.is_object() => Some(v),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, len = block.len(), "model reply contained an unparseable JSON block");
            None
        }
    }
}

fn numbered_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]*\d+[.)][ \t]+(.+?)[ \t]*$").ok())
        .as_ref()
}

/// Text of every `1. ...` / `2) ...` list line, in order.
pub fn numbered_items(text: &str) -> Vec<String> {
    let Some(re) = numbered_re() else {
        return Vec::new();
    };
    re.captures_iter(text)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Strip a leading `[tag]` or `(tag)` and an optional separator from a list item.
pub fn strip_leading_tag(item: &str) -> &str {
    let trimmed = item.trim_start();
    let close = match trimmed.chars().next() {
        Some('[') => ']',
        Some('(') => ')',
        _ => return trimmed,
    };
    match trimmed.find(close) {
        Some(i) => trimmed[i + 1..]
            .trim_start()
            .trim_start_matches(|c| c == ':' || c == '-')
            .trim_start(),
        None => trimmed,
    }
}

/// Build an [`Issue`] from one free-text list item.
pub fn issue_from_item(item: &str, category: &str) -> Issue {
    Issue::new(
        strip_leading_tag(item),
        extract_location(item),
        Some(category.to_string()),
        infer_severity(item),
    )
}

pub fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    let lower = haystack.to_lowercase();
    needles.iter().any(|n| lower.contains(n))
}

/// Truncate to at most `max` characters.
pub fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

pub fn string_field<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| v.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// `deserialize_with` adapters for model-written JSON, where numbers often
/// arrive quoted and scalars show up where strings were asked for. None of
/// them fail; unusable values become the field's empty value.
pub mod lenient {
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    fn text(v: Value) -> Option<String> {
        match v {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(text(Value::deserialize(d)?).unwrap_or_default())
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(text(Value::deserialize(d)?).filter(|s| !s.trim().is_empty()))
    }

    /// Numbers, or strings like `"85"` / `"85%"`.
    pub fn opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
            _ => None,
        })
    }

    /// A list of strings; a bare string is a one-element list, objects are kept as JSON text.
    pub fn strings<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        let items = match Value::deserialize(d)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        Ok(items
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(_) => Some(v.to_string()),
                other => text(other),
            })
            .collect())
    }

    /// A list of `T`, skipping entries that do not decode.
    pub fn items<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        let Value::Array(items) = Value::deserialize(d)? else {
            return Ok(Vec::new());
        };
        Ok(items
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_must_start_a_line() {
        assert_eq!(
            marker_verdict("[REVIEW_PASSED]\nall good", "REVIEW"),
            Some(Verdict::Passed)
        );
        assert_eq!(
            marker_verdict("intro\n  [REVIEW_FAILED] nope", "REVIEW"),
            Some(Verdict::Failed)
        );
        assert_eq!(marker_verdict("I would say [REVIEW_PASSED]", "REVIEW"), None);
    }

    #[test]
    fn marker_prefix_is_matched() {
        let text = "[TEST_FAILED]\n[SECURITY_PASSED]";
        assert_eq!(marker_verdict(text, "SECURITY"), Some(Verdict::Passed));
        assert_eq!(marker_verdict(text, "PERFORMANCE"), None);
    }

    #[test]
    fn json_block_with_prose_and_fences() {
        let text = "Here you go:\n```json\n{\"a\": {\"b\": 1}}\n```\nThanks.";
        let v = extract_json_block(text).unwrap();
        assert_eq!(v["a"]["b"], 1);
    }

    #[test]
    fn json_block_missing_or_broken() {
        assert!(extract_json_block("no json here").is_none());
        assert!(extract_json_block("} backwards {").is_none());
        assert!(extract_json_block("{not: valid}").is_none());
    }

    #[test]
    fn numbered_items_both_styles() {
        let text = "Issues:\n1. first thing\n  2) second thing  \nnot numbered\n10. tenth";
        assert_eq!(
            numbered_items(text),
            vec!["first thing", "second thing", "tenth"]
        );
    }

    #[test]
    fn strip_tag_variants() {
        assert_eq!(strip_leading_tag("[high] src/a.rs - bad"), "src/a.rs - bad");
        assert_eq!(strip_leading_tag("(low): nit"), "nit");
        assert_eq!(strip_leading_tag("plain"), "plain");
        assert_eq!(strip_leading_tag("[unclosed"), "[unclosed");
    }
}
