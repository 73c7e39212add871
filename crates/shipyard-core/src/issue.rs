use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Three-level severity used for every issue the engine reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Low,
    #[default]
    Medium,
    High,
}

impl IssueSeverity {
    /// Lenient parse; `critical` folds into high and `info` into low.
    pub fn from_label(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" | "high" | "blocker" | "major" => Self::High,
            "low" | "info" | "minor" | "trivial" | "nit" => Self::Low,
            _ => Self::Medium,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// A normalized finding produced by a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub hash: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub severity: IssueSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Issue {
    pub fn new(
        summary: impl Into<String>,
        location: Option<String>,
        category: Option<String>,
        severity: IssueSeverity,
    ) -> Self {
        let summary = summary.into();
        let location = location.filter(|l| !l.trim().is_empty());
        let category = category.filter(|c| !c.trim().is_empty());
        let hash = issue_hash(
            &summary,
            location.as_deref().unwrap_or(""),
            category.as_deref().unwrap_or(""),
        );
        Self {
            hash,
            summary,
            location,
            severity,
            category,
        }
    }
}

const HASH_SEPARATOR: char = '|';

/// Stable identity of an issue across runs.
///
/// Fields are trimmed and lowercased before hashing, so case and surrounding
/// whitespace never produce a new identity. The digest is a 32-bit rolling
/// hash rendered as lowercase hex; it only has to keep accidental duplicates
/// apart, not resist collisions.
pub fn issue_hash(summary: &str, location: &str, category: &str) -> String {
    let normalized = format!(
        "{}{sep}{}{sep}{}",
        summary.trim().to_lowercase(),
        location.trim().to_lowercase(),
        category.trim().to_lowercase(),
        sep = HASH_SEPARATOR,
    );
    let mut hash: u32 = 0;
    for c in normalized.chars() {
        hash = (hash << 5).wrapping_sub(hash).wrapping_add(c as u32);
    }
    format!("{hash:08x}")
}

/// Drop issues whose hash was already seen, keeping first occurrences in order.
pub fn dedupe_issues(issues: Vec<Issue>) -> Vec<Issue> {
    let mut seen = HashSet::new();
    issues
        .into_iter()
        .filter(|i| seen.insert(i.hash.clone()))
        .collect()
}

/// Guess a severity from free text when the model did not label one.
pub fn infer_severity(text: &str) -> IssueSeverity {
    let lower = text.to_lowercase();
    if let Some(tag) = severity_tag(&lower) {
        return IssueSeverity::from_label(&tag);
    }
    const HIGH: [&str; 7] = [
        "critical",
        "security",
        "vulnerab",
        "data loss",
        "crash",
        "panic",
        "injection",
    ];
    const LOW: [&str; 6] = ["minor", "nit", "style", "typo", "naming", "cosmetic"];
    if HIGH.iter().any(|k| lower.contains(k)) {
        IssueSeverity::High
    } else if LOW.iter().any(|k| lower.contains(k)) {
        IssueSeverity::Low
    } else {
        IssueSeverity::Medium
    }
}

fn severity_tag(lower: &str) -> Option<String> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"[\[(](critical|high|medium|low|info|minor|major)[\])]").ok())
        .as_ref()?;
    re.captures(lower).map(|c| c[1].to_string())
}

/// Pull a `path/to/file.ext` or `path/to/file.ext:42` reference out of free text.
pub fn extract_location(text: &str) -> Option<String> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"([A-Za-z0-9_./\-]+\.[A-Za-z0-9]{1,6}(?::\d+(?::\d+)?)?)").ok())
        .as_ref()?;
    re.captures_iter(text)
        .map(|c| c[1].to_string())
        .find(|m| m.contains('/') || m.contains(':'))
}

// ── Tests ──────────────────────────────────────────────────────────────────
