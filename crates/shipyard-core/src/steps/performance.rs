use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};
use tracing::info;

use super::parse::{contains_any, extract_json_block, marker_verdict, string_field, Verdict};
use super::StepContext;
use crate::issue::{dedupe_issues, infer_severity, Issue, IssueSeverity};
use crate::model::ModelExecutor;
use crate::types::{Feature, PerformanceConfig, PipelineStepResult, StepStatus};

const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    ("algorithms", &["loop", "complexity", "o(n", "nested", "sort", "algorithm"]),
    ("database", &["query", "n+1", "index", "sql", "database"]),
    ("memory", &["allocation", "leak", "clone", "memory", "buffer"]),
    ("network", &["request", "latency", "http", "api", "network"]),
    ("rendering", &["render", "dom", "repaint", "layout"]),
    ("io", &["file", "disk", "i/o", "fsync"]),
];

/// Category for a performance finding, by keyword. `fallback` is used when
/// nothing matches, then `"general"`.
pub fn categorize(text: &str, fallback: Option<&str>) -> String {
    let lower = text.to_lowercase();
    CATEGORY_KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
        .map(|(cat, _)| (*cat).to_string())
        .or_else(|| {
            fallback
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_lowercase)
        })
        .unwrap_or_else(|| "general".to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceReport {
    pub verdict: Option<Verdict>,
    /// `None` when the reply carried no JSON object.
    pub structured: Option<Value>,
    pub issues: Vec<Issue>,
}

pub struct PerformanceStep {
    executor: Arc<dyn ModelExecutor>,
}

impl PerformanceStep {
    pub fn new(executor: Arc<dyn ModelExecutor>) -> Self {
        Self { executor }
    }

    pub fn build_prompt(feature: &Feature, config: &PerformanceConfig) -> String {
        let focus = if config.focus_areas.is_empty() {
            "algorithmic complexity, database access patterns, memory usage, network calls, I/O"
                .to_string()
        } else {
            config.focus_areas.join(", ")
        };
        format!(
            "Analyze the performance of the changes made for this feature.\n\n\
             Feature: {}\n\n{}\n\n---\n\nFocus on: {focus}\n\n\
             Start with [PERFORMANCE_PASSED] or [PERFORMANCE_FAILED] on its own line, then reply \
             with a single JSON object:\n\
             {{\"summary\": string, \"issues\": [{{\"severity\": \"high|medium|low\", \
             \"category\": string, \"description\": string, \"location\": \"file:line\", \
             \"suggestion\": string}}], \"metrics\": object}}\n\
             If there is nothing to improve, say \"No issues found\".\n",
            feature.title, feature.description
        )
    }

    pub fn parse_result(output: &str) -> PerformanceReport {
        let verdict = marker_verdict(output, "PERFORMANCE");
        let structured = extract_json_block(output);
        let issues = structured
            .as_ref()
            .and_then(|v| v.get("issues"))
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(issue_from_json).collect())
            .unwrap_or_default();
        PerformanceReport {
            verdict,
            structured,
            issues: dedupe_issues(issues),
        }
    }

    pub async fn execute(
        &self,
        ctx: &StepContext<'_>,
        config: &PerformanceConfig,
    ) -> Result<PipelineStepResult> {
        let prompt = Self::build_prompt(ctx.feature, config);
        info!(step_id = %ctx.step.id, model = ctx.model, "running performance step");
        let response = self.executor.execute(ctx.request(prompt)).await?;
        let report = Self::parse_result(&response.output);

        let status = match report.verdict {
            _ if response.status.is_failed() => StepStatus::Failed,
            Some(Verdict::Passed) => StepStatus::Passed,
            Some(Verdict::Failed) => StepStatus::Failed,
            None if contains_any(
                &response.output,
                &["no issues found", "no performance issues"],
            ) =>
            {
                StepStatus::Passed
            }
            None if report.structured.is_some() && report.issues.is_empty() => StepStatus::Passed,
            None => StepStatus::Failed,
        };

        let mut result = PipelineStepResult::new(status, response.output.clone())
            .with_metadata("markerFound", Value::Bool(report.verdict.is_some()));
        if let Some(v) = &report.structured {
            if let Some(summary) = v.get("summary") {
                result = result.with_metadata("summary", summary.clone());
            }
            if let Some(metrics) = v.get("metrics") {
                result = result.with_metadata("metrics", metrics.clone());
            }
        }
        let mut counts = serde_json::Map::new();
        for issue in &report.issues {
            let cat = issue.category.clone().unwrap_or_default();
            let n = counts.get(&cat).and_then(Value::as_u64).unwrap_or(0);
            counts.insert(cat, json!(n + 1));
        }
        Ok(result
            .with_metadata("categories", Value::Object(counts))
            .with_issues(report.issues))
    }
}

fn issue_from_json(v: &Value) -> Option<Issue> {
    let summary = string_field(v, &["description", "title", "summary", "issue"])?;
    let severity = string_field(v, &["severity", "impact"])
        .map(IssueSeverity::from_label)
        .unwrap_or_else(|| infer_severity(summary));
    let category = categorize(summary, string_field(v, &["category", "type"]));
    Some(Issue::new(
        summary,
        string_field(v, &["location", "file"]).map(str::to_string),
        Some(category),
        severity,
    ))
}

// ── Tests ──────────────────────────────────────────────────────────────────
