use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::parse::{contains_any, extract_json_block, lenient, marker_verdict, Verdict};
use super::StepContext;
use crate::issue::{dedupe_issues, Issue, IssueSeverity};
use crate::model::ModelExecutor;
use crate::types::{Feature, PipelineStepResult, SecurityConfig, SecuritySeverity, StepStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Vulnerability {
    #[serde(deserialize_with = "lenient::string")]
    pub severity: String,
    #[serde(alias = "type", deserialize_with = "lenient::opt_string")]
    pub category: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub title: Option<String>,
    #[serde(deserialize_with = "lenient::string")]
    pub description: String,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub location: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub recommendation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityReport {
    #[serde(deserialize_with = "lenient::string")]
    pub summary: String,
    #[serde(deserialize_with = "lenient::items")]
    pub vulnerabilities: Vec<Vulnerability>,
    #[serde(deserialize_with = "lenient::strings")]
    pub recommendations: Vec<String>,
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub security_score: Option<f64>,
    pub compliance: Value,
}

/// Collapse the five-level security scale onto the engine's three levels.
pub fn to_issue_severity(s: SecuritySeverity) -> IssueSeverity {
    match s {
        SecuritySeverity::Critical | SecuritySeverity::High => IssueSeverity::High,
        SecuritySeverity::Medium => IssueSeverity::Medium,
        SecuritySeverity::Low | SecuritySeverity::Info => IssueSeverity::Low,
    }
}

/// Keep only vulnerabilities at or above `min`, as engine issues.
pub fn filter_vulnerabilities(vulns: &[Vulnerability], min: SecuritySeverity) -> Vec<Issue> {
    let issues = vulns
        .iter()
        .filter(|v| SecuritySeverity::from_label(&v.severity).rank() >= min.rank())
        .map(|v| {
            let summary = v
                .title
                .as_deref()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or(&v.description);
            Issue::new(
                summary,
                v.location.clone(),
                Some(v.category.clone().unwrap_or_else(|| "security".into())),
                to_issue_severity(SecuritySeverity::from_label(&v.severity)),
            )
        })
        .collect();
    dedupe_issues(issues)
}

pub struct SecurityStep {
    executor: Arc<dyn ModelExecutor>,
}

impl SecurityStep {
    pub fn new(executor: Arc<dyn ModelExecutor>) -> Self {
        Self { executor }
    }

    pub fn build_prompt(feature: &Feature, config: &SecurityConfig) -> String {
        let checks = if config.checks.is_empty() {
            "injection, authentication and authorization flaws, secrets in code, \
             unsafe deserialization, vulnerable dependencies"
                .to_string()
        } else {
            config.checks.join(", ")
        };
        let mut s = format!(
            "Perform a security audit of the changes made for this feature.\n\n\
             Feature: {}\n\n{}\n\n---\n\nCheck for: {checks}\n",
            feature.title, feature.description
        );
        if !config.compliance.is_empty() {
            s.push_str(&format!(
                "Report compliance against: {}\n",
                config.compliance.join(", ")
            ));
        }
        s.push_str(
            "\nStart with [SECURITY_PASSED] or [SECURITY_FAILED] on its own line, then reply \
             with a single JSON object:\n\
             {\"summary\": string, \"vulnerabilities\": [{\"severity\": \
             \"critical|high|medium|low|info\", \"type\": string, \"title\": string, \
             \"description\": string, \"location\": \"file:line\", \"recommendation\": string}], \
             \"recommendations\": [string], \"securityScore\": number (0-100), \
             \"compliance\": object}\n",
        );
        s
    }

    pub fn parse_result(output: &str) -> Option<SecurityReport> {
        let block = extract_json_block(output)?;
        match serde_json::from_value(block) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "security reply JSON did not match the report shape");
                None
            }
        }
    }

    pub async fn execute(
        &self,
        ctx: &StepContext<'_>,
        config: &SecurityConfig,
    ) -> Result<PipelineStepResult> {
        let prompt = Self::build_prompt(ctx.feature, config);
        info!(step_id = %ctx.step.id, model = ctx.model, min_severity = ?config.min_severity, "running security step");
        let response = self.executor.execute(ctx.request(prompt)).await?;
        let marker = marker_verdict(&response.output, "SECURITY");
        let report = Self::parse_result(&response.output);

        let issues = report
            .as_ref()
            .map(|r| filter_vulnerabilities(&r.vulnerabilities, config.min_severity))
            .unwrap_or_default();

        let status = match (marker, &report) {
            _ if response.status.is_failed() => StepStatus::Failed,
            (Some(Verdict::Passed), _) => StepStatus::Passed,
            (Some(Verdict::Failed), _) => StepStatus::Failed,
            (None, Some(_)) if issues.is_empty() => StepStatus::Passed,
            (None, Some(_)) => StepStatus::Failed,
            (None, None) => {
                if contains_any(
                    &response.output,
                    &["no vulnerabilities", "no security issues"],
                ) {
                    StepStatus::Passed
                } else {
                    StepStatus::Failed
                }
            }
        };

        let mut result = PipelineStepResult::new(status, response.output.clone())
            .with_metadata("structured", Value::Bool(report.is_some()));
        if let Some(r) = report {
            result = result
                .with_metadata("summary", Value::String(r.summary))
                .with_metadata("securityScore", json!(r.security_score))
                .with_metadata("recommendations", json!(r.recommendations))
                .with_metadata("compliance", r.compliance)
                .with_metadata("totalVulnerabilities", json!(r.vulnerabilities.len()))
                .with_metadata("reportedVulnerabilities", json!(issues.len()));
        }
        Ok(result.with_issues(issues))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
