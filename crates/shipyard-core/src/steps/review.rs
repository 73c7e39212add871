use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::info;

use super::parse::{issue_from_item, marker_verdict, numbered_items, Verdict};
use super::StepContext;
use crate::issue::{dedupe_issues, Issue};
use crate::model::ModelExecutor;
use crate::types::{Feature, PipelineStepResult, ReviewConfig, StepStatus};

const REVIEW_CHECKLIST: [&str; 6] = [
    "Correctness: the change does what the feature asks, including edge cases",
    "Error handling: failures are surfaced or handled, never silently ignored",
    "Readability: naming and structure a maintainer can follow",
    "Tests: new behaviour is covered by tests",
    "Security: input validation, secrets handling, injection risks",
    "Consistency with the surrounding code and project conventions",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewReport {
    pub verdict: Option<Verdict>,
    pub issues: Vec<Issue>,
}

/// Free-form code review gated on a `[REVIEW_PASSED]`/`[REVIEW_FAILED]` marker.
pub struct ReviewStep {
    executor: Arc<dyn ModelExecutor>,
}

impl ReviewStep {
    pub fn new(executor: Arc<dyn ModelExecutor>) -> Self {
        Self { executor }
    }

    pub fn build_prompt(feature: &Feature, config: &ReviewConfig) -> String {
        let mut s = format!(
            "You are reviewing the implementation of a feature.\n\n\
             Feature: {}\n\n{}\n\n---\n\nReview checklist:\n",
            feature.title, feature.description
        );
        for item in REVIEW_CHECKLIST.iter().map(|s| s.to_string()).chain(config.checklist.iter().cloned()) {
            s.push_str(&format!("- {item}\n"));
        }
        if !config.focus.is_empty() {
            s.push_str(&format!("\nPay particular attention to: {}\n", config.focus.join(", ")));
        }
        s.push_str(
            "\nBegin your reply with [REVIEW_PASSED] on its own line if the change is ready, \
             or [REVIEW_FAILED] if it is not. When it fails, list every problem as a numbered \
             line in the form:\n\
             1. [high|medium|low] path/to/file.ext:line - description\n",
        );
        s
    }

    pub fn parse_result(output: &str) -> ReviewReport {
        let verdict = marker_verdict(output, "REVIEW");
        let issues = if verdict == Some(Verdict::Passed) {
            Vec::new()
        } else {
            dedupe_issues(
                numbered_items(output)
                    .iter()
                    .map(|item| issue_from_item(item, "review"))
                    .collect(),
            )
        };
        ReviewReport { verdict, issues }
    }

    pub async fn execute(
        &self,
        ctx: &StepContext<'_>,
        config: &ReviewConfig,
    ) -> Result<PipelineStepResult> {
        let prompt = Self::build_prompt(ctx.feature, config);
        info!(step_id = %ctx.step.id, model = ctx.model, "running review step");
        let response = self.executor.execute(ctx.request(prompt)).await?;
        let report = Self::parse_result(&response.output);

        let status = match report.verdict {
            _ if response.status.is_failed() => StepStatus::Failed,
            Some(Verdict::Passed) => StepStatus::Passed,
            Some(Verdict::Failed) => StepStatus::Failed,
            // No verdict marker: decide on whether any issues were listed.
            None if report.issues.is_empty() => StepStatus::Passed,
            None => StepStatus::Failed,
        };

        Ok(PipelineStepResult::new(status, response.output)
            .with_metadata("markerFound", Value::Bool(report.verdict.is_some()))
            .with_issues(report.issues))
    }
}
