//! User-defined step with bounded retry looping.
//!
//! Each attempt renders the prompt template, optionally consults an external
//! code reviewer, otherwise asks the model, and checks the reply against the
//! configured success criteria. Attempts are recorded in iteration memory
//! when enabled so a later run can pick up where this one stopped.

use std::borrow::Cow;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use regex::{Captures, Regex};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::parse::{issue_from_item, numbered_items, truncate};
use super::StepContext;
use crate::issue::{dedupe_issues, Issue};
use crate::memory::{IterationFeedback, IterationMemory, IterationMemoryStore};
use crate::model::{CodeReviewer, ModelExecutor};
use crate::types::{AmbiguousOutcome, CustomConfig, Feature, PipelineStepResult, StepStatus};

const SUMMARY_LIMIT: usize = 500;

const FAILURE_PHRASES: [&str; 5] = [
    "not met",
    "not fulfilled",
    "unfulfilled",
    "not satisfied",
    "failed",
];
const SUCCESS_PHRASES: [&str; 4] = ["criteria met", "fulfilled", "satisfied", "all criteria"];

fn placeholder_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").ok())
        .as_ref()
}

/// Substitute `{{name}}` placeholders. Feature fields (`featureId`, `title`,
/// `description`, `status`) take precedence over config variables. Unknown
/// placeholders are left as written.
pub fn render_template(template: &str, feature: &Feature, config: &CustomConfig) -> String {
    let Some(re) = placeholder_re() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &Captures<'_>| -> String {
        let value: Option<Cow<'_, str>> = match &caps[1] {
            "featureId" => Some(Cow::Borrowed(feature.id.as_str())),
            "title" => Some(Cow::Borrowed(feature.title.as_str())),
            "description" => Some(Cow::Borrowed(feature.description.as_str())),
            "status" => Some(Cow::Borrowed(feature.status.as_str())),
            name => config.variables.get(name).map(|v| Cow::Borrowed(v.as_str())),
        };
        match value {
            Some(v) => v.into_owned(),
            None => caps[0].to_string(),
        }
    })
    .into_owned()
}

/// Decide whether a reply satisfies the success criteria.
///
/// Failure phrases are checked first so "not fulfilled" is never read as
/// "fulfilled". A reply with neither falls back to `ambiguous`.
pub fn criteria_met(output: &str, criteria: &[String], ambiguous: AmbiguousOutcome) -> bool {
    if criteria.is_empty() {
        return true;
    }
    let lower = output.to_lowercase();
    if FAILURE_PHRASES.iter().any(|p| lower.contains(p)) {
        return false;
    }
    if SUCCESS_PHRASES.iter().any(|p| lower.contains(p)) {
        return true;
    }
    ambiguous == AmbiguousOutcome::Pass
}

/// One finished attempt.
#[derive(Debug, Clone)]
struct Attempt {
    met: bool,
    output: String,
    issues: Vec<Issue>,
    source: &'static str,
    /// Code review answered or refused; no further attempts.
    terminal: bool,
}

impl Attempt {
    fn summary(&self) -> String {
        truncate(self.output.trim(), SUMMARY_LIMIT)
    }
}

pub struct CustomStep {
    executor: Arc<dyn ModelExecutor>,
    memory: Arc<dyn IterationMemoryStore>,
    code_reviewer: Option<Arc<dyn CodeReviewer>>,
}

impl CustomStep {
    pub fn new(executor: Arc<dyn ModelExecutor>, memory: Arc<dyn IterationMemoryStore>) -> Self {
        Self {
            executor,
            memory,
            code_reviewer: None,
        }
    }

    pub fn with_code_reviewer(mut self, reviewer: Arc<dyn CodeReviewer>) -> Self {
        self.code_reviewer = Some(reviewer);
        self
    }

    pub fn build_prompt(
        feature: &Feature,
        config: &CustomConfig,
        memory: Option<&IterationMemory>,
        loop_count: u32,
        prior_feedback: &[String],
    ) -> String {
        let mut s = render_template(&config.prompt, feature, config);

        if !config.success_criteria.is_empty() {
            s.push_str("\n\n## Success Criteria\n");
            for c in &config.success_criteria {
                s.push_str(&format!("- {c}\n"));
            }
            s.push_str(
                "\nEnd your reply by stating whether the success criteria are met \
                 (\"criteria met\") or not (\"criteria not met\").\n",
            );
        }

        if let Some(mem) = memory.filter(|m| !m.previous_issues.is_empty()) {
            s.push_str(&format!(
                "\n## Issues from {} previous run(s)\n",
                mem.iteration_count
            ));
            for issue in &mem.previous_issues {
                match &issue.location {
                    Some(loc) => s.push_str(&format!("- {} ({loc})\n", issue.summary)),
                    None => s.push_str(&format!("- {}\n", issue.summary)),
                }
            }
        }

        if loop_count > 1 {
            s.push_str(&format!(
                "\n## Retry\nThis is attempt {loop_count} of {}. Earlier attempts did not meet \
                 the success criteria.\n",
                config.loop_config.max_loops
            ));
            for (i, fb) in prior_feedback.iter().enumerate() {
                s.push_str(&format!("\nAttempt {} feedback:\n{fb}\n", i + 1));
            }
        }
        s
    }

    async fn load_memory(&self, ctx: &StepContext<'_>) -> Option<IterationMemory> {
        match self
            .memory
            .memory_for_next_iteration(&ctx.step.id, &ctx.feature.id)
            .await
        {
            Ok(m) => m,
            Err(e) => {
                warn!(step_id = %ctx.step.id, error = %e, "failed to load iteration memory");
                None
            }
        }
    }

    async fn persist(&self, ctx: &StepContext<'_>, issues: Vec<Issue>, summary: String) {
        let feedback = IterationFeedback { issues, summary };
        if let Err(e) = self
            .memory
            .store_feedback(&ctx.step.id, &ctx.feature.id, feedback)
            .await
        {
            warn!(step_id = %ctx.step.id, error = %e, "failed to store iteration feedback");
        }
    }

    /// Run the external reviewer if configured. `None` means take the model path.
    async fn try_code_review(
        &self,
        ctx: &StepContext<'_>,
        config: &CustomConfig,
        prompt: &str,
    ) -> Option<Attempt> {
        let review_cfg = config.code_review.as_ref().filter(|c| c.enabled)?;
        let reviewer = self.code_reviewer.as_ref()?;
        match reviewer
            .review(ctx.feature, prompt, ctx.project_path, ctx.cancel)
            .await
        {
            Ok(outcome) => Some(Attempt {
                met: outcome.passed,
                output: outcome.output,
                issues: dedupe_issues(outcome.issues),
                source: "code_review",
                terminal: true,
            }),
            Err(e) if !review_cfg.fallback_to_model => Some(Attempt {
                met: false,
                output: format!("code review failed: {e:#}"),
                issues: Vec::new(),
                source: "code_review",
                terminal: true,
            }),
            Err(e) => {
                warn!(step_id = %ctx.step.id, error = %e, "code review failed, falling back to model");
                None
            }
        }
    }

    async fn model_attempt(
        &self,
        ctx: &StepContext<'_>,
        config: &CustomConfig,
        prompt: String,
    ) -> Result<Attempt> {
        let response = self.executor.execute(ctx.request(prompt)).await?;
        let met = !response.status.is_failed()
            && criteria_met(
                &response.output,
                &config.success_criteria,
                config.ambiguous_outcome,
            );
        let issues = if met {
            Vec::new()
        } else {
            dedupe_issues(
                numbered_items(&response.output)
                    .iter()
                    .map(|item| issue_from_item(item, "custom"))
                    .collect(),
            )
        };
        Ok(Attempt {
            met,
            output: response.output,
            issues,
            source: "model",
            terminal: false,
        })
    }

    pub async fn execute(
        &self,
        ctx: &StepContext<'_>,
        config: &CustomConfig,
    ) -> Result<PipelineStepResult> {
        let max_loops = config.loop_config.max_loops.max(1);
        let memory_enabled = config.memory_config.enabled;
        let memory = if memory_enabled {
            self.load_memory(ctx).await
        } else {
            None
        };

        let mut loop_count: u32 = 1;
        let mut prior_feedback = Vec::new();
        let attempt = loop {
            let prompt = Self::build_prompt(
                ctx.feature,
                config,
                memory.as_ref(),
                loop_count,
                &prior_feedback,
            );
            info!(step_id = %ctx.step.id, model = ctx.model, loop_count, max_loops, "running custom step attempt");
            ctx.progress(format!("attempt {loop_count} of {max_loops}"));

            let attempt = match self.try_code_review(ctx, config, &prompt).await {
                Some(a) => a,
                None => match self.model_attempt(ctx, config, prompt).await {
                    Ok(a) => a,
                    Err(e) => {
                        if memory_enabled {
                            self.persist(ctx, Vec::new(), format!("attempt errored: {e:#}"))
                                .await;
                        }
                        return Err(e);
                    }
                },
            };

            if memory_enabled {
                self.persist(ctx, attempt.issues.clone(), attempt.summary())
                    .await;
            }

            let done = attempt.met
                || attempt.terminal
                || ctx.cancel.is_cancelled()
                || !config.loop_config.loop_until_success
                || loop_count >= max_loops;
            if done {
                break attempt;
            }

            prior_feedback.push(attempt.summary());
            if config.loop_config.delay_ms > 0 {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break attempt,
                    _ = tokio::time::sleep(Duration::from_millis(config.loop_config.delay_ms)) => {}
                }
            }
            loop_count += 1;
        };

        let status = if attempt.met {
            StepStatus::Passed
        } else {
            StepStatus::Failed
        };
        info!(step_id = %ctx.step.id, loop_count, status = %status, source = attempt.source, "custom step finished");
        Ok(PipelineStepResult::new(status, attempt.output)
            .with_issues(attempt.issues)
            .with_iterations(loop_count)
            .with_metadata("loopCount", json!(loop_count))
            .with_metadata("maxLoops", json!(max_loops))
            .with_metadata("criteriaMet", Value::Bool(attempt.met))
            .with_metadata("source", Value::String(attempt.source.into()))
            .with_metadata("cancelled", Value::Bool(ctx.cancel.is_cancelled())))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn feature() -> Feature {
        Feature {
            id: "f-1".into(),
            title: "Add login".into(),
            description: "OAuth flow".into(),
            status: "in_review".into(),
            ..Default::default()
        }
    }

    #[test]
    fn template_substitution() {
        let mut config = CustomConfig {
            prompt: "Check {{ title }} ({{featureId}}) for {{target}}; keep {{unknown}}".into(),
            ..Default::default()
        };
        config.variables.insert("target".into(), "leaks".into());
        config.variables.insert("title".into(), "ignored".into());
        assert_eq!(
            render_template(&config.prompt, &feature(), &config),
            "Check Add login (f-1) for leaks; keep {{unknown}}"
        );
    }

    #[test]
    fn criteria_failure_phrases_win() {
        let criteria = vec!["docs updated".to_string()];
        assert!(!criteria_met("Criteria not fulfilled", &criteria, AmbiguousOutcome::Pass));
        assert!(criteria_met("All criteria met.", &criteria, AmbiguousOutcome::Fail));
        assert!(criteria_met("looks fine", &criteria, AmbiguousOutcome::Pass));
        assert!(!criteria_met("looks fine", &criteria, AmbiguousOutcome::Fail));
        assert!(criteria_met("anything", &[], AmbiguousOutcome::Fail));
    }

    #[test]
    fn retry_prompt_mentions_attempt() {
        let mut config = CustomConfig {
            prompt: "Do it".into(),
            success_criteria: vec!["done".into()],
            ..Default::default()
        };
        config.loop_config.max_loops = 3;
        let first = CustomStep::build_prompt(&feature(), &config, None, 1, &[]);
        assert!(first.contains("## Success Criteria"));
        assert!(!first.contains("attempt 1 of 3"));
        let second =
            CustomStep::build_prompt(&feature(), &config, None, 2, &["missed docs".into()]);
        assert!(second.contains("This is attempt 2 of 3"));
        assert!(second.contains("missed docs"));
    }
}
