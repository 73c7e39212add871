use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{OnFailure, PipelineConfig};
use crate::issue::{dedupe_issues, Issue};
use crate::steps::{StepContext, StepRegistry};
use crate::types::{
    Feature, PipelineStepConfig, PipelineStepResult, StepEvent, StepEventSender, StepModel,
    StepStatus,
};

/// Model from a different family, so two steps never collapse onto the same one.
pub fn substitute_model_family(model: &str) -> Option<&'static str> {
    let lower = model.to_ascii_lowercase();
    if lower.contains("opus") {
        Some("sonnet")
    } else if lower.contains("sonnet") {
        Some("opus")
    } else if lower.contains("haiku") {
        Some("sonnet")
    } else {
        None
    }
}

fn emit(events: Option<&StepEventSender>, event: StepEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

// ── Step executor ────────────────────────────────────────────────────────

/// Runs one configured step and always yields a result.
pub struct StepExecutor {
    registry: StepRegistry,
    default_model: String,
}

impl StepExecutor {
    pub fn new(registry: StepRegistry, default_model: impl Into<String>) -> Self {
        Self {
            registry,
            default_model: default_model.into(),
        }
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn model_for_step(&self, feature: &Feature, step: &PipelineStepConfig) -> String {
        let feature_model = feature
            .model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.default_model);
        match &step.model {
            StepModel::Same => feature_model.to_string(),
            StepModel::Different => substitute_model_family(feature_model)
                .unwrap_or(&self.default_model)
                .to_string(),
            StepModel::Explicit(m) => m.clone(),
        }
    }

    pub async fn execute(
        &self,
        feature: &Feature,
        step: &PipelineStepConfig,
        project_path: &Path,
        cancel: &CancellationToken,
        events: Option<&StepEventSender>,
    ) -> PipelineStepResult {
        emit(
            events,
            StepEvent::Started {
                step_id: step.id.clone(),
                step_type: step.step_type(),
                name: step.name.clone(),
            },
        );
        let model = self.model_for_step(feature, step);
        let ctx = StepContext {
            feature,
            step,
            model: &model,
            project_path,
            cancel,
            events,
        };

        match self.registry.execute(&ctx).await {
            Ok(result) => {
                info!(
                    step_id = %step.id,
                    step_type = %step.step_type(),
                    status = %result.status,
                    issues = result.issues.len(),
                    "step finished"
                );
                emit(
                    events,
                    StepEvent::Finished {
                        step_id: step.id.clone(),
                        status: result.status.clone(),
                    },
                );
                result
            }
            Err(e) => {
                let message = format!("{e:#}");
                warn!(step_id = %step.id, step_type = %step.step_type(), "step failed: {message}");
                emit(
                    events,
                    StepEvent::Failed {
                        step_id: step.id.clone(),
                        error: message.clone(),
                    },
                );
                PipelineStepResult::from_error(message)
            }
        }
    }
}

// ── Pipeline runner ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub step_id: String,
    pub required: bool,
    pub result: PipelineStepResult,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunSummary {
    pub passed: bool,
    pub cancelled: bool,
    pub steps: Vec<StepOutcome>,
    /// Union of all step issues, deduplicated by hash.
    pub issues: Vec<Issue>,
}

impl PipelineRunSummary {
    pub fn result(&self, step_id: &str) -> Option<&PipelineStepResult> {
        self.steps
            .iter()
            .find(|o| o.step_id == step_id)
            .map(|o| &o.result)
    }
}

/// Runs a whole pipeline against one feature, step by step in file order.
pub struct PipelineRunner {
    executor: Arc<StepExecutor>,
}

impl PipelineRunner {
    pub fn new(executor: Arc<StepExecutor>) -> Self {
        Self { executor }
    }

    pub async fn run(
        &self,
        feature: &Feature,
        pipeline: &PipelineConfig,
        project_path: &Path,
        cancel: &CancellationToken,
        events: Option<&StepEventSender>,
    ) -> PipelineRunSummary {
        let mut steps: Vec<StepOutcome> = Vec::with_capacity(pipeline.steps.len());
        if !pipeline.enabled {
            info!(feature_id = %feature.id, "pipeline disabled, nothing to run");
            return PipelineRunSummary {
                passed: true,
                cancelled: false,
                steps,
                issues: Vec::new(),
            };
        }

        let mut statuses: HashMap<&str, StepStatus> = HashMap::new();
        let mut cancelled = false;
        let mut halted = false;

        for step in &pipeline.steps {
            if cancel.is_cancelled() {
                info!(feature_id = %feature.id, step_id = %step.id, "pipeline cancelled before step");
                cancelled = true;
                break;
            }

            let blocked = step
                .dependencies
                .iter()
                .find(|d| !statuses.get(d.as_str()).is_some_and(StepStatus::is_passed));
            let result = if halted {
                PipelineStepResult::new(StepStatus::Skipped, "skipped: pipeline stopped")
            } else if let Some(dep) = blocked {
                info!(step_id = %step.id, dependency = %dep, "skipping step, dependency did not pass");
                PipelineStepResult::new(
                    StepStatus::Skipped,
                    format!("skipped: dependency {dep} did not pass"),
                )
            } else {
                self.executor
                    .execute(feature, step, project_path, cancel, events)
                    .await
            };

            if step.required && result.status.is_failed() && pipeline.on_failure == OnFailure::Stop
            {
                warn!(step_id = %step.id, "required step failed, stopping pipeline");
                halted = true;
            }
            statuses.insert(step.id.as_str(), result.status.clone());
            steps.push(StepOutcome {
                step_id: step.id.clone(),
                required: step.required,
                result,
            });
        }

        let all_required_passed = pipeline.steps.iter().filter(|s| s.required).all(|s| {
            statuses
                .get(s.id.as_str())
                .is_some_and(StepStatus::is_passed)
        });
        let issues = dedupe_issues(
            steps
                .iter()
                .flat_map(|o| o.result.issues.iter().cloned())
                .collect(),
        );
        let passed = all_required_passed && !cancelled;
        info!(
            feature_id = %feature.id,
            passed,
            cancelled,
            steps = steps.len(),
            issues = issues.len(),
            "pipeline run finished"
        );
        PipelineRunSummary {
            passed,
            cancelled,
            steps,
            issues,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
