use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::issue::Issue;
use crate::types::{Feature, PipelineStepConfig, StepEvent, StepEventSender, StepStatus};

/// Everything a model backend needs to answer one step prompt.
pub struct ModelRequest<'a> {
    pub feature: &'a Feature,
    pub step: &'a PipelineStepConfig,
    /// Resolved model name (after `same`/`different` substitution).
    pub model: &'a str,
    pub prompt: String,
    pub project_path: &'a Path,
    pub cancel: CancellationToken,
    /// If set, backends forward incremental output here as progress events.
    pub events: Option<StepEventSender>,
}

impl ModelRequest<'_> {
    pub fn progress(&self, message: impl Into<String>) {
        if let Some(tx) = &self.events {
            let _ = tx.send(StepEvent::Progress {
                step_id: self.step.id.clone(),
                message: message.into(),
            });
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub status: StepStatus,
    pub output: String,
}

impl ModelResponse {
    pub fn passed(output: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Passed,
            output: output.into(),
        }
    }
}

/// Turns a prompt into a model/agent reply.
#[async_trait]
pub trait ModelExecutor: Send + Sync {
    async fn execute(&self, request: ModelRequest<'_>) -> Result<ModelResponse>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeReviewOutcome {
    pub passed: bool,
    pub output: String,
    pub issues: Vec<Issue>,
}

/// External code-review integration a custom step may try before the model.
#[async_trait]
pub trait CodeReviewer: Send + Sync {
    async fn review(
        &self,
        feature: &Feature,
        prompt: &str,
        project_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<CodeReviewOutcome>;
}
