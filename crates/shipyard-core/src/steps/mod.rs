//! Step implementations, one per [`StepKind`] variant.

pub mod custom;
pub mod parse;
pub mod performance;
pub mod review;
pub mod security;
pub mod test_coverage;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

pub use custom::CustomStep;
pub use performance::PerformanceStep;
pub use review::ReviewStep;
pub use security::SecurityStep;
pub use test_coverage::TestStep;

use crate::memory::IterationMemoryStore;
use crate::model::{CodeReviewer, ModelExecutor, ModelRequest};
use crate::types::{Feature, PipelineStepConfig, PipelineStepResult, StepEvent, StepEventSender, StepKind};

/// Per-invocation inputs shared by every step implementation.
pub struct StepContext<'a> {
    pub feature: &'a Feature,
    pub step: &'a PipelineStepConfig,
    /// Model resolved for this step.
    pub model: &'a str,
    pub project_path: &'a Path,
    pub cancel: &'a CancellationToken,
    pub events: Option<&'a StepEventSender>,
}

impl<'a> StepContext<'a> {
    pub fn request(&self, prompt: String) -> ModelRequest<'a> {
        ModelRequest {
            feature: self.feature,
            step: self.step,
            model: self.model,
            prompt,
            project_path: self.project_path,
            cancel: self.cancel.clone(),
            events: self.events.cloned(),
        }
    }

    pub fn progress(&self, message: impl Into<String>) {
        if let Some(tx) = self.events {
            let _ = tx.send(StepEvent::Progress {
                step_id: self.step.id.clone(),
                message: message.into(),
            });
        }
    }
}

/// Dispatch table from step variant to handler, built once per engine.
pub struct StepRegistry {
    review: ReviewStep,
    security: SecurityStep,
    performance: PerformanceStep,
    test: TestStep,
    custom: CustomStep,
}

impl StepRegistry {
    pub fn new(executor: Arc<dyn ModelExecutor>, memory: Arc<dyn IterationMemoryStore>) -> Self {
        Self {
            review: ReviewStep::new(Arc::clone(&executor)),
            security: SecurityStep::new(Arc::clone(&executor)),
            performance: PerformanceStep::new(Arc::clone(&executor)),
            test: TestStep::new(Arc::clone(&executor)),
            custom: CustomStep::new(executor, memory),
        }
    }

    pub fn with_code_reviewer(mut self, reviewer: Arc<dyn CodeReviewer>) -> Self {
        self.custom = self.custom.with_code_reviewer(reviewer);
        self
    }

    pub async fn execute(&self, ctx: &StepContext<'_>) -> Result<PipelineStepResult> {
        match &ctx.step.kind {
            StepKind::Review(config) => self.review.execute(ctx, config).await,
            StepKind::Security(config) => self.security.execute(ctx, config).await,
            StepKind::Performance(config) => self.performance.execute(ctx, config).await,
            StepKind::Test(config) => self.test.execute(ctx, config).await,
            StepKind::Custom(config) => self.custom.execute(ctx, config).await,
        }
    }
}
