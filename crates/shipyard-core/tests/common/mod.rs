#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use shipyard_core::issue::Issue;
use shipyard_core::memory::{InMemoryIterationStore, IterationMemoryStore};
use shipyard_core::model::{CodeReviewOutcome, CodeReviewer, ModelExecutor, ModelRequest, ModelResponse};
use shipyard_core::pipeline::StepExecutor;
use shipyard_core::steps::StepRegistry;
use shipyard_core::{Feature, StepStatus};
use tokio_util::sync::CancellationToken;

/// Canned reply for one executor call.
pub enum Reply {
    Ok(ModelResponse),
    Err(String),
    /// Cancel the request's token, then answer with the given text.
    CancelThen(String),
}

pub fn ok(text: &str) -> Reply {
    Reply::Ok(ModelResponse::passed(text))
}

pub fn failed_status(text: &str) -> Reply {
    Reply::Ok(ModelResponse {
        status: StepStatus::Failed,
        output: text.to_string(),
    })
}

pub fn err(message: &str) -> Reply {
    Reply::Err(message.to_string())
}

#[derive(Debug, Clone)]
pub struct Call {
    pub step_id: String,
    pub model: String,
    pub prompt: String,
}

/// Replays scripted replies in order and records every request.
/// An exhausted script answers with an error.
#[derive(Default)]
pub struct ScriptedExecutor {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedExecutor {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelExecutor for ScriptedExecutor {
    async fn execute(&self, request: ModelRequest<'_>) -> Result<ModelResponse> {
        self.calls.lock().unwrap().push(Call {
            step_id: request.step.id.clone(),
            model: request.model.to_string(),
            prompt: request.prompt.clone(),
        });
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Reply::Ok(r)) => Ok(r),
            Some(Reply::Err(m)) => Err(anyhow::anyhow!(m)),
            Some(Reply::CancelThen(text)) => {
                request.cancel.cancel();
                Ok(ModelResponse::passed(text))
            }
            None => Err(anyhow::anyhow!("script exhausted")),
        }
    }
}

/// Code reviewer that returns a fixed outcome or a fixed error.
pub struct FixedReviewer {
    pub outcome: std::result::Result<CodeReviewOutcome, String>,
    pub calls: Mutex<u32>,
}

impl FixedReviewer {
    pub fn passing(output: &str, issues: Vec<Issue>) -> Arc<Self> {
        Arc::new(Self {
            outcome: Ok(CodeReviewOutcome {
                passed: true,
                output: output.to_string(),
                issues,
            }),
            calls: Mutex::new(0),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            outcome: Err(message.to_string()),
            calls: Mutex::new(0),
        })
    }
}

#[async_trait]
impl CodeReviewer for FixedReviewer {
    async fn review(
        &self,
        _feature: &Feature,
        _prompt: &str,
        _project_path: &Path,
        _cancel: &CancellationToken,
    ) -> Result<CodeReviewOutcome> {
        *self.calls.lock().unwrap() += 1;
        self.outcome.clone().map_err(|m| anyhow::anyhow!(m))
    }
}

pub fn feature() -> Feature {
    Feature {
        id: "feat-42".into(),
        title: "Add rate limiting".into(),
        description: "Limit API calls per user to 100/min.".into(),
        status: "in_review".into(),
        model: Some("opus".into()),
        ..Default::default()
    }
}

pub fn memory() -> Arc<InMemoryIterationStore> {
    Arc::new(InMemoryIterationStore::new())
}

pub fn step_executor(
    executor: Arc<ScriptedExecutor>,
    memory: Arc<dyn IterationMemoryStore>,
) -> StepExecutor {
    StepExecutor::new(StepRegistry::new(executor, memory), "sonnet")
}
