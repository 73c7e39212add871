use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shipyard_core::config::Config;
use shipyard_core::model::{ModelExecutor, ModelRequest, ModelResponse};
use shipyard_core::StepStatus;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::event::{AgentEvent, TranscriptBuilder};
use crate::subprocess::{spawn_jsonl, SpawnOptions};

/// Answers step prompts by running the Claude Code CLI in the project directory.
pub struct ClaudeExecutor {
    /// Path to the `claude` binary.
    pub claude_bin: String,
    pub idle_timeout: Duration,
    /// `None` means the idle timeout.
    pub startup_timeout: Option<Duration>,
    pub allowed_tools: String,
    pub max_turns: u32,
}

impl ClaudeExecutor {
    pub fn new(claude_bin: impl Into<String>) -> Self {
        Self {
            claude_bin: claude_bin.into(),
            idle_timeout: Duration::from_secs(300),
            startup_timeout: None,
            allowed_tools: "Read,Glob,Grep,Bash".to_string(),
            max_turns: 50,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut exec = Self::new(config.claude_bin.clone());
        exec.idle_timeout = Duration::from_millis(config.idle_timeout_ms);
        if config.startup_timeout_ms > 0 {
            exec.startup_timeout = Some(Duration::from_millis(config.startup_timeout_ms));
        }
        exec
    }

    pub fn with_timeouts(mut self, idle: Duration, startup: Option<Duration>) -> Self {
        self.idle_timeout = idle;
        self.startup_timeout = startup;
        self
    }

    pub fn args(&self, model: &str, prompt: &str) -> Vec<String> {
        vec![
            "--model".to_string(),
            model.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--allowedTools".to_string(),
            self.allowed_tools.clone(),
            "--max-turns".to_string(),
            self.max_turns.to_string(),
            "--print".to_string(),
            prompt.to_string(),
        ]
    }
}

fn augmented_path() -> String {
    let path = std::env::var("PATH").unwrap_or_default();
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_default();
    format!("{path}:/home/{user}/.local/bin:/usr/local/bin")
}

#[async_trait]
impl ModelExecutor for ClaudeExecutor {
    async fn execute(&self, request: ModelRequest<'_>) -> Result<ModelResponse> {
        let mut opts = SpawnOptions::new(&self.claude_bin, self.args(request.model, &request.prompt))
            .cwd(request.project_path)
            .env("PATH", augmented_path())
            .cancel(request.cancel.clone())
            .idle_timeout(self.idle_timeout);
        if let Some(startup) = self.startup_timeout {
            opts = opts.startup_timeout(startup);
        }

        info!(
            step_id = %request.step.id,
            feature_id = %request.feature.id,
            model = request.model,
            prompt_len = request.prompt.len(),
            "spawning claude subprocess"
        );
        let mut stream = spawn_jsonl(opts);
        let pid = stream.pid();
        let mut transcript = TranscriptBuilder::default();

        while let Some(item) = stream.next().await {
            let value = match item {
                Ok(v) => v,
                Err(e) => {
                    warn!(step_id = %request.step.id, pid = ?pid, "claude subprocess failed: {e}");
                    return Err(e).with_context(|| {
                        format!("claude run for step {} failed", request.step.id)
                    });
                }
            };
            if let Some(text) = transcript.push(&AgentEvent::from_value(value)) {
                request.progress(text);
            }
        }

        let transcript = transcript.finish();
        info!(
            step_id = %request.step.id,
            pid = ?pid,
            is_error = transcript.is_error,
            tool_calls = transcript.tool_calls,
            output_len = transcript.output.len(),
            "claude subprocess finished"
        );
        let status = if transcript.is_error {
            StepStatus::Failed
        } else {
            StepStatus::Passed
        };
        Ok(ModelResponse {
            status,
            output: transcript.output,
        })
    }
}
