use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::issue::Issue;

/// What a custom step remembers between attempts for one (step, feature) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationMemory {
    pub iteration_count: u32,
    pub previous_issues: Vec<Issue>,
    #[serde(default)]
    pub summaries: Vec<String>,
}

/// Feedback recorded after one attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationFeedback {
    pub issues: Vec<Issue>,
    pub summary: String,
}

#[async_trait]
pub trait IterationMemoryStore: Send + Sync {
    async fn memory_for_next_iteration(
        &self,
        step_id: &str,
        feature_id: &str,
    ) -> Result<Option<IterationMemory>>;

    async fn store_feedback(
        &self,
        step_id: &str,
        feature_id: &str,
        feedback: IterationFeedback,
    ) -> Result<()>;

    async fn clear(&self, step_id: &str, feature_id: &str) -> Result<()>;
}

/// Process-local memory store. One instance per orchestrator run.
#[derive(Default)]
pub struct InMemoryIterationStore {
    entries: Mutex<HashMap<(String, String), IterationMemory>>,
}

impl InMemoryIterationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IterationMemoryStore for InMemoryIterationStore {
    async fn memory_for_next_iteration(
        &self,
        step_id: &str,
        feature_id: &str,
    ) -> Result<Option<IterationMemory>> {
        let map = self.entries.lock().await;
        Ok(map
            .get(&(step_id.to_string(), feature_id.to_string()))
            .cloned())
    }

    async fn store_feedback(
        &self,
        step_id: &str,
        feature_id: &str,
        feedback: IterationFeedback,
    ) -> Result<()> {
        let mut map = self.entries.lock().await;
        let entry = map
            .entry((step_id.to_string(), feature_id.to_string()))
            .or_default();
        entry.iteration_count += 1;
        entry.previous_issues.extend(feedback.issues);
        entry.previous_issues = crate::issue::dedupe_issues(std::mem::take(&mut entry.previous_issues));
        if !feedback.summary.is_empty() {
            entry.summaries.push(feedback.summary);
        }
        Ok(())
    }

    async fn clear(&self, step_id: &str, feature_id: &str) -> Result<()> {
        self.entries
            .lock()
            .await
            .remove(&(step_id.to_string(), feature_id.to_string()));
        Ok(())
    }
}
