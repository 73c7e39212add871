//! Task lifecycle state machine.
//!
//! Owns the authoritative status of every tracked task, the static table of
//! legal `(from, to)` edges, and the validation gate attached to each edge.
//! Invalid edges and failed validations are reported as [`TransitionOutcome`]
//! values and on the event channel; they never error.
//!
//! `transition` holds a per-task lock across read, validate and write, so two
//! concurrent transitions of the same task are applied one after the other
//! and the second one sees the first one's result.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

// ── States ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    Researching,
    InProgress,
    InReview,
    QueueForPr,
    PrCreated,
    PrFixesNeeded,
    ReadyForMerge,
    Completed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 9] = [
        Self::Todo,
        Self::Researching,
        Self::InProgress,
        Self::InReview,
        Self::QueueForPr,
        Self::PrCreated,
        Self::PrFixesNeeded,
        Self::ReadyForMerge,
        Self::Completed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::Researching => "researching",
            Self::InProgress => "in_progress",
            Self::InReview => "in_review",
            Self::QueueForPr => "queue_for_pr",
            Self::PrCreated => "pr_created",
            Self::PrFixesNeeded => "pr_fixes_needed",
            Self::ReadyForMerge => "ready_for_merge",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|st| st.as_str() == normalized)
    }

    pub fn is_initial(self) -> bool {
        self == Self::Todo
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Completed
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current lifecycle record of one task. Replaced wholesale on every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    pub task_id: String,
    pub state: TaskStatus,
    pub previous_state: Option<TaskStatus>,
    pub entered_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

// ── Transition context & validation ──────────────────────────────────────

/// Caller-supplied facts that edge validations are evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransitionContext(pub Map<String, Value>);

impl TransitionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn flag(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Length of an array entry; `None` when absent or not an array.
    pub fn array_len(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(Value::as_array).map(Vec::len)
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| !v.is_null())
    }

    fn metadata(&self) -> Map<String, Value> {
        self.get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }
}

impl From<Value> for TransitionContext {
    fn from(v: Value) -> Self {
        match v {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }
}

/// Asynchronous validation predicate for an edge.
#[async_trait]
pub trait TransitionGuard: Send + Sync {
    async fn check(&self, ctx: &TransitionContext) -> bool;
}

#[derive(Clone)]
pub enum Validation {
    Sync(fn(&TransitionContext) -> bool),
    Async(Arc<dyn TransitionGuard>),
}

impl Validation {
    async fn evaluate(&self, ctx: &TransitionContext) -> bool {
        match self {
            Self::Sync(f) => f(ctx),
            Self::Async(g) => g.check(ctx).await,
        }
    }
}

impl fmt::Debug for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Validation::Sync"),
            Self::Async(_) => f.write_str("Validation::Async"),
        }
    }
}

/// One declared edge of the lifecycle graph.
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub phase: Option<&'static str>,
    pub validation: Option<Validation>,
    pub error_message: Option<&'static str>,
}

impl StateTransition {
    fn edge(from: TaskStatus, to: TaskStatus, phase: &'static str) -> Self {
        Self {
            from,
            to,
            phase: Some(phase),
            validation: None,
            error_message: None,
        }
    }

    fn guarded(mut self, check: fn(&TransitionContext) -> bool, error: &'static str) -> Self {
        self.validation = Some(Validation::Sync(check));
        self.error_message = Some(error);
        self
    }
}

fn research_has_subtasks(ctx: &TransitionContext) -> bool {
    ctx.array_len("subtasks").is_some_and(|n| n > 0)
}

fn implementation_complete(ctx: &TransitionContext) -> bool {
    ctx.flag("implementationComplete")
}

fn no_unresolved_issues(ctx: &TransitionContext) -> bool {
    ctx.array_len("issues").unwrap_or(0) == 0
}

fn pr_opened(ctx: &TransitionContext) -> bool {
    ctx.has("prNumber") || ctx.has("prUrl")
}

fn ci_passed(ctx: &TransitionContext) -> bool {
    ctx.flag("ciPassed")
}

fn merged(ctx: &TransitionContext) -> bool {
    ctx.flag("merged")
}

/// The built-in lifecycle graph.
pub fn default_transitions() -> Vec<StateTransition> {
    use TaskStatus::*;
    let mut table = vec![
        StateTransition::edge(Todo, Researching, "research"),
        StateTransition::edge(Researching, InProgress, "implement").guarded(
            research_has_subtasks,
            "Research must produce at least one subtask before implementation",
        ),
        StateTransition::edge(InProgress, InReview, "review").guarded(
            implementation_complete,
            "Implementation must be complete before review",
        ),
        StateTransition::edge(InReview, QueueForPr, "finalize").guarded(
            no_unresolved_issues,
            "Cannot queue for PR: review has unresolved issues",
        ),
        StateTransition::edge(InReview, InProgress, "fix"),
        StateTransition::edge(QueueForPr, PrCreated, "pr").guarded(
            pr_opened,
            "A pull request number or URL is required",
        ),
        StateTransition::edge(PrCreated, ReadyForMerge, "merge")
            .guarded(ci_passed, "CI checks must pass before merge"),
        StateTransition::edge(PrCreated, PrFixesNeeded, "pr_fix"),
        StateTransition::edge(PrFixesNeeded, InReview, "review"),
        StateTransition::edge(ReadyForMerge, Completed, "complete")
            .guarded(merged, "Pull request must be merged before completion"),
    ];
    for state in TaskStatus::ALL {
        if !state.is_initial() && !state.is_terminal() {
            table.push(StateTransition::edge(state, Todo, "abort"));
        }
    }
    table
}

// ── Outcomes & events ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionOutcome {
    pub valid: bool,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    /// The task's state after the call (unchanged on failure).
    pub state: Option<TaskState>,
}

impl TransitionOutcome {
    fn rejected(error: String, state: Option<TaskState>) -> Self {
        Self {
            valid: false,
            error: Some(error),
            warnings: Vec::new(),
            state,
        }
    }
}

/// Broadcast to observers for every transition attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    StateChanged {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
        phase: Option<&'static str>,
    },
    ValidationFailed {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
        error: String,
    },
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    Reset {
        task_id: String,
    },
}

impl LifecycleEvent {
    pub fn kind(&self) -> &str {
        match self {
            Self::StateChanged { .. } => "state_changed",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Reset { .. } => "reset",
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            Self::StateChanged { task_id, .. }
            | Self::ValidationFailed { task_id, .. }
            | Self::InvalidTransition { task_id, .. }
            | Self::Reset { task_id } => task_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateStats {
    pub count: usize,
    /// Mean of `now - entered_at` across tasks in this state, in milliseconds.
    pub mean_time_in_state_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LifecycleStats {
    pub total_tasks: usize,
    pub by_state: BTreeMap<TaskStatus, StateStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathViolation {
    /// Index of the first state of the offending pair.
    pub index: usize,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathValidation {
    pub valid: bool,
    pub violations: Vec<PathViolation>,
}

// ── Machine ──────────────────────────────────────────────────────────────

pub struct LifecycleMachine {
    transitions: Vec<StateTransition>,
    strict_mode: bool,
    tasks: Mutex<HashMap<String, TaskState>>,
    /// Serializes read-validate-write per task id.
    task_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    event_tx: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleMachine {
    pub fn new(strict_mode: bool) -> Self {
        Self::with_transitions(default_transitions(), strict_mode)
    }

    pub fn with_transitions(transitions: Vec<StateTransition>, strict_mode: bool) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            transitions,
            strict_mode,
            tasks: Mutex::new(HashMap::new()),
            task_locks: Mutex::new(HashMap::new()),
            event_tx,
        }
    }

    pub fn strict_mode(&self) -> bool {
        self.strict_mode
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.event_tx.subscribe()
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    fn find(&self, from: TaskStatus, to: TaskStatus) -> Option<&StateTransition> {
        self.transitions.iter().find(|t| t.from == from && t.to == to)
    }

    pub fn is_valid_transition(&self, from: TaskStatus, to: TaskStatus) -> bool {
        self.find(from, to).is_some()
    }

    pub fn available_transitions(&self, from: TaskStatus) -> Vec<&StateTransition> {
        self.transitions.iter().filter(|t| t.from == from).collect()
    }

    pub async fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.tasks.lock().await.get(task_id).cloned()
    }

    /// Current status, `todo` for tasks never transitioned.
    pub async fn current_status(&self, task_id: &str) -> TaskStatus {
        self.task_state(task_id)
            .await
            .map(|s| s.state)
            .unwrap_or(TaskStatus::Todo)
    }

    pub async fn tracked_tasks(&self) -> Vec<TaskState> {
        let mut all: Vec<TaskState> = self.tasks.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        all
    }

    /// Forget a task; it reads as `todo` afterwards.
    pub async fn reset(&self, task_id: &str) -> bool {
        let lock = self.task_lock(task_id).await;
        let removed = {
            let _guard = lock.lock().await;
            self.tasks.lock().await.remove(task_id).is_some()
        };
        self.release_lock(task_id, lock).await;
        if removed {
            info!(task_id, "task lifecycle reset");
            self.emit(LifecycleEvent::Reset {
                task_id: task_id.to_string(),
            });
        }
        removed
    }

    /// Task ids that currently have a transition or reset in flight.
    pub async fn locked_tasks(&self) -> usize {
        self.task_locks.lock().await.len()
    }

    async fn task_lock(&self, task_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.task_locks.lock().await;
        Arc::clone(locks.entry(task_id.to_string()).or_default())
    }

    /// Drop the per-task lock once nobody else holds or waits on it.
    async fn release_lock(&self, task_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.task_locks.lock().await;
        // Clones are only handed out under `task_locks`, so the count cannot grow here.
        let idle = locks
            .get(task_id)
            .is_some_and(|l| Arc::ptr_eq(l, &lock) && Arc::strong_count(l) == 2);
        if idle {
            locks.remove(task_id);
        }
    }

    pub async fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        ctx: &TransitionContext,
    ) -> TransitionOutcome {
        let lock = self.task_lock(task_id).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.apply_transition(task_id, to, ctx).await
        };
        self.release_lock(task_id, lock).await;
        outcome
    }

    /// Read, validate and write one transition. Caller holds the task lock.
    async fn apply_transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        ctx: &TransitionContext,
    ) -> TransitionOutcome {
        let current = self.task_state(task_id).await;
        let from = current.as_ref().map(|s| s.state).unwrap_or(TaskStatus::Todo);

        let Some(edge) = self.find(from, to) else {
            warn!(task_id, %from, %to, "invalid transition");
            self.emit(LifecycleEvent::InvalidTransition {
                task_id: task_id.to_string(),
                from,
                to,
            });
            return TransitionOutcome::rejected(
                format!("Invalid transition from {from} to {to}"),
                current,
            );
        };

        let mut warnings = Vec::new();
        if let Some(validation) = &edge.validation {
            if !self.strict_mode {
                warnings.push(format!(
                    "validation for {from} -> {to} skipped (strict mode disabled)"
                ));
            } else if !validation.evaluate(ctx).await {
                let error = edge
                    .error_message
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Validation failed for {from} -> {to}"));
                warn!(task_id, %from, %to, error = %error, "transition validation failed");
                self.emit(LifecycleEvent::ValidationFailed {
                    task_id: task_id.to_string(),
                    from,
                    to,
                    error: error.clone(),
                });
                return TransitionOutcome::rejected(error, current);
            }
        }

        let next = TaskState {
            task_id: task_id.to_string(),
            state: to,
            previous_state: Some(from),
            entered_at: Utc::now(),
            metadata: ctx.metadata(),
        };
        self.tasks
            .lock()
            .await
            .insert(task_id.to_string(), next.clone());

        info!(task_id, %from, %to, phase = edge.phase.unwrap_or(""), "task transitioned");
        self.emit(LifecycleEvent::StateChanged {
            task_id: task_id.to_string(),
            from,
            to,
            phase: edge.phase,
        });

        TransitionOutcome {
            valid: true,
            error: None,
            warnings,
            state: Some(next),
        }
    }

    pub async fn stats(&self) -> LifecycleStats {
        self.stats_at(Utc::now()).await
    }

    pub async fn stats_at(&self, now: DateTime<Utc>) -> LifecycleStats {
        let tasks = self.tasks.lock().await;
        let mut totals: BTreeMap<TaskStatus, (usize, i64)> = BTreeMap::new();
        for task in tasks.values() {
            let entry = totals.entry(task.state).or_default();
            entry.0 += 1;
            entry.1 += (now - task.entered_at).num_milliseconds();
        }
        let by_state = totals
            .into_iter()
            .map(|(state, (count, sum_ms))| {
                let mean = sum_ms / count.max(1) as i64;
                (
                    state,
                    StateStats {
                        count,
                        mean_time_in_state_ms: mean,
                    },
                )
            })
            .collect();
        LifecycleStats {
            total_tasks: tasks.len(),
            by_state,
        }
    }

    /// Check a planned sequence of states against the table without touching any task.
    pub fn validate_workflow_path(&self, path: &[TaskStatus]) -> PathValidation {
        let violations: Vec<PathViolation> = path
            .windows(2)
            .enumerate()
            .filter(|(_, pair)| !self.is_valid_transition(pair[0], pair[1]))
            .map(|(index, pair)| PathViolation {
                index,
                from: pair[0],
                to: pair[1],
            })
            .collect();
        PathValidation {
            valid: violations.is_empty(),
            violations,
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Default for LifecycleMachine {
    fn default() -> Self {
        Self::new(true)
    }
}
