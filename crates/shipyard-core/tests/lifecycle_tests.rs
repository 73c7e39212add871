// Lifecycle state machine: transition table, validation gates, observer
// events, stats and workflow-path pre-validation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use shipyard_core::lifecycle::{
    default_transitions, LifecycleEvent, LifecycleMachine, StateTransition, TaskStatus,
    TransitionContext, TransitionGuard, Validation,
};

use TaskStatus::*;

fn declared_edges() -> HashSet<(TaskStatus, TaskStatus)> {
    [
        (Todo, Researching),
        (Researching, InProgress),
        (InProgress, InReview),
        (InReview, QueueForPr),
        (InReview, InProgress),
        (QueueForPr, PrCreated),
        (PrCreated, ReadyForMerge),
        (PrCreated, PrFixesNeeded),
        (PrFixesNeeded, InReview),
        (ReadyForMerge, Completed),
        (Researching, Todo),
        (InProgress, Todo),
        (InReview, Todo),
        (QueueForPr, Todo),
        (PrCreated, Todo),
        (PrFixesNeeded, Todo),
        (ReadyForMerge, Todo),
    ]
    .into_iter()
    .collect()
}

/// Drive a fresh task to `target` along the happy path, satisfying every gate.
async fn drive_to(machine: &LifecycleMachine, task_id: &str, target: TaskStatus) {
    let path = [
        (Researching, json!({})),
        (InProgress, json!({"subtasks": ["a"]})),
        (InReview, json!({"implementationComplete": true})),
        (QueueForPr, json!({"issues": []})),
        (PrCreated, json!({"prNumber": 7})),
        (ReadyForMerge, json!({"ciPassed": true})),
        (Completed, json!({"merged": true})),
    ];
    if target == Todo {
        return;
    }
    for (state, ctx) in path {
        let out = machine
            .transition(task_id, state, &TransitionContext::from(ctx))
            .await;
        assert!(out.valid, "driving to {state}: {:?}", out.error);
        if state == target {
            return;
        }
    }
}

// =============================================================================
// Transition table
// =============================================================================

#[test]
fn test_transition_table_is_exhaustive() {
    let machine = LifecycleMachine::default();
    let edges = declared_edges();
    for from in TaskStatus::ALL {
        for to in TaskStatus::ALL {
            assert_eq!(
                machine.is_valid_transition(from, to),
                edges.contains(&(from, to)),
                "{from} -> {to}"
            );
        }
    }
    assert_eq!(default_transitions().len(), edges.len());
}

#[test]
fn test_completed_is_terminal() {
    let machine = LifecycleMachine::default();
    assert!(machine.available_transitions(Completed).is_empty());
    assert!(Completed.is_terminal());
    assert!(Todo.is_initial());
}

#[test]
fn test_abort_edges_have_no_validation() {
    for t in default_transitions().iter().filter(|t| t.to == Todo) {
        assert!(t.validation.is_none(), "{} -> todo", t.from);
        assert_eq!(t.phase, Some("abort"));
    }
}

// =============================================================================
// transition()
// =============================================================================

#[tokio::test]
async fn test_unknown_task_starts_at_todo() {
    let machine = LifecycleMachine::default();
    assert_eq!(machine.current_status("nope").await, Todo);
    assert!(machine.task_state("nope").await.is_none());
}

#[tokio::test]
async fn test_invalid_transition_leaves_state_unchanged() {
    let machine = LifecycleMachine::default();
    drive_to(&machine, "t1", InProgress).await;
    let before = machine.task_state("t1").await;

    for to in TaskStatus::ALL {
        if machine.is_valid_transition(InProgress, to) {
            continue;
        }
        let out = machine
            .transition("t1", to, &TransitionContext::new())
            .await;
        assert!(!out.valid);
        assert_eq!(
            out.error.as_deref(),
            Some(format!("Invalid transition from in_progress to {to}").as_str())
        );
        assert_eq!(machine.task_state("t1").await, before);
    }
}

#[tokio::test]
async fn test_failed_validation_does_not_mutate() {
    let machine = LifecycleMachine::new(true);
    drive_to(&machine, "t1", Researching).await;
    let before = machine.task_state("t1").await;

    let out = machine
        .transition("t1", InProgress, &TransitionContext::new().with("subtasks", json!([])))
        .await;
    assert!(!out.valid);
    assert!(out.error.unwrap().contains("subtask"));
    assert_eq!(machine.task_state("t1").await, before);
}

#[tokio::test]
async fn test_queue_for_pr_with_no_issues() {
    let machine = LifecycleMachine::new(true);
    drive_to(&machine, "t1", InReview).await;

    let out = machine
        .transition("t1", QueueForPr, &TransitionContext::from(json!({"issues": []})))
        .await;
    assert!(out.valid);
    assert!(out.warnings.is_empty());

    let state = machine.task_state("t1").await.unwrap();
    assert_eq!(state.state, QueueForPr);
    assert_eq!(state.previous_state, Some(InReview));
}

#[tokio::test]
async fn test_queue_for_pr_with_unresolved_issues_fails() {
    let machine = LifecycleMachine::new(true);
    drive_to(&machine, "t1", InReview).await;

    let out = machine
        .transition("t1", QueueForPr, &TransitionContext::from(json!({"issues": ["x"]})))
        .await;
    assert!(!out.valid);
    assert!(out.error.unwrap().contains("unresolved issues"));
    assert_eq!(machine.current_status("t1").await, InReview);
}

#[tokio::test]
async fn test_strict_mode_off_skips_validation_with_warning() {
    let machine = LifecycleMachine::new(false);
    drive_to(&machine, "t1", InReview).await;

    let out = machine
        .transition("t1", QueueForPr, &TransitionContext::from(json!({"issues": ["x"]})))
        .await;
    assert!(out.valid);
    assert_eq!(out.warnings.len(), 1);
    assert!(out.warnings[0].contains("strict mode"));
    assert_eq!(machine.current_status("t1").await, QueueForPr);
}

#[tokio::test]
async fn test_strict_mode_off_still_rejects_undeclared_edges() {
    let machine = LifecycleMachine::new(false);
    let out = machine
        .transition("t1", Completed, &TransitionContext::new())
        .await;
    assert!(!out.valid);
}

#[tokio::test]
async fn test_metadata_taken_from_context() {
    let machine = LifecycleMachine::default();
    let ctx = TransitionContext::new().with("metadata", json!({"agent": "a1"}));
    machine.transition("t1", Researching, &ctx).await;
    let state = machine.task_state("t1").await.unwrap();
    assert_eq!(state.metadata.get("agent"), Some(&json!("a1")));
}

#[tokio::test]
async fn test_abort_from_any_active_state() {
    let machine = LifecycleMachine::default();
    drive_to(&machine, "t1", PrCreated).await;
    let out = machine
        .transition("t1", Todo, &TransitionContext::new())
        .await;
    assert!(out.valid);
    let state = machine.task_state("t1").await.unwrap();
    assert_eq!(state.state, Todo);
    assert_eq!(state.previous_state, Some(PrCreated));
}

#[tokio::test]
async fn test_full_happy_path_and_reset() {
    let machine = LifecycleMachine::default();
    drive_to(&machine, "t1", Completed).await;
    assert_eq!(machine.current_status("t1").await, Completed);

    assert!(machine.reset("t1").await);
    assert!(!machine.reset("t1").await);
    assert_eq!(machine.current_status("t1").await, Todo);
    assert!(machine.tracked_tasks().await.is_empty());
}

// =============================================================================
// Observer events
// =============================================================================

#[tokio::test]
async fn test_events_are_tagged_by_kind() {
    let machine = LifecycleMachine::default();
    let mut rx = machine.subscribe();

    machine
        .transition("t1", Researching, &TransitionContext::new())
        .await;
    machine
        .transition("t1", InProgress, &TransitionContext::new())
        .await;
    machine
        .transition("t1", Completed, &TransitionContext::new())
        .await;

    let first = rx.recv().await.unwrap();
    assert_eq!(first.kind(), "state_changed");
    assert_eq!(
        first,
        LifecycleEvent::StateChanged {
            task_id: "t1".into(),
            from: Todo,
            to: Researching,
            phase: Some("research"),
        }
    );
    assert_eq!(rx.recv().await.unwrap().kind(), "validation_failed");
    let third = rx.recv().await.unwrap();
    assert_eq!(third.kind(), "invalid_transition");
    assert_eq!(third.task_id(), "t1");
}

// =============================================================================
// Stats and path validation
// =============================================================================

#[tokio::test]
async fn test_stats_count_and_mean_time() {
    let machine = LifecycleMachine::default();
    drive_to(&machine, "a", Researching).await;
    drive_to(&machine, "b", Researching).await;
    drive_to(&machine, "c", InProgress).await;

    let a = machine.task_state("a").await.unwrap().entered_at;
    let b = machine.task_state("b").await.unwrap().entered_at;
    let now = a.max(b) + chrono::Duration::milliseconds(1_000);
    let expected_mean = ((now - a).num_milliseconds() + (now - b).num_milliseconds()) / 2;

    let stats = machine.stats_at(now).await;
    assert_eq!(stats.total_tasks, 3);
    let researching = &stats.by_state[&Researching];
    assert_eq!(researching.count, 2);
    assert_eq!(researching.mean_time_in_state_ms, expected_mean);
    assert_eq!(stats.by_state[&InProgress].count, 1);
    assert!(!stats.by_state.contains_key(&InReview));
}

#[test]
fn test_validate_workflow_path_reports_every_violation() {
    let machine = LifecycleMachine::default();
    let ok = machine.validate_workflow_path(&[Todo, Researching, InProgress, InReview, InProgress]);
    assert!(ok.valid);

    let bad = machine.validate_workflow_path(&[Todo, InReview, QueueForPr, Completed]);
    assert!(!bad.valid);
    let indices: Vec<usize> = bad.violations.iter().map(|v| v.index).collect();
    assert_eq!(indices, vec![0, 2]);
    assert_eq!(bad.violations[1].from, QueueForPr);
    assert_eq!(bad.violations[1].to, Completed);

    assert!(machine.validate_workflow_path(&[]).valid);
    assert!(machine.validate_workflow_path(&[Completed]).valid);
}

// =============================================================================
// Async guards and per-task serialization
// =============================================================================

struct SlowGuard {
    calls: AtomicUsize,
}

#[async_trait]
impl TransitionGuard for SlowGuard {
    async fn check(&self, ctx: &TransitionContext) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.flag("allow")
    }
}

fn slow_machine(guard: Arc<SlowGuard>) -> LifecycleMachine {
    LifecycleMachine::with_transitions(
        vec![
            StateTransition {
                from: Todo,
                to: Researching,
                phase: Some("research"),
                validation: Some(Validation::Async(guard)),
                error_message: Some("not allowed"),
            },
            StateTransition {
                from: Researching,
                to: Todo,
                phase: Some("abort"),
                validation: None,
                error_message: None,
            },
        ],
        true,
    )
}

#[tokio::test]
async fn test_async_guard_gates_transition() {
    let guard = Arc::new(SlowGuard {
        calls: AtomicUsize::new(0),
    });
    let machine = slow_machine(Arc::clone(&guard));

    let denied = machine
        .transition("t1", Researching, &TransitionContext::new())
        .await;
    assert_eq!(denied.error.as_deref(), Some("not allowed"));

    let allowed = machine
        .transition("t1", Researching, &TransitionContext::new().with("allow", true))
        .await;
    assert!(allowed.valid);
    assert_eq!(guard.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_concurrent_transitions_on_same_task_are_serialized() {
    let guard = Arc::new(SlowGuard {
        calls: AtomicUsize::new(0),
    });
    let machine = Arc::new(slow_machine(Arc::clone(&guard)));
    let ctx = TransitionContext::new().with("allow", true);

    let (a, b) = tokio::join!(
        machine.transition("t1", Researching, &ctx),
        machine.transition("t1", Researching, &ctx),
    );

    // The second caller observes the first one's write, so researching ->
    // researching is rejected as undeclared.
    assert_eq!([a.valid, b.valid].iter().filter(|v| **v).count(), 1);
    let loser = if a.valid { &b } else { &a };
    assert!(loser.error.as_deref().unwrap().contains("Invalid transition"));
    assert_eq!(guard.calls.load(Ordering::SeqCst), 1);
    assert_eq!(machine.locked_tasks().await, 0);
}

#[tokio::test]
async fn test_task_locks_are_released_after_use() {
    let machine = LifecycleMachine::new(true);
    let ctx = TransitionContext::new();
    for i in 0..50 {
        let task = format!("task-{i}");
        machine.transition(&task, Researching, &ctx).await;
        machine.transition(&task, Completed, &ctx).await;
    }
    assert_eq!(machine.locked_tasks().await, 0);

    assert!(machine.reset("task-0").await);
    assert!(!machine.reset("never-seen").await);
    assert_eq!(machine.locked_tasks().await, 0);
    assert_eq!(machine.tracked_tasks().await.len(), 49);
}

#[tokio::test]
async fn test_unrelated_tasks_do_not_contend() {
    let guard = Arc::new(SlowGuard {
        calls: AtomicUsize::new(0),
    });
    let machine = slow_machine(Arc::clone(&guard));
    let ctx = TransitionContext::new().with("allow", true);

    let (a, b) = tokio::join!(
        machine.transition("t1", Researching, &ctx),
        machine.transition("t2", Researching, &ctx),
    );
    assert!(a.valid && b.valid);
    assert_eq!(machine.tracked_tasks().await.len(), 2);
}
