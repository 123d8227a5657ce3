//! Replay, crash-recovery, and queue-exclusion properties.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Value, json};
use tempfile::TempDir;

use loom::{
    ActivityDefinition, Client, CommitBatch, Config, Registry, RegistryBuilder, StateMap, TaskKind,
    TaskStatus, WorkflowDefinition, WorkflowEvent, WorkflowHandle, WorkflowStatus,
};

fn test_config() -> Config {
    Config {
        poll_interval: Duration::from_millis(10),
        activity_backoff_base: Duration::from_millis(1),
        activity_backoff_cap: Duration::from_millis(10),
        ..Config::default()
    }
}

async fn setup(registry: Arc<Registry>) -> (Client, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = Config {
        store_path: dir.path().join("loom.db"),
        ..test_config()
    };
    let client = Client::connect(registry, config).await.expect("connect");
    (client, dir)
}

async fn drive(client: &Client, handle: &WorkflowHandle) -> WorkflowStatus {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let ran = client.run_once().await.expect("run_once");
        let status = handle.status().await.expect("status");
        if status.is_terminal() {
            return status;
        }
        if !ran {
            assert!(Instant::now() < deadline, "workflow made no progress");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Registry whose single step greets via an activity and counts handler
/// invocations, so tests can prove the side effect ran exactly once.
fn counting_registry(calls: Arc<AtomicU32>) -> Arc<Registry> {
    RegistryBuilder::new()
        .register_activity(ActivityDefinition::new("greet", move |args: Vec<Value>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let name = args[0].as_str().unwrap_or_default().to_string();
                Ok(json!(format!("Hello, {name}")))
            }
        }))
        .unwrap()
        .register_workflow(greeting_workflow(json!("World")))
        .unwrap()
        .build()
}

fn greeting_workflow(arg: Value) -> WorkflowDefinition {
    WorkflowDefinition::new("hello", "1").step("greet", move |ctx| {
        let arg = arg.clone();
        async move {
            let greeting = ctx.activity("greet", vec![arg]).await?;
            ctx.state().set("greeting", greeting)?;
            Ok(())
        }
    })
}

// Crash recovery: the activity result is committed but the step has not
// completed. The re-dispatched STEP run must read the completion from
// history without invoking the activity again, then finish the step.
#[tokio::test]
async fn step_rerun_after_activity_commit_does_not_reexecute_the_activity() {
    let calls = Arc::new(AtomicU32::new(0));
    let (client, _dir) = setup(counting_registry(Arc::clone(&calls))).await;

    let handle = client
        .start("hello", "1", json!({}), StateMap::new())
        .await
        .unwrap();

    // dispatch 1: STEP schedules the activity and suspends
    assert!(client.run_once().await.unwrap());
    // dispatch 2: ACTIVITY appends ACTIVITY_COMPLETED and enqueues a STEP;
    // the worker "crashes" here, before that STEP ever runs
    assert!(client.run_once().await.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(handle.status().await.unwrap(), WorkflowStatus::Running);

    // recovery: a fresh dispatch replays the step from the top
    let status = drive(&client, &handle).await;
    assert_eq!(status, WorkflowStatus::Completed);

    // the handler never ran a second time and exactly one schedule exists
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let (_, events) = client.inspect(handle.id()).await.unwrap();
    let schedules = events
        .iter()
        .filter(|r| r.event.event_type() == "ACTIVITY_SCHEDULED")
        .count();
    assert_eq!(schedules, 1);
}

// Once committed, a step is never re-emitted: dispatching a forced extra
// STEP task for a completed workflow drains it with zero new events.
#[tokio::test]
async fn redispatch_after_completion_appends_nothing() {
    let calls = Arc::new(AtomicU32::new(0));
    let (client, _dir) = setup(counting_registry(calls)).await;

    let handle = client
        .start("hello", "1", json!({}), StateMap::new())
        .await
        .unwrap();
    drive(&client, &handle).await;

    let (_, events_before) = client.inspect(handle.id()).await.unwrap();

    // force a stale STEP task past the dedupe guard
    sqlx::query(
        "INSERT INTO tasks (id, workflow_id, kind, target, run_at, status,
                            attempts, max_attempts, created_at, updated_at)
         VALUES ('stale-step', ?1, 'STEP', 'hello', ?2, 'PENDING', 0, 1, ?2, ?2)",
    )
    .bind(handle.id())
    .bind(Utc::now())
    .execute(client.store().pool())
    .await
    .unwrap();

    assert!(client.run_once().await.unwrap());
    let stale = client.store().get_task("stale-step").await.unwrap().unwrap();
    assert_eq!(stale.status, TaskStatus::Completed);

    let (_, events_after) = client.inspect(handle.id()).await.unwrap();
    assert_eq!(events_after.len(), events_before.len());
}

// Append-only: ids, types, and payloads of already-recorded events never
// change as the workflow keeps progressing.
#[tokio::test]
async fn history_prefix_is_immutable_across_progress() {
    let calls = Arc::new(AtomicU32::new(0));
    let (client, _dir) = setup(counting_registry(calls)).await;

    let handle = client
        .start("hello", "1", json!({}), StateMap::new())
        .await
        .unwrap();

    assert!(client.run_once().await.unwrap());
    let (_, prefix) = client.inspect(handle.id()).await.unwrap();
    assert!(!prefix.is_empty());

    drive(&client, &handle).await;
    let (_, full) = client.inspect(handle.id()).await.unwrap();

    assert!(full.len() > prefix.len());
    for (before, after) in prefix.iter().zip(full.iter()) {
        assert_eq!(before.id, after.id);
        assert_eq!(before.event, after.event);
    }
}

// Determinism: the same history replayed twice produces the same decisions
// and no new writes (exercised by running the drive loop which replays the
// greet step twice), while changed step code fails the workflow.
#[tokio::test]
async fn changed_step_code_fails_with_non_determinism() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_activity = Arc::clone(&calls);
    let activity = move || {
        let calls = Arc::clone(&calls_in_activity);
        ActivityDefinition::new("greet", move |args: Vec<Value>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let name = args[0].as_str().unwrap_or_default().to_string();
                Ok(json!(format!("Hello, {name}")))
            }
        })
    };

    let registry_v1 = RegistryBuilder::new()
        .register_activity(activity())
        .unwrap()
        .register_workflow(greeting_workflow(json!("World")))
        .unwrap()
        .build();

    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        store_path: dir.path().join("loom.db"),
        ..test_config()
    };
    let client_v1 = Client::new(
        loom::Store::open(&config.store_path).await.unwrap(),
        registry_v1,
        config.clone(),
    );

    let handle = client_v1
        .start("hello", "1", json!({}), StateMap::new())
        .await
        .unwrap();
    // STEP schedules the activity, ACTIVITY completes it
    assert!(client_v1.run_once().await.unwrap());
    assert!(client_v1.run_once().await.unwrap());

    // "deploy" changed step code: same workflow name, different activity args
    let registry_v2 = RegistryBuilder::new()
        .register_activity(activity())
        .unwrap()
        .register_workflow(greeting_workflow(json!("Mars")))
        .unwrap()
        .build();
    let client_v2 = Client::new(client_v1.store().clone(), registry_v2, config);

    let handle_v2 = client_v2.handle(handle.id());
    let status = drive(&client_v2, &handle_v2).await;
    assert_eq!(status, WorkflowStatus::Failed);

    let err = handle_v2.try_result().await.unwrap_err();
    assert!(err.to_string().contains("non-deterministic"));

    // the failure event is final: nothing follows it
    let (_, events) = client_v2.inspect(handle.id()).await.unwrap();
    assert_eq!(events.last().unwrap().event.event_type(), "WORKFLOW_FAILED");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// At most one RUNNING STEP per workflow, and no activity claim races a
// running STEP driver.
#[tokio::test]
async fn claimer_refuses_second_claim_while_step_runs() {
    let calls = Arc::new(AtomicU32::new(0));
    let (client, _dir) = setup(counting_registry(calls)).await;

    let handle = client
        .start("hello", "1", json!({}), StateMap::new())
        .await
        .unwrap();
    let store = client.store();

    let claimed = store
        .claim_next_task("worker-a", Utc::now())
        .await
        .unwrap()
        .expect("initial STEP task");
    assert_eq!(claimed.kind, TaskKind::Step);
    assert_eq!(claimed.claimed_by.as_deref(), Some("worker-a"));
    assert_eq!(claimed.attempts, 1);

    // force extra PENDING tasks for the same workflow past the dedupe guard
    for (id, kind, target) in [
        ("forced-step", "STEP", "hello"),
        ("forced-activity", "ACTIVITY", "act-1"),
    ] {
        sqlx::query(
            "INSERT INTO tasks (id, workflow_id, kind, target, run_at, status,
                                attempts, max_attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', 0, 1, ?5, ?5)",
        )
        .bind(id)
        .bind(handle.id())
        .bind(kind)
        .bind(target)
        .bind(Utc::now())
        .execute(store.pool())
        .await
        .unwrap();
    }

    // while the STEP is RUNNING nothing else for this workflow is claimable
    assert!(
        store
            .claim_next_task("worker-b", Utc::now())
            .await
            .unwrap()
            .is_none()
    );

    store.complete_task(&claimed.id).await.unwrap();
    let next = store
        .claim_next_task("worker-b", Utc::now())
        .await
        .unwrap()
        .expect("claimable after the driver finished");
    assert_eq!(next.claimed_by.as_deref(), Some("worker-b"));
}

// A task stranded in RUNNING by a dead worker is released back to PENDING
// once it goes stale, and the claim-time attempt stays counted.
#[tokio::test]
async fn stale_running_tasks_are_released_for_reclaim() {
    let calls = Arc::new(AtomicU32::new(0));
    let (client, _dir) = setup(counting_registry(calls)).await;

    let handle = client
        .start("hello", "1", json!({}), StateMap::new())
        .await
        .unwrap();
    let store = client.store();

    let claimed = store
        .claim_next_task("doomed-worker", Utc::now())
        .await
        .unwrap()
        .unwrap();

    // nothing stale yet
    assert_eq!(
        store
            .release_stale_tasks(Utc::now(), Duration::from_secs(60))
            .await
            .unwrap(),
        0
    );

    // pretend an hour passed since the claim
    let released = store
        .release_stale_tasks(Utc::now() + chrono::Duration::hours(1), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(released, 1);

    let task = store.get_task(&claimed.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 1);

    // and the workflow still runs to completion afterwards
    let status = drive(&client, &handle).await;
    assert_eq!(status, WorkflowStatus::Completed);
}

// A claimer that is still alive renews its lease through heartbeats, so
// the stale sweep never reclaims work that is merely slow.
#[tokio::test]
async fn heartbeat_renews_the_claim_of_in_flight_tasks() {
    let calls = Arc::new(AtomicU32::new(0));
    let (client, _dir) = setup(counting_registry(calls)).await;

    let handle = client
        .start("hello", "1", json!({}), StateMap::new())
        .await
        .unwrap();
    let store = client.store();

    let claimed = store
        .claim_next_task("worker-a", Utc::now())
        .await
        .unwrap()
        .unwrap();

    // only the claiming worker may renew
    assert!(
        !store
            .heartbeat_task(&claimed.id, "worker-b", Utc::now())
            .await
            .unwrap()
    );

    // the claimer renews while its slow handler is still executing, long
    // past the point the original claim would have gone stale
    let renewed_at = Utc::now() + chrono::Duration::seconds(3600);
    assert!(
        store
            .heartbeat_task(&claimed.id, "worker-a", renewed_at)
            .await
            .unwrap()
    );

    // a sweep that would have reclaimed the original claim finds nothing
    let released = store
        .release_stale_tasks(
            renewed_at + chrono::Duration::seconds(30),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
    assert_eq!(released, 0);
    let task = store.get_task(&claimed.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Running);

    // once heartbeats stop, the lease eventually expires
    let released = store
        .release_stale_tasks(renewed_at + chrono::Duration::hours(1), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(released, 1);

    // a task that is no longer RUNNING is not renewable
    assert!(
        !store
            .heartbeat_task(&claimed.id, "worker-a", Utc::now())
            .await
            .unwrap()
    );
}

// Even if a lease is lost and two claimers finish the same activity, only
// one terminal outcome event lands in history.
#[tokio::test]
async fn racing_completion_commits_keep_a_single_outcome() {
    let calls = Arc::new(AtomicU32::new(0));
    let (client, _dir) = setup(counting_registry(calls)).await;

    let handle = client
        .start("hello", "1", json!({}), StateMap::new())
        .await
        .unwrap();
    // STEP schedules the activity
    assert!(client.run_once().await.unwrap());

    let (_, events) = client.inspect(handle.id()).await.unwrap();
    let activity_id = events
        .iter()
        .find_map(|record| match &record.event {
            WorkflowEvent::ActivityScheduled { activity_id, .. } => Some(activity_id.clone()),
            _ => None,
        })
        .expect("scheduled activity");

    let store = client.store();
    let mut first = CommitBatch::new(handle.id());
    first.events.push(WorkflowEvent::ActivityCompleted {
        activity_id: activity_id.clone(),
        result: json!("first"),
    });
    store.apply_batch(first).await.unwrap();

    // the losing claimer commits late, once as a success and once as a
    // timeout failure; both are dropped
    let mut second = CommitBatch::new(handle.id());
    second.events.push(WorkflowEvent::ActivityCompleted {
        activity_id: activity_id.clone(),
        result: json!("second"),
    });
    store.apply_batch(second).await.unwrap();
    let mut late_failure = CommitBatch::new(handle.id());
    late_failure.events.push(WorkflowEvent::ActivityFailed {
        activity_id: activity_id.clone(),
        error: "late timeout".into(),
        attempts_used: 1,
    });
    store.apply_batch(late_failure).await.unwrap();

    let (_, events) = client.inspect(handle.id()).await.unwrap();
    let outcomes: Vec<_> = events
        .iter()
        .filter_map(|record| match &record.event {
            WorkflowEvent::ActivityCompleted { result, .. } => Some(result.clone()),
            WorkflowEvent::ActivityFailed { .. } => Some(json!("failed")),
            _ => None,
        })
        .collect();
    assert_eq!(outcomes, vec![json!("first")]);
}

// Timer tasks are not claimable before their fire time.
#[tokio::test]
async fn timer_tasks_wait_for_their_fire_time() {
    let registry = RegistryBuilder::new()
        .register_workflow(
            WorkflowDefinition::new("napper", "1").step("nap", |ctx| async move {
                ctx.sleep(Duration::from_secs(3600)).await?;
                Ok(())
            }),
        )
        .unwrap()
        .build();
    let (client, _dir) = setup(registry).await;

    let handle = client
        .start("napper", "1", json!({}), StateMap::new())
        .await
        .unwrap();

    // STEP schedules the far-future timer, then the queue is quiet
    assert!(client.run_once().await.unwrap());
    assert!(!client.run_once().await.unwrap());

    let tasks = client.store().list_tasks(handle.id()).await.unwrap();
    let timer = tasks.iter().find(|t| t.kind == TaskKind::Timer).unwrap();
    assert_eq!(timer.status, TaskStatus::Pending);
    assert!(timer.run_at > Utc::now() + chrono::Duration::minutes(55));
}
