//! SQLite persistence layer.
//!
//! This module provides storage for:
//! - Workflow instances and their status transitions
//! - The append-only event log (replay order = ascending ordinal)
//! - The task queue with atomic claims for worker dispatch
//! - The durable per-workflow log sink
//!
//! Every mutating operation either fully succeeds or has no effect. Step
//! effects are flushed through [`CommitBatch`], which lands events, task
//! enqueues, log lines, and the status transition in one transaction, so a
//! crash between user code and the flush simply re-runs the step.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::types::Json;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::events::{
    EventRecord, LogLevel, StateMap, TaskKind, TaskStatus, WorkflowEvent, WorkflowStatus,
};

/// Attempt budget for STEP tasks enqueued where no policy is in scope
/// (signal delivery); matches the default retry count of 3 plus the first
/// attempt.
const DEFAULT_STEP_MAX_ATTEMPTS: i64 = 4;

/// A workflow row.
#[derive(Debug, Clone)]
pub struct WorkflowRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    pub module: Option<String>,
    pub status: WorkflowStatus,
    pub input: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task row.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    pub workflow_id: String,
    pub kind: TaskKind,
    pub target: String,
    pub run_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A durable workflow log line.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub id: i64,
    pub workflow_id: String,
    pub level: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// A task to enqueue.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: String,
    pub kind: TaskKind,
    pub target: String,
    pub run_at: DateTime<Utc>,
    pub max_attempts: i64,
}

impl NewTask {
    /// Driver task that resumes replay of a workflow. Deduplicated at
    /// insert: a workflow never carries two live STEP tasks.
    pub fn step(definition_name: &str, now: DateTime<Utc>, max_attempts: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: TaskKind::Step,
            target: definition_name.to_string(),
            run_at: now,
            max_attempts,
        }
    }

    /// Execution task for a scheduled activity; the task id doubles as the
    /// claim unit for retries.
    pub fn activity(activity_id: &str, now: DateTime<Utc>, max_attempts: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: TaskKind::Activity,
            target: activity_id.to_string(),
            run_at: now,
            max_attempts,
        }
    }

    /// Wakeup task that fires a scheduled timer; not dispatchable before
    /// `fire_at`.
    pub fn timer(timer_id: &str, fire_at: DateTime<Utc>, max_attempts: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: TaskKind::Timer,
            target: timer_id.to_string(),
            run_at: fire_at,
            max_attempts,
        }
    }
}

/// A workflow to create (top-level or child).
#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub id: String,
    pub name: String,
    pub version: String,
    pub module: Option<String>,
    pub input: Value,
    pub initial_state: StateMap,
    /// max_attempts stamped on the initial STEP task.
    pub step_max_attempts: i64,
}

/// A buffered log line.
#[derive(Debug, Clone)]
pub struct NewLog {
    pub level: LogLevel,
    pub message: String,
}

/// The observable effects of one step invocation, applied atomically.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    pub workflow_id: String,
    pub events: Vec<WorkflowEvent>,
    pub tasks: Vec<NewTask>,
    pub logs: Vec<NewLog>,
    pub children: Vec<NewWorkflow>,
    pub status: Option<WorkflowStatus>,
    /// Driving task to mark COMPLETED in the same transaction.
    pub complete_task: Option<String>,
    /// Task to mark FAILED in the same transaction (terminal activity
    /// failure keeps its task row and failure event consistent).
    pub fail_task: Option<(String, String)>,
}

impl CommitBatch {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            events: Vec::new(),
            tasks: Vec::new(),
            logs: Vec::new(),
            children: Vec::new(),
            status: None,
            complete_task: None,
            fail_task: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.tasks.is_empty()
            && self.logs.is_empty()
            && self.children.is_empty()
            && self.status.is_none()
            && self.complete_task.is_none()
            && self.fail_task.is_none()
    }
}

/// Handle to the embedded store. Cheap to clone; clones share the pool.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `path` and bring the
    /// schema up to date.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a workflow: insert the RUNNING row, append
    /// `WORKFLOW_STARTED`, and enqueue the initial STEP task, in one
    /// transaction.
    pub async fn create_workflow(&self, workflow: &NewWorkflow) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        insert_workflow(&mut tx, workflow, now).await?;
        tx.commit().await?;
        debug!(workflow_id = %workflow.id, name = %workflow.name, "workflow created");
        Ok(())
    }

    pub async fn load_workflow(&self, workflow_id: &str) -> Result<WorkflowRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => workflow_from_row(&row),
            None => Err(StoreError::WorkflowNotFound(workflow_id.to_string())),
        }
    }

    /// Status-only probe, cheaper than [`Store::load_workflow`].
    pub async fn workflow_status(&self, workflow_id: &str) -> Result<WorkflowStatus, StoreError> {
        let row = sqlx::query("SELECT status FROM workflows WHERE id = ?1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get("status")?),
            None => Err(StoreError::WorkflowNotFound(workflow_id.to_string())),
        }
    }

    /// Full ordered history of a workflow.
    pub async fn load_history(&self, workflow_id: &str) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, workflow_id, type, payload, created_at
             FROM events
             WHERE workflow_id = ?1
             ORDER BY id ASC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    /// Flush a step's observable effects atomically.
    ///
    /// If the workflow reached a terminal status in the meantime (for
    /// example a concurrent cancel, or an activity completing after the
    /// workflow failed), the batch's events and enqueues are dropped and
    /// only the task bookkeeping is applied, preserving the invariant that
    /// nothing follows a terminal event.
    pub async fn apply_batch(&self, batch: CommitBatch) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let status: Option<WorkflowStatus> =
            sqlx::query("SELECT status FROM workflows WHERE id = ?1")
                .bind(&batch.workflow_id)
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.try_get("status"))
                .transpose()?;
        let status = status.ok_or_else(|| StoreError::WorkflowNotFound(batch.workflow_id.clone()))?;

        if status.is_terminal() {
            if let Some(task_id) = &batch.complete_task {
                mark_task(&mut tx, task_id, TaskStatus::Completed, None, now).await?;
            }
            if let Some((task_id, error)) = &batch.fail_task {
                mark_task(&mut tx, task_id, TaskStatus::Failed, Some(error), now).await?;
            }
            tx.commit().await?;
            debug!(workflow_id = %batch.workflow_id, %status, "dropped batch for terminal workflow");
            return Ok(());
        }

        for child in &batch.children {
            insert_workflow(&mut tx, child, now).await?;
        }
        for event in &batch.events {
            insert_event(&mut tx, &batch.workflow_id, event, now).await?;
        }
        for task in &batch.tasks {
            insert_task(&mut tx, &batch.workflow_id, task, now).await?;
        }
        for log in &batch.logs {
            insert_log(&mut tx, &batch.workflow_id, log.level.as_str(), &log.message, now).await?;
        }

        if let Some(new_status) = batch.status {
            sqlx::query(
                "UPDATE workflows SET status = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'RUNNING'",
            )
            .bind(new_status)
            .bind(now)
            .bind(&batch.workflow_id)
            .execute(&mut *tx)
            .await?;

            // A workflow that failed or was cancelled drains its queue.
            if matches!(new_status, WorkflowStatus::Failed | WorkflowStatus::Cancelled) {
                fail_pending_tasks(&mut tx, &batch.workflow_id, new_status, now).await?;
            }
        }

        if let Some(task_id) = &batch.complete_task {
            mark_task(&mut tx, task_id, TaskStatus::Completed, None, now).await?;
        }
        if let Some((task_id, error)) = &batch.fail_task {
            mark_task(&mut tx, task_id, TaskStatus::Failed, Some(error), now).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Atomically claim the next runnable task: the oldest PENDING task
    /// whose `run_at` has passed, skipping any task whose workflow already
    /// has a RUNNING STEP task (a STEP driver serializes all work on its
    /// workflow). The claim marks the task RUNNING, increments its attempt
    /// counter, and stamps the claiming worker, all in one statement.
    pub async fn claim_next_task(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query(
            "UPDATE tasks SET
                 status = 'RUNNING',
                 attempts = attempts + 1,
                 claimed_by = ?1,
                 updated_at = ?2
             WHERE id = (
                 SELECT t.id FROM tasks t
                 WHERE t.status = 'PENDING'
                   AND t.run_at <= ?3
                   AND NOT EXISTS (
                       SELECT 1 FROM tasks r
                       WHERE r.workflow_id = t.workflow_id
                         AND r.kind = 'STEP'
                         AND r.status = 'RUNNING'
                   )
                 ORDER BY t.run_at ASC, t.created_at ASC
                 LIMIT 1
             )
             RETURNING *",
        )
        .bind(worker_id)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    /// Renew the claim on an in-flight task by touching `updated_at`.
    /// Returns false when the task is no longer RUNNING under this worker
    /// (finished, failed, or reclaimed), telling the caller to stop
    /// renewing.
    pub async fn heartbeat_task(
        &self,
        task_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET updated_at = ?1
             WHERE id = ?2 AND status = 'RUNNING' AND claimed_by = ?3",
        )
        .bind(now)
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Return tasks stranded in RUNNING by a crashed worker to PENDING.
    /// A live claimer renews its lease through [`Store::heartbeat_task`],
    /// so only tasks whose worker stopped heartbeating go stale. The
    /// attempt already counted at claim time stays counted, so a task
    /// that keeps stranding eventually exhausts `max_attempts`.
    pub async fn release_stale_tasks(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<u64, StoreError> {
        let cutoff = now
            - chrono::Duration::from_std(stale_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let result = sqlx::query(
            "UPDATE tasks SET status = 'PENDING', claimed_by = NULL, updated_at = ?1
             WHERE status = 'RUNNING' AND updated_at < ?2",
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            debug!(released = result.rows_affected(), "released stale tasks");
        }
        Ok(result.rows_affected())
    }

    pub async fn complete_task(&self, task_id: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        mark_task(&mut tx, task_id, TaskStatus::Completed, None, now).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Record a failed attempt. With `retry_at`, the task returns to
    /// PENDING for a later dispatch; without, it is terminally FAILED.
    pub async fn fail_task(
        &self,
        task_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        match retry_at {
            Some(run_at) => {
                sqlx::query(
                    "UPDATE tasks SET status = 'PENDING', run_at = ?1, last_error = ?2,
                         updated_at = ?3
                     WHERE id = ?4 AND status = 'RUNNING'",
                )
                .bind(run_at)
                .bind(error)
                .bind(now)
                .bind(task_id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                let mut tx = self.pool.begin().await?;
                mark_task(&mut tx, task_id, TaskStatus::Failed, Some(error), now).await?;
                tx.commit().await?;
            }
        }
        Ok(())
    }

    /// Deliver an external signal: append `SIGNAL_RECEIVED` and make sure a
    /// STEP task exists to resume the workflow. Rejected for workflows that
    /// are not RUNNING.
    pub async fn append_signal(
        &self,
        workflow_id: &str,
        name: &str,
        payload: Value,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let workflow = fetch_workflow_for_update(&mut tx, workflow_id).await?;
        if workflow.status != WorkflowStatus::Running {
            return Err(StoreError::WorkflowNotRunning {
                id: workflow_id.to_string(),
                status: workflow.status,
            });
        }

        let event = WorkflowEvent::SignalReceived {
            name: name.to_string(),
            payload,
        };
        insert_event(&mut tx, workflow_id, &event, now).await?;
        insert_task(
            &mut tx,
            workflow_id,
            &NewTask::step(&workflow.name, now, DEFAULT_STEP_MAX_ATTEMPTS),
            now,
        )
        .await?;

        tx.commit().await?;
        debug!(workflow_id, signal = name, "signal appended");
        Ok(())
    }

    /// Cancel a workflow: append `WORKFLOW_CANCELLED`, mark the row
    /// CANCELLED, and fail its pending tasks. A no-op on workflows already
    /// in a terminal state.
    pub async fn cancel_workflow(&self, workflow_id: &str, reason: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let workflow = fetch_workflow_for_update(&mut tx, workflow_id).await?;
        if workflow.status.is_terminal() {
            return Ok(());
        }

        let event = WorkflowEvent::WorkflowCancelled {
            reason: reason.to_string(),
        };
        insert_event(&mut tx, workflow_id, &event, now).await?;
        sqlx::query(
            "UPDATE workflows SET status = 'CANCELLED', updated_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(workflow_id)
        .execute(&mut *tx)
        .await?;
        fail_pending_tasks(&mut tx, workflow_id, WorkflowStatus::Cancelled, now).await?;

        tx.commit().await?;
        debug!(workflow_id, reason, "workflow cancelled");
        Ok(())
    }

    /// Standalone durable log write, outside any batch.
    pub async fn append_log(
        &self,
        workflow_id: &str,
        level: LogLevel,
        message: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        insert_log(&mut tx, workflow_id, level.as_str(), message, now).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
        limit: i64,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM workflows WHERE status = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )
                .bind(status)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM workflows ORDER BY created_at DESC LIMIT ?1")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(workflow_from_row).collect()
    }

    pub async fn list_tasks(&self, workflow_id: &str) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE workflow_id = ?1 ORDER BY created_at ASC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    pub async fn list_logs(&self, workflow_id: &str) -> Result<Vec<LogRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, workflow_id, level, message, created_at
             FROM logs WHERE workflow_id = ?1 ORDER BY id ASC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(LogRecord {
                    id: row.try_get("id")?,
                    workflow_id: row.try_get("workflow_id")?,
                    level: row.try_get("level")?,
                    message: row.try_get("message")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}

// === Transaction helpers ===

struct WorkflowHead {
    name: String,
    status: WorkflowStatus,
}

async fn fetch_workflow_for_update(
    tx: &mut Transaction<'_, Sqlite>,
    workflow_id: &str,
) -> Result<WorkflowHead, StoreError> {
    let row = sqlx::query("SELECT name, status FROM workflows WHERE id = ?1")
        .bind(workflow_id)
        .fetch_optional(&mut **tx)
        .await?;
    match row {
        Some(row) => Ok(WorkflowHead {
            name: row.try_get("name")?,
            status: row.try_get("status")?,
        }),
        None => Err(StoreError::WorkflowNotFound(workflow_id.to_string())),
    }
}

async fn insert_workflow(
    tx: &mut Transaction<'_, Sqlite>,
    workflow: &NewWorkflow,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO workflows (id, name, version, module, status, input, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'RUNNING', ?5, ?6, ?7)",
    )
    .bind(&workflow.id)
    .bind(&workflow.name)
    .bind(&workflow.version)
    .bind(&workflow.module)
    .bind(Json(&workflow.input))
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    let started = WorkflowEvent::WorkflowStarted {
        input: workflow.input.clone(),
        initial_state: workflow.initial_state.clone(),
    };
    insert_event(tx, &workflow.id, &started, now).await?;
    insert_task(
        tx,
        &workflow.id,
        &NewTask::step(&workflow.name, now, workflow.step_max_attempts),
        now,
    )
    .await?;
    Ok(())
}

async fn insert_event(
    tx: &mut Transaction<'_, Sqlite>,
    workflow_id: &str,
    event: &WorkflowEvent,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let payload = event.payload()?;
    match event {
        // At most one terminal outcome per activity: if two claimers race
        // the same activity (a reclaimed lease), the second commit is a
        // no-op instead of a duplicate completion.
        WorkflowEvent::ActivityCompleted { activity_id, .. }
        | WorkflowEvent::ActivityFailed { activity_id, .. } => {
            sqlx::query(
                "INSERT INTO events (workflow_id, type, payload, created_at)
                 SELECT ?1, ?2, ?3, ?4
                 WHERE NOT EXISTS (
                     SELECT 1 FROM events
                     WHERE workflow_id = ?1
                       AND type IN ('ACTIVITY_COMPLETED', 'ACTIVITY_FAILED')
                       AND payload ->> 'activity_id' = ?5
                 )",
            )
            .bind(workflow_id)
            .bind(event.event_type())
            .bind(Json(payload))
            .bind(now)
            .bind(activity_id)
            .execute(&mut **tx)
            .await?;
        }
        // A timer fires once, for the same reason.
        WorkflowEvent::TimerFired { timer_id } => {
            sqlx::query(
                "INSERT INTO events (workflow_id, type, payload, created_at)
                 SELECT ?1, ?2, ?3, ?4
                 WHERE NOT EXISTS (
                     SELECT 1 FROM events
                     WHERE workflow_id = ?1
                       AND type = 'TIMER_FIRED'
                       AND payload ->> 'timer_id' = ?5
                 )",
            )
            .bind(workflow_id)
            .bind(event.event_type())
            .bind(Json(payload))
            .bind(now)
            .bind(timer_id)
            .execute(&mut **tx)
            .await?;
        }
        _ => {
            sqlx::query(
                "INSERT INTO events (workflow_id, type, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(workflow_id)
            .bind(event.event_type())
            .bind(Json(payload))
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

async fn insert_task(
    tx: &mut Transaction<'_, Sqlite>,
    workflow_id: &str,
    task: &NewTask,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    match task.kind {
        // A STEP enqueue is skipped when the workflow already has a live
        // driver (invariant: one STEP task per RUNNING workflow).
        TaskKind::Step => {
            sqlx::query(
                "INSERT INTO tasks (id, workflow_id, kind, target, run_at, status,
                                    attempts, max_attempts, created_at, updated_at)
                 SELECT ?1, ?2, 'STEP', ?3, ?4, 'PENDING', 0, ?5, ?6, ?6
                 WHERE NOT EXISTS (
                     SELECT 1 FROM tasks
                     WHERE workflow_id = ?2
                       AND kind = 'STEP'
                       AND status IN ('PENDING', 'RUNNING')
                 )",
            )
            .bind(&task.id)
            .bind(workflow_id)
            .bind(&task.target)
            .bind(task.run_at)
            .bind(task.max_attempts)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
        TaskKind::Activity | TaskKind::Timer => {
            sqlx::query(
                "INSERT INTO tasks (id, workflow_id, kind, target, run_at, status,
                                    attempts, max_attempts, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', 0, ?6, ?7, ?7)",
            )
            .bind(&task.id)
            .bind(workflow_id)
            .bind(task.kind)
            .bind(&task.target)
            .bind(task.run_at)
            .bind(task.max_attempts)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

async fn insert_log(
    tx: &mut Transaction<'_, Sqlite>,
    workflow_id: &str,
    level: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO logs (workflow_id, level, message, created_at) VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(workflow_id)
    .bind(level)
    .bind(message)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn mark_task(
    tx: &mut Transaction<'_, Sqlite>,
    task_id: &str,
    status: TaskStatus,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE tasks SET status = ?1, last_error = COALESCE(?2, last_error), updated_at = ?3
         WHERE id = ?4 AND status = 'RUNNING'",
    )
    .bind(status)
    .bind(error)
    .bind(now)
    .bind(task_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn fail_pending_tasks(
    tx: &mut Transaction<'_, Sqlite>,
    workflow_id: &str,
    status: WorkflowStatus,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let reason = match status {
        WorkflowStatus::Cancelled => "workflow cancelled",
        _ => "workflow failed",
    };
    sqlx::query(
        "UPDATE tasks SET status = 'FAILED', last_error = ?1, updated_at = ?2
         WHERE workflow_id = ?3 AND status = 'PENDING'",
    )
    .bind(reason)
    .bind(now)
    .bind(workflow_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// === Row decoding ===

fn workflow_from_row(row: &SqliteRow) -> Result<WorkflowRecord, StoreError> {
    let input: Json<Value> = row.try_get("input")?;
    Ok(WorkflowRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        module: row.try_get("module")?,
        status: row.try_get("status")?,
        input: input.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<TaskRecord, StoreError> {
    Ok(TaskRecord {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        kind: row.try_get("kind")?,
        target: row.try_get("target")?,
        run_at: row.try_get("run_at")?,
        status: row.try_get("status")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        last_error: row.try_get("last_error")?,
        claimed_by: row.try_get("claimed_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<EventRecord, StoreError> {
    let event_type: String = row.try_get("type")?;
    let payload: Json<Value> = row.try_get("payload")?;
    let event = WorkflowEvent::from_parts(&event_type, payload.0)?;
    Ok(EventRecord {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        event,
        created_at: row.try_get("created_at")?,
    })
}
