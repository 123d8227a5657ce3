//! Replay engine: drives workflow runs and executes activity/timer tasks.
//!
//! `run_step` re-executes a workflow's steps against its stored history.
//! Completed steps are fast-skipped via their `STEP_COMPLETED` markers;
//! the first incomplete step runs for real, with every context call either
//! replaying a recorded event or buffering a new one. Effects land
//! atomically at step boundaries and at suspension, so a crash anywhere
//! in between re-runs the step without duplicating anything.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::StepContext;
use crate::error::{EngineError, StepError};
use crate::events::{TaskKind, WorkflowEvent};
use crate::registry::Registry;
use crate::store::{CommitBatch, NewTask, Store, TaskRecord};

pub struct ReplayEngine {
    store: Store,
    registry: Arc<Registry>,
    config: Config,
}

impl ReplayEngine {
    pub fn new(store: Store, registry: Arc<Registry>, config: Config) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Execute a claimed STEP task: replay the workflow to its first
    /// unrecorded decision and advance it as far as it will go.
    pub async fn run_step(&self, task: &TaskRecord) -> Result<(), EngineError> {
        let workflow = self.store.load_workflow(&task.workflow_id).await?;
        if workflow.status.is_terminal() {
            // Stale driver for a finished workflow; drain it.
            self.store.complete_task(&task.id).await?;
            return Ok(());
        }

        let definition = self
            .registry
            .get_workflow(&workflow.name, &workflow.version)
            .ok_or_else(|| EngineError::DefinitionNotFound {
                name: workflow.name.clone(),
                version: workflow.version.clone(),
            })?;

        let history = self.store.load_history(&workflow.id).await?;
        let events: Vec<WorkflowEvent> = history.into_iter().map(|record| record.event).collect();
        let ctx = StepContext::new(
            workflow.id.clone(),
            workflow.input.clone(),
            events,
            Arc::clone(&self.registry),
            self.config.clone(),
        );
        ctx.consume_started();

        for step in definition.steps() {
            if ctx.fast_forward_past(&step.name) {
                continue;
            }
            debug!(
                workflow_id = %workflow.id,
                step = %step.name,
                replaying = ctx.is_replaying(),
                "entering step"
            );

            match step.run(ctx.clone()).await {
                Ok(()) => {
                    // Step boundary: flush its effects together with the
                    // completion marker. The driver task stays RUNNING so
                    // no one else claims this workflow mid-flight.
                    let mut batch = ctx.take_batch();
                    batch.events.push(WorkflowEvent::StepCompleted {
                        step_name: step.name.clone(),
                    });
                    self.store.apply_batch(batch).await?;
                }
                Err(StepError::Suspended) => {
                    let mut batch = ctx.take_batch();
                    batch.complete_task = Some(task.id.clone());
                    self.store.apply_batch(batch).await?;
                    debug!(
                        workflow_id = %workflow.id,
                        step = %step.name,
                        "workflow blocked awaiting external progress"
                    );
                    return Ok(());
                }
                Err(err) => {
                    // Everything else is terminal for the workflow: an
                    // escaped activity failure, a determinism violation, or
                    // a plain bug in step code. The step's partial effects
                    // are discarded; only the failure is recorded.
                    let error = err.to_string();
                    warn!(
                        workflow_id = %workflow.id,
                        step = %step.name,
                        %error,
                        "workflow failed"
                    );
                    ctx.take_batch();
                    let mut batch = CommitBatch::new(workflow.id.clone());
                    batch
                        .events
                        .push(WorkflowEvent::WorkflowFailed { error });
                    batch.status = Some(crate::events::WorkflowStatus::Failed);
                    batch.complete_task = Some(task.id.clone());
                    self.store.apply_batch(batch).await?;
                    return Ok(());
                }
            }
        }

        let final_state = ctx.state_snapshot();
        let mut batch = ctx.take_batch();
        batch
            .events
            .push(WorkflowEvent::WorkflowCompleted { final_state });
        batch.status = Some(crate::events::WorkflowStatus::Completed);
        batch.complete_task = Some(task.id.clone());
        self.store.apply_batch(batch).await?;
        info!(workflow_id = %workflow.id, "workflow completed");
        Ok(())
    }

    /// Execute a claimed ACTIVITY task: invoke the registered handler under
    /// its timeout, then either record the completion and wake the workflow,
    /// requeue the task with backoff, or record the permanent failure.
    pub async fn run_activity(&self, task: &TaskRecord) -> Result<(), EngineError> {
        let workflow = self.store.load_workflow(&task.workflow_id).await?;
        let history = self.store.load_history(&task.workflow_id).await?;

        let activity_id = task.target.clone();
        let scheduled = history.iter().find_map(|record| match &record.event {
            WorkflowEvent::ActivityScheduled {
                activity_id: id,
                name,
                args,
                ..
            } if *id == activity_id => Some((name.clone(), args.clone())),
            _ => None,
        });
        let Some((name, args)) = scheduled else {
            return Err(EngineError::CorruptHistory {
                task_id: task.id.clone(),
                detail: format!("no ACTIVITY_SCHEDULED event for activity {activity_id}"),
            });
        };

        debug!(
            workflow_id = %task.workflow_id,
            activity = %name,
            attempt = task.attempts,
            "running activity"
        );

        let outcome = match self.registry.get_activity(&name) {
            Some(definition) => {
                let timeout = definition.timeout.unwrap_or(self.config.activity_timeout);
                match tokio::time::timeout(timeout, definition.invoke(args)).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(format!("{err:#}")),
                    Err(_) => Err(format!(
                        "activity '{name}' timed out after {}s",
                        timeout.as_secs()
                    )),
                }
            }
            None => Err(format!("activity '{name}' is not registered")),
        };

        match outcome {
            Ok(result) => {
                let mut batch = CommitBatch::new(task.workflow_id.clone());
                batch.events.push(WorkflowEvent::ActivityCompleted {
                    activity_id,
                    result,
                });
                batch
                    .tasks
                    .push(NewTask::step(&workflow.name, Utc::now(), self.step_max_attempts()));
                batch.complete_task = Some(task.id.clone());
                self.store.apply_batch(batch).await?;
            }
            Err(error) if task.attempts < task.max_attempts => {
                let retry_at = self
                    .config
                    .backoff()
                    .next_run_at(Utc::now(), task.attempts as u32);
                warn!(
                    workflow_id = %task.workflow_id,
                    activity = %name,
                    attempt = task.attempts,
                    max_attempts = task.max_attempts,
                    %error,
                    %retry_at,
                    "activity attempt failed; will retry"
                );
                self.store.fail_task(&task.id, &error, Some(retry_at)).await?;
            }
            Err(error) => {
                warn!(
                    workflow_id = %task.workflow_id,
                    activity = %name,
                    attempts = task.attempts,
                    %error,
                    "activity failed permanently"
                );
                let mut batch = CommitBatch::new(task.workflow_id.clone());
                batch.events.push(WorkflowEvent::ActivityFailed {
                    activity_id,
                    error: error.clone(),
                    attempts_used: task.attempts as u32,
                });
                // Wake the workflow so the awaiting step observes the failure.
                batch
                    .tasks
                    .push(NewTask::step(&workflow.name, Utc::now(), self.step_max_attempts()));
                batch.fail_task = Some((task.id.clone(), error));
                self.store.apply_batch(batch).await?;
            }
        }
        Ok(())
    }

    /// Execute a claimed TIMER task: record the firing and wake the
    /// workflow. Claims respect `run_at`, so the timer is due by now.
    pub async fn run_timer(&self, task: &TaskRecord) -> Result<(), EngineError> {
        let workflow = self.store.load_workflow(&task.workflow_id).await?;
        let mut batch = CommitBatch::new(task.workflow_id.clone());
        batch.events.push(WorkflowEvent::TimerFired {
            timer_id: task.target.clone(),
        });
        batch
            .tasks
            .push(NewTask::step(&workflow.name, Utc::now(), self.step_max_attempts()));
        batch.complete_task = Some(task.id.clone());
        self.store.apply_batch(batch).await?;
        debug!(workflow_id = %task.workflow_id, timer_id = %task.target, "timer fired");
        Ok(())
    }

    /// Dispatch a claimed task by kind.
    pub async fn run_task(&self, task: &TaskRecord) -> Result<(), EngineError> {
        match task.kind {
            TaskKind::Step => self.run_step(task).await,
            TaskKind::Activity => self.run_activity(task).await,
            TaskKind::Timer => self.run_timer(task).await,
        }
    }

    fn step_max_attempts(&self) -> i64 {
        self.config.activity_retry_count as i64 + 1
    }
}
