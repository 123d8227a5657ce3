//! Per-run execution context handed to workflow step code.
//!
//! The context owns the replay cursor over a workflow's event history.
//! Every non-deterministic operation a step performs must flow through it:
//! activity invocation, timers, signal waits, state mutation, child
//! workflow spawns, and logging. While unconsumed history remains ahead of
//! the cursor the context is *replaying*: each call is checked against the
//! recorded event and answered from it, and side outputs are suppressed.
//! Once the cursor passes the end of history the context is *live*: calls
//! buffer their events and task enqueues into a [`CommitBatch`] that the
//! engine flushes atomically at step boundaries and suspension points.
//!
//! Suspension is signalled with [`StepError::Suspended`]; step code
//! propagates it with `?` and must never convert or swallow it.
//!
//! The context is a cheap clone over shared interior state, so step
//! closures take it by value. One step body runs at a time per workflow;
//! the lock is never held across an await.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::StepError;
use crate::events::{LogLevel, StateMap, WorkflowEvent, fold_state};
use crate::registry::Registry;
use crate::store::{CommitBatch, NewLog, NewTask, NewWorkflow};

/// Execution context for one replay pass over one workflow.
#[derive(Clone)]
pub struct StepContext {
    inner: Arc<Mutex<ContextInner>>,
}

struct ContextInner {
    workflow_id: String,
    input: Value,
    history: Vec<WorkflowEvent>,
    cursor: usize,
    consumed_signals: HashSet<usize>,
    state: StateMap,
    batch: CommitBatch,
    registry: Arc<Registry>,
    config: Config,
}

impl StepContext {
    pub(crate) fn new(
        workflow_id: String,
        input: Value,
        history: Vec<WorkflowEvent>,
        registry: Arc<Registry>,
        config: Config,
    ) -> Self {
        let state = fold_state(&history);
        let batch = CommitBatch::new(workflow_id.clone());
        Self {
            inner: Arc::new(Mutex::new(ContextInner {
                workflow_id,
                input,
                history,
                cursor: 0,
                consumed_signals: HashSet::new(),
                state,
                batch,
                registry,
                config,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ContextInner> {
        self.inner.lock().expect("step context lock poisoned")
    }

    pub fn workflow_id(&self) -> String {
        self.lock().workflow_id.clone()
    }

    /// Immutable workflow input as recorded at creation.
    pub fn input(&self) -> Value {
        self.lock().input.clone()
    }

    /// True while unconsumed history remains ahead of the cursor. Side
    /// outputs fire only when this is false.
    pub fn is_replaying(&self) -> bool {
        let inner = self.lock();
        inner.next_meaningful_from(inner.cursor).is_some()
    }

    /// Invoke an activity, or replay its recorded outcome.
    ///
    /// During replay the next recorded schedule must match `(name, args)`
    /// exactly; anything else is a non-determinism failure. If the matching
    /// completion is recorded its result is returned (or, for a permanent
    /// failure, [`StepError::ActivityFailed`] is raised). With no
    /// completion yet, or on first encounter, the step suspends.
    pub async fn activity(&self, name: &str, args: Vec<Value>) -> Result<Value, StepError> {
        self.lock().activity(name, args)
    }

    /// Durable sleep. The fire time is computed once, on first encounter,
    /// and replayed from history afterwards.
    pub async fn sleep(&self, duration: Duration) -> Result<(), StepError> {
        self.lock().sleep(duration)
    }

    /// Wait for a named external signal. Signals may land in history while
    /// the workflow is blocked elsewhere, so the whole history is scanned
    /// for the first unconsumed `SIGNAL_RECEIVED` with this name.
    pub async fn wait_for_signal(&self, name: &str) -> Result<Value, StepError> {
        self.lock().wait_for_signal(name)
    }

    /// Spawn a child workflow and return its id. The id is recorded in
    /// history, so replays observe the same child.
    pub async fn start_child_workflow(
        &self,
        name: &str,
        version: &str,
        input: Value,
        initial_state: StateMap,
    ) -> Result<String, StepError> {
        self.lock()
            .start_child_workflow(name, version, input, initial_state)
    }

    /// Handle for state reads and durable state mutation.
    pub fn state(&self) -> StateHandle {
        StateHandle { ctx: self.clone() }
    }

    /// Handle for durable, replay-suppressed workflow logging.
    pub fn logger(&self) -> WorkflowLogger {
        WorkflowLogger { ctx: self.clone() }
    }

    // === Engine-side hooks ===

    /// Consume the leading `WORKFLOW_STARTED` event.
    pub(crate) fn consume_started(&self) {
        let mut inner = self.lock();
        if matches!(
            inner.history.get(inner.cursor),
            Some(WorkflowEvent::WorkflowStarted { .. })
        ) {
            inner.cursor += 1;
        }
    }

    /// Fast-skip a completed step: advance the cursor past its
    /// `STEP_COMPLETED` marker (and everything the step emitted before it).
    /// Returns false when the marker is absent, meaning the step must run.
    pub(crate) fn fast_forward_past(&self, step_name: &str) -> bool {
        let mut inner = self.lock();
        for idx in inner.cursor..inner.history.len() {
            if let WorkflowEvent::StepCompleted { step_name: name } = &inner.history[idx]
                && name == step_name
            {
                inner.cursor = idx + 1;
                return true;
            }
        }
        false
    }

    /// Take the pending commit batch, leaving a fresh one behind.
    pub(crate) fn take_batch(&self) -> CommitBatch {
        let mut inner = self.lock();
        let workflow_id = inner.workflow_id.clone();
        std::mem::replace(&mut inner.batch, CommitBatch::new(workflow_id))
    }

    /// Current folded state.
    pub(crate) fn state_snapshot(&self) -> StateMap {
        self.lock().state.clone()
    }
}

impl ContextInner {
    /// Index of the first event at or after `from` that a non-signal
    /// matcher may observe. Signals are skipped (not consumed): they are
    /// delivered out of band by `wait_for_signal`.
    fn next_meaningful_from(&self, from: usize) -> Option<usize> {
        (from..self.history.len())
            .find(|&idx| !matches!(self.history[idx], WorkflowEvent::SignalReceived { .. }))
    }

    fn is_replaying(&self) -> bool {
        self.next_meaningful_from(self.cursor).is_some()
    }

    fn activity(&mut self, name: &str, args: Vec<Value>) -> Result<Value, StepError> {
        let Some(idx) = self.next_meaningful_from(self.cursor) else {
            return self.schedule_activity(name, args);
        };

        let activity_id = match &self.history[idx] {
            WorkflowEvent::ActivityScheduled {
                activity_id,
                name: recorded_name,
                args: recorded_args,
                ..
            } => {
                if recorded_name != name {
                    return Err(StepError::NonDeterministic(format!(
                        "history scheduled activity '{recorded_name}' but code schedules '{name}'"
                    )));
                }
                if recorded_args != &args {
                    return Err(StepError::NonDeterministic(format!(
                        "activity '{name}' called with arguments that differ from history"
                    )));
                }
                activity_id.clone()
            }
            other => {
                return Err(StepError::NonDeterministic(format!(
                    "code schedules activity '{name}' but history has {}",
                    other.event_type()
                )));
            }
        };
        self.cursor = idx + 1;

        let Some(outcome_idx) = self.next_meaningful_from(self.cursor) else {
            // Scheduled but not yet resolved; the ACTIVITY task is already
            // queued from the run that recorded the schedule.
            return Err(StepError::Suspended);
        };
        match &self.history[outcome_idx] {
            WorkflowEvent::ActivityCompleted {
                activity_id: id,
                result,
            } if *id == activity_id => {
                let result = result.clone();
                self.cursor = outcome_idx + 1;
                Ok(result)
            }
            WorkflowEvent::ActivityFailed {
                activity_id: id,
                error,
                ..
            } if *id == activity_id => {
                let error = error.clone();
                self.cursor = outcome_idx + 1;
                Err(StepError::ActivityFailed {
                    activity_id,
                    name: name.to_string(),
                    error,
                })
            }
            other => Err(StepError::NonDeterministic(format!(
                "expected outcome of activity '{name}' but history has {}",
                other.event_type()
            ))),
        }
    }

    fn schedule_activity(&mut self, name: &str, args: Vec<Value>) -> Result<Value, StepError> {
        let Some(definition) = self.registry.get_activity(name) else {
            return Err(StepError::Failed(anyhow::anyhow!(
                "activity '{name}' is not registered"
            )));
        };
        let retry_count = definition
            .retry_count
            .unwrap_or(self.config.activity_retry_count);
        let activity_id = Uuid::new_v4().to_string();
        debug!(
            workflow_id = %self.workflow_id,
            activity = name,
            activity_id = %activity_id,
            "scheduling activity"
        );
        self.batch.events.push(WorkflowEvent::ActivityScheduled {
            activity_id: activity_id.clone(),
            name: name.to_string(),
            args,
            attempt: 0,
        });
        self.batch.tasks.push(NewTask::activity(
            &activity_id,
            Utc::now(),
            retry_count as i64 + 1,
        ));
        Err(StepError::Suspended)
    }

    fn sleep(&mut self, duration: Duration) -> Result<(), StepError> {
        let Some(idx) = self.next_meaningful_from(self.cursor) else {
            let timer_id = Uuid::new_v4().to_string();
            let fire_at = Utc::now()
                + chrono::Duration::from_std(duration)
                    .unwrap_or_else(|_| chrono::Duration::days(365_000));
            debug!(
                workflow_id = %self.workflow_id,
                timer_id = %timer_id,
                %fire_at,
                "scheduling timer"
            );
            self.batch.events.push(WorkflowEvent::TimerScheduled {
                timer_id: timer_id.clone(),
                fire_at,
            });
            self.batch
                .tasks
                .push(NewTask::timer(&timer_id, fire_at, self.task_max_attempts()));
            return Err(StepError::Suspended);
        };

        let timer_id = match &self.history[idx] {
            WorkflowEvent::TimerScheduled { timer_id, .. } => timer_id.clone(),
            other => {
                return Err(StepError::NonDeterministic(format!(
                    "code sleeps but history has {}",
                    other.event_type()
                )));
            }
        };
        self.cursor = idx + 1;

        let Some(fired_idx) = self.next_meaningful_from(self.cursor) else {
            return Err(StepError::Suspended);
        };
        match &self.history[fired_idx] {
            WorkflowEvent::TimerFired { timer_id: id } if *id == timer_id => {
                self.cursor = fired_idx + 1;
                Ok(())
            }
            other => Err(StepError::NonDeterministic(format!(
                "expected timer {timer_id} to fire but history has {}",
                other.event_type()
            ))),
        }
    }

    fn wait_for_signal(&mut self, name: &str) -> Result<Value, StepError> {
        let mut found: Option<(usize, Value)> = None;
        for (idx, event) in self.history.iter().enumerate() {
            if let WorkflowEvent::SignalReceived {
                name: recorded,
                payload,
            } = event
                && recorded == name
                && !self.consumed_signals.contains(&idx)
            {
                found = Some((idx, payload.clone()));
                break;
            }
        }
        if let Some((idx, payload)) = found {
            self.consumed_signals.insert(idx);
            return Ok(payload);
        }

        if let Some(idx) = self.next_meaningful_from(self.cursor) {
            return Err(StepError::NonDeterministic(format!(
                "code waits for signal '{name}' but history has {}",
                self.history[idx].event_type()
            )));
        }

        self.emit_log(LogLevel::Info, format!("waiting for signal '{name}'"));
        Err(StepError::Suspended)
    }

    fn start_child_workflow(
        &mut self,
        name: &str,
        version: &str,
        input: Value,
        initial_state: StateMap,
    ) -> Result<String, StepError> {
        if let Some(idx) = self.next_meaningful_from(self.cursor) {
            return match &self.history[idx] {
                WorkflowEvent::ChildWorkflowStarted {
                    child_id,
                    name: recorded_name,
                    version: recorded_version,
                } => {
                    if recorded_name != name || recorded_version != version {
                        return Err(StepError::NonDeterministic(format!(
                            "history started child '{recorded_name}' v{recorded_version} \
                             but code starts '{name}' v{version}"
                        )));
                    }
                    let child_id = child_id.clone();
                    self.cursor = idx + 1;
                    Ok(child_id)
                }
                other => Err(StepError::NonDeterministic(format!(
                    "code starts child workflow '{name}' but history has {}",
                    other.event_type()
                ))),
            };
        }

        let Some(definition) = self.registry.get_workflow(name, version) else {
            return Err(StepError::Failed(anyhow::anyhow!(
                "child workflow '{name}' v{version} is not registered"
            )));
        };
        let child_id = Uuid::new_v4().to_string();
        info!(
            workflow_id = %self.workflow_id,
            child_id = %child_id,
            child = name,
            "starting child workflow"
        );
        self.batch.events.push(WorkflowEvent::ChildWorkflowStarted {
            child_id: child_id.clone(),
            name: name.to_string(),
            version: version.to_string(),
        });
        self.batch.children.push(NewWorkflow {
            id: child_id.clone(),
            name: name.to_string(),
            version: version.to_string(),
            module: definition.module.clone(),
            input,
            initial_state,
            step_max_attempts: self.task_max_attempts(),
        });
        Ok(child_id)
    }

    fn set_state(&mut self, key: &str, value: Value) -> Result<(), StepError> {
        if let Some(idx) = self.next_meaningful_from(self.cursor) {
            return match &self.history[idx] {
                WorkflowEvent::StateSet {
                    key: recorded_key,
                    value: recorded_value,
                } if recorded_key == key => {
                    let recorded_value = recorded_value.clone();
                    self.cursor = idx + 1;
                    self.state.insert(key.to_string(), recorded_value);
                    Ok(())
                }
                other => Err(StepError::NonDeterministic(format!(
                    "code sets state key '{key}' but history has {}",
                    other.event_type()
                ))),
            };
        }

        self.state.insert(key.to_string(), value.clone());
        self.batch.events.push(WorkflowEvent::StateSet {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    fn update_state(&mut self, new_state_fn: impl FnOnce(&StateMap) -> StateMap) -> Result<(), StepError> {
        if let Some(idx) = self.next_meaningful_from(self.cursor) {
            return match &self.history[idx] {
                WorkflowEvent::StateUpdate { new_state } => {
                    let new_state = new_state.clone();
                    self.cursor = idx + 1;
                    self.state = new_state;
                    Ok(())
                }
                other => Err(StepError::NonDeterministic(format!(
                    "code updates state but history has {}",
                    other.event_type()
                ))),
            };
        }

        let new_state = new_state_fn(&self.state);
        self.state = new_state.clone();
        self.batch
            .events
            .push(WorkflowEvent::StateUpdate { new_state });
        Ok(())
    }

    fn emit_log(&mut self, level: LogLevel, message: String) {
        if self.is_replaying() {
            return;
        }
        match level {
            LogLevel::Debug => debug!(workflow_id = %self.workflow_id, "{message}"),
            LogLevel::Info => info!(workflow_id = %self.workflow_id, "{message}"),
            LogLevel::Warn => warn!(workflow_id = %self.workflow_id, "{message}"),
            LogLevel::Error => error!(workflow_id = %self.workflow_id, "{message}"),
        }
        self.batch.logs.push(NewLog { level, message });
    }

    fn task_max_attempts(&self) -> i64 {
        self.config.activity_retry_count as i64 + 1
    }
}

/// State view and mutators. Reads are pure; writes are durable events.
pub struct StateHandle {
    ctx: StepContext,
}

impl StateHandle {
    /// Pure read of one key from the folded state; no event.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.ctx.lock().state.get(key).cloned()
    }

    /// Full copy of the folded state.
    pub fn snapshot(&self) -> StateMap {
        self.ctx.lock().state.clone()
    }

    /// Set one key, recording a `STATE_SET` event. During replay the next
    /// recorded state event must be a `STATE_SET` of the same key; its
    /// stored value is applied.
    pub fn set(&self, key: &str, value: Value) -> Result<(), StepError> {
        self.ctx.lock().set_state(key, value)
    }

    /// Replace the whole state through an updater, recording one
    /// `STATE_UPDATE` snapshot event.
    pub fn update<F>(&self, updater: F) -> Result<(), StepError>
    where
        F: FnOnce(&StateMap) -> StateMap,
    {
        self.ctx.lock().update_state(updater)
    }

    /// Collect several writes into a single `STATE_UPDATE` emitted at
    /// scope exit.
    pub fn batch<F>(&self, fill: F) -> Result<(), StepError>
    where
        F: FnOnce(&mut StateBatch),
    {
        let mut staged = StateBatch {
            changes: self.ctx.lock().state.clone(),
        };
        fill(&mut staged);
        self.update(|_| staged.changes)
    }
}

/// Staged state writes inside [`StateHandle::batch`].
#[derive(Debug)]
pub struct StateBatch {
    changes: StateMap,
}

impl StateBatch {
    pub fn set(&mut self, key: &str, value: Value) {
        self.changes.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.changes.get(key)
    }
}

/// Durable workflow logger. Suppressed during replay so a re-run never
/// duplicates log lines; live lines are mirrored to `tracing` and buffered
/// into the commit batch.
pub struct WorkflowLogger {
    ctx: StepContext,
}

impl WorkflowLogger {
    pub fn debug(&self, message: impl Into<String>) {
        self.ctx.lock().emit_log(LogLevel::Debug, message.into());
    }

    pub fn info(&self, message: impl Into<String>) {
        self.ctx.lock().emit_log(LogLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.ctx.lock().emit_log(LogLevel::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.ctx.lock().emit_log(LogLevel::Error, message.into());
    }
}
