//! Event model for the append-only workflow history.
//!
//! Events are the sole source of truth: workflow status, derived state, and
//! the task queue are all reconstructible from them. Once appended an event
//! is never modified or deleted, and per workflow the ascending store
//! ordinal is the replay order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Derived workflow state: a JSON object folded from the history.
pub type StateMap = Map<String, Value>;

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal statuses admit no further events or transitions.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "RUNNING",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Failed => "FAILED",
            WorkflowStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of queued work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskKind {
    Step,
    Activity,
    Timer,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Step => "STEP",
            TaskKind::Activity => "ACTIVITY",
            TaskKind::Timer => "TIMER",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a durable workflow log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// One entry in a workflow's history.
///
/// Serialized adjacently tagged so the stored `(type, payload)` column pair
/// round-trips through a single derive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WorkflowEvent {
    #[serde(rename = "WORKFLOW_STARTED")]
    WorkflowStarted {
        input: Value,
        initial_state: StateMap,
    },

    #[serde(rename = "STATE_SET")]
    StateSet { key: String, value: Value },

    #[serde(rename = "STATE_UPDATE")]
    StateUpdate { new_state: StateMap },

    #[serde(rename = "ACTIVITY_SCHEDULED")]
    ActivityScheduled {
        activity_id: String,
        name: String,
        args: Vec<Value>,
        attempt: u32,
    },

    #[serde(rename = "ACTIVITY_COMPLETED")]
    ActivityCompleted { activity_id: String, result: Value },

    #[serde(rename = "ACTIVITY_FAILED")]
    ActivityFailed {
        activity_id: String,
        error: String,
        attempts_used: u32,
    },

    #[serde(rename = "TIMER_SCHEDULED")]
    TimerScheduled {
        timer_id: String,
        fire_at: DateTime<Utc>,
    },

    #[serde(rename = "TIMER_FIRED")]
    TimerFired { timer_id: String },

    #[serde(rename = "SIGNAL_RECEIVED")]
    SignalReceived { name: String, payload: Value },

    #[serde(rename = "CHILD_WORKFLOW_STARTED")]
    ChildWorkflowStarted {
        child_id: String,
        name: String,
        version: String,
    },

    #[serde(rename = "STEP_COMPLETED")]
    StepCompleted { step_name: String },

    #[serde(rename = "WORKFLOW_COMPLETED")]
    WorkflowCompleted { final_state: StateMap },

    #[serde(rename = "WORKFLOW_FAILED")]
    WorkflowFailed { error: String },

    #[serde(rename = "WORKFLOW_CANCELLED")]
    WorkflowCancelled { reason: String },
}

impl WorkflowEvent {
    /// Stored type tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowStarted { .. } => "WORKFLOW_STARTED",
            WorkflowEvent::StateSet { .. } => "STATE_SET",
            WorkflowEvent::StateUpdate { .. } => "STATE_UPDATE",
            WorkflowEvent::ActivityScheduled { .. } => "ACTIVITY_SCHEDULED",
            WorkflowEvent::ActivityCompleted { .. } => "ACTIVITY_COMPLETED",
            WorkflowEvent::ActivityFailed { .. } => "ACTIVITY_FAILED",
            WorkflowEvent::TimerScheduled { .. } => "TIMER_SCHEDULED",
            WorkflowEvent::TimerFired { .. } => "TIMER_FIRED",
            WorkflowEvent::SignalReceived { .. } => "SIGNAL_RECEIVED",
            WorkflowEvent::ChildWorkflowStarted { .. } => "CHILD_WORKFLOW_STARTED",
            WorkflowEvent::StepCompleted { .. } => "STEP_COMPLETED",
            WorkflowEvent::WorkflowCompleted { .. } => "WORKFLOW_COMPLETED",
            WorkflowEvent::WorkflowFailed { .. } => "WORKFLOW_FAILED",
            WorkflowEvent::WorkflowCancelled { .. } => "WORKFLOW_CANCELLED",
        }
    }

    /// Stored payload object.
    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        let mut tagged = serde_json::to_value(self)?;
        Ok(tagged
            .as_object_mut()
            .and_then(|obj| obj.remove("payload"))
            .unwrap_or(Value::Object(Map::new())))
    }

    /// Reassemble an event from its stored `(type, payload)` pair.
    pub fn from_parts(event_type: &str, payload: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({
            "type": event_type,
            "payload": payload,
        }))
    }
}

/// A persisted event with its store ordinal.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub id: i64,
    pub workflow_id: String,
    pub event: WorkflowEvent,
    pub created_at: DateTime<Utc>,
}

/// Fold the derived state view out of a history.
///
/// `WORKFLOW_STARTED` seeds the user-supplied initial state, `STATE_SET`
/// upserts one key, `STATE_UPDATE` replaces the whole object. Every other
/// event is state-neutral. The fold is a pure function of the history, so
/// it is identical no matter how many intermediate replays ran.
pub fn fold_state<'a, I>(events: I) -> StateMap
where
    I: IntoIterator<Item = &'a WorkflowEvent>,
{
    let mut state = StateMap::new();
    for event in events {
        match event {
            WorkflowEvent::WorkflowStarted { initial_state, .. } => {
                state = initial_state.clone();
            }
            WorkflowEvent::StateSet { key, value } => {
                state.insert(key.clone(), value.clone());
            }
            WorkflowEvent::StateUpdate { new_state } => {
                state = new_state.clone();
            }
            _ => {}
        }
    }
    state
}
