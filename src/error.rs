//! Error taxonomy for the engine.
//!
//! Errors fall into four families: persistence failures ([`StoreError`]),
//! the step interrupt/failure channel ([`StepError`]), registration problems
//! ([`RegistryError`]), and everything surfaced to API callers
//! ([`ClientError`]).

use thiserror::Error;

use crate::events::WorkflowStatus;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("workflow {id} is not running (status {status})")]
    WorkflowNotRunning { id: String, status: WorkflowStatus },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("event codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Interrupt and failure channel for workflow step code.
///
/// `Suspended` is engine control flow, not a failure: it means the step
/// reached a decision whose outcome is not yet in history and must pause
/// until a worker records it. Step code must propagate it untouched (use
/// `?`). The only variant user code may handle locally is
/// [`StepError::ActivityFailed`]; match on it specifically and re-return
/// every other variant:
///
/// ```ignore
/// match ctx.activity("charge", args).await {
///     Ok(receipt) => { /* ... */ }
///     Err(StepError::ActivityFailed { error, .. }) => { /* compensate */ }
///     Err(other) => return Err(other),
/// }
/// ```
#[derive(Debug, Error)]
pub enum StepError {
    /// The step is waiting on an unrecorded external decision (activity
    /// result, timer firing, or signal). Commit-and-pause, not a failure.
    #[error("step suspended awaiting external progress")]
    Suspended,

    /// An activity exhausted its retries; surfaced at the awaiting call.
    #[error("activity '{name}' failed: {error}")]
    ActivityFailed {
        activity_id: String,
        name: String,
        error: String,
    },

    /// Replay diverged from recorded history. Terminal, never retried.
    #[error("non-deterministic workflow execution: {0}")]
    NonDeterministic(String),

    /// Any other error escaping step code; terminal for the workflow.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Errors raised while building the registry at startup.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("workflow '{name}' v{version} already registered with a different definition")]
    WorkflowMismatch { name: String, version: String },

    #[error("activity '{name}' already registered with a different definition")]
    ActivityMismatch { name: String },

    #[error("workflow '{name}' v{version} declares duplicate step '{step}'")]
    DuplicateStep {
        name: String,
        version: String,
        step: String,
    },

    #[error("workflow '{name}' v{version} has no steps")]
    EmptyWorkflow { name: String, version: String },
}

/// Invalid runtime configuration.
#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Errors from the replay engine while executing a claimed task.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("workflow definition '{name}' v{version} is not registered")]
    DefinitionNotFound { name: String, version: String },

    #[error("task {task_id} references corrupt history: {detail}")]
    CorruptHistory { task_id: String, detail: String },
}

/// Errors surfaced through the control API.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("workflow not found: {0}")]
    NotFound(String),

    #[error("workflow {0} is still running; result is not available")]
    StillRunning(String),

    #[error("workflow {workflow_id} failed: {error}")]
    ExecutionFailed { workflow_id: String, error: String },

    #[error("workflow {workflow_id} was cancelled: {reason}")]
    Cancelled { workflow_id: String, reason: String },

    #[error("unknown workflow definition '{name}' v{version}")]
    UnknownDefinition { name: String, version: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ClientError {
    /// Process exit code for CLI wrappers: 0 success, 1 generic failure,
    /// 2 misconfiguration, 3 workflow failed, 4 not found.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::NotFound(_) => 4,
            ClientError::UnknownDefinition { .. } => 4,
            ClientError::Store(StoreError::WorkflowNotFound(_)) => 4,
            ClientError::ExecutionFailed { .. } | ClientError::Cancelled { .. } => 3,
            ClientError::Configuration(_) => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(ClientError::NotFound("w".into()).exit_code(), 4);
        assert_eq!(
            ClientError::Store(StoreError::WorkflowNotFound("w".into())).exit_code(),
            4
        );
        assert_eq!(
            ClientError::ExecutionFailed {
                workflow_id: "w".into(),
                error: "boom".into()
            }
            .exit_code(),
            3
        );
        assert_eq!(
            ClientError::Cancelled {
                workflow_id: "w".into(),
                reason: "operator".into()
            }
            .exit_code(),
            3
        );
        assert_eq!(
            ClientError::Configuration(ConfigError("bad backend".into())).exit_code(),
            2
        );
        assert_eq!(ClientError::StillRunning("w".into()).exit_code(), 1);
    }

    #[test]
    fn suspended_is_distinguishable_from_failures() {
        let err = StepError::Suspended;
        assert!(matches!(err, StepError::Suspended));
        let err: StepError = anyhow::anyhow!("user bug").into();
        assert!(matches!(err, StepError::Failed(_)));
    }
}
