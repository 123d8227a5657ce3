//! Control API: starting workflows and interacting with running instances.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::engine::ReplayEngine;
use crate::error::{ClientError, StoreError};
use crate::events::{EventRecord, StateMap, WorkflowEvent, WorkflowStatus, fold_state};
use crate::registry::Registry;
use crate::store::{NewWorkflow, Store, WorkflowRecord};
use crate::worker;

/// Entry point for clients embedding the engine.
#[derive(Clone)]
pub struct Client {
    store: Store,
    registry: Arc<Registry>,
    config: Config,
}

impl Client {
    pub fn new(store: Store, registry: Arc<Registry>, config: Config) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Open the configured store and build a client over it.
    pub async fn connect(registry: Arc<Registry>, config: Config) -> Result<Self, ClientError> {
        let store = Store::open(&config.store_path).await?;
        Ok(Self::new(store, registry, config))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Start a workflow with a generated id.
    pub async fn start(
        &self,
        name: &str,
        version: &str,
        input: Value,
        initial_state: StateMap,
    ) -> Result<WorkflowHandle, ClientError> {
        let id = Uuid::new_v4().to_string();
        self.start_with_id(&id, name, version, input, initial_state)
            .await
    }

    /// Start a workflow under a client-assigned id.
    pub async fn start_with_id(
        &self,
        workflow_id: &str,
        name: &str,
        version: &str,
        input: Value,
        initial_state: StateMap,
    ) -> Result<WorkflowHandle, ClientError> {
        let definition = self.registry.get_workflow(name, version).ok_or_else(|| {
            ClientError::UnknownDefinition {
                name: name.to_string(),
                version: version.to_string(),
            }
        })?;

        self.store
            .create_workflow(&NewWorkflow {
                id: workflow_id.to_string(),
                name: definition.name.clone(),
                version: definition.version.clone(),
                module: definition.module.clone(),
                input,
                initial_state,
                step_max_attempts: self.config.activity_retry_count as i64 + 1,
            })
            .await?;

        info!(workflow_id, name, version, "workflow started");
        Ok(self.handle(workflow_id))
    }

    /// Handle for an existing workflow id.
    pub fn handle(&self, workflow_id: &str) -> WorkflowHandle {
        WorkflowHandle {
            id: workflow_id.to_string(),
            store: self.store.clone(),
            poll_interval: self.config.poll_interval,
        }
    }

    /// List workflows, optionally filtered by status.
    pub async fn list(
        &self,
        status: Option<WorkflowStatus>,
        limit: i64,
    ) -> Result<Vec<WorkflowRecord>, ClientError> {
        Ok(self.store.list_workflows(status, limit).await?)
    }

    /// Workflow row plus its full ordered history.
    pub async fn inspect(
        &self,
        workflow_id: &str,
    ) -> Result<(WorkflowRecord, Vec<EventRecord>), ClientError> {
        let workflow = self
            .store
            .load_workflow(workflow_id)
            .await
            .map_err(map_store)?;
        let events = self.store.load_history(workflow_id).await?;
        Ok((workflow, events))
    }

    /// Dispatch a single queued task, for embedded and test use. Returns
    /// false when the queue had nothing runnable.
    pub async fn run_once(&self) -> Result<bool, ClientError> {
        let engine = ReplayEngine::new(
            self.store.clone(),
            Arc::clone(&self.registry),
            self.config.clone(),
        );
        Ok(worker::run_once(&self.store, &engine, "embedded").await?)
    }
}

/// Handle for one workflow instance.
#[derive(Clone, Debug)]
pub struct WorkflowHandle {
    id: String,
    store: Store,
    poll_interval: Duration,
}

impl WorkflowHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn status(&self) -> Result<WorkflowStatus, ClientError> {
        self.store.workflow_status(&self.id).await.map_err(map_store)
    }

    /// Block until the workflow reaches a terminal state, then return its
    /// final state. Failure and cancellation surface as errors.
    pub async fn result(&self) -> Result<StateMap, ClientError> {
        loop {
            match self.try_result().await {
                Err(ClientError::StillRunning(_)) => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                other => return other,
            }
        }
    }

    /// Non-blocking result probe.
    pub async fn try_result(&self) -> Result<StateMap, ClientError> {
        let status = self.store.workflow_status(&self.id).await.map_err(map_store)?;
        match status {
            WorkflowStatus::Running => Err(ClientError::StillRunning(self.id.clone())),
            WorkflowStatus::Completed => {
                let history = self.store.load_history(&self.id).await?;
                for record in history.iter().rev() {
                    if let WorkflowEvent::WorkflowCompleted { final_state } = &record.event {
                        return Ok(final_state.clone());
                    }
                }
                // Terminal event missing would be a store bug; fall back to
                // the fold so the caller still gets a coherent state.
                Ok(fold_state(history.iter().map(|record| &record.event)))
            }
            WorkflowStatus::Failed => {
                let history = self.store.load_history(&self.id).await?;
                Err(ClientError::ExecutionFailed {
                    workflow_id: self.id.clone(),
                    error: extract_error(&history),
                })
            }
            WorkflowStatus::Cancelled => {
                let history = self.store.load_history(&self.id).await?;
                let reason = history
                    .iter()
                    .rev()
                    .find_map(|record| match &record.event {
                        WorkflowEvent::WorkflowCancelled { reason } => Some(reason.clone()),
                        _ => None,
                    })
                    .unwrap_or_else(|| "cancelled".to_string());
                Err(ClientError::Cancelled {
                    workflow_id: self.id.clone(),
                    reason,
                })
            }
        }
    }

    /// Deliver an external signal to the workflow.
    pub async fn signal(&self, name: &str, payload: Value) -> Result<(), ClientError> {
        if name.is_empty() {
            return Err(ClientError::InvalidArgument(
                "signal name must be a non-empty string".to_string(),
            ));
        }
        self.store
            .append_signal(&self.id, name, payload)
            .await
            .map_err(map_store)
    }

    /// Cancel the workflow. In-flight activities are not interrupted; their
    /// results are discarded on completion.
    pub async fn cancel(&self, reason: &str) -> Result<(), ClientError> {
        self.store
            .cancel_workflow(&self.id, reason)
            .await
            .map_err(map_store)
    }
}

fn map_store(err: StoreError) -> ClientError {
    match err {
        StoreError::WorkflowNotFound(id) => ClientError::NotFound(id),
        other => ClientError::Store(other),
    }
}

/// The most relevant failure in a history: the last `WORKFLOW_FAILED` wins,
/// then the last `ACTIVITY_FAILED`.
fn extract_error(history: &[EventRecord]) -> String {
    let mut workflow_error = None;
    let mut activity_error = None;
    for record in history {
        match &record.event {
            WorkflowEvent::WorkflowFailed { error } => workflow_error = Some(error.clone()),
            WorkflowEvent::ActivityFailed { error, .. } => activity_error = Some(error.clone()),
            _ => {}
        }
    }
    workflow_error
        .or(activity_error)
        .unwrap_or_else(|| "workflow failed for unknown reasons".to_string())
}
