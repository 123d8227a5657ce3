//! Process-wide catalog of workflow and activity definitions.
//!
//! The registry is built once at startup and is immutable afterwards from
//! the engine's point of view. Registration is idempotent: registering the
//! same definition twice is a no-op, while re-registering a name with a
//! differing fingerprint is an error.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::context::StepContext;
use crate::error::{RegistryError, StepError};

/// Boxed step body. Steps receive a clone of the execution context and
/// drive every non-deterministic operation through it.
pub type StepFn =
    Arc<dyn Fn(StepContext) -> BoxFuture<'static, Result<(), StepError>> + Send + Sync>;

/// Boxed activity body. Activities are the side-effect boundary; they take
/// the recorded argument list and may fail freely, the retry machinery is
/// outside.
pub type ActivityFn =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// One named unit of workflow code, delimited by a `STEP_COMPLETED` event.
#[derive(Clone)]
pub struct StepDefinition {
    pub name: String,
    handler: StepFn,
}

impl StepDefinition {
    pub fn run(&self, ctx: StepContext) -> BoxFuture<'static, Result<(), StepError>> {
        (self.handler)(ctx)
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A named, versioned workflow: an ordered list of steps.
#[derive(Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: String,
    pub module: Option<String>,
    steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            module: None,
            steps: Vec::new(),
        }
    }

    /// Attach an optional module string, kept for listing and diagnostics.
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    /// Append a step. Step order is execution order.
    pub fn step<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.steps.push(StepDefinition {
            name: name.into(),
            handler: Arc::new(move |ctx| Box::pin(handler(ctx))),
        });
        self
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    /// Source fingerprint: name, version, and the ordered step names.
    fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update([0]);
        hasher.update(self.version.as_bytes());
        for step in &self.steps {
            hasher.update([0]);
            hasher.update(step.name.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("steps", &self.steps.iter().map(|s| &s.name).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// A named activity with its retry/timeout policy. Policy fields left unset
/// fall back to the configured defaults at schedule/execution time.
#[derive(Clone)]
pub struct ActivityDefinition {
    pub name: String,
    pub retry_count: Option<u32>,
    pub timeout: Option<Duration>,
    handler: ActivityFn,
}

impl ActivityDefinition {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            retry_count: None,
            timeout: None,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn invoke(&self, args: Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> {
        (self.handler)(args)
    }

    /// Source fingerprint: name plus declared policy. The handler body is
    /// opaque, so only the registration surface is hashed.
    fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update([0]);
        hasher.update(format!("{:?}", self.retry_count).as_bytes());
        hasher.update([0]);
        hasher.update(format!("{:?}", self.timeout).as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl std::fmt::Debug for ActivityDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityDefinition")
            .field("name", &self.name)
            .field("retry_count", &self.retry_count)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Builder used during startup, before workers run.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    workflows: HashMap<(String, String), (String, Arc<WorkflowDefinition>)>,
    activities: HashMap<String, (String, Arc<ActivityDefinition>)>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_workflow(mut self, def: WorkflowDefinition) -> Result<Self, RegistryError> {
        if def.steps.is_empty() {
            return Err(RegistryError::EmptyWorkflow {
                name: def.name,
                version: def.version,
            });
        }
        {
            let mut seen = std::collections::HashSet::new();
            for step in &def.steps {
                if !seen.insert(step.name.as_str()) {
                    return Err(RegistryError::DuplicateStep {
                        name: def.name.clone(),
                        version: def.version.clone(),
                        step: step.name.clone(),
                    });
                }
            }
        }

        let key = (def.name.clone(), def.version.clone());
        let fingerprint = def.fingerprint();
        if let Some((existing, _)) = self.workflows.get(&key) {
            if *existing == fingerprint {
                return Ok(self);
            }
            return Err(RegistryError::WorkflowMismatch {
                name: key.0,
                version: key.1,
            });
        }
        self.workflows.insert(key, (fingerprint, Arc::new(def)));
        Ok(self)
    }

    pub fn register_activity(mut self, def: ActivityDefinition) -> Result<Self, RegistryError> {
        let fingerprint = def.fingerprint();
        if let Some((existing, _)) = self.activities.get(&def.name) {
            if *existing == fingerprint {
                return Ok(self);
            }
            return Err(RegistryError::ActivityMismatch { name: def.name });
        }
        self.activities
            .insert(def.name.clone(), (fingerprint, Arc::new(def)));
        Ok(self)
    }

    pub fn build(self) -> Arc<Registry> {
        Arc::new(Registry {
            workflows: self
                .workflows
                .into_iter()
                .map(|(key, (_, def))| (key, def))
                .collect(),
            activities: self
                .activities
                .into_iter()
                .map(|(key, (_, def))| (key, def))
                .collect(),
        })
    }
}

/// Immutable name/version lookup for workflows and activities.
#[derive(Debug)]
pub struct Registry {
    workflows: HashMap<(String, String), Arc<WorkflowDefinition>>,
    activities: HashMap<String, Arc<ActivityDefinition>>,
}

impl Registry {
    pub fn get_workflow(&self, name: &str, version: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows
            .get(&(name.to_string(), version.to_string()))
            .cloned()
    }

    pub fn get_activity(&self, name: &str) -> Option<Arc<ActivityDefinition>> {
        self.activities.get(name).cloned()
    }

    pub fn workflow_count(&self) -> usize {
        self.workflows.len()
    }

    pub fn activity_count(&self) -> usize {
        self.activities.len()
    }
}
