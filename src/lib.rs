//! Loom - A durable workflow orchestration engine
//!
//! User code expresses a long-running business process as an ordered list of
//! deterministic steps that invoke activities, sleep on timers, and react to
//! external signals. Every observable decision is persisted to an
//! append-only event log; in-memory state is re-derived by deterministic
//! replay, so a workflow progresses exactly once to completion even across
//! process crashes. The key components are:
//!
//! ## Execution
//!
//! - [`ReplayEngine`]: replays workflow code against stored history and
//!   advances it to the next unrecorded decision
//! - [`StepContext`]: the narrow API step code uses for activities, timers,
//!   signals, state, and logging
//! - [`WorkerPool`]: cooperative workers polling the task queue
//!
//! ## Persistence
//!
//! - [`Store`]: SQLite-backed workflows, events, tasks, and logs, with
//!   atomic commit batches and atomic task claims
//! - [`Config`]: environment-based configuration
//!
//! ## Registration & control
//!
//! - [`Registry`]: startup-built catalog of workflow and activity
//!   definitions
//! - [`Client`] / [`WorkflowHandle`]: start, signal, cancel, inspect, and
//!   await workflows
//!
//! Step code must propagate [`StepError::Suspended`] untouched; the only
//! error kind a workflow may handle locally is
//! [`StepError::ActivityFailed`].

pub mod client;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod registry;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod worker;

// Configuration
pub use config::{Config, StoreBackend};

// Errors
pub use error::{ClientError, ConfigError, EngineError, RegistryError, StepError, StoreError};

// Events and derived state
pub use events::{
    EventRecord, LogLevel, StateMap, TaskKind, TaskStatus, WorkflowEvent, WorkflowStatus,
    fold_state,
};

// Persistence
pub use store::{
    CommitBatch, LogRecord, NewLog, NewTask, NewWorkflow, Store, TaskRecord, WorkflowRecord,
};

// Registration
pub use registry::{
    ActivityDefinition, Registry, RegistryBuilder, StepDefinition, WorkflowDefinition,
};

// Execution
pub use context::{StateBatch, StateHandle, StepContext, WorkflowLogger};
pub use engine::ReplayEngine;
pub use retry::BackoffPolicy;
pub use worker::{WorkerPool, run_once};

// Control API
pub use client::{Client, WorkflowHandle};
