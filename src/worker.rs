//! Cooperative worker pool over the task queue.
//!
//! Each worker is a single logical runner: it claims one task at a time,
//! dispatches it through the engine, and sleeps for the poll interval when
//! the queue is empty. Any number of workers (and processes) may share the
//! same store; claim atomicity and the one-STEP-per-workflow rule live in
//! the store, not here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::ReplayEngine;
use crate::error::EngineError;
use crate::registry::Registry;
use crate::store::Store;

/// Floor for the lease-renewal period, so tiny stale timeouts cannot turn
/// the heartbeat into a spin loop.
const MIN_HEARTBEAT_PERIOD: Duration = Duration::from_millis(10);

/// Claim and execute at most one task. Returns false when the queue had
/// nothing runnable. This is the single-dispatch primitive behind both the
/// worker loops and the embedded/test `run_once` control API.
///
/// While the task executes, a background heartbeat renews its claim, so a
/// slow-but-alive handler is never reclaimed by the stale-task sweep.
pub async fn run_once(
    store: &Store,
    engine: &ReplayEngine,
    worker_id: &str,
) -> Result<bool, EngineError> {
    let Some(task) = store.claim_next_task(worker_id, Utc::now()).await? else {
        return Ok(false);
    };
    debug!(
        worker_id,
        task_id = %task.id,
        kind = %task.kind,
        workflow_id = %task.workflow_id,
        attempt = task.attempts,
        "claimed task"
    );

    // Tasks of a finished workflow are drained without dispatch; a late
    // activity result is discarded because the workflow is terminal.
    let status = store.workflow_status(&task.workflow_id).await?;
    if status.is_terminal() {
        store.complete_task(&task.id).await?;
        debug!(task_id = %task.id, %status, "drained task for terminal workflow");
        return Ok(true);
    }

    let heartbeat = spawn_heartbeat(
        store,
        &task.id,
        worker_id,
        engine.config().stale_task_timeout,
    );
    let dispatched = engine.run_task(&task).await;
    heartbeat.abort();

    if let Err(err) = dispatched {
        // A store/system failure, not a workflow outcome: retry the task
        // with backoff until its attempt budget runs out. The workflow row
        // stays RUNNING for an operator to inspect.
        let error = err.to_string();
        let retry_at = (task.attempts < task.max_attempts).then(|| {
            engine
                .config()
                .backoff()
                .next_run_at(Utc::now(), task.attempts as u32)
        });
        warn!(
            worker_id,
            task_id = %task.id,
            %error,
            retrying = retry_at.is_some(),
            "task dispatch failed"
        );
        store.fail_task(&task.id, &error, retry_at).await?;
    }
    Ok(true)
}

/// Renew the claim on `task_id` every fifth of the stale timeout until the
/// dispatch finishes (the caller aborts the handle) or the task stops being
/// ours.
fn spawn_heartbeat(
    store: &Store,
    task_id: &str,
    worker_id: &str,
    stale_after: Duration,
) -> JoinHandle<()> {
    let store = store.clone();
    let task_id = task_id.to_string();
    let worker_id = worker_id.to_string();
    let period = (stale_after / 5).max(MIN_HEARTBEAT_PERIOD);
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately; the claim itself just stamped
        // updated_at, so skip it
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.heartbeat_task(&task_id, &worker_id, Utc::now()).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    warn!(task_id = %task_id, error = %err, "task heartbeat failed");
                }
            }
        }
    })
}

/// A pool of cooperative worker loops sharing one store.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.worker_count` workers.
    pub fn start(store: Store, registry: Arc<Registry>, config: Config) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = (0..config.worker_count)
            .map(|index| {
                let worker = Worker {
                    id: format!("worker-{index}"),
                    store: store.clone(),
                    engine: ReplayEngine::new(
                        store.clone(),
                        Arc::clone(&registry),
                        config.clone(),
                    ),
                    config: config.clone(),
                    shutdown_rx: shutdown_rx.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        info!(worker_count = config.worker_count, "worker pool started");
        Self {
            shutdown_tx,
            handles,
        }
    }

    /// Signal all workers to stop after their current task.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Signal shutdown and wait for every worker to exit.
    pub async fn shutdown(self) {
        self.trigger_shutdown();
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!(?err, "worker task panicked");
            }
        }
        info!("worker pool stopped");
    }
}

struct Worker {
    id: String,
    store: Store,
    engine: ReplayEngine,
    config: Config,
    shutdown_rx: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        info!(worker_id = %self.id, "worker started");
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            match run_once(&self.store, &self.engine, &self.id).await {
                Ok(true) => {}
                Ok(false) => {
                    // Empty queue: reclaim anything a dead worker stranded,
                    // then idle until the next poll or shutdown.
                    if let Err(err) = self
                        .store
                        .release_stale_tasks(Utc::now(), self.config.stale_task_timeout)
                        .await
                    {
                        warn!(worker_id = %self.id, error = %err, "stale task sweep failed");
                    }
                    if self.idle().await {
                        break;
                    }
                }
                Err(err) => {
                    error!(worker_id = %self.id, error = %err, "dispatch error");
                    if self.idle().await {
                        break;
                    }
                }
            }
        }
        info!(worker_id = %self.id, "worker stopped");
    }

    /// Sleep for the poll interval, returning true if shutdown fired. A
    /// closed shutdown channel (the pool was dropped) also stops the worker.
    async fn idle(&mut self) -> bool {
        tokio::select! {
            changed = self.shutdown_rx.changed() => {
                changed.is_err() || *self.shutdown_rx.borrow()
            }
            _ = tokio::time::sleep(self.config.poll_interval) => false,
        }
    }
}
