//! # Sync Worker
//!
//! Pulls tasks off the [`TaskQueue`] and runs them through the
//! [`SyncCoordinator`], up to `worker_concurrency` at a time. Any number of
//! workers, in any number of processes, can share one queue.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::coordinator::SyncCoordinator;
use crate::error::{Result, SyncError};
use crate::task_queue::{FailureDisposition, QueuedTask, TaskQueue};

pub struct SyncWorker {
    coordinator: Arc<SyncCoordinator>,
    queue: Arc<TaskQueue>,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    poll_interval: Duration,
    recovery_interval: Duration,
    shutdown: CancellationToken,
}

impl SyncWorker {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        let config = coordinator.config();
        let concurrency = config.worker_concurrency.max(1);
        let poll_interval = config.poll_interval;
        let recovery_interval = (config.stale_task_after / 2).max(poll_interval);
        let queue = coordinator.queue().clone();

        Self {
            coordinator,
            queue,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            poll_interval,
            recovery_interval,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Poll the queue until shut down, then wait for running tasks.
    pub async fn run(&self) -> Result<()> {
        info!(concurrency = self.concurrency, "Sync worker started");
        let mut last_recovery: Option<Instant> = None;

        loop {
            if last_recovery.map_or(true, |at| at.elapsed() >= self.recovery_interval) {
                if let Err(e) = self.queue.recover_stale().await {
                    warn!(error = %e, "Stale task recovery failed");
                }
                last_recovery = Some(Instant::now());
            }

            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => {
                    permit.map_err(|_| SyncError::Cancelled)?
                }
            };

            match self.queue.dequeue().await {
                Ok(Some(task)) => {
                    let coordinator = self.coordinator.clone();
                    let queue = self.queue.clone();
                    tokio::spawn(async move {
                        if let Err(e) = process(&coordinator, &queue, task).await {
                            error!(error = %e, "Failed to record task outcome");
                        }
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    warn!(error = %e, "Failed to poll task queue");
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("Sync worker stopping, waiting for running tasks");
        let _ = self.semaphore.acquire_many(self.concurrency as u32).await;
        info!("Sync worker stopped");
        Ok(())
    }

    /// Run due tasks one at a time until none is left. Returns how many ran.
    pub async fn drain(&self) -> Result<usize> {
        let mut processed = 0;
        while let Some(task) = self.queue.dequeue().await? {
            process(&self.coordinator, &self.queue, task).await?;
            processed += 1;
        }
        Ok(processed)
    }
}

/// Run one task and record the outcome in the queue.
async fn process(coordinator: &SyncCoordinator, queue: &TaskQueue, task: QueuedTask) -> Result<()> {
    let span = info_span!("task", task_id = %task.id, kind = task.task.kind(), attempt = task.attempts + 1);

    async move {
        match coordinator.execute(&task.task).await {
            Ok(()) => queue.mark_complete(task.id).await,
            Err(e) => {
                let disposition = queue.mark_failed(task.id, &e).await?;
                if disposition == FailureDisposition::Failed {
                    if let Err(cleanup) = coordinator.on_permanent_failure(&task.task, &e).await {
                        error!(error = %cleanup, "Cleanup after failed task did not complete");
                    }
                }
                Ok(())
            }
        }
    }
    .instrument(span)
    .await
}
