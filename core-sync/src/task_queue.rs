//! # Task Queue
//!
//! Durable queue of engine units of work, shared by every worker through
//! the database.
//!
//! ## Overview
//!
//! - **Messages**: every unit of work is a [`SyncTask`], stored as JSON, so a
//!   task carries all the state it needs and nothing lives in a worker's
//!   memory between tasks
//! - **Scheduling**: tasks become claimable at `available_at`, which is how
//!   fan-out staggering and retry backoff are expressed
//! - **Claiming**: a single `UPDATE ... RETURNING` moves one due task to
//!   `processing`, so two workers never claim the same task
//! - **Retries**: only transient errors are retried, with exponential
//!   backoff, up to `max_retries`. Everything else fails on the first try
//! - **Recovery**: tasks stuck in `processing` past `stale_task_after`
//!   belonged to a crashed worker and go back to `pending`
//! - **Dedup**: follow-up work queued with [`TaskQueue::enqueue_once`] is
//!   stored at most once per key, so a redelivered task cannot fork the run
//!   it belongs to
//!
//! ## Usage
//!
//! ```ignore
//! let queue = TaskQueue::new(Arc::new(repository), clock, &config);
//! queue.enqueue(SyncTask::ReconcileSource { source_id }).await?;
//!
//! while let Some(task) = queue.dequeue().await? {
//!     match coordinator.execute(&task.task).await {
//!         Ok(()) => queue.mark_complete(task.id).await?,
//!         Err(e) => { queue.mark_failed(task.id, &e).await?; }
//!     }
//! }
//! ```

use async_trait::async_trait;
use bridge_traits::Clock;
use chrono::{DateTime, Utc};
use core_runtime::config::SyncEngineConfig;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::continuation::ImportCollection;
use crate::error::{Result, SyncError};
use crate::reconciliation::ChordId;
use crate::remote_set::RemoteSetRef;
use crate::source::{ProviderKind, SourceId};

// ============================================================================
// Messages
// ============================================================================

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum SyncTask {
    /// Fan out one import per source of a provider
    ImportAllSources {
        provider: ProviderKind,
        #[serde(default)]
        import_all: bool,
    },
    /// One page of one source's import run
    ImportCollection(ImportCollection),
    /// Import a parent source, then each of its children with the parent's
    /// identifiers
    ImportCollectionGroup {
        source_id: SourceId,
        #[serde(default)]
        import_all: bool,
    },
    /// Start a stale-inventory reconciliation of one source
    ReconcileSource { source_id: SourceId },
    /// Reconciliation branch collecting locally available identifiers
    CollectAvailable { source_id: SourceId, chord_id: ChordId },
    /// Reconciliation combiner, queued once both branches reported
    CombineReconciliation { chord_id: ChordId },
    /// Delete a remote set nobody needs anymore
    RemoveSet { set: RemoteSetRef },
}

impl SyncTask {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncTask::ImportAllSources { .. } => "import_all_sources",
            SyncTask::ImportCollection(_) => "import_collection",
            SyncTask::ImportCollectionGroup { .. } => "import_collection_group",
            SyncTask::ReconcileSource { .. } => "reconcile_source",
            SyncTask::CollectAvailable { .. } => "collect_available",
            SyncTask::CombineReconciliation { .. } => "combine_reconciliation",
            SyncTask::RemoveSet { .. } => "remove_set",
        }
    }
}

/// Type-safe task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SyncError::InvalidId(e.to_string()))
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Waiting for `available_at`
    Pending,
    /// Claimed by a worker
    Processing,
    Completed,
    /// Failed for good
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(SyncError::InvalidStatus(s.to_string())),
        }
    }
}

/// A task as stored in the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTask {
    pub id: TaskId,
    pub task: SyncTask,
    pub status: TaskStatus,
    /// Failed attempts so far
    pub attempts: u32,
    pub last_error: Option<String>,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// At most one task per key is ever stored
    pub dedup_key: Option<String>,
}

impl QueuedTask {
    pub fn new(task: SyncTask, available_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            task,
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            available_at,
            created_at: now,
            updated_at: now,
            started_at: None,
            dedup_key: None,
        }
    }
}

/// What [`TaskQueue::mark_failed`] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back to pending, claimable after `delay`
    Retrying { attempt: u32, delay: Duration },
    /// Terminal
    Failed,
}

// ============================================================================
// Repository
// ============================================================================

#[async_trait]
pub trait TaskQueueRepository: Send + Sync {
    /// Store a new task. Returns `false` when a task with the same dedup key
    /// already exists, in which case nothing is written.
    async fn insert(&self, task: &QueuedTask) -> Result<bool>;

    async fn update(&self, task: &QueuedTask) -> Result<()>;

    async fn find_by_id(&self, id: TaskId) -> Result<Option<QueuedTask>>;

    async fn find_by_dedup_key(&self, key: &str) -> Result<Option<QueuedTask>>;

    /// Atomically move the oldest due pending task to processing.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<QueuedTask>>;

    async fn count_by_status(&self, status: TaskStatus) -> Result<u64>;

    async fn delete_completed(&self) -> Result<u64>;

    async fn get_failed(&self) -> Result<Vec<QueuedTask>>;

    /// Return processing tasks claimed before `started_before` to pending.
    async fn requeue_stale(&self, started_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64>;
}

pub struct SqliteTaskQueueRepository {
    pool: SqlitePool,
}

impl SqliteTaskQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize database table if it doesn't exist
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_tasks (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                available_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                started_at INTEGER,
                dedup_key TEXT UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sync_tasks_status_available
            ON sync_tasks(status, available_at ASC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

const TASK_COLUMNS: &str = "id, payload, status, attempts, last_error, available_at, created_at, \
     updated_at, started_at, dedup_key";

#[derive(Debug, FromRow)]
struct TaskRow {
    id: String,
    payload: String,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    available_at: i64,
    created_at: i64,
    updated_at: i64,
    started_at: Option<i64>,
    dedup_key: Option<String>,
}

fn millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| SyncError::Database(format!("Invalid timestamp: {}", ms)))
}

impl TryFrom<TaskRow> for QueuedTask {
    type Error = SyncError;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(QueuedTask {
            id: TaskId::from_string(&row.id)?,
            task: serde_json::from_str(&row.payload)?,
            status: row.status.parse()?,
            attempts: row.attempts as u32,
            last_error: row.last_error,
            available_at: millis(row.available_at)?,
            created_at: millis(row.created_at)?,
            updated_at: millis(row.updated_at)?,
            started_at: row.started_at.map(millis).transpose()?,
            dedup_key: row.dedup_key,
        })
    }
}

#[async_trait]
impl TaskQueueRepository for SqliteTaskQueueRepository {
    async fn insert(&self, task: &QueuedTask) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_tasks (
                id, kind, payload, status, attempts, last_error,
                available_at, created_at, updated_at, started_at, dedup_key
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(dedup_key) DO NOTHING
            "#,
        )
        .bind(task.id.as_str())
        .bind(task.task.kind())
        .bind(serde_json::to_string(&task.task)?)
        .bind(task.status.as_str())
        .bind(task.attempts as i64)
        .bind(&task.last_error)
        .bind(task.available_at.timestamp_millis())
        .bind(task.created_at.timestamp_millis())
        .bind(task.updated_at.timestamp_millis())
        .bind(task.started_at.map(|t| t.timestamp_millis()))
        .bind(&task.dedup_key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update(&self, task: &QueuedTask) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_tasks SET
                status = ?,
                attempts = ?,
                last_error = ?,
                available_at = ?,
                updated_at = ?,
                started_at = ?
            WHERE id = ?
            "#,
        )
        .bind(task.status.as_str())
        .bind(task.attempts as i64)
        .bind(&task.last_error)
        .bind(task.available_at.timestamp_millis())
        .bind(task.updated_at.timestamp_millis())
        .bind(task.started_at.map(|t| t.timestamp_millis()))
        .bind(task.id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::TaskNotFound {
                task_id: task.id.to_string(),
            });
        }
        Ok(())
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<QueuedTask>> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {} FROM sync_tasks WHERE id = ?", TASK_COLUMNS))
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        row.map(QueuedTask::try_from).transpose()
    }

    async fn find_by_dedup_key(&self, key: &str) -> Result<Option<QueuedTask>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM sync_tasks WHERE dedup_key = ?",
            TASK_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(QueuedTask::try_from).transpose()
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<QueuedTask>> {
        let now_ms = now.timestamp_millis();
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            r#"
            UPDATE sync_tasks SET status = 'processing', started_at = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM sync_tasks
                WHERE status = 'pending' AND available_at <= ?
                ORDER BY available_at ASC, rowid ASC
                LIMIT 1
            )
            RETURNING {}
            "#,
            TASK_COLUMNS
        ))
        .bind(now_ms)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;

        row.map(QueuedTask::try_from).transpose()
    }

    async fn count_by_status(&self, status: TaskStatus) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_tasks WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(count as u64)
    }

    async fn delete_completed(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sync_tasks WHERE status = 'completed'")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn get_failed(&self) -> Result<Vec<QueuedTask>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM sync_tasks WHERE status = 'failed' ORDER BY updated_at DESC",
            TASK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueuedTask::try_from).collect()
    }

    async fn requeue_stale(&self, started_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_tasks SET status = 'pending', started_at = NULL, available_at = ?, updated_at = ?
            WHERE status = 'processing' AND started_at < ?
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(started_before.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// ============================================================================
// Queue
// ============================================================================

pub struct TaskQueue {
    repository: Arc<dyn TaskQueueRepository>,
    clock: Arc<dyn Clock>,
    config: SyncEngineConfig,
}

impl TaskQueue {
    pub fn new(
        repository: Arc<dyn TaskQueueRepository>,
        clock: Arc<dyn Clock>,
        config: &SyncEngineConfig,
    ) -> Self {
        Self {
            repository,
            clock,
            config: config.clone(),
        }
    }

    /// Create the SQLite-backed queue, initializing its table.
    pub async fn sqlite(pool: SqlitePool, clock: Arc<dyn Clock>, config: &SyncEngineConfig) -> Result<Self> {
        let repository = SqliteTaskQueueRepository::new(pool);
        repository.initialize().await?;
        Ok(Self::new(Arc::new(repository), clock, config))
    }

    /// Queue a task that is due immediately.
    pub async fn enqueue(&self, task: SyncTask) -> Result<TaskId> {
        self.enqueue_in(task, Duration::ZERO).await
    }

    /// Queue a task that becomes claimable after `delay`.
    pub async fn enqueue_in(&self, task: SyncTask, delay: Duration) -> Result<TaskId> {
        let now = self.clock.now();
        let available_at = after(now, delay);
        let queued = QueuedTask::new(task, available_at, now);

        debug!(
            task_id = %queued.id,
            kind = queued.task.kind(),
            delay_ms = delay.as_millis() as u64,
            "Enqueuing task"
        );

        self.repository.insert(&queued).await?;
        Ok(queued.id)
    }

    /// Queue a task unless one was already queued under `key`, in any
    /// status. Returns the id of whichever task holds the key.
    pub async fn enqueue_once(&self, task: SyncTask, key: impl Into<String>) -> Result<TaskId> {
        let key = key.into();
        let now = self.clock.now();
        let mut queued = QueuedTask::new(task, now, now);
        queued.dedup_key = Some(key.clone());

        if self.repository.insert(&queued).await? {
            debug!(task_id = %queued.id, kind = queued.task.kind(), "Enqueuing task");
            return Ok(queued.id);
        }

        let existing = self
            .repository
            .find_by_dedup_key(&key)
            .await?
            .ok_or_else(|| SyncError::Database(format!("Task with dedup key {} vanished", key)))?;
        debug!(task_id = %existing.id, %key, "Task already queued, not queueing again");
        Ok(existing.id)
    }

    /// Claim the next due task, if any.
    pub async fn dequeue(&self) -> Result<Option<QueuedTask>> {
        let claimed = self.repository.claim_next(self.clock.now()).await?;
        if let Some(task) = &claimed {
            debug!(
                task_id = %task.id,
                kind = task.task.kind(),
                attempts = task.attempts,
                "Dequeued task"
            );
        }
        Ok(claimed)
    }

    pub async fn mark_complete(&self, id: TaskId) -> Result<()> {
        let mut task = self.find(id).await?;
        task.status = TaskStatus::Completed;
        task.updated_at = self.clock.now();
        self.repository.update(&task).await?;

        debug!(task_id = %id, kind = task.task.kind(), "Task completed");
        Ok(())
    }

    /// Record a failed attempt. Transient errors under the retry ceiling
    /// send the task back to pending with backoff; anything else fails it.
    pub async fn mark_failed(&self, id: TaskId, error: &SyncError) -> Result<FailureDisposition> {
        let mut task = self.find(id).await?;
        let now = self.clock.now();

        task.attempts += 1;
        task.last_error = Some(error.to_string());
        task.updated_at = now;
        task.started_at = None;

        let disposition = if error.is_transient() && task.attempts <= self.config.max_retries {
            let delay = self.config.retry_delay(task.attempts - 1);
            task.status = TaskStatus::Pending;
            task.available_at = after(now, delay);
            FailureDisposition::Retrying {
                attempt: task.attempts,
                delay,
            }
        } else {
            task.status = TaskStatus::Failed;
            FailureDisposition::Failed
        };
        self.repository.update(&task).await?;

        match disposition {
            FailureDisposition::Retrying { attempt, delay } => warn!(
                task_id = %id,
                kind = task.task.kind(),
                attempt,
                max_retries = self.config.max_retries,
                backoff_ms = delay.as_millis() as u64,
                error = %error,
                "Task failed, will retry"
            ),
            FailureDisposition::Failed => warn!(
                task_id = %id,
                kind = task.task.kind(),
                attempts = task.attempts,
                error = %error,
                "Task failed permanently"
            ),
        }

        Ok(disposition)
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<QueuedTask>> {
        self.repository.find_by_id(id).await
    }

    /// Hand tasks of crashed workers back to the queue.
    pub async fn recover_stale(&self) -> Result<u64> {
        let now = self.clock.now();
        let cutoff = now
            .checked_sub_signed(to_chrono(self.config.stale_task_after))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let recovered = self.repository.requeue_stale(cutoff, now).await?;
        if recovered > 0 {
            warn!(recovered, "Requeued tasks abandoned by a crashed worker");
        }
        Ok(recovered)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            pending: self.repository.count_by_status(TaskStatus::Pending).await?,
            processing: self.repository.count_by_status(TaskStatus::Processing).await?,
            completed: self.repository.count_by_status(TaskStatus::Completed).await?,
            failed: self.repository.count_by_status(TaskStatus::Failed).await?,
        })
    }

    pub async fn cleanup_completed(&self) -> Result<u64> {
        let deleted = self.repository.delete_completed().await?;
        info!(deleted_count = deleted, "Cleaned up completed tasks");
        Ok(deleted)
    }

    pub async fn get_failed(&self) -> Result<Vec<QueuedTask>> {
        self.repository.get_failed().await
    }

    async fn find(&self, id: TaskId) -> Result<QueuedTask> {
        self.repository
            .find_by_id(id)
            .await?
            .ok_or_else(|| SyncError::TaskNotFound {
                task_id: id.to_string(),
            })
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_chrono(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Queue statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }

    /// Nothing left to run or running.
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}
