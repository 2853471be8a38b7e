//! # Continuations
//!
//! A multi-page import is not one call stack. Each page runs as its own
//! unit of work, and everything the next page needs travels in the
//! [`ImportCollection`] message: the page token, the fixed window bounds,
//! the run id that owns the source lock, and the handles of the run's
//! remote sets.
//!
//! [`ContinuationController::settle`] closes out one page: it either
//! schedules the next page as a fresh task or, after the last page,
//! advances the watermark and releases the lock.

use bridge_traits::{Clock, PageToken};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::importer::FeedImportResult;
use crate::lock::LockGuard;
use crate::reconciliation::ChordId;
use crate::remote_set::RemoteSetRef;
use crate::repository::WatermarkStore;
use crate::source::SourceId;
use crate::task_queue::{SyncTask, TaskQueue};
use crate::watermark::Watermark;

/// Identifier of one logical import run, shared by all of its pages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
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

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameters of one page of an import run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportCollection {
    pub source_id: SourceId,
    pub run_id: RunId,
    /// Ignore the watermark and rewrite every title
    #[serde(default)]
    pub import_all: bool,
    /// `None` starts at the beginning of the feed
    #[serde(default)]
    pub page: Option<PageToken>,
    /// Required once `page` is set
    #[serde(default)]
    pub modified_since: Option<DateTime<Utc>>,
    /// Required once `page` is set
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Titles a parent account of this source already imported
    #[serde(default)]
    pub parent_identifiers: Option<RemoteSetRef>,
    /// Keep this run's active identifiers in a remote set
    #[serde(default)]
    pub return_identifiers: bool,
    #[serde(default)]
    pub identifier_set: Option<RemoteSetRef>,
    /// Reconciliation waiting on this run's identifiers
    #[serde(default)]
    pub reply_to: Option<ChordId>,
    /// Child sources to import once this run completes, in order
    #[serde(default)]
    pub pending_children: Vec<SourceId>,
    #[serde(default)]
    pub active_processed: u64,
    #[serde(default)]
    pub inactive_processed: u64,
}

impl ImportCollection {
    /// First page of a new run.
    pub fn start(source_id: SourceId) -> Self {
        Self {
            source_id,
            run_id: RunId::new(),
            import_all: false,
            page: None,
            modified_since: None,
            start_time: None,
            parent_identifiers: None,
            return_identifiers: false,
            identifier_set: None,
            reply_to: None,
            pending_children: Vec::new(),
            active_processed: 0,
            inactive_processed: 0,
        }
    }

    pub fn import_all(mut self, import_all: bool) -> Self {
        self.import_all = import_all;
        self
    }

    pub fn with_parent_identifiers(mut self, set: RemoteSetRef) -> Self {
        self.parent_identifiers = Some(set);
        self
    }

    pub fn returning_identifiers(mut self) -> Self {
        self.return_identifiers = true;
        self
    }

    pub fn reply_to(mut self, chord_id: ChordId) -> Self {
        self.reply_to = Some(chord_id);
        self
    }

    pub fn then_children(mut self, children: Vec<SourceId>) -> Self {
        self.pending_children = children;
        self
    }

    pub fn is_first_page(&self) -> bool {
        self.page.is_none()
    }

    /// A continuation must carry both window bounds.
    pub fn validate(&self) -> Result<()> {
        if self.page.is_some() && (self.modified_since.is_none() || self.start_time.is_none()) {
            return Err(SyncError::MissingContinuation);
        }
        Ok(())
    }

    /// Queue key of this run's task for `page`. A run queues each page once.
    pub fn page_key(&self, page: &PageToken) -> String {
        format!("import:{}:{}", self.run_id, page)
    }

    /// Queue key of whatever follows this run once it ends.
    pub fn follow_up_key(&self) -> String {
        format!("import:{}:after", self.run_id)
    }

    /// Parameters of the page after this one.
    pub fn continue_with(&self, result: &FeedImportResult, next_page: PageToken) -> Self {
        Self {
            page: Some(next_page),
            identifier_set: result.identifier_set.clone().or_else(|| self.identifier_set.clone()),
            active_processed: self.active_processed + result.active_processed,
            inactive_processed: self.inactive_processed + result.inactive_processed,
            ..self.clone()
        }
    }
}

/// What [`ContinuationController::settle`] did with a finished page.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// The next page was queued and the lock left to it.
    Scheduled(ImportCollection),
    /// The run finished; the watermark moved and the lock was released.
    Completed(Watermark),
}

pub struct ContinuationController {
    queue: Arc<TaskQueue>,
    watermarks: Arc<dyn WatermarkStore>,
    clock: Arc<dyn Clock>,
}

impl ContinuationController {
    pub fn new(queue: Arc<TaskQueue>, watermarks: Arc<dyn WatermarkStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            queue,
            watermarks,
            clock,
        }
    }

    /// Close out one page of a run.
    ///
    /// With a next page, the continuation is queued as a new task and the
    /// guard is retained for it. Without one, the watermark advances to
    /// `{start_time, now}` in one write and the guard is released. On error
    /// the guard is released and the watermark is untouched.
    pub async fn settle(
        &self,
        params: &ImportCollection,
        service: &str,
        result: &FeedImportResult,
        guard: LockGuard,
    ) -> Result<Settlement> {
        let Some(start_time) = params.start_time else {
            guard.release().await?;
            return Err(SyncError::MissingContinuation);
        };

        match &result.next_page {
            Some(next_page) => {
                let next = params.continue_with(result, next_page.clone());
                let lock = guard.lock().clone();
                guard.retain().await?;

                let key = params.page_key(next_page);
                if let Err(e) = self
                    .queue
                    .enqueue_once(SyncTask::ImportCollection(next.clone()), key)
                    .await
                {
                    lock.release().await?;
                    return Err(e);
                }

                debug!(
                    source_id = %params.source_id,
                    run_id = %params.run_id,
                    next_page = %next_page,
                    "Scheduled next page"
                );
                Ok(Settlement::Scheduled(next))
            }
            None => {
                let finish = self.clock.now();
                let advanced = self
                    .watermarks
                    .advance(params.source_id, service, start_time, finish)
                    .await;
                let released = guard.release().await;
                let watermark = advanced?;
                released?;

                info!(
                    source_id = %params.source_id,
                    run_id = %params.run_id,
                    start = %start_time,
                    finish = %finish,
                    "Import run complete, watermark advanced"
                );
                Ok(Settlement::Completed(watermark))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::DistributedLock;
    use crate::repository::SqliteWatermarkStore;
    use crate::task_queue::{SqliteTaskQueueRepository, TaskQueue};
    use bridge_desktop::InMemoryKeyValueStore;
    use bridge_traits::{LockStore, ManualClock};
    use chrono::TimeZone;
    use core_runtime::config::SyncEngineConfig;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;

    struct Fixture {
        controller: ContinuationController,
        queue: Arc<TaskQueue>,
        watermarks: Arc<SqliteWatermarkStore>,
        locks: Arc<dyn LockStore>,
        clock: Arc<ManualClock>,
    }

    async fn fixture() -> Fixture {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()));
        let config = SyncEngineConfig::builder()
            .database_url("sqlite::memory:")
            .build()
            .unwrap();

        let repository = SqliteTaskQueueRepository::new(pool.clone());
        repository.initialize().await.unwrap();
        let queue = Arc::new(TaskQueue::new(Arc::new(repository), clock.clone(), &config));

        let watermarks = Arc::new(SqliteWatermarkStore::new(pool));
        watermarks.initialize().await.unwrap();

        Fixture {
            controller: ContinuationController::new(queue.clone(), watermarks.clone(), clock.clone()),
            queue,
            watermarks,
            locks: Arc::new(InMemoryKeyValueStore::with_clock(clock.clone())),
            clock,
        }
    }

    fn first_page(fx: &Fixture) -> ImportCollection {
        let mut params = ImportCollection::start(SourceId::new(9));
        params.modified_since = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        params.start_time = Some(fx.clock.now());
        params
    }

    fn lock_for(fx: &Fixture, params: &ImportCollection) -> DistributedLock {
        DistributedLock::new(
            fx.locks.clone(),
            crate::lock::source_lock_key(params.source_id),
            params.run_id.as_str(),
            Duration::from_secs(300),
        )
    }

    #[test]
    fn test_validate_requires_window_on_continuations() {
        let mut params = ImportCollection::start(SourceId::new(1));
        assert!(params.validate().is_ok());

        params.page = Some(PageToken::Number(2));
        assert!(matches!(params.validate(), Err(SyncError::MissingContinuation)));

        params.modified_since = Some(Utc::now());
        params.start_time = Some(Utc::now());
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_continue_with_carries_window() {
        let mut params = ImportCollection::start(SourceId::new(1));
        params.modified_since = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        params.start_time = Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        let result = FeedImportResult {
            active_processed: 90,
            inactive_processed: 10,
            ..Default::default()
        };

        let next = params.continue_with(&result, PageToken::Number(2));

        assert_eq!(next.page, Some(PageToken::Number(2)));
        assert_eq!(next.run_id, params.run_id);
        assert_eq!(next.modified_since, params.modified_since);
        assert_eq!(next.start_time, params.start_time);
        assert_eq!(next.active_processed, 90);
        assert_eq!(next.inactive_processed, 10);
    }

    #[test]
    fn test_message_round_trips_through_json() {
        let params = ImportCollection::start(SourceId::new(4)).import_all(true);
        let json = serde_json::to_string(&params).unwrap();
        let back: ImportCollection = serde_json::from_str(&json).unwrap();
        assert_eq!(params, back);
    }

    #[tokio::test]
    async fn test_next_page_is_queued_and_lock_retained() {
        let fx = fixture().await;
        let params = first_page(&fx);
        let lock = lock_for(&fx, &params);
        let guard = lock.acquire().await.unwrap();
        let result = FeedImportResult {
            current_page: 1,
            total_pages: 2,
            next_page: Some(PageToken::Number(2)),
            ..Default::default()
        };

        let settlement = fx
            .controller
            .settle(&params, "Boundless Import", &result, guard)
            .await
            .unwrap();

        assert!(matches!(settlement, Settlement::Scheduled(_)));
        assert!(lock.locked(true).await.unwrap());
        let queued = fx.queue.dequeue().await.unwrap().unwrap();
        match queued.task {
            SyncTask::ImportCollection(next) => {
                assert_eq!(next.page, Some(PageToken::Number(2)));
                assert_eq!(next.start_time, params.start_time);
            }
            other => panic!("unexpected task {:?}", other),
        }
        assert!(fx
            .watermarks
            .load(params.source_id, "Boundless Import")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_last_page_advances_watermark_and_releases() {
        let fx = fixture().await;
        let params = first_page(&fx);
        let lock = lock_for(&fx, &params);
        let guard = lock.acquire().await.unwrap();
        fx.clock.advance(chrono::Duration::minutes(3));

        let settlement = fx
            .controller
            .settle(&params, "Boundless Import", &FeedImportResult::default(), guard)
            .await
            .unwrap();

        let Settlement::Completed(watermark) = settlement else {
            panic!("expected completion");
        };
        assert_eq!(watermark.start, params.start_time);
        assert_eq!(watermark.finish, Some(fx.clock.now()));
        assert!(!lock.locked(false).await.unwrap());
        assert!(fx.queue.dequeue().await.unwrap().is_none());
    }
}
