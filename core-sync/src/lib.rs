//! # Catalog Sync Engine
//!
//! Pulls bibliographic and availability data from license-provider catalogs
//! into local state, one page per unit of work.
//!
//! ## Overview
//!
//! A source's import is a chain of independently queued tasks. Each task
//! imports one page and hands the next page to a new task, carrying the
//! window bounds and run id in the message. The chain holds the source's
//! [`DistributedLock`] from its first page to its last, and only the last
//! page advances the source's [`Watermark`]. A crash anywhere in between
//! leaves the watermark where it was, and the next run covers the same
//! window again.
//!
//! ## Components
//!
//! - **Remote Sets** (`remote_set`): TTL-bounded shared sets used to pass
//!   identifier collections between tasks
//! - **Distributed Lock** (`lock`): One run per source at a time
//! - **Watermarks** (`watermark`, `repository`): Per-source checkpoints
//! - **Importers** (`importer`): Per-provider page import
//! - **Continuations** (`continuation`): Next-page scheduling and run completion
//! - **Task Queue** (`task_queue`): Durable queue with retries and backoff
//! - **Reconciliation** (`reconciliation`): Deactivation of titles that
//!   disappeared from a provider's feed
//! - **Coordinator** (`coordinator`) and **Worker** (`worker`): Task dispatch

pub mod continuation;
pub mod coordinator;
pub mod error;
pub mod importer;
pub mod lock;
pub mod reconciliation;
pub mod remote_set;
pub mod repository;
pub mod sink;
pub mod source;
pub mod task_queue;
pub mod watermark;
pub mod worker;

pub use continuation::{ContinuationController, ImportCollection, RunId, Settlement};
pub use coordinator::{SyncCoordinator, SyncServices};
pub use error::{Result, SyncError};
pub use importer::{
    BoundlessImporter, EntryPolicy, FeedImportResult, OverdriveImporter, PageContext,
    PaginatedImporter, ProviderImporter,
};
pub use lock::{DistributedLock, LockGuard};
pub use reconciliation::{
    Branch, BranchOutcome, ChordId, ChordRepository, ReconciliationChord, ReconciliationOutcome,
    SqliteChordRepository,
};
pub use remote_set::{RemoteSet, RemoteSetRef, SetOperand};
pub use repository::{SqliteWatermarkStore, WatermarkStore};
pub use sink::{CatalogSink, LocalCatalog};
pub use source::{ProviderKind, SourceConfig, SourceId, SourceRegistry};
pub use task_queue::{
    FailureDisposition, QueueStats, QueuedTask, SqliteTaskQueueRepository, SyncTask, TaskId,
    TaskQueue, TaskQueueRepository, TaskStatus,
};
pub use watermark::{default_start_time, Watermark};
pub use worker::SyncWorker;
