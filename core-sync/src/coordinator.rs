//! # Sync Coordinator
//!
//! Runs every kind of [`SyncTask`] against the injected stores and sinks.
//!
//! ## Overview
//!
//! The coordinator holds no per-run state. Each call works from the task
//! message alone and leaves behind whatever the next task needs: a queued
//! continuation, an advanced watermark, a branch report.
//!
//! ## Import run
//!
//! 1. Reject continuations without window bounds, before touching the lock
//! 2. Take the source lock for the run id, re-entering it on continuations
//! 3. On the first page, compute the window from the watermark and fix the
//!    run's start time
//! 4. Import one page through the provider's importer
//! 5. Settle: queue the next page or advance the watermark and release
//! 6. After the last page, report to a waiting reconciliation and move on
//!    to the next child account of a group
//!
//! A failing page releases the lock and leaves the watermark alone, so the
//! next run covers the same window again.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let coordinator = Arc::new(SyncCoordinator::new(config, services)?);
//! coordinator.import_all_sources(ProviderKind::Boundless, false).await?;
//! SyncWorker::new(coordinator).run().await?;
//! ```

use bridge_traits::{Clock, IdentifierData, LockStore, SetStore};
use core_runtime::config::SyncEngineConfig;
use core_runtime::events::{CoreEvent, EventBus, ImportEvent};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::continuation::{ContinuationController, ImportCollection, Settlement};
use crate::error::{Result, SyncError};
use crate::importer::{FeedImportResult, PageContext, PaginatedImporter, ProviderImporter};
use crate::lock::DistributedLock;
use crate::reconciliation::{Branch, BranchOutcome, ChordRepository, ReconciliationChord};
use crate::remote_set::{RemoteSet, RemoteSetRef};
use crate::repository::WatermarkStore;
use crate::sink::{CatalogSink, LocalCatalog};
use crate::source::{ProviderKind, SourceConfig, SourceId, SourceRegistry};
use crate::task_queue::{SyncTask, TaskQueue};
use crate::watermark::default_start_time;

/// Collaborators of the engine, injected by the host application.
#[derive(Clone)]
pub struct SyncServices {
    pub sources: Arc<dyn SourceRegistry>,
    pub locks: Arc<dyn LockStore>,
    pub sets: Arc<dyn SetStore>,
    pub watermarks: Arc<dyn WatermarkStore>,
    pub chords: Arc<dyn ChordRepository>,
    pub queue: Arc<TaskQueue>,
    pub sink: Arc<dyn CatalogSink>,
    pub catalog: Arc<dyn LocalCatalog>,
    pub clock: Arc<dyn Clock>,
    pub events: EventBus,
}

pub struct SyncCoordinator {
    config: SyncEngineConfig,
    services: SyncServices,
    continuations: ContinuationController,
    chord: ReconciliationChord,
}

impl SyncCoordinator {
    /// # Errors
    ///
    /// Returns [`SyncError::Configuration`] when `config` does not validate.
    pub fn new(config: SyncEngineConfig, services: SyncServices) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SyncError::Configuration(e.to_string()))?;

        let continuations = ContinuationController::new(
            services.queue.clone(),
            services.watermarks.clone(),
            services.clock.clone(),
        );
        let chord = ReconciliationChord::new(
            services.chords.clone(),
            services.queue.clone(),
            services.sets.clone(),
            services.sink.clone(),
            services.catalog.clone(),
            services.clock.clone(),
            services.events.clone(),
            config.remote_set_ttl,
        );

        Ok(Self {
            config,
            services,
            continuations,
            chord,
        })
    }

    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.services.queue
    }

    pub fn events(&self) -> &EventBus {
        &self.services.events
    }

    pub fn reconciliation(&self) -> &ReconciliationChord {
        &self.chord
    }

    /// Run one unit of work.
    pub async fn execute(&self, task: &SyncTask) -> Result<()> {
        match task {
            SyncTask::ImportAllSources {
                provider,
                import_all,
            } => self
                .import_all_sources(*provider, *import_all)
                .await
                .map(|_| ()),
            SyncTask::ImportCollection(params) => {
                self.import_collection(params.clone()).await.map(|_| ())
            }
            SyncTask::ImportCollectionGroup {
                source_id,
                import_all,
            } => self.import_collection_group(*source_id, *import_all).await,
            SyncTask::ReconcileSource { source_id } => {
                self.chord.start(*source_id).await.map(|_| ())
            }
            SyncTask::CollectAvailable {
                source_id,
                chord_id,
            } => self.chord.collect_available(*source_id, chord_id).await,
            SyncTask::CombineReconciliation { chord_id } => {
                self.chord.combine(chord_id).await.map(|_| ())
            }
            SyncTask::RemoveSet { set } => self.remove_set(set).await.map(|_| ()),
        }
    }

    /// Queue an import of every top-level source of `provider`.
    ///
    /// Sources with child accounts are imported as a group. Imports are
    /// spread out by `source_stagger` so they do not hit the provider at
    /// once. Returns how many were queued.
    #[instrument(skip(self))]
    pub async fn import_all_sources(&self, provider: ProviderKind, import_all: bool) -> Result<usize> {
        let sources = self.services.sources.sources_for(provider).await?;
        let mut queued = 0usize;

        for source in sources.iter().filter(|s| s.parent_id.is_none()) {
            let has_children = !self.services.sources.children(source.id).await?.is_empty();
            let task = if has_children {
                SyncTask::ImportCollectionGroup {
                    source_id: source.id,
                    import_all,
                }
            } else {
                SyncTask::ImportCollection(ImportCollection::start(source.id).import_all(import_all))
            };

            let delay = self.config.source_stagger.saturating_mul(queued as u32);
            self.services.queue.enqueue_in(task, delay).await?;
            queued += 1;
        }

        info!("Queued {} collections for import.", queued);
        Ok(queued)
    }

    /// Queue an import of a parent source followed by each of its children.
    ///
    /// The parent's run collects its identifiers, and the children skip
    /// metadata lookups for titles the parent already imported.
    #[instrument(skip(self))]
    pub async fn import_collection_group(&self, source_id: SourceId, import_all: bool) -> Result<()> {
        let source = self.source(source_id).await?;
        let children: Vec<SourceId> = self
            .services
            .sources
            .children(source.id)
            .await?
            .into_iter()
            .map(|child| child.id)
            .collect();

        let mut params = ImportCollection::start(source.id).import_all(import_all);
        if !children.is_empty() {
            params = params.returning_identifiers().then_children(children);
        }
        self.services
            .queue
            .enqueue(SyncTask::ImportCollection(params))
            .await?;
        Ok(())
    }

    /// Import one page of a source and settle the run.
    #[instrument(
        skip(self, params),
        fields(source_id = %params.source_id, run_id = %params.run_id, page = ?params.page)
    )]
    pub async fn import_collection(&self, mut params: ImportCollection) -> Result<Settlement> {
        params.validate()?;

        let source = self.source(params.source_id).await?;
        let service = source.provider.service_name();
        let lock = DistributedLock::for_source(
            self.services.locks.clone(),
            source.id,
            &params.run_id,
            &self.config,
        );
        let guard = match lock.acquire().await {
            Ok(guard) => guard,
            Err(SyncError::LockNotAcquired { key, holder }) => {
                self.emit(ImportEvent::RunSkipped {
                    source_id: source.id.to_string(),
                    holder: holder.clone(),
                });
                return Err(SyncError::LockNotAcquired { key, holder });
            }
            Err(e) => return Err(e),
        };

        let result = match self.run_page(&source, service, &mut params).await {
            Ok(result) => result,
            Err(e) => {
                if let Err(release_error) = guard.release().await {
                    warn!(error = %release_error, "Failed to release lock after failed page");
                }
                self.emit(ImportEvent::RunFailed {
                    source_id: source.id.to_string(),
                    run_id: params.run_id.to_string(),
                    message: e.to_string(),
                    retrying: e.is_transient(),
                });
                return Err(e);
            }
        };

        let settlement = self
            .continuations
            .settle(&params, service, &result, guard)
            .await?;

        match &settlement {
            Settlement::Scheduled(next) => {
                if let Some(page) = &next.page {
                    self.emit(ImportEvent::ContinuationScheduled {
                        source_id: source.id.to_string(),
                        run_id: params.run_id.to_string(),
                        next_page: page.to_string(),
                    });
                }
            }
            Settlement::Completed(_) => {
                self.emit(ImportEvent::RunCompleted {
                    source_id: source.id.to_string(),
                    run_id: params.run_id.to_string(),
                    active_processed: params.active_processed + result.active_processed,
                    inactive_processed: params.inactive_processed + result.inactive_processed,
                });
                let identifiers = result
                    .identifier_set
                    .clone()
                    .or_else(|| params.identifier_set.clone());
                self.finish_run(&params, identifiers).await?;
            }
        }

        Ok(settlement)
    }

    /// Everything between taking the lock and settling the page.
    async fn run_page(
        &self,
        source: &SourceConfig,
        service: &str,
        params: &mut ImportCollection,
    ) -> Result<FeedImportResult> {
        if params.is_first_page() {
            let watermark = self
                .services
                .watermarks
                .get_or_create(source.id, service)
                .await?;
            params.modified_since = Some(watermark.modified_since(params.import_all));
            params.start_time = Some(self.services.clock.now());

            if params.return_identifiers && params.identifier_set.is_none() {
                let source_key = source.id.to_string();
                let run_key = params.run_id.as_str();
                let set = RemoteSet::<IdentifierData>::with_namespace(
                    self.services.sets.clone(),
                    self.config.remote_set_ttl,
                    &["CatalogImport", source_key.as_str(), run_key.as_str(), "identifiers"],
                );
                params.identifier_set = Some(set.to_ref());
            }

            info!(
                modified_since = ?params.modified_since,
                import_all = params.import_all,
                "Starting import run"
            );
            self.emit(ImportEvent::RunStarted {
                source_id: source.id.to_string(),
                run_id: params.run_id.to_string(),
                modified_since: (!params.import_all)
                    .then(|| params.modified_since.map(|t| t.to_rfc3339()))
                    .flatten(),
            });
        }

        let parent_identifiers: Option<HashSet<IdentifierData>> = match &params.parent_identifiers {
            Some(handle) => Some(self.open_set(handle)?.get().await?),
            None => None,
        };
        let identifier_set = params
            .identifier_set
            .as_ref()
            .map(|handle| self.open_set(handle))
            .transpose()?;

        let feed = self.services.sources.feed(source).await?;
        let importer = ProviderImporter::for_source(
            source,
            feed,
            self.services.sink.clone(),
            self.services.catalog.clone(),
            self.services.clock.clone(),
        );

        let ctx = PageContext {
            source_id: source.id,
            page: params.page.as_ref(),
            modified_since: params.modified_since.unwrap_or_else(default_start_time),
            import_all: params.import_all,
            page_size: self.config.page_size,
            parent_identifiers: parent_identifiers.as_ref(),
            identifier_set: identifier_set.as_ref(),
        };
        let result = importer.import_page(ctx).await?;

        self.emit(ImportEvent::PageImported {
            source_id: source.id.to_string(),
            run_id: params.run_id.to_string(),
            current_page: result.current_page,
            total_pages: result.total_pages,
            active_processed: result.active_processed,
            inactive_processed: result.inactive_processed,
        });
        Ok(result)
    }

    /// Follow-up work once a run has ended.
    async fn finish_run(&self, params: &ImportCollection, identifiers: Option<RemoteSetRef>) -> Result<()> {
        if let Some(chord_id) = &params.reply_to {
            let outcome = match identifiers.clone() {
                Some(set) => BranchOutcome::Set(set),
                None => BranchOutcome::Failed {
                    reason: "import run kept no identifier set".to_string(),
                },
            };
            self.chord.report(chord_id, Branch::Active, outcome).await?;
        }
        self.advance_group(params, identifiers).await
    }

    /// Queue the next child of a group, or drop the shared set after the
    /// last one.
    async fn advance_group(&self, params: &ImportCollection, identifiers: Option<RemoteSetRef>) -> Result<()> {
        let shared = params.parent_identifiers.clone().or(identifiers);

        if let Some((next, rest)) = params.pending_children.split_first() {
            let mut child = ImportCollection::start(*next)
                .import_all(params.import_all)
                .then_children(rest.to_vec());
            if let Some(set) = shared {
                child = child.with_parent_identifiers(set);
            }
            debug!(child = %next, remaining = rest.len(), "Queueing next account of group");
            self.services
                .queue
                .enqueue_once(SyncTask::ImportCollection(child), params.follow_up_key())
                .await?;
        } else if let Some(set) = params.parent_identifiers.clone() {
            self.services
                .queue
                .enqueue_once(SyncTask::RemoveSet { set }, params.follow_up_key())
                .await?;
        }
        Ok(())
    }

    /// Cleanup after a task failed for good.
    ///
    /// A failed branch is reported to its reconciliation so the combiner
    /// skips instead of waiting forever, and a group moves on to its
    /// remaining children.
    pub async fn on_permanent_failure(&self, task: &SyncTask, error: &SyncError) -> Result<()> {
        match task {
            SyncTask::ImportCollection(params) => {
                if let Some(chord_id) = &params.reply_to {
                    self.chord
                        .report(
                            chord_id,
                            Branch::Active,
                            BranchOutcome::Failed {
                                reason: error.to_string(),
                            },
                        )
                        .await?;
                    if let Some(set) = &params.identifier_set {
                        self.remove_set(set).await?;
                    }
                }
                if !params.pending_children.is_empty() || params.parent_identifiers.is_some() {
                    self.advance_group(params, params.identifier_set.clone())
                        .await?;
                }
                Ok(())
            }
            SyncTask::CollectAvailable { chord_id, .. } => {
                self.chord
                    .report(
                        chord_id,
                        Branch::Existing,
                        BranchOutcome::Failed {
                            reason: error.to_string(),
                        },
                    )
                    .await
            }
            _ => Ok(()),
        }
    }

    /// Delete a remote set. Returns whether it existed.
    pub async fn remove_set(&self, set: &RemoteSetRef) -> Result<bool> {
        self.open_set(set)?.delete().await
    }

    async fn source(&self, source_id: SourceId) -> Result<SourceConfig> {
        self.services
            .sources
            .source(source_id)
            .await?
            .ok_or_else(|| SyncError::SourceNotFound(source_id.to_string()))
    }

    fn open_set(&self, handle: &RemoteSetRef) -> Result<RemoteSet<IdentifierData>> {
        RemoteSet::from_ref(self.services.sets.clone(), handle, self.config.remote_set_ttl)
    }

    fn emit(&self, event: ImportEvent) {
        self.services.events.emit(CoreEvent::Import(event)).ok();
    }
}
