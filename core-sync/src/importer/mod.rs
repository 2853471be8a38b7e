//! # Paginated Importers
//!
//! One importer per provider turns one feed page into sink writes and a
//! [`FeedImportResult`] saying where the next page starts. Importers keep
//! no state between pages; everything a page needs arrives in its
//! [`PageContext`].
//!
//! ## Per-page flow
//!
//! 1. Fetch the page from the provider feed
//! 2. Classify every entry as active or inactive
//! 3. Look up active titles in provider-sized batches. Changed metadata goes
//!    to the bibliographic sink, changed availability to the circulation
//!    sink, and the rest is counted as unchanged
//! 4. Write zero availability for inactive titles
//! 5. Decide whether another page follows
//!
//! Writes already made stay applied if a later step fails. Sinks upsert, so
//! replaying the page is harmless.

mod boundless;
mod overdrive;

pub use boundless::{BoundlessImporter, BoundlessPolicy};
pub use overdrive::{OverdriveImporter, OverdrivePolicy};

use async_trait::async_trait;
use bridge_traits::{
    CatalogFeed, CirculationData, Clock, FeedEntry, FeedRequest, IdentifierData, PageToken,
    ReplacementPolicy, TitleRecord,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::error::Result;
use crate::remote_set::{RemoteSet, RemoteSetRef};
use crate::sink::{CatalogSink, LocalCatalog};
use crate::source::{ProviderKind, SourceConfig, SourceId};

/// Outcome of importing one page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedImportResult {
    pub current_page: u32,
    pub total_pages: u32,
    /// Where the next page starts. `None` ends the run.
    pub next_page: Option<PageToken>,
    pub active_processed: u64,
    pub inactive_processed: u64,
    /// Active titles whose stored data already matched the feed
    pub unchanged: u64,
    /// Malformed entries and records without usable data
    pub skipped: u64,
    /// Set that collected this run's active identifiers, when one was kept
    pub identifier_set: Option<RemoteSetRef>,
}

impl FeedImportResult {
    pub fn is_last_page(&self) -> bool {
        self.next_page.is_none()
    }
}

/// Everything one page import needs to know.
pub struct PageContext<'a> {
    pub source_id: SourceId,
    /// `None` for the first page
    pub page: Option<&'a PageToken>,
    pub modified_since: DateTime<Utc>,
    /// Ignore the window and treat every title as changed
    pub import_all: bool,
    pub page_size: u32,
    /// Titles a parent account already imported metadata for
    pub parent_identifiers: Option<&'a HashSet<IdentifierData>>,
    /// Set collecting the active identifiers of the run
    pub identifier_set: Option<&'a RemoteSet<IdentifierData>>,
}

/// Capability shared by every provider importer.
#[async_trait]
pub trait PaginatedImporter: Send + Sync {
    fn provider(&self) -> ProviderKind;

    async fn import_page(&self, ctx: PageContext<'_>) -> Result<FeedImportResult>;
}

/// Provider-specific reading of feed entries.
pub trait EntryPolicy: Send + Sync {
    fn provider(&self) -> ProviderKind;

    /// `Some(true)` for titles still licensed, `Some(false)` for titles the
    /// provider delisted, `None` when the entry cannot be classified.
    fn classify(&self, entry: &FeedEntry) -> Option<bool>;

    /// Whether pages are ordered newest first, so a page entirely older
    /// than the window means no later page is in it either.
    fn supports_early_termination(&self) -> bool;
}

/// Importers of every supported provider.
pub enum ProviderImporter {
    Boundless(BoundlessImporter),
    Overdrive(OverdriveImporter),
}

impl ProviderImporter {
    pub fn for_source(
        source: &SourceConfig,
        feed: Arc<dyn CatalogFeed>,
        sink: Arc<dyn CatalogSink>,
        catalog: Arc<dyn LocalCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        match source.provider {
            ProviderKind::Boundless => {
                ProviderImporter::Boundless(BoundlessImporter::new(feed, sink, catalog, clock))
            }
            ProviderKind::Overdrive => {
                ProviderImporter::Overdrive(OverdriveImporter::new(feed, sink, catalog, clock))
            }
        }
    }
}

#[async_trait]
impl PaginatedImporter for ProviderImporter {
    fn provider(&self) -> ProviderKind {
        match self {
            ProviderImporter::Boundless(importer) => importer.provider(),
            ProviderImporter::Overdrive(importer) => importer.provider(),
        }
    }

    async fn import_page(&self, ctx: PageContext<'_>) -> Result<FeedImportResult> {
        match self {
            ProviderImporter::Boundless(importer) => importer.import_page(ctx).await,
            ProviderImporter::Overdrive(importer) => importer.import_page(ctx).await,
        }
    }
}

/// Shared page pipeline, specialized by an [`EntryPolicy`].
pub struct PageProcessor<P> {
    feed: Arc<dyn CatalogFeed>,
    sink: Arc<dyn CatalogSink>,
    catalog: Arc<dyn LocalCatalog>,
    clock: Arc<dyn Clock>,
    policy: P,
}

impl<P: EntryPolicy> PageProcessor<P> {
    pub fn with_policy(
        feed: Arc<dyn CatalogFeed>,
        sink: Arc<dyn CatalogSink>,
        catalog: Arc<dyn LocalCatalog>,
        clock: Arc<dyn Clock>,
        policy: P,
    ) -> Self {
        Self {
            feed,
            sink,
            catalog,
            clock,
            policy,
        }
    }

    #[instrument(
        skip(self, ctx),
        fields(
            provider = %self.policy.provider(),
            source_id = %ctx.source_id,
            page = ?ctx.page,
        )
    )]
    async fn process(&self, ctx: PageContext<'_>) -> Result<FeedImportResult> {
        let request = FeedRequest {
            page: ctx.page.cloned(),
            modified_since: (!ctx.import_all).then_some(ctx.modified_since),
            page_size: ctx.page_size,
        };
        let page = self.feed.fetch_page(request).await?;

        let mut result = FeedImportResult {
            current_page: page.current_page,
            total_pages: page.total_pages,
            ..Default::default()
        };

        for rejected in &page.rejected {
            warn!(reason = %rejected.reason, raw = %rejected.raw, "Skipping malformed feed entry");
            result.skipped += 1;
        }

        let out_of_window = page_before(&page.entries, ctx.modified_since);
        let id_type = self.feed.identifier_type().to_string();
        let now = self.clock.now();

        let mut active = Vec::new();
        for entry in &page.entries {
            match self.policy.classify(entry) {
                Some(true) => active.push(IdentifierData::new(&id_type, &entry.identifier)),
                Some(false) => {
                    let removed =
                        CirculationData::removed(IdentifierData::new(&id_type, &entry.identifier), now);
                    self.sink.apply_circulation(&removed, ctx.source_id).await?;
                    result.inactive_processed += 1;
                }
                None => {
                    warn!(identifier = %entry.identifier, raw = %entry.raw, "Skipping unclassifiable feed entry");
                    result.skipped += 1;
                }
            }
        }

        let (inherited, fresh): (Vec<_>, Vec<_>) = active
            .iter()
            .cloned()
            .partition(|id| ctx.parent_identifiers.is_some_and(|parent| parent.contains(id)));

        let mut changed = 0u64;
        changed += self.lookup_and_apply(&ctx, &fresh, true, &mut result).await?;
        changed += self.lookup_and_apply(&ctx, &inherited, false, &mut result).await?;

        if let Some(set) = ctx.identifier_set {
            set.add(&active).await?;
            result.identifier_set = Some(set.to_ref());
        }

        result.next_page = page.next_page;
        if page.total_pages > 0 && page.current_page >= page.total_pages {
            result.next_page = None;
        }
        if result.next_page.is_some()
            && !ctx.import_all
            && self.policy.supports_early_termination()
            && changed == 0
            && out_of_window
        {
            debug!(
                modified_since = %ctx.modified_since,
                "Page lies entirely before the window, stopping"
            );
            result.next_page = None;
        }

        debug!(
            active = result.active_processed,
            inactive = result.inactive_processed,
            unchanged = result.unchanged,
            skipped = result.skipped,
            last = result.is_last_page(),
            "Page imported"
        );
        Ok(result)
    }

    /// Look up `ids` in batches and route each record. Returns how many
    /// records were written.
    async fn lookup_and_apply(
        &self,
        ctx: &PageContext<'_>,
        ids: &[IdentifierData],
        include_bibliographic: bool,
        result: &mut FeedImportResult,
    ) -> Result<u64> {
        let batch_size = self.feed.lookup_batch_size().max(1);
        let mut written = 0;
        for batch in ids.chunks(batch_size) {
            let values: Vec<String> = batch.iter().map(|id| id.value.clone()).collect();
            let records = self.feed.lookup(&values, include_bibliographic).await?;
            for record in records {
                if self.apply_record(ctx, record, result).await? {
                    written += 1;
                }
            }
        }
        Ok(written)
    }

    async fn apply_record(
        &self,
        ctx: &PageContext<'_>,
        record: TitleRecord,
        result: &mut FeedImportResult,
    ) -> Result<bool> {
        let TitleRecord {
            identifier,
            bibliographic,
            circulation,
        } = record;

        let written = match bibliographic {
            Some(bibliographic) => {
                let bibliographic = if bibliographic.circulation.is_none() {
                    bibliographic.with_circulation(circulation)
                } else {
                    bibliographic
                };
                if bibliographic.circulation.is_none() {
                    warn!(%identifier, "No availability information in lookup record");
                }

                if ctx.import_all
                    || self
                        .catalog
                        .bibliographic_changed(ctx.source_id, &bibliographic)
                        .await?
                {
                    self.sink
                        .apply_bibliographic(
                            &bibliographic,
                            ctx.source_id,
                            &ReplacementPolicy::from_license_source(),
                        )
                        .await?;
                    true
                } else {
                    match &bibliographic.circulation {
                        Some(circulation) => self.apply_if_changed(ctx, circulation).await?,
                        None => false,
                    }
                }
            }
            None => match circulation {
                Some(circulation) => self.apply_if_changed(ctx, &circulation).await?,
                None => {
                    warn!(%identifier, "No availability information in lookup record");
                    result.skipped += 1;
                    return Ok(false);
                }
            },
        };

        result.active_processed += 1;
        if !written {
            result.unchanged += 1;
        }
        Ok(written)
    }

    async fn apply_if_changed(&self, ctx: &PageContext<'_>, circulation: &CirculationData) -> Result<bool> {
        if ctx.import_all
            || self
                .catalog
                .circulation_changed(ctx.source_id, circulation)
                .await?
        {
            self.sink.apply_circulation(circulation, ctx.source_id).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[async_trait]
impl<P: EntryPolicy> PaginatedImporter for PageProcessor<P> {
    fn provider(&self) -> ProviderKind {
        self.policy.provider()
    }

    async fn import_page(&self, ctx: PageContext<'_>) -> Result<FeedImportResult> {
        self.process(ctx).await
    }
}

/// Whether the whole page is strictly older than `since`. An undated entry
/// keeps the page inside the window.
fn page_before(entries: &[FeedEntry], since: DateTime<Utc>) -> bool {
    entries
        .iter()
        .all(|entry| entry.date_added.is_some_and(|added| added < since))
}
