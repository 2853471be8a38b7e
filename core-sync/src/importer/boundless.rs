//! Boundless feeds number their pages and flag every title as active or
//! not. Pages are not ordered by recency, so every page is read.

use bridge_traits::{CatalogFeed, Clock, FeedEntry};
use std::sync::Arc;

use super::{EntryPolicy, PageProcessor};
use crate::sink::{CatalogSink, LocalCatalog};
use crate::source::ProviderKind;

#[derive(Debug, Clone, Copy, Default)]
pub struct BoundlessPolicy;

impl EntryPolicy for BoundlessPolicy {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Boundless
    }

    fn classify(&self, entry: &FeedEntry) -> Option<bool> {
        entry.active
    }

    fn supports_early_termination(&self) -> bool {
        false
    }
}

pub type BoundlessImporter = PageProcessor<BoundlessPolicy>;

impl BoundlessImporter {
    pub fn new(
        feed: Arc<dyn CatalogFeed>,
        sink: Arc<dyn CatalogSink>,
        catalog: Arc<dyn LocalCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        PageProcessor::with_policy(feed, sink, catalog, clock, BoundlessPolicy)
    }
}
