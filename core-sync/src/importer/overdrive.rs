//! Overdrive feeds link to their next page and list titles newest first by
//! the date they were added. A page older than the window means the rest of
//! the feed is older still. Advantage (child) accounts share titles with
//! their parent, which already imported the metadata.

use bridge_traits::{CatalogFeed, Clock, FeedEntry};
use std::sync::Arc;

use super::{EntryPolicy, PageProcessor};
use crate::sink::{CatalogSink, LocalCatalog};
use crate::source::ProviderKind;

#[derive(Debug, Clone, Copy, Default)]
pub struct OverdrivePolicy;

impl EntryPolicy for OverdrivePolicy {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Overdrive
    }

    /// Titles are listed while licensed; an explicit flag wins when present.
    fn classify(&self, entry: &FeedEntry) -> Option<bool> {
        Some(entry.active.unwrap_or(true))
    }

    fn supports_early_termination(&self) -> bool {
        true
    }
}

pub type OverdriveImporter = PageProcessor<OverdrivePolicy>;

impl OverdriveImporter {
    pub fn new(
        feed: Arc<dyn CatalogFeed>,
        sink: Arc<dyn CatalogSink>,
        catalog: Arc<dyn LocalCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        PageProcessor::with_policy(feed, sink, catalog, clock, OverdrivePolicy)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::PaginatedImporter;
    use super::*;
    use bridge_traits::{IdentifierData, PageToken, SystemClock};
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::HashSet;

    const NEXT: &str = "https://api.example.org/v1/collections/abc/products?offset=25";

    fn since() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn old() -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap())
    }

    fn importer(feed: Arc<ScriptedFeed>, sink: Arc<RecordingSink>, catalog: StaticCatalog) -> OverdriveImporter {
        OverdriveImporter::new(feed, sink, Arc::new(catalog), Arc::new(SystemClock))
    }

    fn old_page() -> ScriptedFeed {
        let entries = vec![entry("a", None, old()), entry("b", None, old())];
        ScriptedFeed::new(
            vec![(None, page(entries, 0, 0, Some(PageToken::Url(NEXT.to_string()))))],
            25,
        )
    }

    #[tokio::test]
    async fn test_stops_when_page_is_old_and_unchanged() {
        let catalog = StaticCatalog {
            unchanged: ["a".to_string(), "b".to_string()].into_iter().collect(),
        };
        let importer = importer(Arc::new(old_page()), Arc::new(RecordingSink::default()), catalog);

        let result = importer.import_page(context(None, since())).await.unwrap();

        assert_eq!(result.unchanged, 2);
        assert!(result.is_last_page());
    }

    #[tokio::test]
    async fn test_continues_when_old_page_had_changes() {
        let importer = importer(
            Arc::new(old_page()),
            Arc::new(RecordingSink::default()),
            StaticCatalog::default(),
        );

        let result = importer.import_page(context(None, since())).await.unwrap();

        assert_eq!(result.next_page, Some(PageToken::Url(NEXT.to_string())));
    }

    #[tokio::test]
    async fn test_undated_title_keeps_old_page_in_window() {
        let entries = vec![entry("a", None, old()), entry("b", None, None)];
        let feed = ScriptedFeed::new(
            vec![(None, page(entries, 0, 0, Some(PageToken::Url(NEXT.to_string()))))],
            25,
        );
        let catalog = StaticCatalog {
            unchanged: ["a".to_string(), "b".to_string()].into_iter().collect(),
        };
        let importer = importer(Arc::new(feed), Arc::new(RecordingSink::default()), catalog);

        let result = importer.import_page(context(None, since())).await.unwrap();

        assert_eq!(result.unchanged, 2);
        assert_eq!(result.next_page, Some(PageToken::Url(NEXT.to_string())));
    }

    #[tokio::test]
    async fn test_full_resync_never_stops_early() {
        let catalog = StaticCatalog {
            unchanged: ["a".to_string(), "b".to_string()].into_iter().collect(),
        };
        let importer = importer(Arc::new(old_page()), Arc::new(RecordingSink::default()), catalog);

        let mut ctx = context(None, since());
        ctx.import_all = true;
        let result = importer.import_page(ctx).await.unwrap();

        assert!(!result.is_last_page());
    }

    #[tokio::test]
    async fn test_parent_titles_skip_metadata() {
        let entries = vec![entry("shared", None, None), entry("own", None, None)];
        let feed = Arc::new(ScriptedFeed::new(vec![(None, page(entries, 0, 0, None))], 25));
        let sink = Arc::new(RecordingSink::default());
        let importer = importer(feed.clone(), sink.clone(), StaticCatalog::default());
        let parent: HashSet<_> = [IdentifierData::new(ID_TYPE, "shared")].into_iter().collect();

        let mut ctx = context(None, since());
        ctx.parent_identifiers = Some(&parent);
        let result = importer.import_page(ctx).await.unwrap();

        assert_eq!(result.active_processed, 2);
        let lookups = feed.lookups.lock().await;
        assert!(lookups.contains(&(vec!["own".to_string()], true)));
        assert!(lookups.contains(&(vec!["shared".to_string()], false)));
        assert_eq!(
            *sink.bibliographic.lock().await,
            vec![IdentifierData::new(ID_TYPE, "own")]
        );
        assert_eq!(sink.circulation.lock().await.len(), 1);
    }
}
