//! Shared fixtures for engine integration tests: a scripted provider feed,
//! an in-memory local catalog, and a fully wired coordinator.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_desktop::InMemoryKeyValueStore;
use bridge_traits::{
    error::Result as BridgeResult, BibliographicData, BridgeError, CatalogFeed, CirculationData,
    Clock, FeedEntry, FeedPage, FeedRequest, IdentifierData, LicenseStatus, ManualClock,
    PageToken, ReplacementPolicy, TitleRecord,
};
use chrono::{DateTime, TimeZone, Utc};
use core_runtime::config::SyncEngineConfig;
use core_runtime::events::{CoreEvent, EventBus};
use core_sync::{
    CatalogSink, LocalCatalog, ProviderKind, Result, SourceConfig, SourceId, SourceRegistry,
    SqliteChordRepository, SqliteWatermarkStore, SyncCoordinator, SyncServices, SyncWorker,
    TaskQueue,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;
use tokio::sync::Mutex;

pub const ID_TYPE: &str = "Axis 360 ID";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
}

pub fn id(value: &str) -> IdentifierData {
    IdentifierData::new(ID_TYPE, value)
}

pub fn active(value: &str) -> FeedEntry {
    FeedEntry {
        identifier: value.to_string(),
        active: Some(true),
        date_added: None,
        raw: serde_json::json!({ "titleId": value }),
    }
}

pub fn inactive(value: &str) -> FeedEntry {
    FeedEntry {
        active: Some(false),
        ..active(value)
    }
}

/// Page `number` of `total`, linking to the next number unless last.
pub fn numbered_page(number: u32, total: u32, entries: Vec<FeedEntry>) -> (Option<PageToken>, FeedPage) {
    let token = (number > 1).then_some(PageToken::Number(number));
    let next = (number < total).then_some(PageToken::Number(number + 1));
    (
        token,
        FeedPage {
            entries,
            rejected: Vec::new(),
            current_page: number,
            total_pages: total,
            next_page: next,
        },
    )
}

pub fn range(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{}-{:03}", prefix, i)).collect()
}

// ============================================================================
// Feed
// ============================================================================

/// Feed serving fixed pages. Each fetch advances the shared clock a minute.
pub struct ScriptedFeed {
    pages: HashMap<Option<PageToken>, FeedPage>,
    clock: Arc<ManualClock>,
    failures: Mutex<HashMap<Option<PageToken>, BridgeError>>,
    pub requests: Mutex<Vec<FeedRequest>>,
    /// Identifiers looked up, with whether bibliographic data was requested.
    pub lookups: Mutex<Vec<(Vec<String>, bool)>>,
}

impl ScriptedFeed {
    pub fn new(pages: Vec<(Option<PageToken>, FeedPage)>, clock: Arc<ManualClock>) -> Self {
        Self {
            pages: pages.into_iter().collect(),
            clock,
            failures: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            lookups: Mutex::new(Vec::new()),
        }
    }

    /// Make the next fetch of `page` fail with `error`.
    pub async fn fail_once(&self, page: Option<PageToken>, error: BridgeError) {
        self.failures.lock().await.insert(page, error);
    }

    pub async fn fetch_count(&self) -> usize {
        self.requests.lock().await.len()
    }

    /// Identifiers whose bibliographic data was requested.
    pub async fn bibliographic_lookups(&self) -> BTreeSet<String> {
        self.lookups
            .lock()
            .await
            .iter()
            .filter(|(_, bibliographic)| *bibliographic)
            .flat_map(|(ids, _)| ids.iter().cloned())
            .collect()
    }

    /// Identifiers looked up for circulation only.
    pub async fn circulation_lookups(&self) -> BTreeSet<String> {
        self.lookups
            .lock()
            .await
            .iter()
            .filter(|(_, bibliographic)| !*bibliographic)
            .flat_map(|(ids, _)| ids.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl CatalogFeed for ScriptedFeed {
    fn identifier_type(&self) -> &str {
        ID_TYPE
    }

    fn lookup_batch_size(&self) -> usize {
        125
    }

    async fn fetch_page(&self, request: FeedRequest) -> BridgeResult<FeedPage> {
        self.requests.lock().await.push(request.clone());
        self.clock.advance(chrono::Duration::minutes(1));

        if let Some(error) = self.failures.lock().await.remove(&request.page) {
            return Err(error);
        }
        self.pages
            .get(&request.page)
            .cloned()
            .ok_or_else(|| BridgeError::HttpStatus {
                status: 404,
                message: format!("no page {:?}", request.page),
            })
    }

    async fn lookup(&self, identifiers: &[String], include_bibliographic: bool) -> BridgeResult<Vec<TitleRecord>> {
        self.lookups
            .lock()
            .await
            .push((identifiers.to_vec(), include_bibliographic));
        Ok(identifiers
            .iter()
            .map(|value| {
                let identifier = id(value);
                let circulation = CirculationData {
                    identifier: identifier.clone(),
                    licenses_owned: 2,
                    licenses_available: 1,
                    licenses_reserved: 0,
                    patrons_in_hold_queue: 0,
                    status: LicenseStatus::Available,
                    last_checked: None,
                };
                let bibliographic = include_bibliographic.then(|| {
                    let mut data = BibliographicData::new(identifier.clone());
                    data.title = Some(format!("Title {}", value));
                    data
                });
                TitleRecord {
                    identifier,
                    bibliographic,
                    circulation: Some(circulation),
                }
            })
            .collect())
    }
}

// ============================================================================
// Local catalog
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    Bibliographic(String),
    Circulation(String, LicenseStatus),
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CatalogState {
    pub titles: BTreeMap<String, Option<String>>,
    pub circulation: BTreeMap<String, CirculationData>,
}

/// Local catalog kept in memory. Writes are upserts; change detection
/// compares with what is stored.
#[derive(Default)]
pub struct InMemoryCatalog {
    state: Mutex<CatalogState>,
    pub writes: Mutex<Vec<Write>>,
}

impl InMemoryCatalog {
    /// Seed titles as available without recording writes.
    pub async fn seed_available(&self, values: &[&str]) {
        let mut state = self.state.lock().await;
        for value in values {
            state.titles.insert(value.to_string(), None);
            state.circulation.insert(
                value.to_string(),
                CirculationData {
                    identifier: id(value),
                    licenses_owned: 1,
                    licenses_available: 1,
                    licenses_reserved: 0,
                    patrons_in_hold_queue: 0,
                    status: LicenseStatus::Available,
                    last_checked: None,
                },
            );
        }
    }

    pub async fn snapshot(&self) -> CatalogState {
        self.state.lock().await.clone()
    }

    pub async fn writes(&self) -> Vec<Write> {
        self.writes.lock().await.clone()
    }

    pub async fn bibliographic_writes(&self) -> usize {
        self.writes()
            .await
            .iter()
            .filter(|w| matches!(w, Write::Bibliographic(_)))
            .count()
    }

    pub async fn removals(&self) -> BTreeSet<String> {
        self.writes()
            .await
            .into_iter()
            .filter_map(|w| match w {
                Write::Circulation(value, LicenseStatus::Removed) => Some(value),
                _ => None,
            })
            .collect()
    }

    pub async fn removal_count(&self) -> usize {
        self.writes()
            .await
            .iter()
            .filter(|w| matches!(w, Write::Circulation(_, LicenseStatus::Removed)))
            .count()
    }
}

fn same_availability(a: &CirculationData, b: &CirculationData) -> bool {
    a.licenses_owned == b.licenses_owned
        && a.licenses_available == b.licenses_available
        && a.licenses_reserved == b.licenses_reserved
        && a.patrons_in_hold_queue == b.patrons_in_hold_queue
        && a.status == b.status
}

#[async_trait]
impl CatalogSink for InMemoryCatalog {
    async fn apply_bibliographic(
        &self,
        data: &BibliographicData,
        _source_id: SourceId,
        _policy: &ReplacementPolicy,
    ) -> Result<()> {
        let value = data.primary_identifier.value.clone();
        let mut state = self.state.lock().await;
        state.titles.insert(value.clone(), data.title.clone());
        if let Some(circulation) = &data.circulation {
            state.circulation.insert(value.clone(), circulation.clone());
        }
        self.writes.lock().await.push(Write::Bibliographic(value));
        Ok(())
    }

    async fn apply_circulation(&self, data: &CirculationData, _source_id: SourceId) -> Result<()> {
        let value = data.identifier.value.clone();
        self.state
            .lock()
            .await
            .circulation
            .insert(value.clone(), data.clone());
        self.writes
            .lock()
            .await
            .push(Write::Circulation(value, data.status));
        Ok(())
    }
}

#[async_trait]
impl LocalCatalog for InMemoryCatalog {
    async fn bibliographic_changed(&self, _source_id: SourceId, data: &BibliographicData) -> Result<bool> {
        let state = self.state.lock().await;
        let value = &data.primary_identifier.value;
        let title_changed = state.titles.get(value) != Some(&data.title);
        let circulation_changed = match (&data.circulation, state.circulation.get(value)) {
            (Some(new), Some(old)) => !same_availability(new, old),
            (Some(_), None) => true,
            (None, _) => false,
        };
        Ok(title_changed || circulation_changed)
    }

    async fn circulation_changed(&self, _source_id: SourceId, data: &CirculationData) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state
            .circulation
            .get(&data.identifier.value)
            .map_or(true, |old| !same_availability(data, old)))
    }

    async fn available_identifiers(&self, _source_id: SourceId) -> Result<Vec<IdentifierData>> {
        let state = self.state.lock().await;
        Ok(state
            .circulation
            .values()
            .filter(|c| c.licenses_owned > 0 || c.licenses_available > 0)
            .map(|c| c.identifier.clone())
            .collect())
    }
}

// ============================================================================
// Sources
// ============================================================================

#[derive(Default)]
pub struct StaticRegistry {
    sources: Vec<SourceConfig>,
    feeds: HashMap<SourceId, Arc<ScriptedFeed>>,
}

impl StaticRegistry {
    pub fn with_source(mut self, source: SourceConfig, feed: Arc<ScriptedFeed>) -> Self {
        self.feeds.insert(source.id, feed);
        self.sources.push(source);
        self
    }
}

#[async_trait]
impl SourceRegistry for StaticRegistry {
    async fn sources_for(&self, provider: ProviderKind) -> Result<Vec<SourceConfig>> {
        Ok(self
            .sources
            .iter()
            .filter(|s| s.provider == provider)
            .cloned()
            .collect())
    }

    async fn source(&self, id: SourceId) -> Result<Option<SourceConfig>> {
        Ok(self.sources.iter().find(|s| s.id == id).cloned())
    }

    async fn children(&self, id: SourceId) -> Result<Vec<SourceConfig>> {
        Ok(self
            .sources
            .iter()
            .filter(|s| s.parent_id == Some(id))
            .cloned()
            .collect())
    }

    async fn feed(&self, source: &SourceConfig) -> Result<Arc<dyn CatalogFeed>> {
        let feed = self
            .feeds
            .get(&source.id)
            .cloned()
            .ok_or_else(|| core_sync::SyncError::SourceNotFound(source.id.to_string()))?;
        Ok(feed)
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct Engine {
    pub coordinator: Arc<SyncCoordinator>,
    pub worker: SyncWorker,
    pub catalog: Arc<InMemoryCatalog>,
    pub watermarks: Arc<SqliteWatermarkStore>,
    pub kv: InMemoryKeyValueStore,
    pub clock: Arc<ManualClock>,
    pub events: EventBus,
}

pub fn test_config() -> SyncEngineConfig {
    SyncEngineConfig::builder()
        .database_url("sqlite::memory:")
        .source_stagger(Duration::ZERO)
        .max_retries(2)
        .retry_base_delay(Duration::ZERO)
        .page_size(100)
        .build()
        .unwrap()
}

pub async fn engine(registry: StaticRegistry, clock: Arc<ManualClock>) -> Engine {
    engine_with_catalog(registry, clock, Arc::new(InMemoryCatalog::default())).await
}

pub async fn engine_with_catalog(
    registry: StaticRegistry,
    clock: Arc<ManualClock>,
    catalog: Arc<InMemoryCatalog>,
) -> Engine {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let config = test_config();
    let dyn_clock: Arc<dyn Clock> = clock.clone();

    let watermarks = Arc::new(SqliteWatermarkStore::new(pool.clone()));
    watermarks.initialize().await.unwrap();
    let chords = Arc::new(SqliteChordRepository::new(pool.clone()));
    chords.initialize().await.unwrap();
    // The queue creates its own table.
    let queue = Arc::new(TaskQueue::sqlite(pool, dyn_clock.clone(), &config).await.unwrap());
    let kv = InMemoryKeyValueStore::with_clock(dyn_clock.clone());
    let events = EventBus::new(1024);

    let services = SyncServices {
        sources: Arc::new(registry),
        locks: Arc::new(kv.clone()),
        sets: Arc::new(kv.clone()),
        watermarks: watermarks.clone(),
        chords,
        queue,
        sink: catalog.clone(),
        catalog: catalog.clone(),
        clock: dyn_clock,
        events: events.clone(),
    };
    let coordinator = Arc::new(SyncCoordinator::new(config, services).unwrap());
    let worker = SyncWorker::new(coordinator.clone());

    Engine {
        coordinator,
        worker,
        catalog,
        watermarks,
        kv,
        clock,
        events,
    }
}

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(t0()))
}

pub fn boundless(id: i64) -> SourceConfig {
    SourceConfig::new(id, format!("Boundless {}", id), ProviderKind::Boundless)
}

pub fn overdrive(id: i64) -> SourceConfig {
    SourceConfig::new(id, format!("Overdrive {}", id), ProviderKind::Overdrive)
}

/// Everything emitted so far on a subscription.
pub fn received(rx: &mut Receiver<CoreEvent>) -> Vec<CoreEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
