//! # Stale-Inventory Reconciliation
//!
//! Titles a provider stops listing never show up as "inactive" in its feed;
//! they just vanish. Reconciliation finds them by diffing two identifier
//! sets built independently:
//!
//! - **existing**: titles the local catalog still considers available
//! - **active**: titles the provider listed during a full import pass
//!
//! `existing - active` is what disappeared, and each such title gets a
//! zero-availability update.
//!
//! ## Barrier
//!
//! Both branches run as ordinary queued tasks in any order. Each reports
//! its outcome to a row in `reconciliation_chords`; the report that
//! completes the row queues the combiner. The conditional update that
//! flips `fired` guarantees the combiner is queued once even if a branch
//! report is delivered twice.
//!
//! A branch that failed reports [`BranchOutcome::Failed`]. The combiner
//! never deactivates anything on partial information. It deletes whatever
//! sets were built and reports the pass as skipped.

use async_trait::async_trait;
use bridge_traits::{CirculationData, Clock, IdentifierData, SetStore};
use chrono::{DateTime, Utc};
use core_runtime::events::{CoreEvent, EventBus, ReconciliationEvent};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::continuation::ImportCollection;
use crate::error::{Result, SyncError};
use crate::remote_set::{RemoteSet, RemoteSetRef};
use crate::sink::{CatalogSink, LocalCatalog};
use crate::source::SourceId;
use crate::task_queue::{SyncTask, TaskQueue};

/// Identifier of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChordId(Uuid);

impl ChordId {
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

impl Default for ChordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Existing,
    Active,
}

impl Branch {
    fn column(&self) -> &'static str {
        match self {
            Branch::Existing => "existing",
            Branch::Active => "active",
        }
    }
}

impl std::fmt::Display for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.column())
    }
}

/// What a branch handed to the barrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BranchOutcome {
    Set(RemoteSetRef),
    Failed { reason: String },
}

impl BranchOutcome {
    pub fn set(&self) -> Option<&RemoteSetRef> {
        match self {
            BranchOutcome::Set(set) => Some(set),
            BranchOutcome::Failed { .. } => None,
        }
    }
}

/// Barrier row of one reconciliation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ChordState {
    pub chord_id: ChordId,
    pub source_id: SourceId,
    pub existing: Option<BranchOutcome>,
    pub active: Option<BranchOutcome>,
    pub fired: bool,
    pub created_at: DateTime<Utc>,
}

/// Result of the combiner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationOutcome {
    /// Both branches succeeded; this many titles were deactivated.
    Deactivated(usize),
    /// A branch failed; nothing was deactivated.
    Skipped { reason: String },
}

// ============================================================================
// Repository
// ============================================================================

#[async_trait]
pub trait ChordRepository: Send + Sync {
    async fn create(&self, chord_id: &ChordId, source_id: SourceId, now: DateTime<Utc>) -> Result<()>;

    /// Store a branch outcome. Returns `true` for the one report that
    /// completes the barrier. A second report of the same branch is ignored.
    async fn record(&self, chord_id: &ChordId, branch: Branch, outcome: &BranchOutcome) -> Result<bool>;

    async fn load(&self, chord_id: &ChordId) -> Result<Option<ChordState>>;

    async fn delete(&self, chord_id: &ChordId) -> Result<()>;
}

pub struct SqliteChordRepository {
    pool: SqlitePool,
}

impl SqliteChordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reconciliation_chords (
                chord_id TEXT PRIMARY KEY,
                source_id INTEGER NOT NULL,
                existing TEXT,
                active TEXT,
                fired INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct ChordRow {
    chord_id: String,
    source_id: i64,
    existing: Option<String>,
    active: Option<String>,
    fired: i64,
    created_at: i64,
}

impl TryFrom<ChordRow> for ChordState {
    type Error = SyncError;

    fn try_from(row: ChordRow) -> Result<Self> {
        let outcome = |column: Option<String>| -> Result<Option<BranchOutcome>> {
            column
                .map(|json| serde_json::from_str(&json).map_err(SyncError::from))
                .transpose()
        };
        Ok(ChordState {
            chord_id: ChordId::from_string(&row.chord_id)?,
            source_id: SourceId::new(row.source_id),
            existing: outcome(row.existing)?,
            active: outcome(row.active)?,
            fired: row.fired != 0,
            created_at: DateTime::<Utc>::from_timestamp_millis(row.created_at).ok_or_else(|| {
                SyncError::Database(format!("Invalid timestamp: {}", row.created_at))
            })?,
        })
    }
}

#[async_trait]
impl ChordRepository for SqliteChordRepository {
    async fn create(&self, chord_id: &ChordId, source_id: SourceId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO reconciliation_chords (chord_id, source_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(chord_id.as_str())
        .bind(source_id.value())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record(&self, chord_id: &ChordId, branch: Branch, outcome: &BranchOutcome) -> Result<bool> {
        let exists: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM reconciliation_chords WHERE chord_id = ?")
                .bind(chord_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        if exists.is_none() {
            return Err(SyncError::ChordNotFound {
                chord_id: chord_id.to_string(),
            });
        }

        let column = branch.column();
        sqlx::query(&format!(
            "UPDATE reconciliation_chords SET {column} = ? WHERE chord_id = ? AND {column} IS NULL"
        ))
        .bind(serde_json::to_string(outcome)?)
        .bind(chord_id.as_str())
        .execute(&self.pool)
        .await?;

        let fired = sqlx::query(
            r#"
            UPDATE reconciliation_chords SET fired = 1
            WHERE chord_id = ? AND fired = 0 AND existing IS NOT NULL AND active IS NOT NULL
            "#,
        )
        .bind(chord_id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(fired.rows_affected() == 1)
    }

    async fn load(&self, chord_id: &ChordId) -> Result<Option<ChordState>> {
        let row: Option<ChordRow> = sqlx::query_as(
            "SELECT chord_id, source_id, existing, active, fired, created_at
             FROM reconciliation_chords WHERE chord_id = ?",
        )
        .bind(chord_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ChordState::try_from).transpose()
    }

    async fn delete(&self, chord_id: &ChordId) -> Result<()> {
        sqlx::query("DELETE FROM reconciliation_chords WHERE chord_id = ?")
            .bind(chord_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ============================================================================
// Chord
// ============================================================================

pub struct ReconciliationChord {
    repository: Arc<dyn ChordRepository>,
    queue: Arc<TaskQueue>,
    sets: Arc<dyn SetStore>,
    sink: Arc<dyn CatalogSink>,
    catalog: Arc<dyn LocalCatalog>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    set_ttl: Duration,
}

impl ReconciliationChord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<dyn ChordRepository>,
        queue: Arc<TaskQueue>,
        sets: Arc<dyn SetStore>,
        sink: Arc<dyn CatalogSink>,
        catalog: Arc<dyn LocalCatalog>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        set_ttl: Duration,
    ) -> Self {
        Self {
            repository,
            queue,
            sets,
            sink,
            catalog,
            clock,
            events,
            set_ttl,
        }
    }

    /// Open a barrier for `source_id` and queue both branches.
    #[instrument(skip(self))]
    pub async fn start(&self, source_id: SourceId) -> Result<ChordId> {
        let chord_id = ChordId::new();
        self.repository
            .create(&chord_id, source_id, self.clock.now())
            .await?;

        self.queue
            .enqueue(SyncTask::CollectAvailable {
                source_id,
                chord_id: chord_id.clone(),
            })
            .await?;
        let active_branch = ImportCollection::start(source_id)
            .import_all(true)
            .returning_identifiers()
            .reply_to(chord_id.clone());
        self.queue
            .enqueue(SyncTask::ImportCollection(active_branch))
            .await?;

        info!(%source_id, %chord_id, "Reconciliation started");
        Ok(chord_id)
    }

    /// The "existing" branch: snapshot locally available identifiers into
    /// a remote set and report it.
    #[instrument(skip(self))]
    pub async fn collect_available(&self, source_id: SourceId, chord_id: &ChordId) -> Result<()> {
        let chord = chord_id.as_str();
        let set = RemoteSet::<IdentifierData>::with_namespace(
            self.sets.clone(),
            self.set_ttl,
            &["Reconciliation", chord.as_str(), "existing"],
        );

        let identifiers = self.catalog.available_identifiers(source_id).await?;
        set.add(&identifiers).await?;
        debug!(count = identifiers.len(), "Collected locally available identifiers");

        self.report(chord_id, Branch::Existing, BranchOutcome::Set(set.to_ref()))
            .await
    }

    /// Hand a branch outcome to the barrier, queueing the combiner when it
    /// completes.
    pub async fn report(&self, chord_id: &ChordId, branch: Branch, outcome: BranchOutcome) -> Result<()> {
        if let BranchOutcome::Failed { reason } = &outcome {
            warn!(%chord_id, %branch, %reason, "Reconciliation branch failed");
        }

        if self.repository.record(chord_id, branch, &outcome).await? {
            self.queue
                .enqueue(SyncTask::CombineReconciliation {
                    chord_id: chord_id.clone(),
                })
                .await?;
            debug!(%chord_id, "Both branches reported, combiner queued");
        }
        Ok(())
    }

    /// Run the combiner of a completed barrier.
    #[instrument(skip(self))]
    pub async fn combine(&self, chord_id: &ChordId) -> Result<ReconciliationOutcome> {
        let state = self
            .repository
            .load(chord_id)
            .await?
            .ok_or_else(|| SyncError::ChordNotFound {
                chord_id: chord_id.to_string(),
            })?;

        let outcome = self
            .combine_branches(state.source_id, chord_id, state.existing, state.active)
            .await?;
        self.repository.delete(chord_id).await?;
        Ok(outcome)
    }

    /// Diff the two branch results and deactivate what disappeared.
    ///
    /// Both sets are deleted whatever happens. A missing or failed branch
    /// skips deactivation entirely.
    pub async fn combine_branches(
        &self,
        source_id: SourceId,
        chord_id: &ChordId,
        existing: Option<BranchOutcome>,
        active: Option<BranchOutcome>,
    ) -> Result<ReconciliationOutcome> {
        let existing_set = existing.as_ref().and_then(|o| self.open(o.set()?));
        let active_set = active.as_ref().and_then(|o| self.open(o.set()?));

        let (existing_set, active_set) = match (existing_set, active_set) {
            (Some(existing_set), Some(active_set)) => (existing_set, active_set),
            (existing_set, active_set) => {
                let reason = skip_reason(existing.as_ref(), active.as_ref());
                warn!(%source_id, %chord_id, %reason, "Skipping reconciliation");
                for set in existing_set.iter().chain(active_set.iter()) {
                    self.discard(set).await;
                }
                self.events
                    .emit(CoreEvent::Reconciliation(ReconciliationEvent::Skipped {
                        source_id: source_id.to_string(),
                        chord_id: chord_id.to_string(),
                        reason: reason.clone(),
                    }))
                    .ok();
                return Ok(ReconciliationOutcome::Skipped { reason });
            }
        };

        let deactivated = self
            .deactivate_missing(source_id, &existing_set, &active_set)
            .await;
        self.discard(&existing_set).await;
        self.discard(&active_set).await;
        let deactivated = deactivated?;

        info!(%source_id, %chord_id, deactivated, "Reconciliation complete");
        self.events
            .emit(CoreEvent::Reconciliation(ReconciliationEvent::Completed {
                source_id: source_id.to_string(),
                chord_id: chord_id.to_string(),
                deactivated: deactivated as u64,
            }))
            .ok();
        Ok(ReconciliationOutcome::Deactivated(deactivated))
    }

    async fn deactivate_missing(
        &self,
        source_id: SourceId,
        existing: &RemoteSet<IdentifierData>,
        active: &RemoteSet<IdentifierData>,
    ) -> Result<usize> {
        let mut stale: Vec<IdentifierData> = existing.difference(active).await?.into_iter().collect();
        stale.sort();

        let now = self.clock.now();
        for identifier in &stale {
            debug!(%identifier, "Deactivating title missing from provider feed");
            self.sink
                .apply_circulation(&CirculationData::removed(identifier.clone(), now), source_id)
                .await?;
        }
        Ok(stale.len())
    }

    fn open(&self, handle: &RemoteSetRef) -> Option<RemoteSet<IdentifierData>> {
        match RemoteSet::from_ref(self.sets.clone(), handle, self.set_ttl) {
            Ok(set) => Some(set),
            Err(e) => {
                warn!(key = %handle.key, error = %e, "Cannot open reconciliation set");
                None
            }
        }
    }

    async fn discard(&self, set: &RemoteSet<IdentifierData>) {
        if let Err(e) = set.delete().await {
            warn!(key = %set.key(), error = %e, "Failed to delete reconciliation set");
        }
    }
}

fn skip_reason(existing: Option<&BranchOutcome>, active: Option<&BranchOutcome>) -> String {
    let describe = |branch: Branch, outcome: Option<&BranchOutcome>| match outcome {
        None => Some(format!("{} branch never reported", branch)),
        Some(BranchOutcome::Failed { reason }) => Some(format!("{} branch failed: {}", branch, reason)),
        Some(BranchOutcome::Set(_)) => None,
    };
    let reasons: Vec<String> = [
        describe(Branch::Existing, existing),
        describe(Branch::Active, active),
    ]
    .into_iter()
    .flatten()
    .collect();

    if reasons.is_empty() {
        "branch set unavailable".to_string()
    } else {
        reasons.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::importer::test_support::{RecordingSink, StaticCatalog};
    use bridge_desktop::InMemoryKeyValueStore;
    use bridge_traits::{LicenseStatus, SystemClock};
    use core_runtime::config::SyncEngineConfig;
    use sqlx::sqlite::SqlitePoolOptions;

    const TTL: Duration = Duration::from_secs(600);

    struct Fixture {
        chord: ReconciliationChord,
        repository: Arc<SqliteChordRepository>,
        queue: Arc<TaskQueue>,
        sets: Arc<dyn SetStore>,
        sink: Arc<RecordingSink>,
    }

    async fn fixture() -> Fixture {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let config = SyncEngineConfig::builder()
            .database_url("sqlite::memory:")
            .build()
            .unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let repository = Arc::new(SqliteChordRepository::new(pool.clone()));
        repository.initialize().await.unwrap();
        let queue = Arc::new(TaskQueue::sqlite(pool, clock.clone(), &config).await.unwrap());
        let sets: Arc<dyn SetStore> = Arc::new(InMemoryKeyValueStore::new());
        let sink = Arc::new(RecordingSink::default());

        let chord = ReconciliationChord::new(
            repository.clone(),
            queue.clone(),
            sets.clone(),
            sink.clone(),
            Arc::new(StaticCatalog::default()),
            clock,
            EventBus::new(16),
            TTL,
        );
        Fixture {
            chord,
            repository,
            queue,
            sets,
            sink,
        }
    }

    async fn set_of(sets: &Arc<dyn SetStore>, values: &[&str]) -> RemoteSet<IdentifierData> {
        let set = RemoteSet::new(sets.clone(), TTL);
        let ids: Vec<_> = values
            .iter()
            .map(|v| IdentifierData::new("Axis 360 ID", *v))
            .collect();
        set.add(&ids).await.unwrap();
        set
    }

    #[tokio::test]
    async fn test_combine_deactivates_only_missing() {
        let fx = fixture().await;
        let existing = set_of(&fx.sets, &["A", "B", "C"]).await;
        let active = set_of(&fx.sets, &["B", "C", "D"]).await;

        let outcome = fx
            .chord
            .combine_branches(
                SourceId::new(1),
                &ChordId::new(),
                Some(BranchOutcome::Set(existing.to_ref())),
                Some(BranchOutcome::Set(active.to_ref())),
            )
            .await
            .unwrap();

        assert_eq!(outcome, ReconciliationOutcome::Deactivated(1));
        let circulation = fx.sink.circulation.lock().await;
        assert_eq!(circulation.len(), 1);
        assert_eq!(circulation[0].identifier.value, "A");
        assert_eq!(circulation[0].status, LicenseStatus::Removed);
        assert!(!existing.exists().await.unwrap());
        assert!(!active.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_branch_skips_and_cleans_up() {
        let fx = fixture().await;
        let existing = set_of(&fx.sets, &["A", "B"]).await;

        let outcome = fx
            .chord
            .combine_branches(
                SourceId::new(1),
                &ChordId::new(),
                Some(BranchOutcome::Set(existing.to_ref())),
                Some(BranchOutcome::Failed {
                    reason: "401 Unauthorized".to_string(),
                }),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, ReconciliationOutcome::Skipped { .. }));
        assert!(fx.sink.circulation.lock().await.is_empty());
        assert!(!existing.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_barrier_fires_once() {
        let fx = fixture().await;
        let chord_id = fx.chord.start(SourceId::new(1)).await.unwrap();
        // Both branches queued
        assert_eq!(fx.queue.stats().await.unwrap().pending, 2);

        let failed = BranchOutcome::Failed {
            reason: "boom".to_string(),
        };
        fx.chord
            .report(&chord_id, Branch::Active, failed.clone())
            .await
            .unwrap();
        assert_eq!(fx.queue.stats().await.unwrap().pending, 2);

        fx.chord.collect_available(SourceId::new(1), &chord_id).await.unwrap();
        assert_eq!(fx.queue.stats().await.unwrap().pending, 3);

        // Redelivered report changes nothing
        fx.chord
            .report(&chord_id, Branch::Active, failed)
            .await
            .unwrap();
        assert_eq!(fx.queue.stats().await.unwrap().pending, 3);

        let state = fx.repository.load(&chord_id).await.unwrap().unwrap();
        assert!(state.fired);
        assert!(matches!(state.existing, Some(BranchOutcome::Set(_))));

        let outcome = fx.chord.combine(&chord_id).await.unwrap();
        assert!(matches!(outcome, ReconciliationOutcome::Skipped { .. }));
        assert!(fx.repository.load(&chord_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_report_unknown_chord() {
        let fx = fixture().await;
        let result = fx
            .chord
            .report(
                &ChordId::new(),
                Branch::Existing,
                BranchOutcome::Failed {
                    reason: "x".to_string(),
                },
            )
            .await;
        assert!(matches!(result, Err(SyncError::ChordNotFound { .. })));
    }

    #[test]
    fn test_skip_reason_names_failed_branch() {
        let reason = skip_reason(
            None,
            Some(&BranchOutcome::Failed {
                reason: "timeout".to_string(),
            }),
        );
        assert_eq!(
            reason,
            "existing branch never reported; active branch failed: timeout"
        );
    }
}
