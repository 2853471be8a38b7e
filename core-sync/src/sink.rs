//! # Catalog Sinks
//!
//! The engine never touches the local edition/license tables directly. It
//! reads what it needs through [`LocalCatalog`] and writes through
//! [`CatalogSink`]; the host application implements both.
//!
//! Sink writes must be idempotent upserts. A page redelivered after a crash
//! is applied a second time.

use async_trait::async_trait;
use bridge_traits::{BibliographicData, CirculationData, IdentifierData, ReplacementPolicy};

use crate::error::Result;
use crate::source::SourceId;

/// Write side of the local catalog.
#[async_trait]
pub trait CatalogSink: Send + Sync {
    /// Upsert bibliographic metadata, and circulation when it is attached.
    ///
    /// `policy` says which list fields replace what is stored rather than
    /// merge into it.
    async fn apply_bibliographic(
        &self,
        data: &BibliographicData,
        source_id: SourceId,
        policy: &ReplacementPolicy,
    ) -> Result<()>;

    /// Upsert availability of one title.
    async fn apply_circulation(&self, data: &CirculationData, source_id: SourceId) -> Result<()>;
}

/// Read side of the local catalog.
#[async_trait]
pub trait LocalCatalog: Send + Sync {
    /// Whether `data` differs from what is stored for the title.
    ///
    /// Titles never seen before count as changed.
    async fn bibliographic_changed(&self, source_id: SourceId, data: &BibliographicData)
        -> Result<bool>;

    /// Whether the availability in `data` differs from what is stored.
    async fn circulation_changed(&self, source_id: SourceId, data: &CirculationData) -> Result<bool>;

    /// Identifiers of the source's titles with any licenses owned or available.
    async fn available_identifiers(&self, source_id: SourceId) -> Result<Vec<IdentifierData>>;
}
