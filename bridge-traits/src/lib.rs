//! # Bridge Traits
//!
//! Interfaces between the catalog sync engine and the outside world.
//!
//! ## Overview
//!
//! The engine never talks to a vendor API, a key-value server or a clock
//! directly. Each of those is a trait defined here and injected through
//! constructors, so the same engine runs against production backends,
//! in-process stores or test doubles.
//!
//! ## Traits
//!
//! ### Coordination
//! - [`SetStore`](store::SetStore) - TTL-bounded sets shared between workers
//! - [`LockStore`](store::LockStore) - Owner-tagged leases with compare-and-set release
//!
//! ### Catalog
//! - [`CatalogFeed`](catalog::CatalogFeed) - Paginated provider feed plus detailed lookup
//! - [`HttpClient`](http::HttpClient) - Async HTTP used by provider connectors
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! should map timeouts and connection drops onto the transient variants so
//! that [`BridgeError::is_transient`] gives the engine an accurate retry
//! decision.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so handles can be shared across
//! tokio tasks behind an `Arc`.

pub mod catalog;
pub mod error;
pub mod http;
pub mod store;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use catalog::{
    BibliographicData, CatalogFeed, CirculationData, Contributor, FeedEntry, FeedPage,
    FeedRequest, IdentifierData, LicenseStatus, PageToken, RejectedEntry, ReplacementPolicy,
    TitleRecord,
};
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy};
pub use store::{LockAttempt, LockRecord, LockStore, ScanPage, SetStore};
pub use time::{Clock, ManualClock, SystemClock};
