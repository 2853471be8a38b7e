//! # Desktop Bridge Implementations
//!
//! Native implementations of the bridge traits used by sync workers.
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest`
//! - `SetStore` + `LockStore` backed by a SQLite file shared by every worker
//!   on the host
//! - `SetStore` + `LockStore` kept in process memory for single-process
//!   deployments and tests
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{ReqwestHttpClient, SqliteKeyValueStore};
//!
//! #[tokio::main]
//! async fn main() -> bridge_traits::error::Result<()> {
//!     let http_client = ReqwestHttpClient::new()?;
//!     let store = SqliteKeyValueStore::new("/var/lib/catalog-sync/kv.db".into()).await?;
//!
//!     // Hand both to the sync coordinator
//!     Ok(())
//! }
//! ```

mod http;
mod kv_store;
mod memory_store;

pub use http::ReqwestHttpClient;
pub use kv_store::SqliteKeyValueStore;
pub use memory_store::InMemoryKeyValueStore;
