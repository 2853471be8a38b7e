//! Shared Key-Value Store Abstractions
//!
//! Units of work running in different processes coordinate only through a
//! shared store. These traits describe the two capabilities the sync engine
//! needs from it: TTL-bounded sets and owner-tagged leases.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::Result;

/// One batch of a cursor scan over a set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub members: Vec<String>,
    /// `None` once the scan is finished.
    pub next_cursor: Option<String>,
}

/// Set operations on string members.
///
/// Members are opaque canonical strings; callers own the encoding.
/// Expiry is tracked per key. An expired key behaves exactly like a
/// missing one.
#[async_trait]
pub trait SetStore: Send + Sync {
    /// Identity of the backing store. Two handles with the same id see the
    /// same data.
    fn store_id(&self) -> &str;

    /// Add members and set the key's time-to-live in the same write,
    /// returning how many were not already present. With no members only an
    /// existing key's time-to-live is refreshed.
    async fn set_add(&self, key: &str, members: &[String], ttl: Duration) -> Result<usize>;

    /// Remove members, returning how many were present.
    async fn set_remove(&self, key: &str, members: &[String]) -> Result<usize>;

    /// Remove and return up to `count` arbitrary members.
    async fn set_pop(&self, key: &str, count: usize) -> Result<Vec<String>>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool>;

    async fn set_len(&self, key: &str) -> Result<usize>;

    /// Return up to `count` members after `cursor`.
    ///
    /// Every member present for the whole scan is returned at least once.
    /// Members added or removed while scanning may or may not show up.
    async fn set_scan(&self, key: &str, cursor: Option<&str>, count: usize) -> Result<ScanPage>;

    /// Members of `key` that are not members of `other`.
    ///
    /// The default implementation materializes both sets locally. Stores
    /// that can compute the difference where the data lives should
    /// override it.
    async fn set_difference(&self, key: &str, other: &str) -> Result<Vec<String>> {
        let subtract: HashSet<String> = self.set_members(other).await?.into_iter().collect();
        Ok(self
            .set_members(key)
            .await?
            .into_iter()
            .filter(|m| !subtract.contains(m))
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete a key, returning whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Reset the time-to-live of an existing key. Returns `false` when the
    /// key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;
}

/// Current holder of a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of [`LockStore::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    /// The key was free (or its lease had lapsed) and now belongs to the caller.
    Acquired(LockRecord),
    /// The caller already held the key; its lease was refreshed.
    Reentered(LockRecord),
    /// Someone else holds the key.
    Held(LockRecord),
}

/// Owner-tagged leases with compare-and-set semantics.
#[async_trait]
pub trait LockStore: Send + Sync {
    fn store_id(&self) -> &str;

    /// Take `key` for `owner` unless a different owner holds a live lease.
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<LockAttempt>;

    /// Delete `key` only if `owner` holds it. Returns whether anything was
    /// deleted.
    async fn release(&self, key: &str, owner: &str) -> Result<bool>;

    /// Push the lease of `key` out to now + `ttl`, only if `owner` holds it.
    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Live holder of `key`, if any.
    async fn holder(&self, key: &str) -> Result<Option<LockRecord>>;
}
