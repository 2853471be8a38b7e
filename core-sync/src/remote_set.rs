//! # Remote Sets
//!
//! A [`RemoteSet`] is a named, TTL-bounded set of serializable records kept
//! in a shared [`SetStore`]. Units of work that share nothing but the store
//! and a key use it to hand large identifier collections to one another.
//!
//! ## Overview
//!
//! - Members are stored as canonical JSON strings, so two equal records
//!   always map to the same member
//! - Every `add` refreshes the TTL, including an `add` of nothing, so a set
//!   that is still being written to never expires underneath its run
//! - A [`RemoteSetRef`] is the serializable handle carried in task messages
//!
//! ## Usage
//!
//! ```ignore
//! use core_sync::RemoteSet;
//!
//! let seen: RemoteSet<IdentifierData> =
//!     RemoteSet::with_namespace(store.clone(), ttl, &["CatalogImport", "7", &run_id]);
//! seen.add(&identifiers).await?;
//!
//! // Later, possibly in another process
//! let seen = RemoteSet::<IdentifierData>::from_ref(store, &handle, ttl)?;
//! let all = seen.get().await?;
//! ```

use bridge_traits::SetStore;
use futures::stream::{self, Stream, TryStreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashSet;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Batch size used by [`RemoteSet::iterate`] when the caller has no preference.
pub const DEFAULT_SCAN_BATCH: usize = 500;

/// Serializable handle to a [`RemoteSet`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteSetRef {
    pub key: String,
    pub store_id: String,
}

/// Right-hand side of [`RemoteSet::difference`].
pub enum SetOperand<'a, T> {
    Remote(&'a RemoteSet<T>),
    Local(&'a HashSet<T>),
}

impl<'a, T> From<&'a RemoteSet<T>> for SetOperand<'a, T> {
    fn from(set: &'a RemoteSet<T>) -> Self {
        SetOperand::Remote(set)
    }
}

impl<'a, T> From<&'a HashSet<T>> for SetOperand<'a, T> {
    fn from(set: &'a HashSet<T>) -> Self {
        SetOperand::Local(set)
    }
}

/// Shared-store set of `T`.
pub struct RemoteSet<T> {
    store: Arc<dyn SetStore>,
    key: String,
    ttl: Duration,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for RemoteSet<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            key: self.key.clone(),
            ttl: self.ttl,
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for RemoteSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSet")
            .field("key", &self.key)
            .field("store_id", &self.store.store_id())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl<T> RemoteSet<T>
where
    T: Serialize + DeserializeOwned + Eq + Hash + Send + Sync,
{
    /// A set under a fresh random key.
    pub fn new(store: Arc<dyn SetStore>, ttl: Duration) -> Self {
        Self::with_key(store, format!("RemoteSet::{}", Uuid::new_v4()), ttl)
    }

    /// A set under `parts` joined with `::`.
    pub fn with_namespace(store: Arc<dyn SetStore>, ttl: Duration, parts: &[&str]) -> Self {
        Self::with_key(store, parts.join("::"), ttl)
    }

    pub fn with_key(store: Arc<dyn SetStore>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            ttl,
            _marker: PhantomData,
        }
    }

    /// Reattach to a set created elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Configuration`] when the handle points at a
    /// different store than `store`.
    pub fn from_ref(store: Arc<dyn SetStore>, handle: &RemoteSetRef, ttl: Duration) -> Result<Self> {
        if store.store_id() != handle.store_id {
            return Err(SyncError::Configuration(format!(
                "Remote set {} lives in store {}, not {}",
                handle.key,
                handle.store_id,
                store.store_id()
            )));
        }
        Ok(Self::with_key(store, handle.key.clone(), ttl))
    }

    pub fn to_ref(&self) -> RemoteSetRef {
        RemoteSetRef {
            key: self.key.clone(),
            store_id: self.store.store_id().to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn encode(item: &T) -> Result<String> {
        serde_json::to_string(item).map_err(SyncError::from)
    }

    fn encode_all(items: &[T]) -> Result<Vec<String>> {
        items.iter().map(Self::encode).collect()
    }

    fn decode(&self, member: &str) -> Result<T> {
        serde_json::from_str(member).map_err(|e| SyncError::Deserialization {
            key: self.key.clone(),
            member: member.to_string(),
            reason: e.to_string(),
        })
    }

    /// Decode members, logging and dropping the ones that fail.
    fn decode_lenient(&self, members: Vec<String>) -> Vec<T> {
        members
            .into_iter()
            .filter_map(|member| match self.decode(&member) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Skipping undeserializable set member");
                    None
                }
            })
            .collect()
    }

    /// Insert items and refresh the TTL. Returns how many were new.
    pub async fn add(&self, items: &[T]) -> Result<usize> {
        let members = Self::encode_all(items)?;
        let added = self.store.set_add(&self.key, &members, self.ttl).await?;
        debug!(key = %self.key, added, "Added to remote set");
        Ok(added)
    }

    /// Remove items. Returns how many were present.
    pub async fn remove(&self, items: &[T]) -> Result<usize> {
        let members = Self::encode_all(items)?;
        Ok(self.store.set_remove(&self.key, &members).await?)
    }

    /// Remove and return up to `count` arbitrary members.
    pub async fn pop(&self, count: usize) -> Result<Vec<T>> {
        let members = self.store.set_pop(&self.key, count).await?;
        Ok(self.decode_lenient(members))
    }

    pub async fn contains(&self, item: &T) -> Result<bool> {
        Ok(self
            .store
            .set_contains(&self.key, &Self::encode(item)?)
            .await?)
    }

    /// Materialize the whole set, skipping members that fail to decode.
    pub async fn get(&self) -> Result<HashSet<T>> {
        let members = self.store.set_members(&self.key).await?;
        Ok(self.decode_lenient(members).into_iter().collect())
    }

    /// Materialize the whole set, failing on the first undecodable member.
    pub async fn get_strict(&self) -> Result<HashSet<T>> {
        self.store
            .set_members(&self.key)
            .await?
            .iter()
            .map(|member| self.decode(member))
            .collect()
    }

    /// One batch of a cursor scan. Pass the returned cursor back in to
    /// continue; `None` means the scan is finished.
    pub async fn scan(&self, cursor: Option<&str>, count: usize) -> Result<(Vec<T>, Option<String>)> {
        let page = self.store.set_scan(&self.key, cursor, count).await?;
        Ok((self.decode_lenient(page.members), page.next_cursor))
    }

    /// Lazily visit every member in batches of `batch_size`.
    ///
    /// Members present for the whole iteration are yielded at least once.
    /// Consumers must tolerate duplicates if the set changes meanwhile.
    pub fn iterate(&self, batch_size: usize) -> impl Stream<Item = Result<T>> + Send + 'static
    where
        T: 'static,
    {
        let set = self.clone();
        // `Some(cursor)` while batches remain, `None` once the scan ends.
        stream::try_unfold(Some(None::<String>), move |state| {
            let set = set.clone();
            async move {
                let Some(cursor) = state else {
                    return Ok::<_, SyncError>(None);
                };
                let (items, next) = set.scan(cursor.as_deref(), batch_size).await?;
                let batch = stream::iter(items.into_iter().map(Ok::<T, SyncError>));
                Ok(Some((batch, next.map(Some))))
            }
        })
        .try_flatten()
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(self.store.exists(&self.key).await?)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.store.set_len(&self.key).await?)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Delete the set. Returns whether it existed.
    pub async fn delete(&self) -> Result<bool> {
        let existed = self.store.delete(&self.key).await?;
        debug!(key = %self.key, existed, "Deleted remote set");
        Ok(existed)
    }

    /// Reset the TTL without writing.
    pub async fn expire(&self) -> Result<bool> {
        Ok(self.store.expire(&self.key, self.ttl).await?)
    }

    /// Members of this set that are not in `other`.
    ///
    /// Against another remote set the subtraction runs in the store. Against
    /// a local set this set is materialized first.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Configuration`] when `other` lives in a
    /// different store.
    pub async fn difference<'a>(&self, other: impl Into<SetOperand<'a, T>>) -> Result<HashSet<T>>
    where
        T: 'a,
    {
        match other.into() {
            SetOperand::Remote(other) => {
                if other.store.store_id() != self.store.store_id() {
                    return Err(SyncError::Configuration(format!(
                        "Cannot diff {} ({}) against {} ({}): sets live in different stores",
                        self.key,
                        self.store.store_id(),
                        other.key,
                        other.store.store_id()
                    )));
                }
                let members = self.store.set_difference(&self.key, &other.key).await?;
                Ok(self.decode_lenient(members).into_iter().collect())
            }
            SetOperand::Local(other) => Ok(self
                .get()
                .await?
                .into_iter()
                .filter(|item| !other.contains(item))
                .collect()),
        }
    }
}

impl<T> RemoteSet<T>
where
    T: Serialize + DeserializeOwned + Eq + Hash + Send + Sync,
{
    /// Members of this set absent from an in-memory set.
    pub async fn difference_local(&self, other: &HashSet<T>) -> Result<HashSet<T>> {
        self.difference(other).await
    }
}
