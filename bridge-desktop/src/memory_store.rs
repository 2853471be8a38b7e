//! In-process Key-Value Store
//!
//! Cloning an [`InMemoryKeyValueStore`] yields another handle on the same
//! data, which is how tests stand in for several workers sharing one store.

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    store::{LockAttempt, LockRecord, LockStore, ScanPage, SetStore},
    time::{Clock, SystemClock},
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct SetEntry {
    members: BTreeSet<String>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    sets: HashMap<String, SetEntry>,
    locks: HashMap<String, LockRecord>,
}

impl State {
    fn live_set(&mut self, key: &str, now: DateTime<Utc>) -> Option<&mut SetEntry> {
        let expired = self
            .sets
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.sets.remove(key);
        }
        self.sets.get_mut(key)
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.sets.get(key).is_some_and(|entry| entry.members.is_empty()) {
            self.sets.remove(key);
        }
    }

    fn live_lock(&mut self, key: &str, now: DateTime<Utc>) -> Option<&mut LockRecord> {
        if self.locks.get(key).is_some_and(|lock| lock.expires_at <= now) {
            self.locks.remove(key);
        }
        self.locks.get_mut(key)
    }
}

fn lease_end(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// [`SetStore`] and [`LockStore`] kept in process memory.
#[derive(Clone)]
pub struct InMemoryKeyValueStore {
    state: Arc<Mutex<State>>,
    store_id: Arc<str>,
    clock: Arc<dyn Clock>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            store_id: format!("memory:{}", uuid::Uuid::new_v4()).into(),
            clock,
        }
    }

    /// Keys of all live sets, sorted.
    pub async fn set_keys(&self) -> Vec<String> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let mut keys: Vec<String> = state
            .sets
            .iter()
            .filter(|(_, entry)| entry.expires_at.map_or(true, |at| at > now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SetStore for InMemoryKeyValueStore {
    fn store_id(&self) -> &str {
        &self.store_id
    }

    async fn set_add(&self, key: &str, members: &[String], ttl: Duration) -> Result<usize> {
        if members.is_empty() {
            self.expire(key, ttl).await?;
            return Ok(0);
        }
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.live_set(key, now);
        let entry = state.sets.entry(key.to_string()).or_default();
        entry.expires_at = Some(lease_end(now, ttl));
        Ok(members
            .iter()
            .filter(|m| entry.members.insert((*m).clone()))
            .count())
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<usize> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let removed = match state.live_set(key, now) {
            Some(entry) => members.iter().filter(|m| entry.members.remove(*m)).count(),
            None => 0,
        };
        state.drop_if_empty(key);
        Ok(removed)
    }

    async fn set_pop(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let popped = match state.live_set(key, now) {
            Some(entry) => {
                let taken: Vec<String> = entry.members.iter().take(count).cloned().collect();
                for member in &taken {
                    entry.members.remove(member);
                }
                taken
            }
            None => Vec::new(),
        };
        state.drop_if_empty(key);
        Ok(popped)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state
            .live_set(key, now)
            .map(|entry| entry.members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state
            .live_set(key, now)
            .is_some_and(|entry| entry.members.contains(member)))
    }

    async fn set_len(&self, key: &str) -> Result<usize> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state
            .live_set(key, now)
            .map(|entry| entry.members.len())
            .unwrap_or(0))
    }

    async fn set_scan(&self, key: &str, cursor: Option<&str>, count: usize) -> Result<ScanPage> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(entry) = state.live_set(key, now) else {
            return Ok(ScanPage::default());
        };

        let lower = match cursor {
            Some(c) => Bound::Excluded(c.to_string()),
            None => Bound::Unbounded,
        };
        let mut members: Vec<String> = entry
            .members
            .range((lower, Bound::Unbounded))
            .take(count + 1)
            .cloned()
            .collect();

        let next_cursor = if members.len() > count {
            members.truncate(count);
            members.last().cloned()
        } else {
            None
        };

        Ok(ScanPage {
            members,
            next_cursor,
        })
    }

    async fn set_difference(&self, key: &str, other: &str) -> Result<Vec<String>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let subtract = state
            .live_set(other, now)
            .map(|entry| entry.members.clone())
            .unwrap_or_default();
        Ok(state
            .live_set(key, now)
            .map(|entry| entry.members.difference(&subtract).cloned().collect())
            .unwrap_or_default())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.set_len(key).await? > 0)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let existed = state.live_set(key, now).is_some();
        state.sets.remove(key);
        Ok(existed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        match state.live_set(key, now) {
            Some(entry) => {
                entry.expires_at = Some(lease_end(now, ttl));
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl LockStore for InMemoryKeyValueStore {
    fn store_id(&self) -> &str {
        &self.store_id
    }

    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<LockAttempt> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        if let Some(record) = state.live_lock(key, now) {
            if record.owner == owner {
                record.expires_at = lease_end(now, ttl);
                return Ok(LockAttempt::Reentered(record.clone()));
            }
            return Ok(LockAttempt::Held(record.clone()));
        }

        let record = LockRecord {
            key: key.to_string(),
            owner: owner.to_string(),
            acquired_at: now,
            expires_at: lease_end(now, ttl),
        };
        state.locks.insert(key.to_string(), record.clone());
        Ok(LockAttempt::Acquired(record))
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if state
            .live_lock(key, now)
            .is_some_and(|record| record.owner == owner)
        {
            state.locks.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        match state.live_lock(key, now) {
            Some(record) if record.owner == owner => {
                record.expires_at = lease_end(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn holder(&self, key: &str) -> Result<Option<LockRecord>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state.live_lock(key, now).map(|record| record.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::time::ManualClock;
    use chrono::TimeZone;

    const TTL: Duration = Duration::from_secs(3600);

    fn members(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = InMemoryKeyValueStore::new();
        let other = store.clone();

        store.set_add("s", &members(&["a"]), TTL).await.unwrap();
        assert!(other.set_contains("s", "a").await.unwrap());
        assert_eq!(SetStore::store_id(&store), SetStore::store_id(&other));
        assert_ne!(
            SetStore::store_id(&store),
            SetStore::store_id(&InMemoryKeyValueStore::new())
        );
    }

    #[tokio::test]
    async fn test_empty_add_does_not_create_set() {
        let store = InMemoryKeyValueStore::new();
        assert_eq!(store.set_add("s", &[], TTL).await.unwrap(), 0);
        assert!(!store.exists("s").await.unwrap());
    }

    #[tokio::test]
    async fn test_first_add_already_expires() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let store = InMemoryKeyValueStore::with_clock(clock.clone());

        store
            .set_add("s", &members(&["a"]), Duration::from_secs(10))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(11));

        assert!(!store.exists("s").await.unwrap());
    }

    #[tokio::test]
    async fn test_expiry_and_lease() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let store = InMemoryKeyValueStore::with_clock(clock.clone());

        store.set_add("s", &members(&["a"]), TTL).await.unwrap();
        store.expire("s", Duration::from_secs(30)).await.unwrap();
        store
            .try_acquire("l", "owner", Duration::from_secs(30))
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(31));

        assert!(!store.exists("s").await.unwrap());
        assert!(store.holder("l").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_tolerates_removal() {
        let store = InMemoryKeyValueStore::new();
        store
            .set_add("s", &members(&["a", "b", "c", "d"]), TTL)
            .await
            .unwrap();

        let first = store.set_scan("s", None, 2).await.unwrap();
        assert_eq!(first.members, members(&["a", "b"]));

        store.set_remove("s", &members(&["a"])).await.unwrap();
        let second = store
            .set_scan("s", first.next_cursor.as_deref(), 2)
            .await
            .unwrap();
        assert_eq!(second.members, members(&["c", "d"]));
        assert!(second.next_cursor.is_none());
    }
}
