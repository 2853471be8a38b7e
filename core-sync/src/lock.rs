//! # Distributed Lock
//!
//! Per-source mutual exclusion shared by every worker process through a
//! [`LockStore`].
//!
//! ## Overview
//!
//! - One lock per source, keyed `CatalogImport::Source::<id>`; there is no
//!   global lock
//! - The owner is the logical run id. Every continuation of a run re-enters
//!   the lock it already owns and refreshes the lease
//! - A lease bounds how long a crashed holder can block the source; a
//!   [`LockGuard`] renews it on a heartbeat while the unit of work runs
//! - [`DistributedLock::acquire`] never waits. A busy source rejects the new
//!   run instead of parking a worker on it
//!
//! ## Usage
//!
//! ```ignore
//! let lock = DistributedLock::for_source(store, source_id, &run_id, &config);
//! let guard = lock.acquire().await?;
//! // ... one page of work ...
//! if more_pages {
//!     guard.retain().await?; // the continuation inherits the lock
//! } else {
//!     guard.release().await?;
//! }
//! ```

use bridge_traits::{LockAttempt, LockRecord, LockStore};
use core_runtime::config::SyncEngineConfig;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::continuation::RunId;
use crate::error::{Result, SyncError};
use crate::source::SourceId;

/// Lock key of a source.
pub fn source_lock_key(source_id: SourceId) -> String {
    format!("CatalogImport::Source::{}", source_id)
}

/// Handle on one named lock for one owner.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    key: String,
    owner: String,
    lease: Duration,
    heartbeat: Duration,
    retry_delay: Duration,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("lease", &self.lease)
            .finish()
    }
}

impl DistributedLock {
    pub fn new(
        store: Arc<dyn LockStore>,
        key: impl Into<String>,
        owner: impl Into<String>,
        lease: Duration,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            owner: owner.into(),
            lease,
            heartbeat: lease / 3,
            retry_delay: core_runtime::config::DEFAULT_LOCK_RETRY_DELAY,
        }
    }

    /// The lock guarding imports of `source_id`, owned by `run_id`.
    pub fn for_source(
        store: Arc<dyn LockStore>,
        source_id: SourceId,
        run_id: &RunId,
        config: &SyncEngineConfig,
    ) -> Self {
        Self::new(store, source_lock_key(source_id), run_id.as_str(), config.lock_lease)
            .with_heartbeat(config.lock_heartbeat)
            .with_retry_delay(config.lock_retry_delay)
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Take the lock or fail at once with [`SyncError::LockNotAcquired`].
    pub async fn acquire(&self) -> Result<LockGuard> {
        match self.store.try_acquire(&self.key, &self.owner, self.lease).await? {
            LockAttempt::Acquired(record) => {
                debug!(key = %self.key, owner = %self.owner, "Lock acquired");
                Ok(LockGuard::start(self.clone(), record, false))
            }
            LockAttempt::Reentered(record) => {
                debug!(key = %self.key, owner = %self.owner, "Lock re-entered");
                Ok(LockGuard::start(self.clone(), record, true))
            }
            LockAttempt::Held(record) => {
                warn!(
                    key = %self.key,
                    holder = %record.owner,
                    "Could not acquire lock, another run holds it"
                );
                Err(SyncError::LockNotAcquired {
                    key: self.key.clone(),
                    holder: record.owner,
                })
            }
        }
    }

    /// Retry [`acquire`](Self::acquire) with jittered delays until `timeout`.
    pub async fn acquire_blocking(&self, timeout: Duration) -> Result<LockGuard> {
        let started = Instant::now();
        loop {
            match self.acquire().await {
                Err(SyncError::LockNotAcquired { .. }) => {}
                other => return other,
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(SyncError::LockTimeout {
                    key: self.key.clone(),
                    waited_ms: elapsed.as_millis() as u64,
                });
            }

            let jitter_ms = rand::thread_rng().gen_range(0..=self.retry_delay.as_millis() as u64);
            let delay = (self.retry_delay + Duration::from_millis(jitter_ms))
                .min(timeout.saturating_sub(elapsed));
            tokio::time::sleep(delay).await;
        }
    }

    /// Release the lock if this owner holds it. Safe to call repeatedly.
    pub async fn release(&self) -> Result<bool> {
        let released = self.store.release(&self.key, &self.owner).await?;
        if released {
            debug!(key = %self.key, owner = %self.owner, "Lock released");
        }
        Ok(released)
    }

    /// Push the lease out by another full term. `false` if the lock was lost.
    pub async fn extend(&self) -> Result<bool> {
        Ok(self.store.extend(&self.key, &self.owner, self.lease).await?)
    }

    /// Whether the lock is held; by this owner only when `by_us`.
    pub async fn locked(&self, by_us: bool) -> Result<bool> {
        Ok(match self.store.holder(&self.key).await? {
            Some(record) => !by_us || record.owner == self.owner,
            None => false,
        })
    }

    /// Run `f` under the lock and release it on every exit path.
    pub async fn with_lock<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire().await?;
        let outcome = f().await;
        let released = guard.release().await;
        let value = outcome?;
        released?;
        Ok(value)
    }
}

/// Proof of holding a [`DistributedLock`].
///
/// Dropping a live guard releases the lock in the background. Call
/// [`release`](Self::release) to release deterministically, or
/// [`retain`](Self::retain) to leave the lock for a continuation of the
/// same run.
#[must_use = "dropping the guard releases the lock"]
pub struct LockGuard {
    lock: DistributedLock,
    record: LockRecord,
    reentered: bool,
    heartbeat: CancellationToken,
    live: bool,
}

impl LockGuard {
    fn start(lock: DistributedLock, record: LockRecord, reentered: bool) -> Self {
        let heartbeat = CancellationToken::new();
        if !lock.heartbeat.is_zero() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(run_heartbeat(lock.clone(), heartbeat.clone()));
            }
        }
        Self {
            lock,
            record,
            reentered,
            heartbeat,
            live: true,
        }
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Whether this run already held the lock before this acquisition.
    pub fn reentered(&self) -> bool {
        self.reentered
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    /// Stop the heartbeat and release the lock.
    pub async fn release(mut self) -> Result<bool> {
        self.live = false;
        self.heartbeat.cancel();
        self.lock.release().await
    }

    /// Stop the heartbeat and leave the lock held for a full lease, for the
    /// next unit of work of the same run to pick up.
    pub async fn retain(mut self) -> Result<()> {
        self.live = false;
        self.heartbeat.cancel();
        if !self.lock.extend().await? {
            warn!(key = %self.lock.key, owner = %self.lock.owner, "Lock lost before hand-off");
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.heartbeat.cancel();
        if !self.live {
            return;
        }
        let lock = self.lock.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lock.release().await {
                        warn!(key = %lock.key, error = %e, "Failed to release dropped lock");
                    }
                });
            }
            Err(_) => {
                warn!(key = %lock.key, "Lock guard dropped outside a runtime; lease will expire");
            }
        }
    }
}

async fn run_heartbeat(lock: DistributedLock, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(lock.heartbeat);
    // First tick fires immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => match lock.extend().await {
                Ok(true) => debug!(key = %lock.key, "Lock lease renewed"),
                Ok(false) => {
                    info!(key = %lock.key, owner = %lock.owner, "Lock no longer held, heartbeat stopping");
                    break;
                }
                Err(e) => warn!(key = %lock.key, error = %e, "Lock heartbeat failed"),
            },
        }
    }
}
