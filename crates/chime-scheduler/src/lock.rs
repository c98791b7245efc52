//! Cross-process mutual exclusion for reminder processing.
//!
//! A lock is a row in a shared store keyed by `reminder_{id}`. Acquisition is
//! an atomic insert-if-absent, so exactly one of any number of concurrent
//! callers wins regardless of which process it lives in. Rows left behind by
//! crashed holders are removed by [`DistributedLock::clean_expired`].

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use crate::{
    db::{init_db, to_millis},
    error::{Result, SchedulerError},
};

/// Storage contract behind [`DistributedLock`].
pub trait LockStore: Send + Sync {
    /// Insert `key` unless a row already exists. `true` means the caller owns it now.
    fn insert_if_absent(&self, key: &str, owner: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Delete `key` if it is held by `owner`. Returns the number of rows removed.
    fn delete_by_key(&self, key: &str, owner: &str) -> Result<usize>;

    /// Delete every row acquired before `cutoff`, whoever holds it.
    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// SQLite-backed [`LockStore`]; the `lock_key` primary key provides atomicity.
pub struct SqliteLockStore {
    conn: Mutex<Connection>,
}

impl SqliteLockStore {
    /// Wrap `conn`, creating the schema if needed.
    ///
    /// Sets a busy timeout so concurrent writers from other processes queue
    /// on the database lock instead of failing immediately.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SchedulerError::Poisoned)
    }
}

impl LockStore for SqliteLockStore {
    fn insert_if_absent(&self, key: &str, owner: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "INSERT OR IGNORE INTO scheduler_locks (lock_key, owner, acquired_at)
             VALUES (?1, ?2, ?3)",
            params![key, owner, to_millis(at)],
        )?;
        Ok(n == 1)
    }

    fn delete_by_key(&self, key: &str, owner: &str) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM scheduler_locks WHERE lock_key = ?1 AND owner = ?2",
            params![key, owner],
        )?;
        Ok(n)
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM scheduler_locks WHERE acquired_at < ?1",
            [to_millis(cutoff)],
        )?;
        Ok(n)
    }
}

/// Named, owner-scoped mutex over a [`LockStore`].
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    owner: String,
    ttl: Duration,
}

impl DistributedLock {
    /// `owner` identifies this process; `ttl` is the staleness threshold
    /// after which [`clean_expired`](Self::clean_expired) reclaims a row.
    pub fn new(store: Arc<dyn LockStore>, owner: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            owner: owner.into(),
            ttl,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Try to take `key`. Store errors count as "not acquired".
    pub fn try_lock(&self, key: &str) -> bool {
        match self.store.insert_if_absent(key, &self.owner, Utc::now()) {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(%key, error = %e, "lock acquisition failed, treating as held");
                false
            }
        }
    }

    /// Release `key` if this instance holds it. Never fails.
    pub fn release(&self, key: &str) {
        match self.store.delete_by_key(key, &self.owner) {
            Ok(0) => debug!(%key, "lock already released or held by another instance"),
            Ok(_) => debug!(%key, "lock released"),
            Err(e) => warn!(%key, error = %e, "lock release failed; janitor will reclaim it"),
        }
    }

    /// Take `key` and return a guard that releases it when dropped.
    pub fn acquire(self: &Arc<Self>, key: &str) -> Option<LockGuard> {
        self.try_lock(key).then(|| LockGuard {
            lock: Arc::clone(self),
            key: key.to_string(),
        })
    }

    /// Delete every lock row older than the staleness threshold.
    pub fn clean_expired(&self) -> Result<usize> {
        self.clean_expired_at(Utc::now())
    }

    pub fn clean_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let cutoff = now.checked_sub_signed(ttl).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let n = self.store.delete_older_than(cutoff)?;
        if n > 0 {
            info!(count = n, "expired scheduler locks removed");
        }
        Ok(n)
    }
}

/// Held lock. Dropping it releases the row, on every exit path.
pub struct LockGuard {
    lock: Arc<DistributedLock>,
    key: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.lock.release(&self.key);
    }
}
