// SPDX-License-Identifier: AGPL-3.0-only

//! Component E: the lock manager (spec.md §4.E). Every acquire in this
//! module takes a [`crate::sync::Deadline`] and returns `LOCKED` on
//! timeout rather than blocking forever, the way the teacher's storage
//! engine bounds its own latch acquires.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};

use crate::error::{Error, StoreResult};
use crate::sync::{Backoff, Deadline};

/// A single advisory file lock serializing main-region creation/resizing
/// (spec.md §4.E "Create-lock"). Held for the duration of the guard.
pub struct CreateLock {
    file: File,
}

impl CreateLock {
    pub fn open(repository_path: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(repository_path)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(repository_path.join(".create.lock"))?;
        Ok(Self { file })
    }

    pub fn acquire(&self, deadline: Deadline) -> StoreResult<CreateLockGuard<'_>> {
        let backoff = Backoff::new();
        loop {
            if self.file.try_lock_exclusive().is_ok() {
                return Ok(CreateLockGuard { file: &self.file });
            }
            if deadline.is_expired() {
                return Err(Error::locked("create-lock acquire timed out"));
            }
            backoff.snooze();
        }
    }
}

pub struct CreateLockGuard<'a> {
    file: &'a File,
}

impl Drop for CreateLockGuard<'_> {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(self.file);
    }
}

/// A reader-writer lock with a bounded acquire (spec.md §4.E "Every
/// acquire takes a monotonic deadline"). Backs the ext-remap lock, the
/// per-module data lock, and the per-channel subscription lock.
pub struct TimedRwLock<T> {
    inner: RwLock<T>,
}

impl<T> TimedRwLock<T> {
    pub fn new(value: T) -> Self {
        Self { inner: RwLock::new(value) }
    }

    pub fn read(&self, deadline: Deadline) -> StoreResult<parking_lot::RwLockReadGuard<'_, T>> {
        let backoff = Backoff::new();
        loop {
            if let Some(g) = self.inner.try_read() {
                return Ok(g);
            }
            if deadline.is_expired() {
                return Err(Error::locked("read lock acquire timed out"));
            }
            backoff.snooze();
        }
    }

    pub fn write(&self, deadline: Deadline) -> StoreResult<parking_lot::RwLockWriteGuard<'_, T>> {
        let backoff = Backoff::new();
        loop {
            if let Some(g) = self.inner.try_write() {
                return Ok(g);
            }
            if deadline.is_expired() {
                return Err(Error::locked("write lock acquire timed out"));
            }
            backoff.snooze();
        }
    }

    /// Acquires upgradable-read, then atomically upgrades to write (spec.md
    /// §4.E "Upgrading from read → write is atomic and waits; a write lock
    /// cannot be acquired while any reader other than the upgrader holds
    /// it"). Returns the write guard directly: callers that only needed the
    /// read view can drop it immediately without ever upgrading.
    pub fn upgradable_read(&self, deadline: Deadline) -> StoreResult<RwLockUpgradableReadGuard<'_, T>> {
        let backoff = Backoff::new();
        loop {
            if let Some(g) = self.inner.try_upgradable_read() {
                return Ok(g);
            }
            if deadline.is_expired() {
                return Err(Error::locked("upgradable-read lock acquire timed out"));
            }
            backoff.snooze();
        }
    }

    pub fn upgrade<'a>(
        &self,
        guard: RwLockUpgradableReadGuard<'a, T>,
        deadline: Deadline,
    ) -> StoreResult<parking_lot::RwLockWriteGuard<'a, T>> {
        let backoff = Backoff::new();
        let mut guard = guard;
        loop {
            match RwLockUpgradableReadGuard::try_upgrade(guard) {
                Ok(w) => return Ok(w),
                Err(g) => {
                    guard = g;
                    if deadline.is_expired() {
                        return Err(Error::locked("lock upgrade timed out"));
                    }
                    backoff.snooze();
                }
            }
        }
    }
}

/// An advisory exclusive lock per (module, datastore) held by one session
/// to block all writers (spec.md §4.E "DS-lock"): an owning-session id plus
/// a timestamp, as would be stored in the main region's module record.
pub struct DsLock {
    owner: AtomicU64,
    acquired_at_secs: AtomicU64,
}

impl Default for DsLock {
    fn default() -> Self {
        Self::new()
    }
}

impl DsLock {
    pub fn new() -> Self {
        Self { owner: AtomicU64::new(0), acquired_at_secs: AtomicU64::new(0) }
    }

    /// Attempts to take the lock for `session_id` (nonzero). Fails with
    /// `LOCKED` if a different live session already holds it.
    pub fn acquire(&self, session_id: u64, is_owner_live: impl Fn(u64) -> bool) -> StoreResult<()> {
        let cur = self.owner.load(Ordering::Acquire);
        if cur != 0 && cur != session_id && is_owner_live(cur) {
            return Err(Error::locked(format!("datastore is locked by session {cur}")));
        }
        self.owner.store(session_id, Ordering::Release);
        self.acquired_at_secs.store(now_secs(), Ordering::Release);
        Ok(())
    }

    pub fn release(&self, session_id: u64) -> StoreResult<()> {
        let cur = self.owner.load(Ordering::Acquire);
        if cur != session_id {
            return Err(Error::invalid_arg("release: caller does not hold the datastore lock"));
        }
        self.owner.store(0, Ordering::Release);
        Ok(())
    }

    pub fn owner(&self) -> Option<u64> {
        match self.owner.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Per-(module, datastore) lock set: the reader-writer data lock plus the
/// advisory DS-lock (spec.md §4.E).
pub struct ModuleDatastoreLocks {
    pub data: TimedRwLock<()>,
    pub ds_lock: DsLock,
}

impl Default for ModuleDatastoreLocks {
    fn default() -> Self {
        Self { data: TimedRwLock::new(()), ds_lock: DsLock::new() }
    }
}

/// The full lock manager: the process-wide create-lock, the ext-remap
/// lock, and a registry of per-(module, datastore) and per-channel locks
/// created on first touch (spec.md §4.E).
pub struct LockManager {
    pub create_lock: CreateLock,
    pub ext_remap: TimedRwLock<()>,
    module_locks: RwLock<BTreeMap<String, Arc<ModuleDatastoreLocks>>>,
    subscription_locks: RwLock<BTreeMap<String, Arc<TimedRwLock<()>>>>,
}

impl LockManager {
    pub fn new(repository_path: &Path) -> StoreResult<Self> {
        Ok(Self {
            create_lock: CreateLock::open(repository_path)?,
            ext_remap: TimedRwLock::new(()),
            module_locks: RwLock::new(BTreeMap::new()),
            subscription_locks: RwLock::new(BTreeMap::new()),
        })
    }

    fn key(module: &str, datastore: &str) -> String {
        format!("{module}\0{datastore}")
    }

    pub fn module_datastore(&self, module: &str, datastore: &str) -> Arc<ModuleDatastoreLocks> {
        let key = Self::key(module, datastore);
        if let Some(l) = self.module_locks.read().get(&key) {
            return l.clone();
        }
        let mut w = self.module_locks.write();
        w.entry(key).or_insert_with(|| Arc::new(ModuleDatastoreLocks::default())).clone()
    }

    pub fn subscription_channel(&self, channel_key: &str) -> Arc<TimedRwLock<()>> {
        if let Some(l) = self.subscription_locks.read().get(channel_key) {
            return l.clone();
        }
        let mut w = self.subscription_locks.write();
        w.entry(channel_key.to_string()).or_insert_with(|| Arc::new(TimedRwLock::new(()))).clone()
    }

    /// Sorts module names into the canonical acquisition order (spec.md
    /// §4.E "Ordering": lexicographic by module name) before a caller
    /// takes locks on more than one module at once.
    pub fn canonical_order<'a>(modules: &mut [&'a str]) {
        modules.sort_unstable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn ds_lock_blocks_other_live_sessions() {
        let lock = DsLock::new();
        lock.acquire(1, |_| true).unwrap();
        assert!(lock.acquire(2, |_| true).is_err());
        assert!(lock.acquire(2, |_| false).is_ok()); // stale owner, not live
    }

    #[test]
    fn timed_rwlock_upgrade_round_trip() {
        let lock = TimedRwLock::new(5);
        let upgradable = lock.upgradable_read(Deadline::after(Duration::from_millis(50))).unwrap();
        assert_eq!(*upgradable, 5);
        let mut w = lock.upgrade(upgradable, Deadline::after(Duration::from_millis(50))).unwrap();
        *w = 6;
        drop(w);
        assert_eq!(*lock.read(Deadline::forever()).unwrap(), 6);
    }

    #[test]
    fn canonical_order_is_lexicographic() {
        let mut modules = vec!["zeta", "alpha", "mid"];
        LockManager::canonical_order(&mut modules);
        assert_eq!(modules, vec!["alpha", "mid", "zeta"]);
    }
}
