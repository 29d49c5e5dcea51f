//! Per-UID in-process locks.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

/// Lazily created mutex per UID, serializing reads and writes of one record
/// inside the process. An entry lives only while some caller holds or waits
/// on it.
#[derive(Debug, Default)]
pub(crate) struct UidLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UidLocks {
    /// Returns the mutex for `uid`. The map shard is released before the
    /// caller locks the returned mutex.
    fn lock_for(&self, uid: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(uid) {
            return lock.clone();
        }
        self.locks
            .entry(uid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Runs `f` while holding the mutex for `uid`, then drops the entry if
    /// no other caller picked it up in the meantime.
    pub(crate) fn with_lock<T>(&self, uid: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.lock_for(uid);
        let result = {
            let _held = lock.lock();
            f()
        };
        drop(lock);
        // The map's own clone is the only reference left when nobody else
        // holds or waits on this UID; remove_if checks under the shard lock.
        self.locks.remove_if(uid, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}
