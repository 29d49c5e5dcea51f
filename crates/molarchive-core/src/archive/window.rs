//! Hook for an external UI or host to block interaction during bulk
//! operations.

/// Callback pair invoked around bulk operations.
pub trait WindowLock: Send + Sync {
    /// Called before a bulk operation starts.
    fn lock(&self);

    /// Called once the bulk operation has finished, successfully or not.
    fn unlock(&self);
}

/// Holds a [`WindowLock`] for its lifetime.
pub struct WindowGuard<'a> {
    lock: Option<&'a dyn WindowLock>,
}

impl<'a> WindowGuard<'a> {
    /// Locks `lock`, if any, until the guard is dropped.
    pub fn acquire(lock: Option<&'a dyn WindowLock>) -> Self {
        if let Some(lock) = lock {
            lock.lock();
        }
        Self { lock }
    }
}

impl Drop for WindowGuard<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock {
            lock.unlock();
        }
    }
}
