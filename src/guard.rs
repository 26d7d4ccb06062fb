//! Scoped acquisitions backing `Lock::exclusive()`/`Lock::concurrent()`.
//!
//! A guard that owns the acquisition and releases it on drop, so every
//! scope exit, whether a return, a `?`, or a panic, releases the lock.
//! Distinct guard types for each mode keep the release path
//! infallible-looking at the call site.

use std::ops::Deref;

use tracing::error;

use crate::lock::Lock;

/// Held while this object exists, `self.lock` is exclusively locked.
/// Releases on drop.
pub struct ExclusiveGuard<'a> {
    pub(crate) lock: &'a Lock,
}

impl Deref for ExclusiveGuard<'_> {
    type Target = Lock;

    fn deref(&self) -> &Lock {
        self.lock
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release_exclusive() {
            error!(?err, "failed to release exclusive guard");
        }
    }
}

/// Held while this object exists, `self.lock` holds one concurrent
/// acquisition. Releases on drop.
pub struct ConcurrentGuard<'a> {
    pub(crate) lock: &'a Lock,
}

impl Deref for ConcurrentGuard<'_> {
    type Target = Lock;

    fn deref(&self) -> &Lock {
        self.lock
    }
}

impl Drop for ConcurrentGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release_concurrent() {
            error!(?err, "failed to release concurrent guard");
        }
    }
}
