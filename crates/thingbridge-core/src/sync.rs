//! Cancelable mutual exclusion.
//!
//! [`CancelableLock`] is a lock whose acquisition can be abandoned through a
//! [`CancellationToken`]. It is the primitive every record table and value
//! log in ThingBridge is guarded by.
//!
//! ```rust,no_run
//! use thingbridge_core::sync::CancelableLock;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() {
//! let lock = CancelableLock::new(Vec::<u32>::new());
//! let cancel = CancellationToken::new();
//!
//! let Some(mut values) = lock.try_lock(&cancel).await else {
//!     return; // canceled before the lock became available
//! };
//! values.push(1);
//! # }
//! ```

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// A lock around `T` whose acquisition honours a cancellation token.
///
/// Built on a tokio mutex, so waiters are served in arrival order. The lock
/// is not reentrant.
pub struct CancelableLock<T> {
    inner: Mutex<T>,
    held: AtomicBool,
}

impl<T> CancelableLock<T> {
    /// Create a new, unlocked lock.
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            held: AtomicBool::new(false),
        }
    }

    /// Wait for the lock until it is acquired or `cancel` fires.
    ///
    /// Returns `None` if the token fired first; the lock is then not held by
    /// the caller. A token that is already canceled always yields `None`,
    /// even when the lock is free.
    pub async fn try_lock(&self, cancel: &CancellationToken) -> Option<CancelableLockGuard<'_, T>> {
        if cancel.is_cancelled() {
            return None;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            guard = self.inner.lock() => Some(self.hold(guard)),
        }
    }

    /// Wait for the lock without a way to give up. Never returns without
    /// holding the lock.
    pub async fn lock(&self) -> CancelableLockGuard<'_, T> {
        let guard = self.inner.lock().await;
        self.hold(guard)
    }

    /// Reports whether someone currently holds the lock.
    ///
    /// Do **not** use this to decide whether an operation is safe: the lock
    /// may be taken or released right after the check.
    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Consume the lock and return the protected value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    fn hold<'a>(&'a self, guard: MutexGuard<'a, T>) -> CancelableLockGuard<'a, T> {
        self.held.store(true, Ordering::Release);
        CancelableLockGuard {
            guard,
            held: &self.held,
        }
    }
}

impl<T: Default> Default for CancelableLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for CancelableLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelableLock")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// Proof of holding a [`CancelableLock`]. Dropping it releases the lock.
pub struct CancelableLockGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    held: &'a AtomicBool,
}

impl<T> Deref for CancelableLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for CancelableLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for CancelableLockGuard<'_, T> {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}
