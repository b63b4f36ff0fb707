// Copyright (C) 2025 Red Hat. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The big lock shared with the rest of the hypervisor.
//!
//! Most hypervisor state (the address-space registry, device configuration semantics) is
//! guarded by one coarse lock. The lock remembers, per thread, whether it is currently held, so
//! code paths with a fixed lock ordering can detect a violation instead of deadlocking: any
//! finer-grained lock that must be taken *before* the big lock checks
//! [`held_by_current_thread`] when it is acquired.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::Duration;

// How often a cancellable acquisition retries.
const CANCELLABLE_POLL: Duration = Duration::from_millis(1);

thread_local! {
    static BQL_HELD: Cell<usize> = const { Cell::new(0) };
}

/// The global lock guarding `T`.
#[derive(Debug, Default)]
pub struct Bql<T> {
    inner: Mutex<T>,
}

impl<T> Bql<T> {
    /// Create a new lock around `value`.
    pub fn new(value: T) -> Self {
        Bql {
            inner: Mutex::new(value),
        }
    }

    /// Acquire the lock, blocking the current thread until it is able to do so.
    ///
    /// A poisoned lock is recovered: the state it guards is only ever mutated through
    /// operations that leave it consistent on early return.
    pub fn lock(&self) -> BqlGuard<'_, T> {
        self.guard(self.inner.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Acquire the lock unless `cancelled` turns true first, in which case `None` is returned.
    ///
    /// For worker threads that must stay joinable by a thread holding the lock.
    pub fn lock_or_cancel(&self, cancelled: impl Fn() -> bool) -> Option<BqlGuard<'_, T>> {
        loop {
            if cancelled() {
                return None;
            }
            match self.inner.try_lock() {
                Ok(guard) => return Some(self.guard(guard)),
                Err(TryLockError::Poisoned(e)) => return Some(self.guard(e.into_inner())),
                Err(TryLockError::WouldBlock) => thread::sleep(CANCELLABLE_POLL),
            }
        }
    }

    fn guard<'a>(&'a self, guard: MutexGuard<'a, T>) -> BqlGuard<'a, T> {
        BQL_HELD.with(|held| held.set(held.get() + 1));
        BqlGuard {
            lock: self,
            guard: Some(guard),
        }
    }

    /// Consume the lock and return the guarded value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

/// Whether the calling thread currently holds the big lock.
pub fn held_by_current_thread() -> bool {
    BQL_HELD.with(|held| held.get() > 0)
}

/// RAII guard for [`Bql`].
#[derive(Debug)]
pub struct BqlGuard<'a, T> {
    lock: &'a Bql<T>,
    guard: Option<MutexGuard<'a, T>>,
}

impl<T> BqlGuard<'_, T> {
    /// Release the lock for the duration of `f`, then reacquire it.
    ///
    /// Use this to take a lock that orders before the big lock while already holding it.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.release();
        let ret = f();
        self.guard = Some(self.lock.inner.lock().unwrap_or_else(|e| e.into_inner()));
        BQL_HELD.with(|held| held.set(held.get() + 1));
        ret
    }

    fn release(&mut self) {
        if self.guard.take().is_some() {
            BQL_HELD.with(|held| held.set(held.get() - 1));
        }
    }
}

impl<T> Deref for BqlGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // The guard is only `None` inside `unlocked()`, which holds `&mut self`.
        self.guard.as_deref().expect("BQL guard used while unlocked")
    }
}

impl<T> DerefMut for BqlGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard
            .as_deref_mut()
            .expect("BQL guard used while unlocked")
    }
}

impl<T> Drop for BqlGuard<'_, T> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_held_tracking() {
        let bql = Bql::new(5u32);
        assert!(!held_by_current_thread());
        {
            let mut guard = bql.lock();
            assert!(held_by_current_thread());
            *guard += 1;
            let inner = guard.unlocked(held_by_current_thread);
            assert!(!inner);
            assert!(held_by_current_thread());
            assert_eq!(*guard, 6);
        }
        assert!(!held_by_current_thread());
        assert_eq!(bql.into_inner(), 6);
    }

    #[test]
    fn test_lock_or_cancel() {
        let bql = Bql::new(1u32);
        let guard = bql.lock();
        thread::scope(|s| {
            let waiter = s.spawn(|| bql.lock_or_cancel(|| true).is_none());
            assert!(waiter.join().unwrap());
        });
        drop(guard);
        let guard = bql.lock_or_cancel(|| false).unwrap();
        assert!(held_by_current_thread());
        assert_eq!(*guard, 1);
    }

    #[test]
    fn test_held_is_per_thread() {
        let bql = Arc::new(Bql::new(()));
        let _guard = bql.lock();
        let other = thread::spawn(held_by_current_thread)
            .join()
            .unwrap();
        assert!(!other);
    }
}
