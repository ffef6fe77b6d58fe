// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address-space mutex with contention accounting
//! OWNERS: @kernel-sync-team
//! PUBLIC API: AspaceLock::new(), lock(), try_lock(), is_locked(), stats()
//! DEPENDS_ON: spin::Mutex
//! INVARIANTS: Guards the whole node arena of one address space; not reentrant

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of how often the lock was taken and how often callers had to spin.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LockStats {
    pub acquisitions: u64,
    pub contended: u64,
}

/// Spin mutex guarding one address space.
pub struct AspaceLock<T> {
    inner: spin::Mutex<T>,
    acquisitions: AtomicU64,
    contended: AtomicU64,
}

impl<T> AspaceLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
            acquisitions: AtomicU64::new(0),
            contended: AtomicU64::new(0),
        }
    }

    /// Locks the mutex, counting the acquisition as contended if it had to spin.
    pub fn lock(&self) -> AspaceLockGuard<'_, T> {
        let guard = match self.inner.try_lock() {
            Some(guard) => guard,
            None => {
                self.contended.fetch_add(1, Ordering::Relaxed);
                self.inner.lock()
            }
        };
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        AspaceLockGuard { guard }
    }

    pub fn try_lock(&self) -> Option<AspaceLockGuard<'_, T>> {
        let guard = self.inner.try_lock()?;
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        Some(AspaceLockGuard { guard })
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
        }
    }
}

pub struct AspaceLockGuard<'a, T> {
    guard: spin::MutexGuard<'a, T>,
}

impl<'a, T> Deref for AspaceLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<'a, T> DerefMut for AspaceLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}
