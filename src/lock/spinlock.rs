//! Mutual exclusion lock that busy waits.
//!
//! Backed by `spin::Mutex`, the same crate the teacher already
//! depends on for exactly this purpose. Used for the bcache's bucket
//! locks, the inode table lock, and the buffer cache's tick counter:
//! all of these are held only across a handful of field reads/writes,
//! never across a blocking call (spec §5 lock ordering rule 1).

use std::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

/// A spinning mutual-exclusion lock around `T`.
pub struct Spinlock<T> {
    name: &'static str,
    inner: Mutex<T>,
}

/// RAII guard for a [`Spinlock`]. Releases on drop.
pub struct SpinlockGuard<'a, T> {
    name: &'static str,
    inner: MutexGuard<'a, T>,
}

impl<T> Spinlock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            inner: Mutex::new(data),
        }
    }

    /// Acquires the lock, busy waiting until it is free.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        SpinlockGuard {
            name: self.name,
            inner: self.inner.lock(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}
