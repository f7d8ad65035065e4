//! Long-term lock that may block the caller.
//!
//! Backed by `std::sync::Mutex`, whose blocking acquisition is the
//! hosted analogue of "may sleep while held" (spec §5). One instance
//! guards each buffer's payload and each in-memory inode's fields;
//! holders may perform blocking disk I/O while holding it.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

pub struct Sleeplock<T> {
    name: &'static str,
    inner: Mutex<T>,
}

pub struct SleeplockGuard<'a, T> {
    name: &'static str,
    inner: MutexGuard<'a, T>,
}

impl<T> Sleeplock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            inner: Mutex::new(data),
        }
    }

    /// Acquires the lock, blocking the caller until it is free.
    pub fn lock(&self) -> SleeplockGuard<'_, T> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(|_| panic!("sleeplock {} poisoned", self.name));
        SleeplockGuard {
            name: self.name,
            inner,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Deref for SleeplockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for SleeplockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}
