//! A short critical section whose holder can park until woken.
//!
//! The log's `outstanding`/`committing` state needs exactly this: a
//! quick lock to inspect/update a few counters, plus the ability to
//! block `begin_op`/`end_op` until the commit finishes or space frees
//! up. `std::sync::Mutex` + `std::sync::Condvar` is the hosted
//! analogue of the teacher's `Sleepablelock`, which pairs a spinlock
//! with a wait/wakeup channel.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard};

pub struct Sleepablelock<T> {
    name: &'static str,
    inner: Mutex<T>,
    cv: Condvar,
}

pub struct SleepablelockGuard<'a, T> {
    lock: &'a Sleepablelock<T>,
    inner: Option<MutexGuard<'a, T>>,
}

impl<T> Sleepablelock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            inner: Mutex::new(data),
            cv: Condvar::new(),
        }
    }

    pub fn lock(&self) -> SleepablelockGuard<'_, T> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(|_| panic!("sleepablelock {} poisoned", self.name));
        SleepablelockGuard {
            lock: self,
            inner: Some(inner),
        }
    }

    /// Wakes every caller currently blocked in [`SleepablelockGuard::sleep`].
    pub fn wakeup(&self) {
        self.cv.notify_all();
    }
}

impl<T> SleepablelockGuard<'_, T> {
    /// Atomically releases the lock and blocks the caller until
    /// [`Sleepablelock::wakeup`] is called, then reacquires the lock.
    /// Mirrors the teacher's `guard.sleep(ctx)`.
    pub fn sleep(&mut self) {
        let guard = self.inner.take().expect("guard already consumed");
        let guard = self
            .lock
            .cv
            .wait(guard)
            .unwrap_or_else(|_| panic!("sleepablelock {} poisoned", self.lock.name));
        self.inner = Some(guard);
    }

    /// Runs `f` with the lock released, then reacquires it. Used by
    /// `end_op` to run `commit()` without holding the coordinator
    /// lock (spec §4.2: "executed ... with the log spinlock NOT held").
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let guard = self.inner.take().expect("guard already consumed");
        drop(guard);
        let result = f();
        let guard = self
            .lock
            .inner
            .lock()
            .unwrap_or_else(|_| panic!("sleepablelock {} poisoned", self.lock.name));
        self.inner = Some(guard);
        result
    }
}

impl<T> Deref for SleepablelockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.inner.as_ref().expect("guard already consumed")
    }
}

impl<T> DerefMut for SleepablelockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_mut().expect("guard already consumed")
    }
}
