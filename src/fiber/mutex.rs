//! Cooperative locks.
//!
//! [`Latch`] is the raw lock: a FIFO queue of fibers where the head owns
//! the lock. [`Mutex`] wraps a latch around a value, releasing the lock
//! through an RAII guard, in the shape of [`std::sync::Mutex`] minus the
//! poisoning — a fiber cannot be preempted, so a panic while holding the
//! lock unwinds the guard like any other drop.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

#[cfg(debug_assertions)]
use std::{cell::Cell, panic::Location};

use crate::clock;
use crate::error::{Error, Result};
use crate::ev::Deadline;
use crate::fiber::{self, WaitQueue};

////////////////////////////////////////////////////////////////////////////////
// Latch
////////////////////////////////////////////////////////////////////////////////

/// A lock for cooperative multitasking: the queue of waiting fibers, the
/// first of which owns the latch. Waiters acquire in FIFO order.
#[derive(Default)]
pub struct Latch {
    queue: WaitQueue,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            queue: WaitQueue::new(),
        }
    }

    /// Lock the latch, yielding until the current fiber can gain access.
    pub fn lock(&self) -> LatchGuard<'_> {
        self.lock_timeout(clock::INFINITY)
            .expect("infinite lock timed out")
    }

    /// Lock with a deadline. On timeout the fiber gives up its place in the
    /// queue and fails with [`Error::TimedOut`].
    pub fn lock_timeout(&self, timeout: Duration) -> Result<LatchGuard<'_>> {
        let cur = fiber::current();
        let deadline = Deadline::new(crate::ev::to_seconds(timeout));
        self.queue.park_tail(&cur);
        loop {
            if self.queue.front_is(&cur) {
                return Ok(LatchGuard { latch: self });
            }
            if deadline.is_zero() || deadline.expired() {
                self.queue.unlink(&cur);
                return Err(Error::TimedOut);
            }
            // A wakeup (from unlock, or a stray cancel) clears the wait
            // marker; re-assert it without losing the queue position.
            self.queue.re_mark(&cur);
            fiber::yield_timeout_seconds(deadline.remaining());
        }
    }

    /// Try to lock the latch. Returns `None` immediately if it is locked.
    /// Does not yield.
    pub fn try_lock(&self) -> Option<LatchGuard<'_>> {
        if self.queue.is_empty() {
            let cur = fiber::current();
            self.queue.park_tail(&cur);
            Some(LatchGuard { latch: self })
        } else {
            None
        }
    }

    fn unlock(&self) {
        let owner = self.queue.pop_front().expect("unlock of an unlocked latch");
        debug_assert!(
            std::rc::Rc::ptr_eq(&owner, &fiber::current()),
            "latch unlocked by a fiber that does not own it"
        );
        // Raw peek: a waiter that was spuriously woken keeps its place in
        // line, and waking it again is a no-op while it is scheduled.
        if let Some(next) = self.queue.front_raw() {
            next.wakeup();
        }
    }
}

impl fmt::Debug for Latch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Latch")
            .field("locked", &!self.queue.is_empty())
            .finish()
    }
}

/// An RAII "scoped lock" of a [`Latch`]. The latch is unlocked when the
/// guard is dropped.
pub struct LatchGuard<'a> {
    latch: &'a Latch,
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.latch.unlock();
    }
}

impl fmt::Debug for LatchGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatchGuard").finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Mutex
////////////////////////////////////////////////////////////////////////////////

/// A mutual-exclusion primitive protecting a value, built on [`Latch`].
pub struct Mutex<T: ?Sized> {
    latch: Latch,
    #[cfg(debug_assertions)]
    lock_location: Cell<Option<&'static Location<'static>>>,
    data: UnsafeCell<T>,
}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    pub fn new(t: T) -> Mutex<T> {
        Mutex {
            latch: Latch::new(),
            #[cfg(debug_assertions)]
            lock_location: Cell::default(),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the mutex, yielding the current fiber until it is able to
    /// do so. The returned guard unlocks on drop.
    ///
    /// Locking a mutex in the fiber which already holds it deadlocks.
    #[track_caller]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        #[cfg(debug_assertions)]
        let guard = self.latch.try_lock().unwrap_or_else(|| {
            self.log_lock_location();
            self.latch.lock()
        });

        #[cfg(not(debug_assertions))]
        let guard = self.latch.lock();

        MutexGuard::new(self, guard)
    }

    /// Attempts to acquire this lock. Returns `None` if it is held by
    /// another fiber. Does not yield.
    #[track_caller]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        match self.latch.try_lock() {
            Some(guard) => Some(MutexGuard::new(self, guard)),
            None => {
                #[cfg(debug_assertions)]
                self.log_lock_location();
                None
            }
        }
    }

    /// Immediately drops the guard, and consequently unlocks the mutex.
    pub fn unlock(guard: MutexGuard<'_, T>) {
        drop(guard);
    }

    /// Returns a mutable reference to the underlying data. No locking: the
    /// mutable borrow statically guarantees no guards exist.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    #[cfg(debug_assertions)]
    fn log_lock_location(&self) {
        if let Some(loc) = self.lock_location.get() {
            log::debug!("mutex was locked at {loc}");
        } else {
            log::debug!("mutex was locked at unknown location");
        }
    }
}

impl<T> From<T> for Mutex<T> {
    fn from(t: T) -> Self {
        Mutex::new(t)
    }
}

impl<T: ?Sized + Default> Default for Mutex<T> {
    fn default() -> Mutex<T> {
        Mutex::new(Default::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => {
                d.field("data", &&*guard);
            }
            None => {
                struct LockedPlaceholder;
                impl fmt::Debug for LockedPlaceholder {
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        f.write_str("<locked>")
                    }
                }
                d.field("data", &LockedPlaceholder);
            }
        }
        d.finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// MutexGuard
////////////////////////////////////////////////////////////////////////////////

pub struct MutexGuard<'a, T: ?Sized + 'a> {
    lock: &'a Mutex<T>,
    _latch_guard: LatchGuard<'a>,
}

impl<'mutex, T: ?Sized> MutexGuard<'mutex, T> {
    #[track_caller]
    fn new(lock: &'mutex Mutex<T>, _latch_guard: LatchGuard<'mutex>) -> Self {
        #[cfg(debug_assertions)]
        lock.lock_location.set(Some(Location::caller()));
        Self { lock, _latch_guard }
    }
}

impl<'a, T: ?Sized + 'a> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        self.lock.lock_location.set(None);
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized + fmt::Display> fmt::Display for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}
