//! The global execution lock.
//!
//! One non-reentrant mutual-exclusion domain shared by every vCPU thread and the control thread.
//! All cross-CPU control state lives inside the lock (`Bql<T>` owns the `T`). Each thread tracks
//! whether it currently holds a global execution lock, so "lock twice" and "lock-requiring
//! operation without the lock" are caught as programming errors instead of deadlocking or racing.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

static NEXT_BQL_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Id of the lock held by the current thread; 0 when none is held.
    static HELD: Cell<usize> = const { Cell::new(0) };
}

fn set_held(id: usize) {
    HELD.with(|held| held.set(id));
}

/// Returns true if the current thread holds a global execution lock.
pub fn bql_locked() -> bool {
    HELD.with(|held| held.get() != 0)
}

#[track_caller]
pub fn assert_bql_held() {
    assert!(
        bql_locked(),
        "operation requires the global execution lock, which the current thread does not hold"
    );
}

pub struct Bql<T> {
    id: usize,
    inner: Mutex<T>,
}

impl<T> Bql<T> {
    pub fn new(value: T) -> Self {
        Self {
            id: NEXT_BQL_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(value),
        }
    }

    /// Acquire the lock, blocking until it is available.
    ///
    /// Panics if the current thread already holds a global execution lock.
    #[track_caller]
    pub fn lock(&self) -> BqlGuard<'_, T> {
        assert!(
            !bql_locked(),
            "global execution lock acquired twice by the same thread"
        );
        let guard = self.inner.lock();
        set_held(self.id);
        BqlGuard { bql: self, guard }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        HELD.with(|held| held.get() == self.id)
    }
}

pub struct BqlGuard<'a, T> {
    bql: &'a Bql<T>,
    guard: MutexGuard<'a, T>,
}

impl<'a, T> BqlGuard<'a, T> {
    /// Release the lock while `f` runs, then reacquire it.
    ///
    /// Code inside `f` may take the lock again (e.g. a backend touching shared state).
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        set_held(0);
        let ret = MutexGuard::unlocked(&mut self.guard, f);
        set_held(self.bql.id);
        ret
    }

    /// Block on `cond`, releasing the lock for the duration of the wait.
    pub fn wait(&mut self, cond: &Condvar) {
        cond.wait(&mut self.guard);
    }

    /// Like [`BqlGuard::wait`] with an upper bound. Returns true if the wait timed out.
    pub fn wait_for(&mut self, cond: &Condvar, timeout: Duration) -> bool {
        cond.wait_for(&mut self.guard, timeout).timed_out()
    }

    /// Release and reacquire the lock, handing it to a waiting thread if there is one.
    pub fn bump(&mut self) {
        set_held(0);
        MutexGuard::bump(&mut self.guard);
        set_held(self.bql.id);
    }
}

impl<T> Deref for BqlGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for BqlGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for BqlGuard<'_, T> {
    fn drop(&mut self) {
        set_held(0);
    }
}
