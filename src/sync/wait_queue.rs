// # Reason-Coded Wait Queue
//
// A condition variable whose wakeups carry a reason. The waiter hands in
// the guard of the mutex protecting the state it was examining; the wait
// releases that mutex, parks the thread, and reacquires the mutex before
// returning the reason. One queue must always be paired with the same
// mutex.
//
// The queue also tracks a single optional owner thread, used by the page
// cache to assert that the thread releasing a BUSY page is the one that
// acquired it.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

/// Why a waiter was woken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WakeReason {
    /// The previous holder released the resource; re-examine and retry
    Released = 0,

    /// The resource was destroyed while waiting; the lookup must restart
    Destroyed = 1,

    /// An asynchronous event is pending for this thread; surface EINTR
    EventDelivered = 2,

    /// The guarded mutex was torn down; abandon the acquisition
    LockFail = 3,
}

impl WakeReason {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WakeReason::Released,
            1 => WakeReason::Destroyed,
            2 => WakeReason::EventDelivered,
            _ => WakeReason::LockFail,
        }
    }
}

/// Wait queue with reason-coded wakeup and owner tracking
#[derive(Debug)]
pub struct WaitQueue {
    cv: Condvar,
    reason: AtomicU8,
    waiters: AtomicUsize,
    owner: Mutex<Option<ThreadId>>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            cv: Condvar::new(),
            reason: AtomicU8::new(WakeReason::Released as u8),
            waiters: AtomicUsize::new(0),
            owner: Mutex::new(None),
        }
    }

    /// Park the caller, releasing `guard`'s mutex until woken.
    ///
    /// The mutex is held again when this returns. The returned reason is
    /// the one passed to the wake call that ended the sleep.
    pub fn wait<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>) -> WakeReason {
        self.waiters.fetch_add(1, Ordering::AcqRel);
        self.cv.wait(guard);
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        WakeReason::from_u8(self.reason.load(Ordering::Acquire))
    }

    /// Wake every waiter with `reason`
    pub fn wake_all(&self, reason: WakeReason) {
        self.reason.store(reason as u8, Ordering::Release);
        self.cv.notify_all();
    }

    /// Wake one waiter with `reason`
    pub fn wake_one(&self, reason: WakeReason) {
        self.reason.store(reason as u8, Ordering::Release);
        self.cv.notify_one();
    }

    /// True while at least one thread is parked on the queue
    pub fn has_waiters(&self) -> bool {
        self.waiters.load(Ordering::Acquire) > 0
    }

    /// Record the calling thread as the resource owner.
    ///
    /// Returns false if another thread already owns it.
    pub fn set_owner(&self) -> bool {
        let mut owner = self.owner.lock();
        match *owner {
            Some(existing) if existing != thread::current().id() => false,
            _ => {
                *owner = Some(thread::current().id());
                true
            }
        }
    }

    /// Clear the recorded owner
    pub fn clear_owner(&self) {
        *self.owner.lock() = None;
    }

    /// The recorded owner thread, if any
    pub fn owner(&self) -> Option<ThreadId> {
        *self.owner.lock()
    }

    /// Assert (debug builds only) that the caller is the recorded owner
    #[inline]
    pub fn debug_assert_owned(&self) {
        debug_assert_eq!(
            self.owner(),
            Some(thread::current().id()),
            "resource released by a thread that does not own it"
        );
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_wait_returns_wake_reason() {
        let state = Arc::new(Mutex::new(false));
        let wq = Arc::new(WaitQueue::new());

        let waiter = {
            let state = state.clone();
            let wq = wq.clone();
            thread::spawn(move || {
                let mut guard = state.lock();
                while !*guard {
                    let reason = wq.wait(&mut guard);
                    if reason == WakeReason::Destroyed {
                        return reason;
                    }
                }
                WakeReason::Released
            })
        };

        while !wq.has_waiters() {
            thread::sleep(Duration::from_millis(1));
        }
        wq.wake_all(WakeReason::Destroyed);
        assert_eq!(waiter.join().unwrap(), WakeReason::Destroyed);
    }

    #[test]
    fn test_wake_releases_blocked_thread() {
        let state = Arc::new(Mutex::new(false));
        let wq = Arc::new(WaitQueue::new());

        let waiter = {
            let state = state.clone();
            let wq = wq.clone();
            thread::spawn(move || {
                let mut guard = state.lock();
                while !*guard {
                    wq.wait(&mut guard);
                }
            })
        };

        while !wq.has_waiters() {
            thread::sleep(Duration::from_millis(1));
        }
        *state.lock() = true;
        wq.wake_all(WakeReason::Released);
        waiter.join().unwrap();
        assert!(!wq.has_waiters());
    }

    #[test]
    fn test_owner_tracking() {
        let wq = WaitQueue::new();
        assert!(wq.owner().is_none());
        assert!(wq.set_owner());
        assert_eq!(wq.owner(), Some(thread::current().id()));

        // Re-entrant set by the same thread is allowed.
        assert!(wq.set_owner());

        let wq = Arc::new(wq);
        let wq2 = wq.clone();
        let other = thread::spawn(move || wq2.set_owner());
        assert!(!other.join().unwrap());

        wq.clear_owner();
        assert!(wq.owner().is_none());
    }
}
