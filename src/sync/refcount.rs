// # Logical Reference Counter
//
// `Arc` keeps the bytes of a shared object alive; `RefCount` decides when
// the object's teardown runs and refuses new references once it has
// started. The count reaching zero is a one-way door: `inc_if_valid`
// never resurrects a dead object.

use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

/// Teardown-gating reference counter.
///
/// Count semantics: `0` means the object is dead (teardown has run or is
/// running); any other value counts live borrowers.
#[derive(Debug)]
pub struct RefCount {
    count: AtomicU64,
}

impl RefCount {
    /// Create a counter holding `initial` references
    #[inline]
    pub fn new(initial: u64) -> Self {
        Self {
            count: AtomicU64::new(initial),
        }
    }

    /// Take a reference unless the object is already in teardown.
    ///
    /// Returns false when the count is zero; the caller must treat the
    /// object as gone.
    #[inline]
    pub fn inc_if_valid(&self) -> bool {
        let mut cur = self.count.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Drop a reference; true exactly once, on the 1 -> 0 transition.
    #[inline]
    pub fn dec_and_test(&self) -> bool {
        let old = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0, "reference count underflow");
        old == 1
    }

    /// Drop a reference, taking `lock` iff this was the last one.
    ///
    /// While the count is above one the decrement happens lock-free and
    /// `None` is returned. Otherwise the mutex is acquired first and the
    /// decrement re-examined under it, so a teardown that follows
    /// `Some(guard)` is serialised against concurrent `inc_if_valid`
    /// callers that race through the same lock.
    pub fn dec_and_lock<'a, T: ?Sized>(
        &self,
        lock: &'a Mutex<T>,
    ) -> Option<MutexGuard<'a, T>> {
        let mut cur = self.count.load(Ordering::Acquire);
        while cur > 1 {
            match self.count.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return None,
                Err(observed) => cur = observed,
            }
        }

        let guard = lock.lock();
        if self.dec_and_test() {
            Some(guard)
        } else {
            None
        }
    }

    /// Current count, for assertions and busy checks
    #[inline]
    pub fn read(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_inc_if_valid_refuses_dead_object() {
        let refs = RefCount::new(1);
        assert!(refs.inc_if_valid());
        assert!(!refs.dec_and_test());
        assert!(refs.dec_and_test());
        assert!(!refs.inc_if_valid());
        assert_eq!(refs.read(), 0);
    }

    #[test]
    fn test_dec_and_test_fires_once_under_racing_drops() {
        const THREADS: usize = 8;
        const DROPS_PER_THREAD: usize = 1000;

        let refs = Arc::new(RefCount::new((THREADS * DROPS_PER_THREAD) as u64));
        let zero_transitions = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let refs = refs.clone();
                let zeros = zero_transitions.clone();
                thread::spawn(move || {
                    for _ in 0..DROPS_PER_THREAD {
                        if refs.dec_and_test() {
                            zeros.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(zero_transitions.load(Ordering::SeqCst), 1);
        assert_eq!(refs.read(), 0);
    }

    #[test]
    fn test_dec_and_lock_returns_guard_only_at_zero() {
        let lock = Mutex::new(0u32);
        let refs = RefCount::new(2);

        assert!(refs.dec_and_lock(&lock).is_none());
        let guard = refs.dec_and_lock(&lock);
        assert!(guard.is_some());
        drop(guard);
        assert_eq!(refs.read(), 0);
    }

    #[test]
    fn test_dec_and_lock_loses_race_to_incrementer() {
        // A last-reference drop that races an inc_if_valid must not tear
        // down: the count observed under the lock is 2, not 1.
        let lock = Mutex::new(());
        let refs = RefCount::new(1);
        assert!(refs.inc_if_valid());
        assert!(refs.dec_and_lock(&lock).is_none());
        assert_eq!(refs.read(), 1);
    }
}
