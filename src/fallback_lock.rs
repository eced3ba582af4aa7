//! The pessimistic fallback lock backing the HTM hash set (§4.D).
//!
//! Grounded on `util.h`'s `TryLock`: a single atomic flag with a
//! non-blocking `try_acquire`, a `release`, and — the detail that matters
//! here — an `is_held` query that can be read *without* acquiring the lock.
//! The HTM fast path folds a read of `is_held` into its transactional read
//! set (§4.D), so any thread that pessimistically holds the lock forces
//! concurrent transactions to abort rather than race past it.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::backoff::Backoff;

/// A non-blocking test-and-set lock whose held/not-held state can be
/// queried independently of acquiring it.
#[derive(Debug, Default)]
pub struct FallbackLock {
    held: AtomicBool,
}

impl FallbackLock {
    /// Create a lock in the released state.
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Attempt to acquire the lock without blocking. Returns `true` on
    /// success.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Spin until the lock is acquired.
    pub fn acquire(&self) {
        let mut backoff = Backoff::new();
        while !self.try_acquire() {
            backoff.spin();
        }
    }

    /// Release a held lock.
    #[inline]
    pub fn release(&self) {
        self.held.store(false, Ordering::Release);
    }

    /// Read whether the lock is currently held, without acquiring it. Part
    /// of the HTM read set: a transaction that loads this must abort if a
    /// concurrent pessimistic acquirer flips it (§4.D).
    #[inline]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_acquire_then_release_round_trips() {
        let lock = FallbackLock::new();
        assert!(!lock.is_held());
        assert!(lock.try_acquire());
        assert!(lock.is_held());
        assert!(!lock.try_acquire());
        lock.release();
        assert!(!lock.is_held());
        assert!(lock.try_acquire());
    }

    #[test]
    fn only_one_thread_observes_successful_acquire() {
        let lock = Arc::new(FallbackLock::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            handles.push(thread::spawn(move || lock.try_acquire()));
        }
        let successes: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();
        assert_eq!(successes, 1);
    }
}
