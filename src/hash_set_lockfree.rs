//! Lock-free open-addressed hash set (§4.C): fixed-capacity slot array,
//! linear probing, single-word CAS on `EMPTY -> key` and `key -> TOMBSTONE`.
//!
//! Grounded on `set_hashtable_lockfree.h`: same Murmur3 finalizer hash, same
//! `EMPTY`/`TOMBSTONE` sentinel values and probe/CAS state machine, ported
//! from `__sync_val_compare_and_swap` on a plain `int` array to
//! `AtomicI64::compare_exchange`.

use core::sync::atomic::{AtomicI64, Ordering};

use log::trace;

use crate::config;
use crate::error::ConfigError;

const EMPTY: i64 = 0;
const TOMBSTONE: i64 = -1;

/// Murmur3-32-finalizer-derived hash of a key, widened back to an index by
/// the caller's `% capacity`. Matches `murmur3_32` in the reference hash
/// set bit for bit, operating on the low 32 bits of `key`.
#[inline]
pub(crate) fn murmur3_32(key: i64) -> u32 {
    let mut k = key as i32 as u32;
    let mut h: u32 = 0x1a8b714c;
    k = k.wrapping_mul(0xcc9e2d51);
    k = k.rotate_left(15);
    k = k.wrapping_mul(0x1b873593);
    h ^= k;
    h = h.rotate_left(13);
    h = h.wrapping_mul(5).wrapping_add(0xe6546b64);
    h ^= h >> 16;
    h = h.wrapping_mul(0x85ebca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2ae35);
    h ^= h >> 16;
    h
}

/// A fixed-capacity, lock-free open-addressed hash set of `i64` keys.
pub struct LockFreeHashSet {
    data: Vec<AtomicI64>,
    capacity: usize,
}

impl LockFreeHashSet {
    /// Build a set with capacity `2 * requested_capacity`, all slots empty.
    pub fn new(requested_capacity: usize) -> Result<Self, ConfigError> {
        config::check_capacity(requested_capacity)?;
        let capacity = 2 * requested_capacity;
        let data = (0..capacity).map(|_| AtomicI64::new(EMPTY)).collect();
        Ok(Self { data, capacity })
    }

    /// Total number of slots (`2 * requested_capacity`).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert `key` if no slot currently holds it.
    ///
    /// # Panics
    ///
    /// Panics if `key` is `EMPTY` (0) or `TOMBSTONE` (-1) — a precondition
    /// violation (§7).
    pub fn insert_if_absent(&self, _tid: usize, key: i64) -> bool {
        assert!(key != EMPTY && key != TOMBSTONE, "invalid key {key}");
        let hash = murmur3_32(key);
        for i in 0..self.capacity {
            let index = (hash as usize + i) % self.capacity;
            let slot = &self.data[index];
            let found = slot.load(Ordering::Acquire);
            if found == key {
                return false;
            } else if found == EMPTY {
                match slot.compare_exchange(EMPTY, key, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => return true,
                    Err(actual) if actual == key => return false,
                    Err(_) => continue,
                }
            }
        }
        trace!("insert_if_absent({key}): table full after full probe");
        false
    }

    /// Erase `key` if some slot currently holds it.
    ///
    /// # Panics
    ///
    /// Panics if `key` is `EMPTY` or `TOMBSTONE`.
    pub fn erase(&self, _tid: usize, key: i64) -> bool {
        assert!(key != EMPTY && key != TOMBSTONE, "invalid key {key}");
        let hash = murmur3_32(key);
        for i in 0..self.capacity {
            let index = (hash as usize + i) % self.capacity;
            let slot = &self.data[index];
            let found = slot.load(Ordering::Acquire);
            if found == key {
                return slot
                    .compare_exchange(key, TOMBSTONE, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
            } else if found == EMPTY {
                return false;
            }
        }
        false
    }

    /// Quiescent sum of all live (non-empty, non-tombstone) keys.
    pub fn sum_of_keys(&self) -> i64 {
        self.data
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .filter(|&v| v != EMPTY && v != TOMBSTONE)
            .sum()
    }

    /// Opaque debugging hook, matching the reference implementation's
    /// `printDebuggingDetails`; this set carries no per-thread counters to
    /// report (those are out of scope — §1 External collaborators).
    pub fn print_debugging_details(&self) {
        trace!(
            "LockFreeHashSet: capacity={}, live={}",
            self.capacity,
            self.data
                .iter()
                .filter(|s| {
                    let v = s.load(Ordering::Relaxed);
                    v != EMPTY && v != TOMBSTONE
                })
                .count()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet as StdHashSet;
    use std::sync::atomic::AtomicI64 as StdAtomicI64;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn insert_erase_insert_cycle() {
        let set = LockFreeHashSet::new(8).unwrap();
        assert!(set.insert_if_absent(0, 5));
        assert!(!set.insert_if_absent(0, 5));
        assert!(set.erase(0, 5));
        assert!(!set.erase(0, 5));
        assert!(set.insert_if_absent(0, 5));
        assert_eq!(set.sum_of_keys(), 5);
    }

    #[test]
    #[should_panic]
    fn rejects_empty_sentinel_as_key() {
        let set = LockFreeHashSet::new(4).unwrap();
        set.insert_if_absent(0, 0);
    }

    #[test]
    fn mixed_workload_checksum_matches_quiescent_sum() {
        let set = Arc::new(LockFreeHashSet::new(64).unwrap());
        let checksum = Arc::new(StdAtomicI64::new(0));
        const KEY_RANGE: i64 = 200;
        const OPS_PER_THREAD: usize = 2000;

        let mut handles = Vec::new();
        for tid in 0..8 {
            let set = set.clone();
            let checksum = checksum.clone();
            handles.push(thread::spawn(move || {
                let mut state = (tid as u64 + 1) * 2654435761;
                for _ in 0..OPS_PER_THREAD {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    let key = (state % KEY_RANGE as u64) as i64 + 1;
                    if state % 2 == 0 {
                        if set.insert_if_absent(tid, key) {
                            checksum.fetch_add(key, Ordering::Relaxed);
                        }
                    } else if set.erase(tid, key) {
                        checksum.fetch_sub(key, Ordering::Relaxed);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(set.sum_of_keys(), checksum.load(Ordering::Relaxed));
    }

    #[test]
    fn matches_single_threaded_reference_under_random_ops() {
        let set = LockFreeHashSet::new(16).unwrap();
        let mut reference: StdHashSet<i64> = StdHashSet::new();
        let mut state = 0x2545F4914F6CDD1Du64;
        for _ in 0..3000 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let key = (state % 40) as i64 + 1;
            if state % 3 == 0 {
                let inserted = set.insert_if_absent(0, key);
                assert_eq!(inserted, reference.insert(key));
            } else {
                let erased = set.erase(0, key);
                assert_eq!(erased, reference.remove(&key));
            }
        }
        let expected: i64 = reference.iter().sum();
        assert_eq!(set.sum_of_keys(), expected);
    }
}
