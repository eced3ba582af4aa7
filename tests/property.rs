//! Randomized insert/erase sequences checked against a single-threaded
//! reference set, across both concurrent set variants.

use std::collections::HashSet as StdHashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use kcas_core::hash_set_htm::{HtmHashSet, InsertOutcome};
use kcas_core::hash_set_lockfree::LockFreeHashSet;

const KEY_RANGE: i64 = 64;
const OPS_PER_THREAD: usize = 4000;
const THREADS: usize = 6;

#[test]
fn lockfree_set_sum_matches_reference_under_random_concurrent_ops() {
    let set = Arc::new(LockFreeHashSet::new(4096).unwrap());
    let checksum = Arc::new(AtomicI64::new(0));

    let mut handles = Vec::new();
    for tid in 0..THREADS {
        let set = set.clone();
        let checksum = checksum.clone();
        handles.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(tid as u64 + 1);
            for _ in 0..OPS_PER_THREAD {
                let key = rng.gen_range(1..=KEY_RANGE);
                if rng.gen_bool(0.5) {
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
fn htm_set_sum_matches_reference_under_random_concurrent_ops() {
    let set = Arc::new(HtmHashSet::new(THREADS, 4096).unwrap());
    let checksum = Arc::new(AtomicI64::new(0));

    let mut handles = Vec::new();
    for tid in 0..THREADS {
        let set = set.clone();
        let checksum = checksum.clone();
        handles.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(tid as u64 + 100);
            for _ in 0..OPS_PER_THREAD {
                let key = rng.gen_range(1..=KEY_RANGE);
                if rng.gen_bool(0.5) {
                    if set.insert_if_absent(tid, key) != InsertOutcome::AlreadyPresent {
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
fn lockfree_set_single_threaded_matches_reference_set_exactly() {
    let set = LockFreeHashSet::new(1024).unwrap();
    let mut reference: StdHashSet<i64> = StdHashSet::new();
    let mut rng = StdRng::seed_from_u64(42);

    for _ in 0..20_000 {
        let key = rng.gen_range(1..=KEY_RANGE);
        if rng.gen_bool(0.5) {
            assert_eq!(set.insert_if_absent(0, key), reference.insert(key));
        } else {
            assert_eq!(set.erase(0, key), reference.remove(&key));
        }
    }

    let expected: i64 = reference.into_iter().sum();
    assert_eq!(set.sum_of_keys(), expected);
}
