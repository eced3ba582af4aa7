//! Approximate per-thread counter (§3, §4.D): each thread accumulates into
//! its own padded shard and only occasionally folds the shard into a
//! shared total, trading exact accounting for almost no cross-thread
//! traffic on the hot path.
//!
//! Grounded on `Hlock::inc`/`Hlock::read` in `set_unfinished.h`. The
//! bound this gives the HTM hash set (§4.D, §8 `ApproxBound`) is
//! `approx_total <= true_count <= approx_total + num_threads * drain_threshold`,
//! since at most `drain_threshold - 1` increments per thread can be sitting
//! undrained in a shard at any instant.

use core::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use crate::config::{self, Padded, DEFAULT_DRAIN_THRESHOLD};
use crate::error::ConfigError;

/// A per-thread shard, padded to its own cache line.
#[derive(Default)]
struct Shard(AtomicU32);

/// An approximate counter shared across `num_threads` threads.
pub struct ApproxCounter {
    shards: Vec<Padded<Shard>>,
    total: AtomicI64,
    drain_threshold: u32,
}

impl ApproxCounter {
    /// Build a counter for `num_threads` threads, draining a thread's shard
    /// into the shared total once it reaches [`DEFAULT_DRAIN_THRESHOLD`].
    pub fn new(num_threads: usize) -> Result<Self, ConfigError> {
        Self::with_drain_threshold(num_threads, DEFAULT_DRAIN_THRESHOLD)
    }

    /// As [`ApproxCounter::new`], with an explicit drain threshold.
    pub fn with_drain_threshold(
        num_threads: usize,
        drain_threshold: u32,
    ) -> Result<Self, ConfigError> {
        config::check_thread_count(num_threads)?;
        let shards = (0..num_threads).map(|_| Padded::new(Shard::default())).collect();
        Ok(Self {
            shards,
            total: AtomicI64::new(0),
            drain_threshold,
        })
    }

    /// Increment thread `tid`'s shard by one, draining into the shared
    /// total if the shard has reached the drain threshold. Returns the
    /// shared total as observed after this call (which may lag the true
    /// count by up to `drain_threshold - 1` per other thread).
    pub fn inc(&self, tid: usize) -> i64 {
        let shard = &self.shards[tid].0;
        let count = shard.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= self.drain_threshold {
            shard.store(0, Ordering::Relaxed);
            self.total.fetch_add(count as i64, Ordering::AcqRel);
        }
        self.total.load(Ordering::Acquire)
    }

    /// Read the shared (approximate) total without draining any shard.
    pub fn read(&self) -> i64 {
        self.total.load(Ordering::Acquire)
    }
}
