//! `DemoArray` (§4.E): a minimal array data structure whose only operation
//! is "pick K consecutive slots and increment them all atomically", built
//! directly on top of [`crate::kcas::Engine`].
//!
//! Grounded on the original benchmark workhorse `ArrayUsingKCAS`: useful
//! both as a worked example of the KCAS provider interface and as the
//! backbone of the crate's own multi-word-CAS concurrency tests.

use crate::error::ConfigError;
use crate::kcas::Engine;
use crate::tagged::AtomicWord;

/// An array of `size` atomic words supporting K-consecutive-slot atomic
/// increments via the shared [`Engine`].
pub struct DemoArray {
    data: Vec<AtomicWord>,
    k: usize,
}

impl DemoArray {
    /// Build a `DemoArray` of `size` words, each initialized to zero, whose
    /// [`DemoArray::increment_random_k`] operation touches `k` consecutive
    /// slots per call.
    pub fn new(engine: &Engine, size: usize, k: usize) -> Result<Self, ConfigError> {
        crate::config::check_capacity(size)?;
        crate::config::check_k(k)?;
        let data: Vec<AtomicWord> = (0..size).map(|_| AtomicWord::new(0)).collect();
        for word in &data {
            engine.write_init_value(word, 0);
        }
        Ok(Self { data, k })
    }

    /// Pick a starting index at random (via `start_index`, already reduced
    /// mod `size` by the caller) and atomically increment it along with the
    /// `k - 1` slots that follow it, wrapping around the array.
    ///
    /// Returns `true` if the KCAS succeeded; on failure the array is
    /// unchanged and the caller may simply retry with a fresh
    /// `start_index`.
    pub fn increment_random_k(&self, engine: &Engine, tid: usize, start_index: usize) -> bool {
        let size = self.data.len();
        let mut indices = Vec::with_capacity(self.k);
        let mut ix = start_index % size;
        for _ in 0..self.k {
            indices.push(ix);
            ix = (ix + 1) % size;
        }

        let handle = engine.get_descriptor(tid);
        for &i in &indices {
            let old = engine.read_value(&self.data[i]);
            // SAFETY: `self.data[i]` outlives the descriptor handle — both
            // are borrowed from `self`/`engine` for the duration of this
            // call, and `kcas` resolves the attempt before returning.
            unsafe {
                engine.add_entry(&handle, &self.data[i], old, old + 1);
            }
        }
        engine.kcas(tid, &handle)
    }

    /// Sum of all slots' current logical values, helping along any
    /// in-progress KCAS encountered along the way.
    pub fn total(&self, engine: &Engine) -> u64 {
        self.data.iter().map(|w| engine.read_value(w)).sum()
    }

    /// Number of slots in the array.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the array has no slots.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
