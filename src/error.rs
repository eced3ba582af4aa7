//! Error types for constructor-time configuration problems.
//!
//! Per-operation outcomes (a failed KCAS, a key that was already present)
//! are not errors — they are plain booleans/enums returned from the
//! relevant call. This module only covers preconditions a caller can get
//! wrong before any concurrent access begins.

use thiserror::Error;

/// Configuration mistakes caught at construction time.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum ConfigError {
    /// `max_threads` (or `num_threads`) was zero.
    #[error("thread count must be at least 1")]
    ZeroThreads,

    /// A thread count exceeded the compiled `MAX_THREADS` bound.
    #[error("thread count {requested} exceeds compiled maximum {max}")]
    TooManyThreads {
        /// The thread count the caller asked for.
        requested: usize,
        /// The compiled upper bound (`config::MAX_THREADS`).
        max: usize,
    },

    /// `requested_capacity` (hash sets) was zero.
    #[error("requested capacity must be at least 1")]
    ZeroCapacity,

    /// The number of KCAS entries requested exceeds `MAX_K`.
    #[error("K={requested} exceeds compiled maximum MAX_K={max}")]
    TooManyEntries {
        /// The K the caller asked for.
        requested: usize,
        /// The compiled upper bound (`config::MAX_K`).
        max: usize,
    },
}
