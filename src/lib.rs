//! # KCAS core
//!
//! A lock-free K-word compare-and-swap (KCAS) engine and a pair of
//! concurrent open-addressed hash sets built on top of it: one purely
//! lock-free (single-word CAS per slot), one hardware-transactional with a
//! pessimistic fallback lock and in-transaction dynamic resizing.
//!
//! Ported from the descriptor-helping and probe/resize algorithms of a
//! small C++ research benchmark core, onto an ownership model where a
//! KCAS descriptor reference is `(owner thread id, sequence number)`
//! rather than a raw pointer — see [`tagged`] for why.
//!
//! ## Module Organization
//!
//! ### Foundation
//! - [`pr`] - Atomic primitives and memory barriers
//! - [`backoff`] - Exponential backoff for contention management
//! - [`config`] - Compile-time and constructor-time configuration knobs
//! - [`error`] - Constructor-time configuration errors
//!
//! ### KCAS Engine
//! - [`tagged`] - Tagged atomic words distinguishing values from descriptor
//!   references
//! - [`kcas`] - The KCAS engine itself: descriptor pool, install/decide/
//!   cleanup, helping
//! - [`demo_array`] - A minimal array built on the engine, both a worked
//!   example and the engine's own concurrency-test harness
//!
//! ### Hash Sets
//! - [`hash_set_lockfree`] - Lock-free open-addressed hash set
//! - [`fallback_lock`] - The pessimistic lock backing the HTM set
//! - [`approx_counter`] - Sharded approximate population counter
//! - [`htm`] - Hardware transactional memory wrapper with a compile-time
//!   degrade-to-lock switch
//! - [`hash_set_htm`] - HTM hash set with fallback lock and dynamic resize

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// =============================================================================
// Tier 0: Foundation (No Internal Dependencies)
// =============================================================================

/// Atomic primitives and memory barriers.
pub mod pr;

/// Compile-time and constructor-time configuration knobs.
pub mod config;

/// Constructor-time configuration errors.
pub mod error;

// =============================================================================
// Tier 1: Basic Building Blocks (Depends on Tier 0)
// =============================================================================

/// Exponential backoff for contention management.
pub mod backoff;

/// Tagged atomic words distinguishing plain values from KCAS descriptor
/// references.
pub mod tagged;

/// The pessimistic fallback lock backing the HTM hash set.
pub mod fallback_lock;

/// Sharded approximate population counter.
pub mod approx_counter;

/// Hardware transactional memory wrapper with a compile-time degrade
/// switch.
pub mod htm;

// =============================================================================
// Tier 2: Core Components (Depends on Tiers 0-1)
// =============================================================================

/// The KCAS engine: per-thread descriptor pool, install/decide/cleanup,
/// helping.
pub mod kcas;

/// Lock-free open-addressed hash set (single-word CAS per slot).
pub mod hash_set_lockfree;

// =============================================================================
// Tier 3: Composite Structures (Depends on Tiers 0-2)
// =============================================================================

/// HTM hash set with fallback lock and dynamic resize.
pub mod hash_set_htm;

/// A minimal array data structure built on the KCAS engine.
pub mod demo_array;

pub use config::{MAX_K, MAX_THREADS};
pub use demo_array::DemoArray;
pub use error::ConfigError;
pub use hash_set_htm::{HtmHashSet, InsertOutcome};
pub use hash_set_lockfree::LockFreeHashSet;
pub use kcas::{DescriptorHandle, Engine};
pub use tagged::AtomicWord;
