//! The KCAS engine (§4.B): atomically compare-and-swap K independent
//! memory words, installing all K new values or leaving all K untouched,
//! lock-free and linearizable under arbitrarily many concurrent threads.
//!
//! Grounded on the descriptor/helping protocol of the original design
//! (`kcas_unfinished.h`, never completed there) together with the
//! sequence-numbered, per-thread descriptor pool pattern used by
//! multi-word-CAS implementations in the wild (sort-then-install,
//! status-word linearization, any-thread cleanup).

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use log::trace;

use crate::backoff::Backoff;
use crate::config::{self, Padded, MAX_K};
use crate::error::ConfigError;
use crate::tagged::{self, AtomicWord, Decoded};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
enum Status {
    Undecided = 0,
    Succeeded = 1,
    Failed = 2,
}

impl Status {
    #[inline]
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Status::Undecided,
            1 => Status::Succeeded,
            2 => Status::Failed,
            _ => unreachable!("corrupt KCAS status byte"),
        }
    }
}

/// One `(address, expected, new)` row of a KCAS attempt.
#[derive(Clone, Copy)]
struct Entry {
    addr: *const AtomicWord,
    expected: u64,
    new: u64,
}

// SAFETY: `Entry` is only ever read/written while its owning thread holds
// exclusive access to the descriptor slot (pre-publish) or by helpers that
// only read it after validating a seqlock-style snapshot (post-publish).
unsafe impl Send for Entry {}

impl Default for Entry {
    fn default() -> Self {
        Entry {
            addr: core::ptr::null(),
            expected: 0,
            new: 0,
        }
    }
}

/// A thread's descriptor slot, reused across that thread's KCAS attempts.
///
/// `seq` is bumped twice per attempt: once to an odd value before `entries`
/// is mutated (marking the slot "under construction", invalidating any
/// snapshot a helper may be mid-way through taking), and once more to an
/// even value once `entries` is fully populated and `status` reset (marking
/// the slot "published" under that even sequence number). A helper that
/// reads an even `seq` both before and after copying `entries` has a
/// consistent snapshot of that generation; any mismatch means the
/// generation it was chasing is already resolved, so it can simply bail out
/// and let its caller re-read the target address.
struct ThreadDescriptor {
    seq: AtomicU64,
    status: AtomicU8,
    num_entries: UnsafeCell<usize>,
    entries: UnsafeCell<[Entry; MAX_K]>,
}

// SAFETY: `num_entries`/`entries` are mutated only by the owning thread,
// and only while `seq` is odd (i.e. before any other thread can obtain a
// valid snapshot of them). See `ThreadDescriptor` doc comment.
unsafe impl Sync for ThreadDescriptor {}

impl ThreadDescriptor {
    fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            status: AtomicU8::new(Status::Succeeded as u8),
            num_entries: UnsafeCell::new(0),
            entries: UnsafeCell::new([Entry::default(); MAX_K]),
        }
    }
}

/// A snapshot of another thread's descriptor, taken by a helper.
struct Snapshot {
    status_at_snapshot: Status,
    entries: [Entry; MAX_K],
    num_entries: usize,
}

/// A handle identifying the descriptor a thread is currently building or
/// has just built, returned by [`Engine::get_descriptor`].
#[derive(Clone, Copy)]
pub struct DescriptorHandle {
    tid: usize,
}

/// The KCAS engine: owns one descriptor slot per thread id in
/// `[0, max_threads)`.
pub struct Engine {
    descriptors: Vec<Padded<ThreadDescriptor>>,
}

impl Engine {
    /// Build an engine with descriptor slots for `max_threads` threads.
    pub fn new(max_threads: usize) -> Result<Self, ConfigError> {
        config::check_thread_count(max_threads)?;
        let descriptors = (0..max_threads)
            .map(|_| Padded::new(ThreadDescriptor::new()))
            .collect();
        Ok(Self { descriptors })
    }

    /// Return a cleared descriptor slot owned by thread `tid`, ready to
    /// receive entries via [`Engine::add_entry`].
    ///
    /// # Panics
    ///
    /// Panics if `tid` is out of range — a precondition violation, not a
    /// recoverable error (§7).
    pub fn get_descriptor(&self, tid: usize) -> DescriptorHandle {
        let desc = &self.descriptors[tid];
        // Invalidate: bump to an odd sequence number before entries change.
        desc.seq.fetch_add(1, Ordering::AcqRel);
        // SAFETY: only the owning thread (tid) calls get_descriptor/add_entry
        // for its own slot; this is the crate's precondition on thread ids.
        unsafe {
            *desc.num_entries.get() = 0;
        }
        DescriptorHandle { tid }
    }

    /// Append `(addr, expected, new)` to the descriptor.
    ///
    /// # Safety
    ///
    /// `addr` must remain valid (not deallocated) for as long as any thread
    /// may still be helping this KCAS attempt, i.e. at least until
    /// [`Engine::kcas`] returns and any concurrent helper observed at that
    /// point has also finished cleanup.
    ///
    /// # Panics
    ///
    /// Panics if this would exceed `MAX_K` entries (precondition
    /// violation).
    pub unsafe fn add_entry(
        &self,
        handle: &DescriptorHandle,
        addr: &AtomicWord,
        expected: u64,
        new: u64,
    ) {
        let desc = &self.descriptors[handle.tid];
        let num_entries = &mut *desc.num_entries.get();
        assert!(*num_entries < MAX_K, "KCAS descriptor exceeded MAX_K entries");
        let entries = &mut *desc.entries.get();
        entries[*num_entries] = Entry {
            addr: addr as *const AtomicWord,
            expected,
            new,
        };
        *num_entries += 1;
    }

    /// Attempt the K-word CAS described by `handle`. Returns `true` iff
    /// every entry's address held its expected value at some linearization
    /// point and now holds its new value.
    pub fn kcas(&self, tid: usize, handle: &DescriptorHandle) -> bool {
        debug_assert_eq!(tid, handle.tid);
        let desc = &self.descriptors[tid];

        // SAFETY: owner-exclusive mutation window (see ThreadDescriptor doc).
        let num_entries = unsafe { *desc.num_entries.get() };
        assert!(num_entries >= 1, "KCAS descriptor has no entries");
        unsafe {
            let entries = &mut *desc.entries.get();
            sort_entries(&mut entries[..num_entries]);
            assert_unique_addrs(&entries[..num_entries]);
        }

        desc.status.store(Status::Undecided as u8, Ordering::Release);
        // Publish: even sequence number, entries now stable for readers.
        let my_seq = desc.seq.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert_eq!(my_seq % 2, 0, "publish must land on an even sequence number");

        let desc_word = tagged::encode_descriptor(tid, my_seq);

        // Work from a local copy of the entries rather than the live cell:
        // once published, a helper's view of these entries must stay fixed
        // for this generation even if this thread starts a new KCAS before
        // every helper has finished (see `ThreadDescriptor` doc comment).
        let entries: [Entry; MAX_K] = unsafe { *desc.entries.get() };
        let entries = &entries[..num_entries];

        let succeeded = install_phase(
            self,
            &desc.status,
            &desc.seq,
            entries,
            tid,
            my_seq,
            desc_word,
        );
        if succeeded {
            let _ = desc.status.compare_exchange(
                Status::Undecided as u8,
                Status::Succeeded as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }

        let final_status = Status::from_u8(desc.status.load(Ordering::Acquire));
        cleanup_phase(&desc.seq, entries, tid, my_seq, final_status);

        trace!(
            "kcas(tid={tid}, k={num_entries}) -> {}",
            final_status == Status::Succeeded
        );
        final_status == Status::Succeeded
    }

    /// Read the logical value at `addr`, helping any in-progress KCAS
    /// descriptor installed there to a terminal state first.
    pub fn read_value(&self, addr: &AtomicWord) -> u64 {
        loop {
            let raw = addr.read_raw();
            match tagged::decode(raw) {
                Decoded::Value(v) => return v,
                Decoded::Descriptor { tid, seq } => {
                    self.help(tid, seq);
                    // Loop and re-read; the helped descriptor has been
                    // driven to a terminal state and cleaned up (by us or
                    // a racing helper), so the word now holds a value,
                    // possibly a newer descriptor if someone else already
                    // reused the slot.
                }
            }
        }
    }

    /// Write `v` to `addr` before it is visible to other threads.
    pub fn write_init_value(&self, addr: &AtomicWord, v: u64) {
        addr.write_init(v);
    }

    /// Drive the KCAS descriptor owned by `owner_tid` at generation `seq`
    /// to a terminal state (succeeded/failed) and clean up after it, if
    /// that generation is still live. Safe to call on an already-finished
    /// or already-superseded generation: it is then a no-op.
    fn help(&self, owner_tid: usize, seq: u64) {
        let owner = &self.descriptors[owner_tid];
        let Some(snapshot) = Self::snapshot(owner, seq) else {
            return;
        };
        let desc_word = tagged::encode_descriptor(owner_tid, seq);

        let entries = &snapshot.entries[..snapshot.num_entries];

        let status = if snapshot.status_at_snapshot != Status::Undecided {
            snapshot.status_at_snapshot
        } else {
            let succeeded = install_phase(
                self,
                &owner.status,
                &owner.seq,
                entries,
                owner_tid,
                seq,
                desc_word,
            );
            if succeeded {
                // The owner may have moved on to a new generation while we
                // were installing; only claim the decide CAS for the
                // generation we actually helped.
                if owner.seq.load(Ordering::Acquire) == seq {
                    let _ = owner.status.compare_exchange(
                        Status::Undecided as u8,
                        Status::Succeeded as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
            }
            Status::from_u8(owner.status.load(Ordering::Acquire))
        };

        cleanup_phase(&owner.seq, entries, owner_tid, seq, status);
    }

    /// Seqlock-style read of `owner`'s descriptor, valid only if its
    /// sequence number is still `expected_seq` both before and after the
    /// entries are copied out.
    fn snapshot(owner: &ThreadDescriptor, expected_seq: u64) -> Option<Snapshot> {
        let seq_before = owner.seq.load(Ordering::Acquire);
        if seq_before != expected_seq || seq_before % 2 != 0 {
            return None;
        }
        let status_at_snapshot = Status::from_u8(owner.status.load(Ordering::Acquire));
        // SAFETY: entries are stable while seq == expected_seq (even); we
        // re-validate after the read below before trusting this copy.
        let (num_entries, entries) = unsafe {
            (
                *owner.num_entries.get(),
                *owner.entries.get(),
            )
        };
        let seq_after = owner.seq.load(Ordering::Acquire);
        if seq_after != seq_before {
            return None;
        }
        Some(Snapshot {
            status_at_snapshot,
            entries,
            num_entries,
        })
    }
}

fn sort_entries(entries: &mut [Entry]) {
    entries.sort_by_key(|e| e.addr as usize);
}

fn assert_unique_addrs(entries: &[Entry]) {
    for w in entries.windows(2) {
        assert!(
            w[0].addr as usize != w[1].addr as usize,
            "KCAS descriptor has a duplicate address"
        );
    }
}

/// Run the install phase (§4.B step 3) over `entries`, belonging to
/// `(owner_tid, owner_seq)` whose live status cell is `status`. Returns
/// `true` iff every entry was installed (so the caller may attempt the
/// decide-succeeded CAS); returns `false` once a mismatch forced the
/// Undecided->Failed CAS.
///
/// `entries` is a stable local copy (the owner's own pre-sorted entries,
/// or a helper's validated seqlock snapshot) rather than a live reference
/// into the descriptor, so a concurrent new generation on the same slot
/// cannot change it out from under this call.
///
/// `seq_cell` is the owner's live sequence number, re-checked against
/// `owner_seq` before every CAS attempt. A helper that gets preempted for
/// long enough that the owner finishes this generation, returns, and
/// publishes another one reuses the same `status`/entries storage under a
/// new, unrelated generation; without this recheck a late-arriving helper
/// could install or decide against that new generation on the stale one's
/// behalf. Re-validating on every iteration (not just once, at snapshot
/// time) is what keeps this safe across arbitrarily long preemptions.
fn install_phase(
    engine: &Engine,
    status: &AtomicU8,
    seq_cell: &AtomicU64,
    entries: &[Entry],
    owner_tid: usize,
    owner_seq: u64,
    desc_word: u64,
) -> bool {
    for &entry in entries {
        let addr = unsafe { &*entry.addr };
        let mut backoff = Backoff::new();
        loop {
            // Bail if our generation has been superseded: either decided
            // already, or the owner moved on to a different generation
            // entirely (reusing this slot's status/entries storage).
            if seq_cell.load(Ordering::Acquire) != owner_seq {
                return false;
            }
            if Status::from_u8(status.load(Ordering::Acquire)) != Status::Undecided {
                return false;
            }
            let raw = addr.read_raw();
            match tagged::decode(raw) {
                Decoded::Value(v) if v == entry.expected => {
                    if seq_cell.load(Ordering::Acquire) != owner_seq {
                        return false;
                    }
                    if addr.cas_raw(raw, desc_word) {
                        break;
                    }
                    backoff.spin();
                    continue;
                }
                Decoded::Value(_) => {
                    if seq_cell.load(Ordering::Acquire) != owner_seq {
                        return false;
                    }
                    let _ = status.compare_exchange(
                        Status::Undecided as u8,
                        Status::Failed as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    return false;
                }
                Decoded::Descriptor { tid, seq } if tid == owner_tid && seq == owner_seq => {
                    // A duplicate helper already installed this entry.
                    break;
                }
                Decoded::Descriptor { tid, seq } => {
                    engine.help(tid, seq);
                    backoff.spin();
                    continue;
                }
            }
        }
    }
    true
}

/// Run the cleanup phase (§4.B step 5): replace each installed tagged
/// pointer with the final value implied by `status`.
///
/// `seq_cell` is re-checked against `owner_seq` before every CAS, same as
/// in [`install_phase`]: `status` lives in storage the owner reuses across
/// generations, so a helper resuming after the owner has already moved on
/// to a new generation must not trust a `status` it decided against the
/// old one, nor act on `owner.status`/the target word on the new
/// generation's behalf.
fn cleanup_phase(seq_cell: &AtomicU64, entries: &[Entry], owner_tid: usize, owner_seq: u64, status: Status) {
    for &entry in entries {
        let addr = unsafe { &*entry.addr };
        let final_value = match status {
            Status::Succeeded => entry.new,
            _ => entry.expected,
        };
        let final_word = tagged::encode_value(final_value);
        loop {
            if seq_cell.load(Ordering::Acquire) != owner_seq {
                break;
            }
            let raw = addr.read_raw();
            match tagged::decode(raw) {
                Decoded::Descriptor { tid, seq } if tid == owner_tid && seq == owner_seq => {
                    if seq_cell.load(Ordering::Acquire) != owner_seq {
                        break;
                    }
                    if addr.cas_raw(raw, final_word) {
                        break;
                    }
                    // Someone else is racing us to clean up the same
                    // entry; re-read and retry.
                }
                _ => break, // already cleaned up by someone else.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_threaded_kcas_k3() {
        let engine = Engine::new(4).unwrap();
        let words: Vec<AtomicWord> = (0..5).map(|_| AtomicWord::new(0)).collect();

        let h = engine.get_descriptor(0);
        unsafe {
            engine.add_entry(&h, &words[0], 0, 7);
            engine.add_entry(&h, &words[2], 0, 9);
            engine.add_entry(&h, &words[4], 0, 11);
        }
        assert!(engine.kcas(0, &h));
        let values: Vec<u64> = words.iter().map(|w| engine.read_value(w)).collect();
        assert_eq!(values, vec![7, 0, 9, 0, 11]);

        let h2 = engine.get_descriptor(0);
        unsafe {
            engine.add_entry(&h2, &words[0], 0, 1);
            engine.add_entry(&h2, &words[2], 9, 10);
            engine.add_entry(&h2, &words[4], 11, 12);
        }
        assert!(!engine.kcas(0, &h2));
        let values: Vec<u64> = words.iter().map(|w| engine.read_value(w)).collect();
        assert_eq!(values, vec![7, 0, 9, 0, 11]);
    }

    #[test]
    fn two_threaded_conflicting_kcas_accounting() {
        let engine = Arc::new(Engine::new(2).unwrap());
        let words: Arc<Vec<AtomicWord>> = Arc::new((0..10).map(|_| AtomicWord::new(0)).collect());
        const ROUNDS: usize = 2000;

        let mut handles = Vec::new();
        for (tid, base) in [(0usize, 0usize), (1usize, 1usize)] {
            let engine = engine.clone();
            let words = words.clone();
            handles.push(thread::spawn(move || {
                let mut successes = 0u64;
                for _ in 0..ROUNDS {
                    loop {
                        let a = engine.read_value(&words[base]);
                        let b = engine.read_value(&words[base + 1]);
                        let h = engine.get_descriptor(tid);
                        unsafe {
                            engine.add_entry(&h, &words[base], a, a + 1);
                            engine.add_entry(&h, &words[base + 1], b, b + 1);
                        }
                        if engine.kcas(tid, &h) {
                            successes += 1;
                            break;
                        }
                    }
                }
                successes
            }));
        }

        let total_success: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        let sum: u64 = words.iter().map(|w| engine.read_value(w)).sum();
        assert_eq!(sum, 2 * total_success);
    }

    #[test]
    fn kcas_helping_completes_concurrent_attempt() {
        let engine = Arc::new(Engine::new(2).unwrap());
        let words: Arc<Vec<AtomicWord>> = Arc::new(vec![AtomicWord::new(0), AtomicWord::new(0)]);

        let h = engine.get_descriptor(0);
        unsafe {
            engine.add_entry(&h, &words[0], 0, 5);
            engine.add_entry(&h, &words[1], 0, 6);
        }

        // Publish a real generation the way `kcas` itself would, then stop
        // short of it: install just the first entry and pretend thread A
        // was descheduled before reaching the second, un-helped one.
        let desc = &engine.descriptors[0];
        desc.status.store(Status::Undecided as u8, Ordering::Release);
        let my_seq = desc.seq.fetch_add(1, Ordering::AcqRel) + 1;
        assert_eq!(my_seq % 2, 0, "publish must land on an even sequence number");

        let raw0 = words[0].read_raw();
        assert!(words[0].cas_raw(raw0, tagged::encode_descriptor(0, my_seq)));

        // Thread B reads word 0 and must help A's KCAS to completion.
        let observed = engine.read_value(&words[0]);
        assert_eq!(observed, 5);
        assert_eq!(engine.read_value(&words[1]), 6);
    }

    #[test]
    fn rejects_kcas_with_too_many_entries() {
        let engine = Engine::new(1).unwrap();
        let words: Vec<AtomicWord> = (0..MAX_K + 1).map(|_| AtomicWord::new(0)).collect();
        let h = engine.get_descriptor(0);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
            for w in &words {
                engine.add_entry(&h, w, 0, 1);
            }
        }));
        assert!(result.is_err());
    }
}
