//! Hardware transactional memory (HTM), with a compile-time switch that
//! degrades the whole HTM hash set to its pessimistic-lock path on targets
//! that cannot attempt hardware transactions at all (§4.D, §9).
//!
//! Grounded on the teacher's lock-elision module (`elide.rs`), which gates
//! its fast path on `target_feature = "rtm"` and otherwise always takes
//! the fallback lock. This module keeps that same gate but actually
//! attempts a transaction (`core::arch::x86_64::{_xbegin, _xend, _xabort}`)
//! when the feature is present, instead of only pretending to elide.
//! Status-bit layout and abort codes mirror the construction used directly
//! by `set_unfinished.h`'s `Hlock::insertIfAbsent`/`eraseHTM`.

/// Explicit abort code raised when a transaction observes that the table
/// has grown too full and must be expanded — expansion itself cannot run
/// inside a transaction, so the caller falls back to the pessimistic lock.
pub const ABORT_NEEDS_RESIZE: u32 = 1;
/// Explicit abort code raised when a transaction observes the fallback
/// lock pessimistically held by another thread.
pub const ABORT_LOCK_HELD: u32 = 2;

/// Why a transaction attempt did not commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// This build cannot attempt hardware transactions at all (§9).
    Unsupported,
    /// An explicit abort was raised with the given code (one of the
    /// `ABORT_*` constants above).
    Explicit(u32),
    /// The processor aborted the transaction for a reason other than an
    /// explicit `_xabort` (lock/cache-line conflict, capacity overflow,
    /// nested-transaction limit, ...).
    Other,
}

/// Whether this build was compiled with hardware transaction support, i.e.
/// whether [`transaction`] will ever actually attempt one rather than
/// reporting [`AbortReason::Unsupported`] immediately.
#[inline]
pub const fn is_available() -> bool {
    cfg!(all(target_arch = "x86_64", target_feature = "rtm"))
}

/// Attempt to run `body` as a single hardware transaction.
///
/// `body` receives nothing and must perform only plain (non-atomic) memory
/// operations on data the caller already has exclusive-enough access to
/// for the duration of the transaction; it signals an explicit abort by
/// returning `Err(code)` for one of the `ABORT_*` constants, in which case
/// the transaction is rolled back as if it never ran.
///
/// On a target without RTM support `body` is never called and this always
/// returns `Err(AbortReason::Unsupported)` — on such a build the HTM hash
/// set unconditionally takes the fallback-lock path.
#[inline]
pub fn transaction<R>(body: impl FnOnce() -> Result<R, u32>) -> Result<R, AbortReason> {
    #[cfg(all(target_arch = "x86_64", target_feature = "rtm"))]
    {
        imp::transaction(body)
    }
    #[cfg(not(all(target_arch = "x86_64", target_feature = "rtm")))]
    {
        let _ = body;
        Err(AbortReason::Unsupported)
    }
}

#[cfg(all(target_arch = "x86_64", target_feature = "rtm"))]
mod imp {
    use super::AbortReason;
    use core::arch::x86_64::{_xabort, _xbegin, _xend, _XABORT_EXPLICIT, _XBEGIN_STARTED};

    pub fn transaction<R>(body: impl FnOnce() -> Result<R, u32>) -> Result<R, AbortReason> {
        // SAFETY: `_xbegin`/`_xend` bracket a hardware transaction; `body`
        // is documented (on `super::transaction`) to perform only plain
        // memory operations the caller has arranged to be safe to run
        // speculatively and to roll back cleanly on abort.
        unsafe {
            let status = _xbegin();
            if status == _XBEGIN_STARTED {
                match body() {
                    Ok(value) => {
                        _xend();
                        Ok(value)
                    }
                    Err(code) => {
                        // `_xabort` does not return: it rolls the
                        // transaction back and resumes at the `_xbegin`
                        // call site with the abort status set.
                        xabort_dynamic(code);
                        unreachable!("_xabort does not return")
                    }
                }
            } else if status & _XABORT_EXPLICIT != 0 {
                let code = (status >> 24) & 0xff;
                Err(AbortReason::Explicit(code))
            } else {
                Err(AbortReason::Other)
            }
        }
    }

    /// `_xabort` requires a compile-time-constant code; dispatch the two
    /// codes this crate actually raises, plus a generic fallback.
    #[inline]
    unsafe fn xabort_dynamic(code: u32) -> ! {
        match code {
            super::ABORT_NEEDS_RESIZE => _xabort::<{ super::ABORT_NEEDS_RESIZE as u8 }>(),
            super::ABORT_LOCK_HELD => _xabort::<{ super::ABORT_LOCK_HELD as u8 }>(),
            _ => _xabort::<0xff>(),
        }
        unreachable!("_xabort does not return")
    }
}
