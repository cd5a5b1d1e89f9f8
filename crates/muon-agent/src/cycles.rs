//! Cycle counter sources.
//!
//! The hooks read cycles twice per invocation: once in the thunk (the
//! timestamp handed to the hook) and once at hook exit for the overhead
//! accumulator. Per-thread state is generic over the source so the hot path
//! is static dispatch and harnesses can substitute a deterministic counter.

use std::cell::Cell;
use std::rc::Rc;

/// A monotone, nondecreasing 64-bit cycle counter.
///
/// Two successive reads on the same core satisfy `later >= earlier`.
/// Cross-core monotonicity is not required; every consumer computes only
/// same-thread differences.
pub trait CycleSource {
    /// Reads the counter. Must not fence.
    fn read(&self) -> u64;
}

/// The hardware time stamp counter.
#[cfg(target_arch = "x86_64")]
#[derive(Clone, Copy, Debug, Default)]
pub struct Tsc;

#[cfg(target_arch = "x86_64")]
impl CycleSource for Tsc {
    /// Reads the TSC using `RDTSC`.
    ///
    /// Not serializing -- the CPU may reorder it relative to surrounding
    /// instructions, which is acceptable for difference-only consumers.
    #[inline]
    fn read(&self) -> u64 {
        let lo: u32;
        let hi: u32;
        // SAFETY: RDTSC is available on all x86_64 processors and has no
        // side effects.
        unsafe {
            core::arch::asm!(
                "rdtsc",
                out("eax") lo,
                out("edx") hi,
                options(nomem, nostack, preserves_flags),
            );
        }
        (u64::from(hi) << 32) | u64::from(lo)
    }
}

/// A hand-driven counter for harnesses and tests.
///
/// Clones share one value, so a test can keep a handle while the thread
/// state owns another and steer every reading the hooks make.
#[derive(Clone, Debug, Default)]
pub struct ManualCycles {
    now: Rc<Cell<u64>>,
}

impl ManualCycles {
    /// A counter starting at `now`.
    pub fn starting_at(now: u64) -> Self {
        let cycles = Self::default();
        cycles.set(now);
        cycles
    }

    /// Sets the counter to `now`. Callers keep it nondecreasing.
    pub fn set(&self, now: u64) {
        self.now.set(now);
    }

    /// Moves the counter forward by `delta`.
    pub fn advance(&self, delta: u64) {
        self.now.set(self.now.get() + delta);
    }
}

impl CycleSource for ManualCycles {
    fn read(&self) -> u64 {
        self.now.get()
    }
}
