//! The caller's stack as presented to a hook.
//!
//! The entry thunks save the volatile integer registers and flags, then hand
//! the high-level hook a pointer into that save area. [`EntryFrame`] is the
//! typed view of it: the register block, the callee entry address the
//! instrumented prologue pushed, and the displaced return address above it.
//! Field order must match the thunk's push sequence exactly.

/// Snapshot of the stack at hook entry, lowest address first.
///
/// The thunk pushes rax..r11 then rflags, so in memory the flags sit lowest
/// and rax highest, directly below the callee-address slot. The two trailing
/// fields are the slots that were already on the stack when the thunk ran.
#[derive(Debug)]
#[repr(C)]
pub struct EntryFrame {
    /// Saved flags.
    pub rflags: u64,
    /// Saved r11.
    pub r11: u64,
    /// Saved r10.
    pub r10: u64,
    /// Saved r9 (integer argument 6).
    pub r9: u64,
    /// Saved r8 (integer argument 5).
    pub r8: u64,
    /// Saved rdi (integer argument 1).
    pub rdi: u64,
    /// Saved rsi (integer argument 2).
    pub rsi: u64,
    /// Saved rdx (integer argument 3).
    pub rdx: u64,
    /// Saved rcx (integer argument 4).
    pub rcx: u64,
    /// Saved rax.
    pub rax: u64,
    /// The callee's real entry address, pushed by the instrumented prologue.
    pub callee: u64,
    /// The caller's return address; the entry hook overwrites this slot to
    /// divert the epilogue into the exit thunk.
    pub retaddr: u64,
}

impl EntryFrame {
    /// The return address currently in the displaced slot.
    #[inline]
    pub fn return_address(&self) -> u64 {
        self.retaddr
    }

    /// Redirects the callee's return to `addr`.
    #[inline]
    pub fn set_return_address(&mut self, addr: u64) {
        self.retaddr = addr;
    }

    /// The `n`th integer argument slot in System V order.
    ///
    /// Returns 0 past the sixth register argument; stack-passed arguments
    /// are not captured.
    #[inline]
    pub fn arg(&self, n: usize) -> u64 {
        match n {
            0 => self.rdi,
            1 => self.rsi,
            2 => self.rdx,
            3 => self.rcx,
            4 => self.r8,
            5 => self.r9,
            _ => 0,
        }
    }

    /// The address of the return-address slot, used as this frame's position
    /// on the real stack for orphan trimming. Deeper frames have lower
    /// addresses.
    #[inline]
    pub fn frame_pointer(&self) -> usize {
        &self.retaddr as *const u64 as usize
    }
}

// The thunks address this layout by fixed offsets.
const _: () = assert!(size_of::<EntryFrame>() == 96);
const _: () = assert!(core::mem::offset_of!(EntryFrame, callee) == 80);
const _: () = assert!(core::mem::offset_of!(EntryFrame, retaddr) == 88);
