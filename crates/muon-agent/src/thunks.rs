//! The three instrumentation entry points, x86-64 System V.
//!
//! An instrumented prologue pushes the function's real entry address and
//! jumps to an entry thunk, so the thunk sees `[rsp]` = callee entry and
//! `[rsp+8]` = the caller's return address. Each thunk saves the volatile
//! registers and flags (the [`EntryFrame`] layout), reads the cycle counter,
//! calls its high-level hook, restores everything, and `ret`s into the real
//! callee. The entry hook rewrites the saved return-address slot, so the
//! callee's epilogue `ret`s into the exit thunk; that one swaps the hook's
//! returned real return address onto the stack top and `ret`s into user
//! code.
//!
//! Stack alignment: the thunk is entered with `rsp ≡ 0 (mod 16)` (function
//! entry alignment plus the prologue's one push), and every save block below
//! keeps the `call` sites 16-byte aligned.
//!
//! [`EntryFrame`]: crate::frame::EntryFrame

use core::arch::naked_asm;

macro_rules! entry_thunk {
    ($(#[$attr:meta])* $name:ident => $hook:path) => {
        $(#[$attr])*
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name() {
            naked_asm!(
                // Volatile integer registers and flags; in memory this is
                // the tail of the EntryFrame layout, rflags lowest.
                "push rax",
                "push rcx",
                "push rdx",
                "push rsi",
                "push rdi",
                "push r8",
                "push r9",
                "push r10",
                "push r11",
                "pushfq",
                // Argument/return SSE registers below the integer block.
                "sub rsp, 128",
                "movaps [rsp], xmm0",
                "movaps [rsp + 16], xmm1",
                "movaps [rsp + 32], xmm2",
                "movaps [rsp + 48], xmm3",
                "movaps [rsp + 64], xmm4",
                "movaps [rsp + 80], xmm5",
                "movaps [rsp + 96], xmm6",
                "movaps [rsp + 112], xmm7",
                // Cycle timestamp.
                "rdtsc",
                "shl rdx, 32",
                "or rax, rdx",
                "mov rdx, rax",          // arg 2: cycles
                // The callee entry address pushed by the instrumented
                // prologue sits just above the save area.
                "mov rsi, [rsp + 208]",  // arg 1: callee
                // The EntryFrame starts at the saved rflags.
                "lea rdi, [rsp + 128]",  // arg 0: frame
                "call {hook}",
                "movaps xmm0, [rsp]",
                "movaps xmm1, [rsp + 16]",
                "movaps xmm2, [rsp + 32]",
                "movaps xmm3, [rsp + 48]",
                "movaps xmm4, [rsp + 64]",
                "movaps xmm5, [rsp + 80]",
                "movaps xmm6, [rsp + 96]",
                "movaps xmm7, [rsp + 112]",
                "add rsp, 128",
                "popfq",
                "pop r11",
                "pop r10",
                "pop r9",
                "pop r8",
                "pop rdi",
                "pop rsi",
                "pop rdx",
                "pop rcx",
                "pop rax",
                // Consumes the pushed callee address: control enters the
                // real function with the (possibly rewritten) return
                // address on top.
                "ret",
                hook = sym $hook,
            )
        }
    };
}

entry_thunk! {
    /// Entry thunk for ordinary instrumented functions.
    function_entry_thunk => crate::profiler::function_entry_hook
}

entry_thunk! {
    /// Entry thunk for module-lifecycle functions (`DllMain`-shaped:
    /// arg 0 = module base, arg 1 = reason code).
    module_entry_thunk => crate::profiler::module_entry_hook
}

/// Exit thunk: reached by the instrumented callee's `ret` because the entry
/// hook displaced its return address. At entry `rsp` points just above the
/// vacated return-address slot.
#[unsafe(naked)]
pub unsafe extern "C" fn function_exit_thunk() {
    naked_asm!(
        // rax is pushed first: its slot doubles as the landing pad for the
        // real return address below.
        "push rax",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "pushfq",
        // Return-value SSE registers.
        "sub rsp, 32",
        "movaps [rsp], xmm0",
        "movaps [rsp + 16], xmm1",
        "rdtsc",
        "shl rdx, 32",
        "or rax, rdx",
        "mov rsi, rax",          // arg 1: cycles
        // Address of the return-address slot the ret just vacated.
        "lea rdi, [rsp + 104]",  // arg 0: slot address
        "call {hook}",
        // rax now holds the real return address.
        "movaps xmm0, [rsp]",
        "movaps xmm1, [rsp + 16]",
        "add rsp, 32",
        "popfq",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        // Swap the real return address into the saved-rax slot, restoring
        // rax in the same move, then return into user code.
        "xchg rax, [rsp]",
        "ret",
        hook = sym crate::profiler::function_exit_hook,
    )
}

/// The address entry hooks write into displaced return-address slots.
pub fn exit_thunk_address() -> u64 {
    function_exit_thunk as usize as u64
}
