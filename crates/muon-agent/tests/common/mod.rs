//! Shared harness for the agent's scenario tests.
//!
//! Hooks are driven directly with a hand-cranked cycle counter and an
//! in-memory collector; entry frames are laid out in an arena at
//! descending addresses so nesting depth maps onto real stack geometry.

#![allow(dead_code)]

use std::sync::Arc;

use muon_agent::cycles::ManualCycles;
use muon_agent::frame::EntryFrame;
use muon_agent::profiler::ThreadState;
use muon_agent::session::{MemoryClient, MemoryCollector, Session};
use muon_wire::{ParsedInvocation, ParsedSegment, TraceRecord, parse_segment};

/// Sentinel standing in for the exit thunk's address.
pub const EXIT_HOOK: u64 = 0xE417_0000;

/// A thread state wired to a hand-cranked counter and an in-memory
/// collector, plus handles to all three.
pub struct Harness {
    pub state: ThreadState<ManualCycles>,
    pub cycles: ManualCycles,
    pub collector: Arc<MemoryCollector>,
    pub session: Arc<Session>,
}

/// Builds a harness whose segments hold `capacity` bytes.
pub fn harness(capacity: usize) -> Harness {
    let collector = MemoryCollector::new();
    let session = Arc::new(Session::new(Box::new(MemoryClient::new(collector.clone()))));
    let cycles = ManualCycles::default();
    let state = ThreadState::new(session.clone(), cycles.clone(), EXIT_HOOK, capacity);
    Harness {
        state,
        cycles,
        collector,
        session,
    }
}

/// Drives a function entry at `cycles_now` with the counter pinned to the
/// same value, so no overhead accrues unless a test advances it. Returns
/// the frame's slot address for the matching exit.
pub fn enter(h: &mut Harness, arena: &mut FrameArena, depth: usize, retaddr: u64, callee: u64, cycles_now: u64) -> usize {
    h.cycles.set(cycles_now);
    let frame = arena.frame(depth, retaddr, callee);
    h.state.on_function_entry(frame, callee, cycles_now);
    frame.frame_pointer()
}

/// Drives the matching exit; returns the real return address.
pub fn exit(h: &mut Harness, slot: usize, cycles_now: u64) -> u64 {
    h.cycles.set(cycles_now);
    h.state.on_function_exit(slot, cycles_now)
}

/// Parses every segment the collector has received, in arrival order.
pub fn parsed_segments(collector: &MemoryCollector) -> Vec<ParsedSegment> {
    collector
        .segments()
        .iter()
        .map(|image| parse_segment(image).expect("collector received a malformed segment"))
        .collect()
}

/// Flattens all invocation batches across `segments`, in emission order.
pub fn invocations_of(segments: &[ParsedSegment]) -> Vec<ParsedInvocation> {
    segments
        .iter()
        .flat_map(|segment| &segment.records)
        .filter_map(|record| match record {
            TraceRecord::InvocationBatch(batch) => Some(batch.iter().copied()),
            _ => None,
        })
        .flatten()
        .collect()
}

const ARENA_WORDS: usize = 1024;
/// Words between nesting levels; comfortably above the frame size.
const FRAME_STRIDE: usize = 16;

/// Backing store for [`EntryFrame`]s at controlled addresses. Depth 0 sits
/// highest; each deeper level is one stride lower, like real frames.
pub struct FrameArena {
    buf: Box<[u64; ARENA_WORDS]>,
}

impl FrameArena {
    pub fn new() -> Self {
        Self {
            buf: Box::new([0; ARENA_WORDS]),
        }
    }

    /// Writes a fresh frame for nesting `depth` and returns it.
    pub fn frame(&mut self, depth: usize, retaddr: u64, callee: u64) -> &mut EntryFrame {
        self.place(depth, retaddr, callee, 0, 0)
    }

    /// Like [`Self::frame`], with the two argument slots of a
    /// module-lifecycle callee filled in.
    pub fn module_frame(&mut self, depth: usize, retaddr: u64, callee: u64, module: u64, reason: u32) -> &mut EntryFrame {
        self.place(depth, retaddr, callee, module, u64::from(reason))
    }

    fn place(&mut self, depth: usize, retaddr: u64, callee: u64, arg0: u64, arg1: u64) -> &mut EntryFrame {
        let word = ARENA_WORDS - (depth + 1) * FRAME_STRIDE;
        let ptr = self.buf[word..].as_mut_ptr() as *mut EntryFrame;
        // SAFETY: the arena is u64-aligned and each stride leaves room for
        // one frame; the written value is plain old data.
        unsafe {
            ptr.write(EntryFrame {
                rflags: 0,
                r11: 0,
                r10: 0,
                r9: 0,
                r8: 0,
                rdi: arg0,
                rsi: arg1,
                rdx: 0,
                rcx: 0,
                rax: 0,
                callee,
                retaddr,
            });
            &mut *ptr
        }
    }
}

/// Lays out a minimal ET_DYN ELF image: one PT_LOAD spanning 0x5000 bytes
/// and a GNU build-id note whose leading descriptor bytes read back as
/// `0x0BADC0DE`.
pub fn synthetic_module_image() -> Vec<u8> {
    const PHDR_SIZE: usize = 56;
    let note_offset = 64 + 2 * PHDR_SIZE;
    let mut image = vec![0u8; note_offset + 64];

    image[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    image[4] = 2; // ELFCLASS64
    image[5] = 1; // little-endian
    image[0x10..0x12].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
    image[0x20..0x28].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
    image[0x36..0x38].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    image[0x38..0x3A].copy_from_slice(&2u16.to_le_bytes()); // e_phnum

    // PT_LOAD: vaddr 0, memsz 0x5000.
    let ph0 = 64;
    image[ph0..ph0 + 4].copy_from_slice(&1u32.to_le_bytes());
    image[ph0 + 0x28..ph0 + 0x30].copy_from_slice(&0x5000u64.to_le_bytes());

    // PT_NOTE at its own offset.
    let ph1 = 64 + PHDR_SIZE;
    image[ph1..ph1 + 4].copy_from_slice(&4u32.to_le_bytes());
    image[ph1 + 0x10..ph1 + 0x18].copy_from_slice(&(note_offset as u64).to_le_bytes());
    image[ph1 + 0x20..ph1 + 0x28].copy_from_slice(&32u64.to_le_bytes());

    let n = note_offset;
    image[n..n + 4].copy_from_slice(&4u32.to_le_bytes()); // namesz
    image[n + 4..n + 8].copy_from_slice(&8u32.to_le_bytes()); // descsz
    image[n + 8..n + 12].copy_from_slice(&3u32.to_le_bytes()); // NT_GNU_BUILD_ID
    image[n + 12..n + 16].copy_from_slice(b"GNU\0");
    image[n + 16..n + 24].copy_from_slice(&[0xDE, 0xC0, 0xAD, 0x0B, 1, 2, 3, 4]);

    image
}
