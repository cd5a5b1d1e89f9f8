//! Trace wire format for the muon invocation profiler.
//!
//! The agent packs typed records into fixed-capacity segments and hands full
//! segments to a collector; this crate defines the byte layout both sides
//! agree on, plus a parser for the collector side.
//!
//! Segment layout (all little-endian, records 8-byte aligned):
//!
//! ```text
//! SEGMENT HEADER (24 bytes):
//!   segment_length: u32, thread_id: u32, sequence_number: u64, reserved: u64
//!
//! RECORDS (variable, prefixed):
//!   prefix: kind:u16, reserved:u16, size:u32  -- size counts payload only
//!   Kind 0x0010 (module attached):  payload = ModuleRecord (288 bytes)
//!   Kind 0x0011 (thread attached):  payload = ModuleRecord (288 bytes)
//!   Kind 0x0020 (invocation batch): payload = 1..n InvocationRecords
//!                                   (48 bytes each), grown in place
//! ```
//!
//! `segment_length` counts every used byte including the header itself, so a
//! freshly reset segment reports 24.

pub mod parser;
pub mod records;

pub use parser::{ParsedInvocation, ParsedModule, ParsedSegment, TraceRecord, parse_segment};
pub use records::{
    INVOCATION_RECORD_SIZE, InvocationRecord, KIND_INVOCATION_BATCH, KIND_MODULE_ATTACHED,
    KIND_THREAD_ATTACHED, MODULE_NAME_MAX, MODULE_RECORD_SIZE, ModuleRecord, PREFIX_SIZE,
    REASON_PROCESS_ATTACH, REASON_PROCESS_DETACH, REASON_THREAD_ATTACH, REASON_THREAD_DETACH,
    RECORD_ALIGNMENT, RecordPrefix, SEGMENT_HEADER_SIZE, SegmentHeader, aligned_size, attach_kind,
};
