//! Record layouts and kind constants.
//!
//! Every structure here is `#[repr(C)]` and written to segments verbatim by
//! the agent, so field order and widths are wire-stable. The parser in
//! [`crate::parser`] deliberately re-reads these field by field rather than
//! transmuting, which keeps the two sides honest about the layout.

/// Records and record payloads are aligned to this many bytes.
pub const RECORD_ALIGNMENT: usize = 8;

/// Record kind: a module mapped into the process (process-attach reason).
pub const KIND_MODULE_ATTACHED: u16 = 0x0010;

/// Record kind: a module observed on a new thread (thread-attach reason).
/// Identical payload to [`KIND_MODULE_ATTACHED`].
pub const KIND_THREAD_ATTACHED: u16 = 0x0011;

/// Record kind: a batch of packed [`InvocationRecord`]s. The prefix size is
/// grown in place as records are appended to the open batch.
pub const KIND_INVOCATION_BATCH: u16 = 0x0020;

/// Module-event reason code: the process is unloading the module.
pub const REASON_PROCESS_DETACH: u32 = 0;

/// Module-event reason code: the module was just mapped into the process.
pub const REASON_PROCESS_ATTACH: u32 = 1;

/// Module-event reason code: a new thread first entered the module.
pub const REASON_THREAD_ATTACH: u32 = 2;

/// Module-event reason code: a thread is detaching from the module.
pub const REASON_THREAD_DETACH: u32 = 3;

/// Maps an attach reason to the record kind it is emitted under.
///
/// Detach reasons produce no record and return `None`, as does any reason
/// code outside the defined set.
pub const fn attach_kind(reason: u32) -> Option<u16> {
    match reason {
        REASON_PROCESS_ATTACH => Some(KIND_MODULE_ATTACHED),
        REASON_THREAD_ATTACH => Some(KIND_THREAD_ATTACHED),
        _ => None,
    }
}

/// Rounds `n` up to the next multiple of [`RECORD_ALIGNMENT`].
pub const fn aligned_size(n: usize) -> usize {
    (n + RECORD_ALIGNMENT - 1) & !(RECORD_ALIGNMENT - 1)
}

/// The fixed prefix preceding every record payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct RecordPrefix {
    /// One of the `KIND_*` constants.
    pub kind: u16,
    /// Reserved, written as zero.
    pub reserved: u16,
    /// Payload byte count, prefix excluded.
    pub size: u32,
}

/// Byte size of a [`RecordPrefix`].
pub const PREFIX_SIZE: usize = size_of::<RecordPrefix>();

/// The header written at offset 0 of every segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct SegmentHeader {
    /// Used byte count of the whole segment, this header included.
    pub segment_length: u32,
    /// OS thread id of the producing thread.
    pub thread_id: u32,
    /// Monotone per-session segment number.
    pub sequence_number: u64,
    /// Reserved, written as zero.
    pub reserved: u64,
}

/// Byte size of a [`SegmentHeader`].
pub const SEGMENT_HEADER_SIZE: usize = size_of::<SegmentHeader>();

/// Maximum stored length of a module image name, NUL padding included.
pub const MODULE_NAME_MAX: usize = 256;

/// Payload of a module-attached or thread-attached record.
///
/// Describes one mapped image so the collector can resolve the code
/// addresses that later invocation records carry. Metadata that the image
/// format does not provide is written as zero.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct ModuleRecord {
    /// Load address of the image.
    pub base_address: u64,
    /// Span of the image's loadable segments in memory.
    pub image_size: u64,
    /// Leading 4 bytes of the image's build id, or zero.
    pub checksum: u32,
    /// Link timestamp where the image format carries one, else zero.
    pub time_date_stamp: u32,
    /// The `REASON_*` code that triggered the record.
    pub reason: u32,
    /// Reserved, written as zero.
    pub reserved: u32,
    /// NUL-padded UTF-8 image path; empty when unresolved.
    pub image_name: [u8; MODULE_NAME_MAX],
}

/// Byte size of a [`ModuleRecord`].
pub const MODULE_RECORD_SIZE: usize = size_of::<ModuleRecord>();

impl ModuleRecord {
    /// A record for `base_address` and `reason` with all metadata zeroed,
    /// the shape emitted when the image cannot be inspected.
    pub fn zeroed(base_address: u64, reason: u32) -> Self {
        Self {
            base_address,
            image_size: 0,
            checksum: 0,
            time_date_stamp: 0,
            reason,
            reserved: 0,
            image_name: [0; MODULE_NAME_MAX],
        }
    }

    /// Stores `name` truncated to [`MODULE_NAME_MAX`] bytes, NUL-padded.
    pub fn set_name(&mut self, name: &str) {
        self.image_name = [0; MODULE_NAME_MAX];
        let bytes = name.as_bytes();
        let len = bytes.len().min(MODULE_NAME_MAX);
        self.image_name[..len].copy_from_slice(&bytes[..len]);
    }
}

/// One aggregated (caller, callee) entry inside an invocation batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct InvocationRecord {
    /// Return address of the call site.
    pub caller: u64,
    /// Entry address of the called function.
    pub callee: u64,
    /// Observations folded into this record; at least 1 once written.
    pub num_calls: u32,
    /// Reserved, written as zero.
    pub reserved: u32,
    /// Total cycles across all observations, overhead-adjusted.
    pub cycles_sum: u64,
    /// Cheapest single observation.
    pub cycles_min: u64,
    /// Costliest single observation.
    pub cycles_max: u64,
}

/// Byte size of an [`InvocationRecord`].
pub const INVOCATION_RECORD_SIZE: usize = size_of::<InvocationRecord>();

// Wire widths the other side depends on.
const _: () = assert!(PREFIX_SIZE == 8);
const _: () = assert!(SEGMENT_HEADER_SIZE == 24);
const _: () = assert!(MODULE_RECORD_SIZE == 288);
const _: () = assert!(INVOCATION_RECORD_SIZE == 48);
const _: () = assert!(align_of::<SegmentHeader>() == RECORD_ALIGNMENT);
const _: () = assert!(INVOCATION_RECORD_SIZE % RECORD_ALIGNMENT == 0);
const _: () = assert!(MODULE_RECORD_SIZE % RECORD_ALIGNMENT == 0);
