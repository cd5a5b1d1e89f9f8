//! Segment deserialization for the collector side.
//!
//! Decodes one segment byte image back into its header and typed records.
//! Unknown record kinds are preserved as opaque entries and skipped over
//! using their size prefix, so the stream stays parseable across kind
//! additions.

use anyhow::{Result, bail};

use crate::records::{
    INVOCATION_RECORD_SIZE, KIND_INVOCATION_BATCH, KIND_MODULE_ATTACHED, KIND_THREAD_ATTACHED,
    MODULE_NAME_MAX, MODULE_RECORD_SIZE, PREFIX_SIZE, SEGMENT_HEADER_SIZE, aligned_size,
};

/// A parsed segment: header fields plus records in emission order.
#[derive(Debug)]
pub struct ParsedSegment {
    /// Used byte count the producer recorded, header included.
    pub segment_length: u32,
    /// OS thread id of the producing thread.
    pub thread_id: u32,
    /// Monotone per-session segment number.
    pub sequence_number: u64,
    /// Records in the order they were emitted.
    pub records: Vec<TraceRecord>,
}

/// One decoded record.
#[derive(Debug)]
pub enum TraceRecord {
    /// A module description (module-attached or thread-attached kind).
    Module(ParsedModule),
    /// A batch of aggregated invocation statistics.
    InvocationBatch(Vec<ParsedInvocation>),
    /// A record kind this parser does not understand; payload skipped.
    Unknown {
        /// The unrecognized kind value.
        kind: u16,
        /// Its declared payload size.
        size: u32,
    },
}

/// Decoded module record with the image name unpacked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedModule {
    /// Record kind the module arrived under.
    pub kind: u16,
    /// Load address of the image.
    pub base_address: u64,
    /// Span of the image's loadable segments.
    pub image_size: u64,
    /// Leading build-id bytes, or zero.
    pub checksum: u32,
    /// Link timestamp, or zero.
    pub time_date_stamp: u32,
    /// The reason code that triggered the record.
    pub reason: u32,
    /// Image path, empty when the producer could not resolve it.
    pub image_name: String,
}

/// Decoded invocation statistics for one (caller, callee) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInvocation {
    /// Return address of the call site.
    pub caller: u64,
    /// Entry address of the called function.
    pub callee: u64,
    /// Observations folded into the record.
    pub num_calls: u32,
    /// Total overhead-adjusted cycles.
    pub cycles_sum: u64,
    /// Cheapest single observation.
    pub cycles_min: u64,
    /// Costliest single observation.
    pub cycles_max: u64,
}

/// Parses one segment image as produced by the agent.
///
/// Records past `segment_length` are ignored; a header or record that
/// overruns the data is an error, as is a malformed batch size.
pub fn parse_segment(data: &[u8]) -> Result<ParsedSegment> {
    if data.len() < SEGMENT_HEADER_SIZE {
        bail!("segment truncated: {} bytes, header needs {}", data.len(), SEGMENT_HEADER_SIZE);
    }

    let mut pos = 0;
    let segment_length = read_u32(data, &mut pos);
    let thread_id = read_u32(data, &mut pos);
    let sequence_number = read_u64(data, &mut pos);
    let _reserved = read_u64(data, &mut pos);

    let used = segment_length as usize;
    if used < SEGMENT_HEADER_SIZE || used > data.len() {
        bail!("segment_length {used} out of range for {} data bytes", data.len());
    }

    let mut records = Vec::new();
    while pos + PREFIX_SIZE <= used {
        let kind = read_u16(data, &mut pos);
        let _reserved = read_u16(data, &mut pos);
        let size = read_u32(data, &mut pos);

        let payload_end = pos + size as usize;
        if payload_end > used {
            bail!("record kind {kind:#06x} payload overruns segment ({size} bytes at {pos})");
        }

        match kind {
            KIND_MODULE_ATTACHED | KIND_THREAD_ATTACHED => {
                if (size as usize) != MODULE_RECORD_SIZE {
                    bail!("module record payload is {size} bytes, expected {MODULE_RECORD_SIZE}");
                }
                records.push(TraceRecord::Module(parse_module(kind, data, &mut pos)));
            }
            KIND_INVOCATION_BATCH => {
                if size == 0 || (size as usize) % INVOCATION_RECORD_SIZE != 0 {
                    bail!("invocation batch payload {size} is not a positive record multiple");
                }
                let count = size as usize / INVOCATION_RECORD_SIZE;
                let mut batch = Vec::with_capacity(count);
                for _ in 0..count {
                    batch.push(parse_invocation(data, &mut pos));
                }
                records.push(TraceRecord::InvocationBatch(batch));
            }
            _ => {
                pos = payload_end;
                records.push(TraceRecord::Unknown { kind, size });
            }
        }

        // Payloads are emitted 8-aligned; skip any padding the producer added.
        pos = SEGMENT_HEADER_SIZE + aligned_size(pos - SEGMENT_HEADER_SIZE);
    }

    Ok(ParsedSegment {
        segment_length,
        thread_id,
        sequence_number,
        records,
    })
}

fn parse_module(kind: u16, data: &[u8], pos: &mut usize) -> ParsedModule {
    let base_address = read_u64(data, pos);
    let image_size = read_u64(data, pos);
    let checksum = read_u32(data, pos);
    let time_date_stamp = read_u32(data, pos);
    let reason = read_u32(data, pos);
    let _reserved = read_u32(data, pos);

    let name_bytes = &data[*pos..*pos + MODULE_NAME_MAX];
    *pos += MODULE_NAME_MAX;
    let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(MODULE_NAME_MAX);
    let image_name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();

    ParsedModule {
        kind,
        base_address,
        image_size,
        checksum,
        time_date_stamp,
        reason,
        image_name,
    }
}

fn parse_invocation(data: &[u8], pos: &mut usize) -> ParsedInvocation {
    let caller = read_u64(data, pos);
    let callee = read_u64(data, pos);
    let num_calls = read_u32(data, pos);
    let _reserved = read_u32(data, pos);
    let cycles_sum = read_u64(data, pos);
    let cycles_min = read_u64(data, pos);
    let cycles_max = read_u64(data, pos);

    ParsedInvocation {
        caller,
        callee,
        num_calls,
        cycles_sum,
        cycles_min,
        cycles_max,
    }
}

fn read_u16(data: &[u8], pos: &mut usize) -> u16 {
    let val = u16::from_le_bytes([data[*pos], data[*pos + 1]]);
    *pos += 2;
    val
}

fn read_u32(data: &[u8], pos: &mut usize) -> u32 {
    let val = u32::from_le_bytes([data[*pos], data[*pos + 1], data[*pos + 2], data[*pos + 3]]);
    *pos += 4;
    val
}

fn read_u64(data: &[u8], pos: &mut usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[*pos..*pos + 8]);
    *pos += 8;
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{REASON_PROCESS_ATTACH, REASON_THREAD_ATTACH};

    /// Builds a segment image by hand: header, then each (kind, payload).
    fn build_segment(thread_id: u32, sequence: u64, records: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (kind, payload) in records {
            body.extend_from_slice(&kind.to_le_bytes());
            body.extend_from_slice(&0u16.to_le_bytes());
            body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            body.extend_from_slice(payload);
            while body.len() % 8 != 0 {
                body.push(0);
            }
        }

        let mut data = Vec::new();
        let total = (SEGMENT_HEADER_SIZE + body.len()) as u32;
        data.extend_from_slice(&total.to_le_bytes());
        data.extend_from_slice(&thread_id.to_le_bytes());
        data.extend_from_slice(&sequence.to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());
        data.extend_from_slice(&body);
        data
    }

    fn module_payload(base: u64, reason: u32, name: &str) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&base.to_le_bytes());
        payload.extend_from_slice(&0x4000u64.to_le_bytes()); // image_size
        payload.extend_from_slice(&0xAABBCCDDu32.to_le_bytes()); // checksum
        payload.extend_from_slice(&0u32.to_le_bytes()); // time_date_stamp
        payload.extend_from_slice(&reason.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes()); // reserved
        let mut name_bytes = [0u8; MODULE_NAME_MAX];
        name_bytes[..name.len()].copy_from_slice(name.as_bytes());
        payload.extend_from_slice(&name_bytes);
        payload
    }

    fn invocation_payload(entries: &[(u64, u64, u32, u64, u64, u64)]) -> Vec<u8> {
        let mut payload = Vec::new();
        for &(caller, callee, num_calls, sum, min, max) in entries {
            payload.extend_from_slice(&caller.to_le_bytes());
            payload.extend_from_slice(&callee.to_le_bytes());
            payload.extend_from_slice(&num_calls.to_le_bytes());
            payload.extend_from_slice(&0u32.to_le_bytes());
            payload.extend_from_slice(&sum.to_le_bytes());
            payload.extend_from_slice(&min.to_le_bytes());
            payload.extend_from_slice(&max.to_le_bytes());
        }
        payload
    }

    #[test]
    fn parse_header_only_segment() {
        let data = build_segment(41, 7, &[]);
        let parsed = parse_segment(&data).unwrap();
        assert_eq!(parsed.segment_length as usize, SEGMENT_HEADER_SIZE);
        assert_eq!(parsed.thread_id, 41);
        assert_eq!(parsed.sequence_number, 7);
        assert!(parsed.records.is_empty());
    }

    #[test]
    fn parse_module_then_batch() {
        let data = build_segment(
            3,
            0,
            &[
                (
                    KIND_MODULE_ATTACHED,
                    module_payload(0x7F0000000000, REASON_PROCESS_ATTACH, "/lib/libm.so"),
                ),
                (
                    KIND_INVOCATION_BATCH,
                    invocation_payload(&[
                        (0x7F0000001000, 0x7F0000002000, 3, 45, 10, 20),
                        (0x7F0000001100, 0x7F0000002200, 1, 5, 5, 5),
                    ]),
                ),
            ],
        );

        let parsed = parse_segment(&data).unwrap();
        assert_eq!(parsed.records.len(), 2);

        let TraceRecord::Module(module) = &parsed.records[0] else {
            panic!("expected module record first");
        };
        assert_eq!(module.kind, KIND_MODULE_ATTACHED);
        assert_eq!(module.base_address, 0x7F0000000000);
        assert_eq!(module.image_name, "/lib/libm.so");

        let TraceRecord::InvocationBatch(batch) = &parsed.records[1] else {
            panic!("expected invocation batch second");
        };
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].num_calls, 3);
        assert_eq!(batch[0].cycles_sum, 45);
        assert_eq!(batch[1].cycles_min, 5);
    }

    #[test]
    fn thread_attach_kind_round_trips() {
        let data = build_segment(
            9,
            1,
            &[(KIND_THREAD_ATTACHED, module_payload(0x1000, REASON_THREAD_ATTACH, ""))],
        );
        let parsed = parse_segment(&data).unwrap();
        let TraceRecord::Module(module) = &parsed.records[0] else {
            panic!("expected module record");
        };
        assert_eq!(module.kind, KIND_THREAD_ATTACHED);
        assert_eq!(module.reason, REASON_THREAD_ATTACH);
        assert!(module.image_name.is_empty());
    }

    #[test]
    fn unknown_kind_is_skipped_not_fatal() {
        let data = build_segment(
            1,
            0,
            &[
                (0x7777, vec![1, 2, 3, 4, 5]),
                (
                    KIND_INVOCATION_BATCH,
                    invocation_payload(&[(0xA, 0xB, 1, 9, 9, 9)]),
                ),
            ],
        );
        let parsed = parse_segment(&data).unwrap();
        assert!(matches!(
            parsed.records[0],
            TraceRecord::Unknown { kind: 0x7777, size: 5 }
        ));
        assert!(matches!(&parsed.records[1], TraceRecord::InvocationBatch(b) if b.len() == 1));
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert!(parse_segment(&[0u8; 10]).is_err());
    }

    #[test]
    fn overrunning_record_is_rejected() {
        let mut data = build_segment(1, 0, &[]);
        // Claim a batch larger than the remaining bytes.
        data.extend_from_slice(&KIND_INVOCATION_BATCH.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&96u32.to_le_bytes());
        let total = data.len() as u32;
        data[0..4].copy_from_slice(&total.to_le_bytes());
        assert!(parse_segment(&data).is_err());
    }

    #[test]
    fn misaligned_batch_size_is_rejected() {
        let data = build_segment(1, 0, &[(KIND_INVOCATION_BATCH, vec![0u8; 40])]);
        assert!(parse_segment(&data).is_err());
    }
}
