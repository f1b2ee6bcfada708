//! Frame scanner
//!
//! Finds report frames in a chunk of the sensor stream and rewrites the
//! location they carry. Work is split in two passes:
//!
//! 1. `scan` walks the untouched input, validates each candidate record and
//!    collects one `Edit` per rewritten record (input range + replacement).
//! 2. `splice` assembles the output by copying the gaps between edits and
//!    substituting the replacements.
//!
//! All offsets come from the original input, so a record that grows or shrinks
//! never shifts the position of a later one mid-pass.
//!
//! Markers are plain byte strings and can occur inside unrelated payload data.
//! The checksum (v1) and the protobuf decode are the only filters against such
//! false positives, and neither is guaranteed to reject all of them.

use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{
    decode_wrapper_for, kismet_adler32, relocate_report, rewrap, CodecError, GpsFix, ReportKind,
    MARKER_LEN, V2_COMMAND_LEN, V2_TAG,
};

/// Distance from the marker back to the v2 sentinel/version tag
const V2_TAG_BEFORE: usize = 8;
/// Distance from the marker back to the v2 length field
const V2_LENGTH_BEFORE: usize = 4;
/// Distance from the marker to the v2 payload (command field + seqno)
const V2_PAYLOAD_AFTER: usize = V2_COMMAND_LEN + 4;

/// Distance from the marker back to the v1 checksum field
const V1_CHECKSUM_BEFORE: usize = 10;
/// Distance from the marker back to the v1 length field
const V1_LENGTH_BEFORE: usize = 6;
/// The v1 payload starts with the envelope's string tag and length byte
const V1_PAYLOAD_BEFORE: usize = 2;

/// Reasons a candidate record is passed through untouched
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Header would start before offset {floor}")]
    OutOfBounds { floor: usize },

    #[error("Truncated record: payload ends at {end}, chunk holds {available} bytes")]
    Truncated { end: usize, available: usize },

    #[error("Checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Rewritten payload too large: {0} bytes")]
    Oversize(usize),
}

/// Frame protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameVersion {
    /// Checksummed frame with a protobuf `Command` envelope
    V1,
    /// Tagged frame with a fixed-width command field and a raw payload
    V2,
}

impl FrameVersion {
    /// Classify the record around `marker` by its version tag
    pub fn classify(buf: &[u8], marker: usize) -> Self {
        match marker.checked_sub(V2_TAG_BEFORE) {
            Some(start) if buf[start..start + V2_TAG.len()] == V2_TAG => FrameVersion::V2,
            _ => FrameVersion::V1,
        }
    }

    /// Absolute field positions for a record whose marker sits at `marker`
    fn layout(self, marker: usize) -> Option<FrameLayout> {
        let layout = match self {
            FrameVersion::V1 => FrameLayout {
                version: self,
                checksum_at: Some(marker.checked_sub(V1_CHECKSUM_BEFORE)?),
                length_at: marker.checked_sub(V1_LENGTH_BEFORE)?,
                payload_start: marker.checked_sub(V1_PAYLOAD_BEFORE)?,
            },
            FrameVersion::V2 => FrameLayout {
                version: self,
                checksum_at: None,
                length_at: marker.checked_sub(V2_LENGTH_BEFORE)?,
                payload_start: marker + V2_PAYLOAD_AFTER,
            },
        };
        Some(layout)
    }
}

impl std::fmt::Display for FrameVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameVersion::V1 => f.write_str("v1"),
            FrameVersion::V2 => f.write_str("v2"),
        }
    }
}

/// Field positions of one record within the scanned input
#[derive(Debug, Clone, Copy)]
struct FrameLayout {
    version: FrameVersion,
    checksum_at: Option<usize>,
    length_at: usize,
    payload_start: usize,
}

impl FrameLayout {
    /// First byte an edit of this record replaces
    fn rewrite_start(&self) -> usize {
        self.checksum_at.unwrap_or(self.length_at)
    }
}

/// A record located and validated in the input
#[derive(Debug, Clone)]
struct Record {
    kind: ReportKind,
    layout: FrameLayout,
    payload: Range<usize>,
}

/// One substitution in the output: `range` of the input becomes `replacement`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub range: Range<usize>,
    pub replacement: Vec<u8>,
}

/// Per-chunk scan statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    /// Marker matches, validated or not
    pub markers: usize,
    /// Records that passed framing and checksum validation
    pub validated: usize,
    /// Records whose location was rewritten
    pub rewritten: usize,
    /// Candidates passed through untouched
    pub skipped: usize,
}

/// Rewrite every report in `input` to carry `fix`.
///
/// With no fix, records are validated and counted but left as they are.
pub fn rewrite_buffer(input: Bytes, fix: Option<&GpsFix>) -> (Bytes, ScanReport) {
    let (edits, report) = scan(&input, fix);
    if edits.is_empty() {
        return (input, report);
    }
    (splice(&input, &edits), report)
}

/// First pass: locate records and compute their replacements
pub fn scan(input: &[u8], fix: Option<&GpsFix>) -> (Vec<Edit>, ScanReport) {
    let mut edits = Vec::new();
    let mut report = ScanReport::default();

    // Nothing before `floor` may be touched again
    let mut floor = 0;
    let mut pos = 0;

    while pos + MARKER_LEN <= input.len() {
        let Some(kind) = ReportKind::from_marker(&input[pos..pos + MARKER_LEN]) else {
            pos += 1;
            continue;
        };
        report.markers += 1;

        let record = match locate(input, pos, kind, floor) {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!("Skipping {} candidate at offset {}: {}", kind, pos, e);
                report.skipped += 1;
                pos += 1;
                continue;
            }
        };
        report.validated += 1;

        let Some(fix) = fix else {
            tracing::debug!(
                "No GPS fix, leaving {} {} record at offset {} unchanged",
                record.layout.version,
                kind,
                pos
            );
            floor = record.payload.end;
            pos = record.payload.end;
            continue;
        };

        match rewrite_record(input, &record, fix) {
            Ok(edit) => {
                tracing::debug!(
                    "Rewrote {} {} record at offset {} ({} -> {} bytes)",
                    record.layout.version,
                    kind,
                    pos,
                    edit.range.len(),
                    edit.replacement.len()
                );
                report.rewritten += 1;
                floor = edit.range.end;
                pos = edit.range.end;
                edits.push(edit);
            }
            Err(e) => {
                tracing::warn!(
                    "Passing {} {} record at offset {} through unmodified: {}",
                    record.layout.version,
                    kind,
                    pos,
                    e
                );
                report.skipped += 1;
                pos += 1;
            }
        }
    }

    (edits, report)
}

/// Second pass: build the output from the input and its edits.
///
/// Edits must be sorted and non-overlapping, which `scan` guarantees.
pub fn splice(input: &[u8], edits: &[Edit]) -> Bytes {
    let replaced: usize = edits.iter().map(|e| e.range.len()).sum();
    let inserted: usize = edits.iter().map(|e| e.replacement.len()).sum();
    let mut out = BytesMut::with_capacity(input.len() - replaced + inserted);

    let mut cursor = 0;
    for edit in edits {
        out.put_slice(&input[cursor..edit.range.start]);
        out.put_slice(&edit.replacement);
        cursor = edit.range.end;
    }
    out.put_slice(&input[cursor..]);

    out.freeze()
}

/// Resolve the framing around a marker and validate it
fn locate(input: &[u8], marker: usize, kind: ReportKind, floor: usize) -> Result<Record, FrameError> {
    let version = FrameVersion::classify(input, marker);
    let layout = version
        .layout(marker)
        .ok_or(FrameError::OutOfBounds { floor })?;

    if layout.rewrite_start() < floor {
        return Err(FrameError::OutOfBounds { floor });
    }

    let length = read_u32(input, layout.length_at) as usize;
    let end = layout.payload_start.saturating_add(length);
    if end > input.len() {
        return Err(FrameError::Truncated {
            end,
            available: input.len(),
        });
    }
    let payload = layout.payload_start..end;

    if let Some(checksum_at) = layout.checksum_at {
        let stored = read_u32(input, checksum_at);
        let computed = kismet_adler32(&input[payload.clone()]);
        if stored != computed {
            return Err(FrameError::ChecksumMismatch { stored, computed });
        }
    }

    Ok(Record {
        kind,
        layout,
        payload,
    })
}

/// Decode, relocate and re-encode one record
fn rewrite_record(input: &[u8], record: &Record, fix: &GpsFix) -> Result<Edit, FrameError> {
    let payload = &input[record.payload.clone()];
    let layout = &record.layout;

    let new_payload = match layout.version {
        FrameVersion::V1 => {
            let command = decode_wrapper_for(record.kind, payload)?;
            let content = relocate_report(record.kind, &command.content, fix)?;
            rewrap(payload, &content)?
        }
        FrameVersion::V2 => relocate_report(record.kind, payload, fix)?,
    };

    let length = u32::try_from(new_payload.len())
        .map_err(|_| FrameError::Oversize(new_payload.len()))?;

    let start = layout.rewrite_start();
    let mut replacement = Vec::with_capacity(record.payload.start - start + new_payload.len());
    if layout.checksum_at.is_some() {
        replacement.extend_from_slice(&kismet_adler32(&new_payload).to_be_bytes());
    }
    replacement.extend_from_slice(&length.to_be_bytes());
    // v2 keeps its command field and sequence number
    replacement.extend_from_slice(&input[layout.length_at + 4..record.payload.start]);
    replacement.extend_from_slice(&new_payload);

    Ok(Edit {
        range: start..record.payload.end,
        replacement,
    })
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::{
        decode_v1, origin_report, read_v1, v1_frame, v2_frame, v2_frame_raw, FRAME_SIGNATURE,
    };
    use crate::protocol::{
        decode_content, decode_wrapper, encode, LinuxBluetoothDataReport, Report, SubPacket,
    };

    /// Field 20, varint 42: declared by none of the schemas
    const UNKNOWN_FIELD: [u8; 3] = [0xa0, 0x01, 0x2a];

    const FIX: GpsFix = GpsFix {
        lat: 12.34,
        lon: 56.78,
        alt: 9.0,
    };

    #[test]
    fn test_no_markers_is_identity() {
        let input = Bytes::from_static(b"\xde\xca\xfb\xad some unrelated KDSCONFIGURE traffic");
        let (out, report) = rewrite_buffer(input.clone(), Some(&FIX));
        assert_eq!(out, input);
        assert_eq!(report, ScanReport::default());
    }

    #[test]
    fn test_v1_end_to_end_rewrite() {
        let mut input = b"prefix".to_vec();
        input.extend(v1_frame(&origin_report(), 9));
        input.extend_from_slice(b"suffix");

        let (out, report) = rewrite_buffer(Bytes::from(input), Some(&FIX));
        assert_eq!(report.rewritten, 1);
        assert!(out.starts_with(b"prefix"));
        assert!(out.ends_with(b"suffix"));
        assert_eq!(&out[6..10], &FRAME_SIGNATURE);

        let (checksum, payload) = read_v1(&out, 6);
        assert_eq!(checksum, kismet_adler32(&payload));
        assert_eq!(12 + 6 + payload.len() + 6, out.len());

        let decoded = decode_v1(ReportKind::Generic, &payload);
        assert_eq!(decoded.fix(), Some(FIX));
        assert_eq!(decode_wrapper(&payload).unwrap().seqno, 9);
    }

    #[test]
    fn test_v1_bad_checksum_left_untouched() {
        let mut frame = v1_frame(&origin_report(), 1);
        frame[4] ^= 0xff;

        let input = Bytes::from(frame);
        let (out, report) = rewrite_buffer(input.clone(), Some(&FIX));
        assert_eq!(out, input);
        assert_eq!(report.markers, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.rewritten, 0);
    }

    #[test]
    fn test_v2_rewrite_updates_length_and_keeps_header() {
        let frame = v2_frame(&origin_report(), 0x0102_0304);
        let (out, report) = rewrite_buffer(Bytes::from(frame.clone()), Some(&FIX));
        assert_eq!(report.rewritten, 1);

        // Everything up to the payload, except the length, is unchanged
        assert_eq!(&out[..8], &frame[..8]);
        assert_eq!(&out[12..12 + V2_PAYLOAD_AFTER], &frame[12..12 + V2_PAYLOAD_AFTER]);

        let length = read_u32(&out, 8) as usize;
        let payload_start = 12 + V2_PAYLOAD_AFTER;
        assert_eq!(payload_start + length, out.len());

        let decoded = decode_content(ReportKind::Generic, &out[payload_start..]).unwrap();
        assert_eq!(decoded.fix(), Some(FIX));
    }

    #[test]
    fn test_v2_rewrite_keeps_undeclared_fields() {
        let mut payload = encode(&origin_report());
        payload.extend_from_slice(&UNKNOWN_FIELD);
        let frame = v2_frame_raw(ReportKind::Generic, &payload, 1);

        let (out, report) = rewrite_buffer(Bytes::from(frame), Some(&FIX));
        assert_eq!(report.rewritten, 1);

        let payload_start = 12 + V2_PAYLOAD_AFTER;
        assert_eq!(payload_start + read_u32(&out, 8) as usize, out.len());
        assert!(out.ends_with(&UNKNOWN_FIELD));
        let decoded = decode_content(ReportKind::Generic, &out[payload_start..]).unwrap();
        assert_eq!(decoded.fix(), Some(FIX));
    }

    #[test]
    fn test_v1_rewrite_keeps_undeclared_fields() {
        let mut content = encode(&origin_report());
        content.extend_from_slice(&UNKNOWN_FIELD);
        let mut envelope = crate::protocol::encode_wrapper(&crate::protocol::Command {
            command: ReportKind::Generic.name().to_string(),
            seqno: 6,
            content,
        });
        envelope.extend_from_slice(&UNKNOWN_FIELD);

        let mut frame = FRAME_SIGNATURE.to_vec();
        frame.extend_from_slice(&kismet_adler32(&envelope).to_be_bytes());
        frame.extend_from_slice(&(envelope.len() as u32).to_be_bytes());
        frame.extend_from_slice(&envelope);

        let (out, report) = rewrite_buffer(Bytes::from(frame), Some(&FIX));
        assert_eq!(report.rewritten, 1);

        let (checksum, payload) = read_v1(&out, 0);
        assert_eq!(checksum, kismet_adler32(&payload));
        assert!(payload.ends_with(&UNKNOWN_FIELD));

        let command = decode_wrapper(&payload).unwrap();
        assert_eq!(command.seqno, 6);
        assert!(command.content.ends_with(&UNKNOWN_FIELD));
        assert_eq!(decode_v1(ReportKind::Generic, &payload).fix(), Some(FIX));
    }

    #[test]
    fn test_growing_record_does_not_break_following_one() {
        // No GPS record: the rewrite inserts one, so the first frame grows
        let bare = Report::Bluetooth(LinuxBluetoothDataReport::default());
        let first = v1_frame(&bare, 1);
        let second = v1_frame(&origin_report(), 2);

        let mut input = first.clone();
        input.extend_from_slice(&second);

        let (out, report) = rewrite_buffer(Bytes::from(input), Some(&FIX));
        assert_eq!(report.rewritten, 2);

        let (checksum, payload) = read_v1(&out, 0);
        assert_eq!(checksum, kismet_adler32(&payload));
        assert!(payload.len() > first.len() - 12);
        assert_eq!(decode_v1(ReportKind::Bluetooth, &payload).fix(), Some(FIX));

        let next = 12 + payload.len();
        assert_eq!(&out[next..next + 4], &FRAME_SIGNATURE);
        let (checksum, payload) = read_v1(&out, next);
        assert_eq!(checksum, kismet_adler32(&payload));
        assert_eq!(decode_v1(ReportKind::Generic, &payload).fix(), Some(FIX));
        assert_eq!(next + 12 + payload.len(), out.len());
    }

    #[test]
    fn test_mixed_versions_in_one_chunk() {
        let mut input = v2_frame(&origin_report(), 1);
        input.extend(v1_frame(&origin_report(), 2));

        let (_, report) = rewrite_buffer(Bytes::from(input), Some(&FIX));
        assert_eq!(report.markers, 2);
        assert_eq!(report.rewritten, 2);
    }

    #[test]
    fn test_no_fix_leaves_records_alone() {
        let input = Bytes::from(v1_frame(&origin_report(), 3));
        let (out, report) = rewrite_buffer(input.clone(), None);
        assert_eq!(out, input);
        assert_eq!(report.validated, 1);
        assert_eq!(report.rewritten, 0);
    }

    #[test]
    fn test_marker_too_close_to_start() {
        let input = Bytes::from_static(b"\x00\x00KDSDATAREPORT\x00\x00\x00\x00");
        let (out, report) = rewrite_buffer(input.clone(), Some(&FIX));
        assert_eq!(out, input);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_truncated_record_passes_through() {
        let mut frame = v1_frame(&origin_report(), 4);
        frame.truncate(frame.len() - 5);

        let input = Bytes::from(frame);
        let (out, report) = rewrite_buffer(input.clone(), Some(&FIX));
        assert_eq!(out, input);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_v2_garbage_payload_passes_through() {
        let frame = v2_frame_raw(ReportKind::Generic, &[0x0a, 0x7f, 0x01], 0);
        let input = Bytes::from(frame);
        let (out, report) = rewrite_buffer(input.clone(), Some(&FIX));
        assert_eq!(out, input);
        assert_eq!(report.validated, 1);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_marker_inside_payload_not_rescanned() {
        let mut report = origin_report();
        if let Report::Generic(r) = &mut report {
            let mut data = vec![0u8; 16];
            data.extend_from_slice(b"LBTDATAREPORT");
            r.packet = Some(SubPacket {
                time_sec: 1,
                time_usec: 2,
                dlt: 1,
                size: data.len() as u64,
                data,
            });
        }

        let (_, scan_report) = rewrite_buffer(Bytes::from(v1_frame(&report, 5)), Some(&FIX));
        assert_eq!(scan_report.markers, 1);
        assert_eq!(scan_report.rewritten, 1);
    }

    #[test]
    fn test_classify() {
        let v2 = v2_frame(&origin_report(), 0);
        assert_eq!(FrameVersion::classify(&v2, 12), FrameVersion::V2);

        let v1 = v1_frame(&origin_report(), 0);
        assert_eq!(FrameVersion::classify(&v1, 14), FrameVersion::V1);
        assert_eq!(FrameVersion::classify(&v1, 3), FrameVersion::V1);
    }

    #[test]
    fn test_splice_without_edits_copies() {
        let out = splice(b"abcdef", &[]);
        assert_eq!(&out[..], b"abcdef");

        let out = splice(
            b"abcdef",
            &[
                Edit { range: 1..2, replacement: b"XYZ".to_vec() },
                Edit { range: 4..6, replacement: Vec::new() },
            ],
        );
        assert_eq!(&out[..], b"aXYZcd");
    }
}
