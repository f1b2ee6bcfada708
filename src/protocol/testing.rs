//! Frame builders shared by tests

use super::*;

/// Signature that opens every Kismet external frame; the scanner never reads it
pub(crate) const FRAME_SIGNATURE: [u8; 4] = [0xDE, 0xCA, 0xFB, 0xAD];

/// A generic report sitting at null island
pub(crate) fn origin_report() -> Report {
    Report::Generic(DataReport {
        gps: Some(SubGps {
            lat: 0.0,
            lon: 0.0,
            alt: 0.0,
            fix: 3.0,
            ..Default::default()
        }),
        packet: Some(SubPacket {
            time_sec: 1_700_000_000,
            time_usec: 5,
            dlt: 127,
            size: 3,
            data: vec![1, 2, 3],
        }),
        ..Default::default()
    })
}

/// Checksummed frame with a `Command` envelope
pub(crate) fn v1_frame(report: &Report, seqno: u32) -> Vec<u8> {
    let payload = encode_wrapper(&Command {
        command: report.kind().name().to_string(),
        seqno,
        content: encode(report),
    });
    let mut frame = FRAME_SIGNATURE.to_vec();
    frame.extend_from_slice(&kismet_adler32(&payload).to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    frame
}

/// Tagged frame with a raw payload
pub(crate) fn v2_frame(report: &Report, seqno: u32) -> Vec<u8> {
    v2_frame_raw(report.kind(), &encode(report), seqno)
}

pub(crate) fn v2_frame_raw(kind: ReportKind, payload: &[u8], seqno: u32) -> Vec<u8> {
    let mut frame = FRAME_SIGNATURE.to_vec();
    frame.extend_from_slice(&V2_TAG);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    let mut command = [0u8; V2_COMMAND_LEN];
    command[..MARKER_LEN].copy_from_slice(kind.marker());
    frame.extend_from_slice(&command);
    frame.extend_from_slice(&seqno.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Checksum field and payload of the v1 frame starting at `start`
pub(crate) fn read_v1(out: &[u8], start: usize) -> (u32, Vec<u8>) {
    let field = |at: usize| u32::from_be_bytes([out[at], out[at + 1], out[at + 2], out[at + 3]]);
    let checksum = field(start + 4);
    let length = field(start + 8) as usize;
    (checksum, out[start + 12..start + 12 + length].to_vec())
}

/// Decode a v1 payload down to its report
pub(crate) fn decode_v1(kind: ReportKind, payload: &[u8]) -> Report {
    let command = decode_wrapper(payload).unwrap();
    decode_content(kind, &command.content).unwrap()
}
