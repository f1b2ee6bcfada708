//! Report codec
//!
//! Decodes and re-encodes the structured payloads found inside Kismet frames,
//! and applies a location overwrite to them.
//!
//! Rewrites work on the encoded bytes: only the GPS record (or the envelope's
//! content) is re-serialized, and every other field is copied as it arrived,
//! including fields these schemas do not declare.

use prost::encoding::{decode_key, decode_varint, encode_key, encode_varint, skip_field, DecodeContext, WireType};
use prost::Message;
use thiserror::Error;

use super::{Command, DataReport, GpsFix, LinuxBluetoothDataReport, Report, ReportKind, SubGps};

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Envelope command mismatch: expected {expected}, found {found:?}")]
    CommandMismatch {
        expected: ReportKind,
        found: String,
    },
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Field number of `content` in the v1 envelope
const CONTENT_TAG: u32 = 3;
/// Field number of the GPS record in both report schemas
const GPS_TAG: u32 = 2;
/// Highest field number declared by `SubGps`
const SUB_GPS_LAST_TAG: u32 = 11;

/// One encoded field, borrowed from its message
#[derive(Debug, Clone, Copy)]
struct RawField<'a> {
    tag: u32,
    wire_type: WireType,
    /// Key and value
    raw: &'a [u8],
    /// Value only
    value: &'a [u8],
}

impl<'a> RawField<'a> {
    fn is_message(&self, tag: u32) -> bool {
        self.tag == tag && self.wire_type == WireType::LengthDelimited
    }

    /// Bytes of a length-delimited value, without its length prefix
    fn body(&self) -> CodecResult<&'a [u8]> {
        let mut value = self.value;
        decode_varint(&mut value)?;
        Ok(value)
    }
}

/// Split an encoded message into its top-level fields, in wire order
fn split_fields(msg: &[u8]) -> CodecResult<Vec<RawField<'_>>> {
    let mut fields = Vec::new();
    let mut buf = msg;

    while !buf.is_empty() {
        let start = msg.len() - buf.len();
        let (tag, wire_type) = decode_key(&mut buf)?;
        let value_start = msg.len() - buf.len();
        skip_field(wire_type, tag, &mut buf, DecodeContext::default())?;
        let end = msg.len() - buf.len();

        fields.push(RawField {
            tag,
            wire_type,
            raw: &msg[start..end],
            value: &msg[value_start..end],
        });
    }

    Ok(fields)
}

/// Re-assemble `fields`, putting `body` where the first `tag` message was.
///
/// Later occurrences of `tag` are dropped; if there was none, the new field
/// goes last.
fn replace_message_field(fields: &[RawField<'_>], tag: u32, body: &[u8]) -> Vec<u8> {
    let mut field = Vec::with_capacity(body.len() + 6);
    encode_key(tag, WireType::LengthDelimited, &mut field);
    encode_varint(body.len() as u64, &mut field);
    field.extend_from_slice(body);

    let total: usize = fields.iter().map(|f| f.raw.len()).sum();
    let mut out = Vec::with_capacity(total + field.len());
    let mut written = false;
    for f in fields {
        if !f.is_message(tag) {
            out.extend_from_slice(f.raw);
        } else if !written {
            out.extend_from_slice(&field);
            written = true;
        }
    }
    if !written {
        out.extend_from_slice(&field);
    }
    out
}

/// Decode the v1 `Command` envelope (sequence number + inner payload)
pub fn decode_wrapper(bytes: &[u8]) -> CodecResult<Command> {
    Ok(Command::decode(bytes)?)
}

/// Decode the envelope and check that it announces `kind`
pub fn decode_wrapper_for(kind: ReportKind, bytes: &[u8]) -> CodecResult<Command> {
    let command = decode_wrapper(bytes)?;
    if command.command != kind.name() {
        return Err(CodecError::CommandMismatch {
            expected: kind,
            found: command.command,
        });
    }
    Ok(command)
}

/// Serialize a v1 envelope
pub fn encode_wrapper(command: &Command) -> Vec<u8> {
    command.encode_to_vec()
}

/// Decode a report of the given kind
pub fn decode_content(kind: ReportKind, bytes: &[u8]) -> CodecResult<Report> {
    let report = match kind {
        ReportKind::Generic => Report::Generic(DataReport::decode(bytes)?),
        ReportKind::Bluetooth => Report::Bluetooth(LinuxBluetoothDataReport::decode(bytes)?),
    };
    Ok(report)
}

/// Overwrite the location of a report.
///
/// Reports without a GPS record get a fresh 3D one; every other GPS field is
/// left as the sensor sent it.
pub fn set_fix(mut report: Report, fix: &GpsFix) -> Report {
    let gps = report
        .gps_mut()
        .get_or_insert_with(|| SubGps::from_fix(fix));
    gps.lat = fix.lat;
    gps.lon = fix.lon;
    gps.alt = fix.alt;
    report
}

/// Replace the `content` of an encoded v1 envelope, keeping its other fields
pub fn rewrap(envelope: &[u8], content: &[u8]) -> CodecResult<Vec<u8>> {
    let fields = split_fields(envelope)?;
    Ok(replace_message_field(&fields, CONTENT_TAG, content))
}

/// Overwrite the location of an encoded report.
///
/// Only the GPS record is re-serialized (through `set_fix`). Every other
/// field, and any field the GPS schema does not declare, keeps its bytes.
pub fn relocate_report(kind: ReportKind, bytes: &[u8], fix: &GpsFix) -> CodecResult<Vec<u8>> {
    let report = decode_content(kind, bytes)?;
    match report.fix() {
        Some(was) => tracing::trace!("{} report moved from {:.6}, {:.6}", kind, was.lat, was.lon),
        None => tracing::trace!("{} report had no location", report.kind()),
    }

    let fields = split_fields(bytes)?;

    // Undeclared SubGps fields, gathered from every GPS occurrence
    let mut gps_extra = Vec::new();
    for field in fields.iter().filter(|f| f.is_message(GPS_TAG)) {
        for inner in split_fields(field.body()?)? {
            if inner.tag > SUB_GPS_LAST_TAG {
                gps_extra.extend_from_slice(inner.raw);
            }
        }
    }

    let patched = set_fix(report, fix);
    let mut gps = patched.gps().map(|g| g.encode_to_vec()).unwrap_or_default();
    gps.extend_from_slice(&gps_extra);

    Ok(replace_message_field(&fields, GPS_TAG, &gps))
}

/// Serialize a report
pub fn encode(report: &Report) -> Vec<u8> {
    match report {
        Report::Generic(r) => r.encode_to_vec(),
        Report::Bluetooth(r) => r.encode_to_vec(),
    }
}
