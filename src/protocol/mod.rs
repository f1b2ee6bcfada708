//! Protocol module - Kismet external capture protocol, as far as the proxy needs it
//!
//! Kismet remote-capture sensors talk to the server in signed frames:
//!
//! v1: signature(4) checksum(4) length(4) payload, where the payload is a
//!     protobuf `Command` envelope whose first field is the command string.
//! v2: signature(4) 0xABCD(2) version(2) length(4) command(32) seqno(4) payload
//!
//! Frames are located by their command string (the marker), and every other
//! field sits at a fixed distance from it.

mod checksum;
mod codec;
mod frame;
mod message;

#[cfg(test)]
pub(crate) mod testing;

pub use checksum::*;
pub use codec::*;
pub use frame::*;
pub use message::*;

/// Width of a report marker
pub const MARKER_LEN: usize = 13;

pub const GENERIC_REPORT_MARKER: &[u8; MARKER_LEN] = b"KDSDATAREPORT";
pub const BLUETOOTH_REPORT_MARKER: &[u8; MARKER_LEN] = b"LBTDATAREPORT";

/// v2 sentinel (0xABCD) followed by frame version 2, in the v1 checksum slot
pub const V2_TAG: [u8; 4] = [0xAB, 0xCD, 0x00, 0x02];

/// Fixed width of the v2 command field
pub const V2_COMMAND_LEN: usize = 32;
