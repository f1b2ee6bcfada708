//! Kismet structured message schemas
//!
//! Protobuf (proto2) messages carried inside Kismet external frames, declared
//! with prost derive macros. Only the two data-report kinds that can carry a
//! GPS fix are modelled, plus the v1 `Command` envelope that wraps them.

use prost::Message;
use serde::{Deserialize, Serialize};

use super::{BLUETOOTH_REPORT_MARKER, GENERIC_REPORT_MARKER, MARKER_LEN};

/// A single location reading: degrees and meters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

impl GpsFix {
    pub fn new(lat: f64, lon: f64, alt: f64) -> Self {
        Self { lat, lon, alt }
    }
}

/// Which report schema a frame carries, keyed by its command marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportKind {
    /// `KDSDATAREPORT`, generic datasource report
    Generic,
    /// `LBTDATAREPORT`, Linux Bluetooth datasource report
    Bluetooth,
}

impl ReportKind {
    pub const ALL: [ReportKind; 2] = [ReportKind::Generic, ReportKind::Bluetooth];

    /// The command string that identifies this kind on the wire
    pub fn marker(&self) -> &'static [u8; MARKER_LEN] {
        match self {
            ReportKind::Generic => GENERIC_REPORT_MARKER,
            ReportKind::Bluetooth => BLUETOOTH_REPORT_MARKER,
        }
    }

    /// Match a marker window against the known kinds
    pub fn from_marker(window: &[u8]) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| window == kind.marker().as_slice())
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReportKind::Generic => "KDSDATAREPORT",
            ReportKind::Bluetooth => "LBTDATAREPORT",
        }
    }
}

impl std::fmt::Display for ReportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// v1 frame envelope
#[derive(Clone, PartialEq, Message)]
pub struct Command {
    #[prost(string, required, tag = "1")]
    pub command: String,

    #[prost(uint32, required, tag = "2")]
    pub seqno: u32,

    /// Serialized report
    #[prost(bytes = "vec", required, tag = "3")]
    pub content: Vec<u8>,
}

/// Message-bus text attached to a report
#[derive(Clone, PartialEq, Message)]
pub struct MsgbusMessage {
    #[prost(string, required, tag = "1")]
    pub msgtext: String,

    #[prost(uint32, required, tag = "2")]
    pub msgtype: u32,
}

/// GPS sub-record embedded in reports
#[derive(Clone, PartialEq, Message)]
pub struct SubGps {
    #[prost(double, required, tag = "1")]
    pub lat: f64,

    #[prost(double, required, tag = "2")]
    pub lon: f64,

    #[prost(double, required, tag = "3")]
    pub alt: f64,

    /// Fix quality: 2 = 2D, 3 = 3D
    #[prost(double, required, tag = "4")]
    pub fix: f64,

    #[prost(double, optional, tag = "5")]
    pub speed: Option<f64>,

    #[prost(double, optional, tag = "6")]
    pub heading: Option<f64>,

    #[prost(double, optional, tag = "7")]
    pub precision: Option<f64>,

    #[prost(uint64, optional, tag = "8")]
    pub time_sec: Option<u64>,

    #[prost(uint64, optional, tag = "9")]
    pub time_usec: Option<u64>,

    #[prost(string, optional, tag = "10")]
    pub r#type: Option<String>,

    #[prost(string, optional, tag = "11")]
    pub name: Option<String>,
}

/// Fix quality written when a report had no GPS record of its own
pub const FIX_3D: f64 = 3.0;

impl SubGps {
    pub fn from_fix(fix: &GpsFix) -> Self {
        Self {
            lat: fix.lat,
            lon: fix.lon,
            alt: fix.alt,
            fix: FIX_3D,
            ..Default::default()
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct SubSignal {
    #[prost(double, optional, tag = "1")]
    pub signal_dbm: Option<f64>,

    #[prost(double, optional, tag = "2")]
    pub noise_dbm: Option<f64>,

    #[prost(double, optional, tag = "3")]
    pub signal_rssi: Option<f64>,

    #[prost(double, optional, tag = "4")]
    pub noise_rssi: Option<f64>,

    #[prost(double, optional, tag = "5")]
    pub freq_khz: Option<f64>,

    #[prost(string, optional, tag = "6")]
    pub channel: Option<String>,

    #[prost(double, optional, tag = "7")]
    pub datarate: Option<f64>,
}

/// Captured packet
#[derive(Clone, PartialEq, Message)]
pub struct SubPacket {
    #[prost(uint64, required, tag = "1")]
    pub time_sec: u64,

    #[prost(uint64, required, tag = "2")]
    pub time_usec: u64,

    /// Link type of `data`
    #[prost(uint32, required, tag = "3")]
    pub dlt: u32,

    #[prost(uint64, required, tag = "4")]
    pub size: u64,

    #[prost(bytes = "vec", required, tag = "5")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SubSpectrum {
    #[prost(uint64, required, tag = "1")]
    pub time_sec: u64,

    #[prost(uint64, required, tag = "2")]
    pub time_usec: u64,

    #[prost(uint64, required, tag = "3")]
    pub freq_start: u64,

    #[prost(uint64, required, tag = "4")]
    pub freq_end: u64,

    #[prost(uint64, required, tag = "5")]
    pub bin_hz: u64,

    #[prost(double, repeated, packed = "false", tag = "6")]
    pub data: Vec<f64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SubJson {
    #[prost(uint64, required, tag = "1")]
    pub time_sec: u64,

    #[prost(uint64, required, tag = "2")]
    pub time_usec: u64,

    #[prost(string, required, tag = "3")]
    pub r#type: String,

    #[prost(string, required, tag = "4")]
    pub json: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct SubBuffer {
    #[prost(uint64, required, tag = "1")]
    pub time_sec: u64,

    #[prost(uint64, required, tag = "2")]
    pub time_usec: u64,

    #[prost(string, required, tag = "3")]
    pub r#type: String,

    #[prost(bytes = "vec", required, tag = "4")]
    pub buffer: Vec<u8>,
}

/// Generic datasource report (`KDSDATAREPORT`)
#[derive(Clone, PartialEq, Message)]
pub struct DataReport {
    #[prost(message, optional, tag = "1")]
    pub message: Option<MsgbusMessage>,

    #[prost(message, optional, tag = "2")]
    pub gps: Option<SubGps>,

    #[prost(message, optional, tag = "3")]
    pub signal: Option<SubSignal>,

    #[prost(message, optional, tag = "4")]
    pub packet: Option<SubPacket>,

    #[prost(message, optional, tag = "5")]
    pub spectrum: Option<SubSpectrum>,

    #[prost(message, optional, tag = "6")]
    pub json: Option<SubJson>,

    #[prost(message, optional, tag = "7")]
    pub buffer: Option<SubBuffer>,

    #[prost(string, optional, tag = "8")]
    pub warning: Option<String>,
}

/// Bluetooth device seen by the Linux HCI datasource
#[derive(Clone, PartialEq, Message)]
pub struct SubLinuxBluetoothDevice {
    #[prost(uint64, required, tag = "1")]
    pub time_sec: u64,

    #[prost(uint64, required, tag = "2")]
    pub time_usec: u64,

    #[prost(string, required, tag = "3")]
    pub address: String,

    #[prost(string, optional, tag = "4")]
    pub name: Option<String>,

    #[prost(string, repeated, tag = "5")]
    pub uuid_list: Vec<String>,

    #[prost(int32, optional, tag = "6")]
    pub txpower: Option<i32>,

    #[prost(uint32, optional, tag = "7")]
    pub r#type: Option<u32>,
}

/// Linux Bluetooth datasource report (`LBTDATAREPORT`)
#[derive(Clone, PartialEq, Message)]
pub struct LinuxBluetoothDataReport {
    #[prost(message, optional, tag = "1")]
    pub message: Option<MsgbusMessage>,

    #[prost(message, optional, tag = "2")]
    pub gps: Option<SubGps>,

    #[prost(message, optional, tag = "3")]
    pub btdevice: Option<SubLinuxBluetoothDevice>,
}

/// A decoded report of either supported kind
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    Generic(DataReport),
    Bluetooth(LinuxBluetoothDataReport),
}

impl Report {
    pub fn kind(&self) -> ReportKind {
        match self {
            Report::Generic(_) => ReportKind::Generic,
            Report::Bluetooth(_) => ReportKind::Bluetooth,
        }
    }

    /// The GPS record, if the report carries one
    pub fn gps(&self) -> Option<&SubGps> {
        match self {
            Report::Generic(r) => r.gps.as_ref(),
            Report::Bluetooth(r) => r.gps.as_ref(),
        }
    }

    pub(crate) fn gps_mut(&mut self) -> &mut Option<SubGps> {
        match self {
            Report::Generic(r) => &mut r.gps,
            Report::Bluetooth(r) => &mut r.gps,
        }
    }

    /// Current fix as a plain triple
    pub fn fix(&self) -> Option<GpsFix> {
        self.gps().map(|g| GpsFix::new(g.lat, g.lon, g.alt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_lookup() {
        assert_eq!(
            ReportKind::from_marker(b"KDSDATAREPORT"),
            Some(ReportKind::Generic)
        );
        assert_eq!(
            ReportKind::from_marker(b"LBTDATAREPORT"),
            Some(ReportKind::Bluetooth)
        );
        assert_eq!(ReportKind::from_marker(b"KDSCONFIGURE!"), None);
        assert_eq!(ReportKind::from_marker(b"KDS"), None);
    }

    #[test]
    fn test_sub_gps_from_fix() {
        let gps = SubGps::from_fix(&GpsFix::new(1.0, 2.0, 3.0));
        assert_eq!(gps.fix, FIX_3D);
        assert_eq!(gps.name, None);
    }

    #[test]
    fn test_report_fix_accessor() {
        let mut report = Report::Bluetooth(LinuxBluetoothDataReport::default());
        assert_eq!(report.fix(), None);

        *report.gps_mut() = Some(SubGps::from_fix(&GpsFix::new(4.0, 5.0, 6.0)));
        assert_eq!(report.fix(), Some(GpsFix::new(4.0, 5.0, 6.0)));
        assert_eq!(report.kind(), ReportKind::Bluetooth);
    }
}
