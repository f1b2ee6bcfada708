//! gpsd client
//!
//! Keeps a watch-mode connection to gpsd and publishes every position report
//! into a `SharedLocation`. The fix is withdrawn whenever gpsd reports no fix
//! or the connection drops.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;

use super::{GpsFix, SharedLocation};

/// Enables JSON watch mode
const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true};\n";

/// gpsd `mode` for a 2D fix; anything below has no usable position
const MODE_2D: u8 = 2;

/// gpsd client errors
#[derive(Error, Debug)]
pub enum GpsdError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type GpsdResult<T> = Result<T, GpsdError>;

/// What a single gpsd report means for the published fix
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GpsdUpdate {
    Fix(GpsFix),
    NoFix,
    /// Not a position report
    Ignored,
}

/// The fields of a gpsd report the proxy cares about
#[derive(Debug, Deserialize)]
struct Report {
    class: String,
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(rename = "altHAE")]
    alt_hae: Option<f64>,
    alt: Option<f64>,
    #[serde(rename = "altMSL")]
    alt_msl: Option<f64>,
}

/// Interpret one line of gpsd JSON output
pub fn parse_report(line: &str) -> GpsdResult<GpsdUpdate> {
    let report: Report = serde_json::from_str(line)?;
    if report.class != "TPV" {
        return Ok(GpsdUpdate::Ignored);
    }

    if report.mode < MODE_2D {
        return Ok(GpsdUpdate::NoFix);
    }

    match (report.lat, report.lon) {
        (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => {
            let alt = report
                .alt_hae
                .or(report.alt)
                .or(report.alt_msl)
                .unwrap_or(0.0);
            Ok(GpsdUpdate::Fix(GpsFix::new(lat, lon, alt)))
        }
        _ => Ok(GpsdUpdate::NoFix),
    }
}

/// Background task feeding gpsd positions into a `SharedLocation`
pub struct GpsdClient {
    addr: String,
    reconnect_interval: Duration,
    tx: watch::Sender<Option<GpsFix>>,
}

impl GpsdClient {
    /// Create a client for gpsd at `addr` and the source it publishes to
    pub fn new(addr: impl Into<String>, reconnect_interval: Duration) -> (Self, SharedLocation) {
        let (tx, location) = SharedLocation::channel();
        let client = Self {
            addr: addr.into(),
            reconnect_interval,
            tx,
        };
        (client, location)
    }

    /// Run until every `SharedLocation` has been dropped
    pub async fn run(self) {
        loop {
            tracing::info!("Connecting to gpsd at {}", self.addr);

            match self.stream_reports().await {
                Ok(()) => tracing::warn!("gpsd closed the connection"),
                Err(e) => tracing::warn!("gpsd connection failed: {}", e),
            }

            self.publish(None);
            if self.tx.is_closed() {
                break;
            }

            tokio::time::sleep(self.reconnect_interval).await;
        }
    }

    async fn stream_reports(&self) -> GpsdResult<()> {
        let stream = TcpStream::connect(&self.addr).await?;
        let (reader, mut writer) = stream.into_split();

        writer.write_all(WATCH_COMMAND).await?;
        writer.flush().await?;

        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            match parse_report(&line) {
                Ok(GpsdUpdate::Fix(fix)) => self.publish(Some(fix)),
                Ok(GpsdUpdate::NoFix) => self.publish(None),
                Ok(GpsdUpdate::Ignored) => {}
                Err(e) => tracing::debug!("Ignoring gpsd line: {}", e),
            }

            if self.tx.is_closed() {
                break;
            }
        }

        Ok(())
    }

    fn publish(&self, fix: Option<GpsFix>) {
        let previous = self.tx.send_replace(fix);
        match (previous, fix) {
            (None, Some(fix)) => {
                tracing::info!("GPS fix acquired: {:.6}, {:.6}, {:.1} m", fix.lat, fix.lon, fix.alt)
            }
            (Some(_), None) => tracing::warn!("GPS fix lost, locations will pass through unchanged"),
            _ => {}
        }
    }
}
