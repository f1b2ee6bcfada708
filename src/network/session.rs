//! Relay session
//!
//! One session per sensor. It owns the sensor socket and the upstream socket
//! for its whole life, pushes sensor traffic through the frame scanner and
//! passes server traffic back untouched.
//!
//! No read or write carries a timeout: a peer that goes silent keeps its
//! session parked until it disconnects or the process exits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::RelayMode;
use crate::location::LocationSource;
use crate::protocol::rewrite_buffer;

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot reach Kismet server {addr}: {source}")]
    UpstreamConnect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Session statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Chunks read from the sensor
    pub chunks: u64,
    /// Bytes read from the sensor
    pub bytes_from_client: u64,
    /// Bytes written to the server after rewriting
    pub bytes_to_upstream: u64,
    /// Bytes passed back to the sensor
    pub bytes_to_client: u64,
    /// Records that now carry the proxy's location
    pub records_rewritten: u64,
    /// Candidate records passed through untouched
    pub records_skipped: u64,
}

/// Applies the current location to sensor chunks and keeps the counters
struct ChunkRewriter {
    location: Arc<dyn LocationSource>,
    stats: SessionStats,
}

impl ChunkRewriter {
    fn process(&mut self, chunk: Bytes) -> Bytes {
        let fix = self.location.current_fix();
        let received = chunk.len();
        let (out, report) = rewrite_buffer(chunk, fix.as_ref());
        tracing::debug!(
            "Passing {} bytes, {} marker(s), {} valid record(s)",
            received,
            report.markers,
            report.validated
        );

        if fix.is_none() && report.validated > 0 {
            tracing::info!("No GPS data, not altering location");
        }
        if report.rewritten > 0 {
            tracing::info!(
                "Rewrote {} record(s), {} -> {} bytes",
                report.rewritten,
                received,
                out.len()
            );
        }

        self.stats.chunks += 1;
        self.stats.bytes_from_client += received as u64;
        self.stats.bytes_to_upstream += out.len() as u64;
        self.stats.records_rewritten += report.rewritten as u64;
        self.stats.records_skipped += report.skipped as u64;
        out
    }
}

/// Read at most `limit` bytes. `None` means the peer closed.
async fn read_chunk<R>(reader: &mut R, buf: &mut BytesMut, limit: usize) -> std::io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    buf.clear();
    buf.reserve(limit);

    let n = reader.take(limit as u64).read_buf(buf).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(buf.split().freeze()))
}

/// A sensor connection paired with its upstream connection
pub struct Session<C, U> {
    client: C,
    upstream: U,
    rewriter: ChunkRewriter,
    read_buffer_size: usize,
}

impl<C, U> Session<C, U>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(client: C, upstream: U, location: Arc<dyn LocationSource>, read_buffer_size: usize) -> Self {
        Self {
            client,
            upstream,
            rewriter: ChunkRewriter {
                location,
                stats: SessionStats::default(),
            },
            read_buffer_size,
        }
    }

    /// Relay until the sensor disconnects or a socket fails
    pub async fn run(self, mode: RelayMode) -> SessionResult<SessionStats> {
        match mode {
            RelayMode::Lockstep => self.run_lockstep().await,
            RelayMode::Duplex => self.run_duplex().await,
        }
    }

    /// Sensor chunk out, exactly one server chunk back, repeat
    async fn run_lockstep(mut self) -> SessionResult<SessionStats> {
        let limit = self.read_buffer_size;
        let mut inbound = BytesMut::with_capacity(limit);
        let mut response = BytesMut::with_capacity(limit);

        let result = async {
            while let Some(chunk) = read_chunk(&mut self.client, &mut inbound, limit).await? {
                let out = self.rewriter.process(chunk);
                self.upstream.write_all(&out).await?;

                let Some(reply) = read_chunk(&mut self.upstream, &mut response, limit).await? else {
                    tracing::info!("Kismet server closed the connection");
                    break;
                };
                self.client.write_all(&reply).await?;
                self.rewriter.stats.bytes_to_client += reply.len() as u64;
            }
            Ok::<(), SessionError>(())
        }
        .await;

        let _ = self.upstream.shutdown().await;
        let _ = self.client.shutdown().await;

        result.map(|()| self.rewriter.stats)
    }

    /// Both directions at once; ends when either side closes
    async fn run_duplex(self) -> SessionResult<SessionStats> {
        let Session {
            client,
            upstream,
            mut rewriter,
            read_buffer_size: limit,
        } = self;

        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

        let outbound = async {
            let mut inbound = BytesMut::with_capacity(limit);
            while let Some(chunk) = read_chunk(&mut client_rd, &mut inbound, limit).await? {
                let out = rewriter.process(chunk);
                upstream_wr.write_all(&out).await?;
            }
            upstream_wr.shutdown().await
        };
        // Counted per chunk so the total survives whichever side ends first
        let bytes_to_client = AtomicU64::new(0);
        let returned = async {
            let mut response = BytesMut::with_capacity(limit);
            while let Some(reply) = read_chunk(&mut upstream_rd, &mut response, limit).await? {
                client_wr.write_all(&reply).await?;
                bytes_to_client.fetch_add(reply.len() as u64, Ordering::Relaxed);
            }
            Ok::<(), std::io::Error>(())
        };

        tokio::select! {
            result = outbound => result?,
            result = returned => {
                result?;
                tracing::info!("Kismet server closed the connection");
            }
        }

        let _ = client_wr.shutdown().await;

        rewriter.stats.bytes_to_client = bytes_to_client.load(Ordering::Relaxed);
        Ok(rewriter.stats)
    }
}
