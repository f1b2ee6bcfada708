//! Proxy server
//!
//! Owns the listening socket, accepts sensors and spawns one relay session per
//! connection. Stopping the server closes the listener; sessions already
//! running are left to end when their peers disconnect.

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tracing::Instrument;

use super::session::{Session, SessionError, SessionResult, SessionStats};
use super::{connect_upstream, ConnectPolicy, NetworkConfig};
use crate::location::LocationSource;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Kismet server {addr} unreachable: {source}")]
    UpstreamUnreachable {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub type ServerResult<T> = Result<T, ServerError>;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Server started
    Started { bind_addr: SocketAddr },
    /// A sensor connected
    SessionOpened { addr: SocketAddr },
    /// A session ended
    SessionClosed {
        addr: SocketAddr,
        outcome: Result<SessionStats, String>,
    },
    /// Server stopped accepting
    Stopped,
    /// Error occurred
    Error { message: String },
}

/// Proxy server
pub struct Server {
    /// Server configuration
    config: NetworkConfig,
    /// Where sessions get the current fix
    location: Arc<dyn LocationSource>,
    /// Event sender
    event_tx: mpsc::Sender<ServerEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Whether the server is accepting
    running: Arc<RwLock<bool>>,
}

impl Server {
    /// Create a new server
    pub fn new(config: NetworkConfig, location: Arc<dyn LocationSource>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            config,
            location,
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Take the event receiver (can only be called once).
    ///
    /// `Started`, session and accept-error events are dropped while the
    /// channel is full, so an undrained receiver never stalls sensors.
    /// `Stopped` waits for room instead.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Bind the listener and start accepting sensors
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let bind_addr = self.config.listen;
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        if self.config.connect_policy == ConnectPolicy::FailFast && self.config.probe_upstream {
            self.probe_upstream().await?;
        }

        let local_addr = listener.local_addr()?;
        tracing::info!("Listening for sensors on {}", local_addr);
        tracing::info!("Kismet server: {}", self.config.upstream);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        emit(&self.event_tx, ServerEvent::Started { bind_addr: local_addr });

        let config = Arc::new(self.config.clone());
        let location = self.location.clone();
        let event_tx = self.event_tx.clone();
        let running = self.running.clone();

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::info!("Sensor connected from {}", addr);
                                emit(&event_tx, ServerEvent::SessionOpened { addr });

                                let config = config.clone();
                                let location = location.clone();
                                let event_tx = event_tx.clone();
                                let span = tracing::info_span!("session", peer = %addr);

                                tokio::spawn(
                                    async move {
                                        let outcome = handle_client(stream, &config, location).await;
                                        match &outcome {
                                            Ok(stats) => tracing::info!(
                                                "Session ended: {} chunk(s), {} record(s) rewritten, {} skipped, {} -> {} bytes upstream, {} bytes back",
                                                stats.chunks,
                                                stats.records_rewritten,
                                                stats.records_skipped,
                                                stats.bytes_from_client,
                                                stats.bytes_to_upstream,
                                                stats.bytes_to_client
                                            ),
                                            Err(e) => tracing::error!("Session failed: {}", e),
                                        }
                                        emit(&event_tx, ServerEvent::SessionClosed {
                                            addr,
                                            outcome: outcome.map_err(|e| e.to_string()),
                                        });
                                    }
                                    .instrument(span),
                                );
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                                emit(&event_tx, ServerEvent::Error { message: e.to_string() });
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }

            // Dropping the listener closes the socket
            drop(listener);

            *running.write().await = false;

            let _ = event_tx.send(ServerEvent::Stopped).await;
        });

        Ok(local_addr)
    }

    /// Stop accepting new sensors
    pub async fn stop(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(ServerError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        Ok(())
    }

    /// Check if the server is accepting
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// One connection attempt, so a bad upstream address fails at startup
    async fn probe_upstream(&self) -> ServerResult<()> {
        let addr = &self.config.upstream;
        match TcpStream::connect(addr).await {
            Ok(_) => {
                tracing::debug!("Kismet server {} reachable", addr);
                Ok(())
            }
            Err(source) => Err(ServerError::UpstreamUnreachable {
                addr: addr.clone(),
                source,
            }),
        }
    }
}

/// Queue an event without waiting for the consumer
fn emit(event_tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = event_tx.try_send(event) {
        tracing::debug!("Event channel full, dropping {:?}", event);
    }
}

/// Relay one sensor connection
async fn handle_client(
    stream: TcpStream,
    config: &NetworkConfig,
    location: Arc<dyn LocationSource>,
) -> SessionResult<SessionStats> {
    stream.set_nodelay(true)?;

    tracing::info!("Connecting to Kismet server {}", config.upstream);
    let upstream = connect_upstream(&config.upstream, config.connect_policy)
        .await
        .map_err(|source| SessionError::UpstreamConnect {
            addr: config.upstream.clone(),
            source,
        })?;

    Session::new(stream, upstream, location, config.read_buffer_size)
        .run(config.relay_mode)
        .await
}
