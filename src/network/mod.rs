//! Network module - Accepts sensors and relays them to the Kismet server
//!
//! Provides:
//! - Server for accepting sensor connections
//! - Session relaying one sensor to the upstream server through the frame scanner
//! - Upstream connect policies

mod server;
mod session;

pub use server::*;
pub use session::*;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::config::{self, ConnectPolicyKind, RelayMode};

/// How sessions reach the upstream server. Applied the same way to every
/// session and to the startup probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPolicy {
    /// One attempt; failure ends the session
    FailFast,
    /// Retry forever, sleeping `interval` between attempts
    Retry { interval: Duration },
}

/// Runtime configuration for the proxy
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address to accept sensors on
    pub listen: SocketAddr,
    /// Kismet server address
    pub upstream: String,
    /// Largest chunk read from a socket at once
    pub read_buffer_size: usize,
    pub relay_mode: RelayMode,
    pub connect_policy: ConnectPolicy,
    /// Probe the upstream once before accepting (fail-fast only)
    pub probe_upstream: bool,
}

impl NetworkConfig {
    pub fn new(listen: SocketAddr, upstream: impl Into<String>) -> Self {
        Self {
            listen,
            upstream: upstream.into(),
            read_buffer_size: 64 * 1024,
            relay_mode: RelayMode::Lockstep,
            connect_policy: ConnectPolicy::FailFast,
            probe_upstream: true,
        }
    }

    /// Build from the file/CLI configuration
    pub fn from_config(proxy: &config::ProxyConfig) -> Result<Self, std::net::AddrParseError> {
        let listen = proxy.listen.parse()?;
        let connect_policy = match proxy.connect_policy {
            ConnectPolicyKind::FailFast => ConnectPolicy::FailFast,
            ConnectPolicyKind::Retry => ConnectPolicy::Retry {
                interval: Duration::from_millis(proxy.retry_interval_ms),
            },
        };

        Ok(Self {
            read_buffer_size: proxy.read_buffer_size,
            relay_mode: proxy.relay_mode,
            connect_policy,
            probe_upstream: proxy.probe_upstream,
            ..Self::new(listen, proxy.upstream.clone())
        })
    }
}

/// Connect to the upstream server according to `policy`
pub async fn connect_upstream(addr: &str, policy: ConnectPolicy) -> std::io::Result<TcpStream> {
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => match policy {
                ConnectPolicy::FailFast => return Err(e),
                ConnectPolicy::Retry { interval } => {
                    tracing::warn!(
                        "Kismet server {} unreachable ({}), retrying in {:?}",
                        addr,
                        e,
                        interval
                    );
                    tokio::time::sleep(interval).await;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_from_config() {
        let mut proxy = config::ProxyConfig::default();
        proxy.connect_policy = ConnectPolicyKind::Retry;
        proxy.retry_interval_ms = 250;

        let net = NetworkConfig::from_config(&proxy).unwrap();
        assert_eq!(net.listen, "127.0.0.1:3500".parse::<SocketAddr>().unwrap());
        assert_eq!(net.upstream, "127.0.0.1:3501");
        assert_eq!(
            net.connect_policy,
            ConnectPolicy::Retry {
                interval: Duration::from_millis(250)
            }
        );

        proxy.listen = "not-an-address".to_string();
        assert!(NetworkConfig::from_config(&proxy).is_err());
    }

    #[tokio::test]
    async fn test_fail_fast_gives_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(connect_upstream(&addr, ConnectPolicy::FailFast).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_waits_for_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connect = tokio::spawn({
            let addr = addr.to_string();
            async move {
                connect_upstream(
                    &addr,
                    ConnectPolicy::Retry {
                        interval: Duration::from_millis(20),
                    },
                )
                .await
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        let listener = TcpListener::bind(addr).await.unwrap();
        let _accepted = listener.accept().await.unwrap();

        assert!(connect.await.unwrap().is_ok());
    }
}
