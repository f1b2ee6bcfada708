//! kisgps-proxy - GPS rewriting proxy for Kismet remote capture
//!
//! Sits between remote-capture sensors and the Kismet server and replaces the
//! location carried in every data report with the proxy's own.

mod config;
mod location;
mod network;
mod protocol;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::{Config, ConnectPolicyKind, LocationKind, RelayMode};
use location::{GpsFix, GpsdClient, LocationSource, StaticLocation};
use network::{NetworkConfig, Server, ServerEvent};

/// kisgps-proxy - Rewrite Kismet sensor locations in flight
#[derive(Parser, Debug)]
#[command(name = "kisgps-proxy")]
#[command(version)]
#[command(about = "Rewrite GPS data in Kismet remote-capture traffic", long_about = None)]
struct Cli {
    /// Address to accept sensors on (IP:PORT)
    #[arg(short, long)]
    listen: Option<String>,

    /// Kismet server to forward to (IP:PORT)
    #[arg(short, long)]
    send: Option<String>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Take the location from this gpsd (HOST:PORT)
    #[arg(long, conflicts_with = "static_location")]
    gpsd: Option<String>,

    /// Use a fixed location instead of gpsd
    #[arg(long, value_name = "LAT,LON,ALT", value_parser = parse_static_location)]
    static_location: Option<GpsFix>,

    /// Keep retrying the Kismet server instead of failing the session
    #[arg(long)]
    retry_upstream: bool,

    /// Relay both directions independently
    #[arg(long)]
    duplex: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    /// Layer command-line flags over the loaded configuration
    fn apply(&self, config: &mut Config) {
        if let Some(listen) = &self.listen {
            config.proxy.listen = listen.clone();
        }
        if let Some(send) = &self.send {
            config.proxy.upstream = send.clone();
        }
        if self.verbose {
            config.general.verbose = true;
        }
        if let Some(gpsd) = &self.gpsd {
            config.location.source = LocationKind::Gpsd;
            config.location.gpsd = gpsd.clone();
        }
        if let Some(fix) = self.static_location {
            config.location.source = LocationKind::Static;
            config.location.lat = fix.lat;
            config.location.lon = fix.lon;
            config.location.alt = fix.alt;
        }
        if self.retry_upstream {
            config.proxy.connect_policy = ConnectPolicyKind::Retry;
        }
        if self.duplex {
            config.proxy.relay_mode = RelayMode::Duplex;
        }
    }
}

fn parse_static_location(s: &str) -> Result<GpsFix, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [lat, lon, alt] = parts.as_slice() else {
        return Err(format!("expected LAT,LON,ALT, got '{}'", s));
    };

    let parse = |name: &str, value: &str| {
        value
            .parse::<f64>()
            .map_err(|e| format!("invalid {} '{}': {}", name, value, e))
    };
    Ok(GpsFix::new(
        parse("latitude", *lat)?,
        parse("longitude", *lon)?,
        parse("altitude", *alt)?,
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    cli.apply(&mut config);
    config.validate()?;

    if cli.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    // Initialize logging; RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if config.general.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    run_proxy(config).await
}

/// Build the configured location source
fn start_location(config: &config::LocationConfig) -> Arc<dyn LocationSource> {
    match config.source {
        LocationKind::Static => {
            let fix = GpsFix::new(config.lat, config.lon, config.alt);
            tracing::info!("Using static location {:.6}, {:.6}, {:.1}m", fix.lat, fix.lon, fix.alt);
            Arc::new(StaticLocation::new(fix))
        }
        LocationKind::Gpsd => {
            tracing::info!("Using gpsd at {}", config.gpsd);
            let (client, location) = GpsdClient::new(
                config.gpsd.clone(),
                Duration::from_millis(config.reconnect_interval_ms),
            );
            tokio::spawn(client.run());
            Arc::new(location)
        }
    }
}

/// Run the proxy until interrupted
async fn run_proxy(config: Config) -> anyhow::Result<()> {
    let net_config = NetworkConfig::from_config(&config.proxy)
        .with_context(|| format!("Invalid listen address '{}'", config.proxy.listen))?;
    let location = start_location(&config.location);

    let mut server = Server::new(net_config, location);
    let mut event_rx = server
        .take_event_receiver()
        .context("Server event receiver already taken")?;

    let bind_addr = server.start().await?;

    println!("\n========================================");
    println!("  kisgps-proxy Running");
    println!("========================================");
    println!("  Listening: {}", bind_addr);
    println!("  Kismet:    {}", config.proxy.upstream);
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::Started { bind_addr } => {
                        tracing::debug!("Accept loop running on {}", bind_addr);
                    }
                    ServerEvent::SessionOpened { addr } => {
                        tracing::debug!("Session opened: {}", addr);
                    }
                    ServerEvent::SessionClosed { addr, outcome: Ok(stats) } => {
                        tracing::debug!("Session closed: {} ({:?})", addr, stats);
                    }
                    ServerEvent::SessionClosed { addr, outcome: Err(reason) } => {
                        tracing::debug!("Session closed: {} - {}", addr, reason);
                    }
                    ServerEvent::Error { message } => {
                        tracing::error!("Server error: {}", message);
                    }
                    ServerEvent::Stopped => {
                        tracing::debug!("Accept loop stopped");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.stop().await?;
    while let Some(event) = event_rx.recv().await {
        if let ServerEvent::Stopped = event {
            break;
        }
    }
    tracing::info!("Stopped accepting sensors");

    Ok(())
}
