//! BeatBridge Server
//!
//! Runs the hub with the bundled software clock until interrupted, logging
//! the connect URL and every hub notification.

use anyhow::{Context, Result};
use beatbridge_hub::{Hub, HubConfig, HubEvent, SoftwareClock};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "beatbridge")]
#[command(about = "Bridge a shared musical clock to WebSocket clients on the LAN")]
#[command(version)]
struct Cli {
    /// Config file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen interface
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// WebSocket port
    #[arg(short, long)]
    port: Option<u16>,

    /// Tempo reported while the clock is idle
    #[arg(long)]
    tempo: Option<f64>,

    /// Bar length in beats
    #[arg(short, long)]
    quantum: Option<u32>,

    /// Rate of `state` broadcasts (Hz)
    #[arg(long)]
    state_hz: Option<u32>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.json_logs)?;

    let config = load_config(&cli)?;
    let clock = Arc::new(SoftwareClock::new(config.default_tempo));
    let hub = Arc::new(Hub::new(config, clock));

    tokio::spawn(relay_events(hub.clone(), hub.subscribe()));

    if let Err(e) = hub.start().await {
        error!("Hub failed to start: {}", e);
        return Err(e).context("Failed to start hub");
    }

    let port = hub.local_addr().map_or(hub.port(), |addr| addr.port());
    info!("Connect clients to ws://{}:{}", lan_ipv4(), port);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Shutting down");
    hub.stop();
    Ok(())
}

fn setup_logging(verbose: bool, json: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_new("debug")
    } else {
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))
    }
    .context("Failed to parse log level")?;

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).compact())
            .init();
    }

    Ok(())
}

/// Defaults, then the TOML file, then command-line flags
fn load_config(cli: &Cli) -> Result<HubConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("Invalid config file {}", path.display()))?
        }
        None => HubConfig::default(),
    };

    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(tempo) = cli.tempo {
        config.default_tempo = tempo;
    }
    if let Some(quantum) = cli.quantum {
        config.quantum = quantum;
    }
    if let Some(state_hz) = cli.state_hz {
        config.state_hz = state_hz;
    }

    config.validate()?;
    Ok(config)
}

/// IPv4 address other machines on the LAN can reach us at
fn lan_ipv4() -> Ipv4Addr {
    // Connecting a UDP socket sends nothing; it only picks the outbound route
    let route_addr = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
        Ok(socket.local_addr()?.ip())
    };

    match route_addr() {
        Ok(IpAddr::V4(ip)) if !ip.is_loopback() && !ip.is_unspecified() => ip,
        _ => Ipv4Addr::LOCALHOST,
    }
}

async fn relay_events(hub: Arc<Hub>, mut events: broadcast::Receiver<HubEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let state = hub.state();
                info!(
                    event = event.name(),
                    tempo = state.tempo,
                    playing = state.is_playing,
                    peers = state.num_peers,
                    clients = state.num_clients,
                    "{}",
                    describe(&event)
                );
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Missed {} hub events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn describe(event: &HubEvent) -> String {
    match event {
        HubEvent::Started => "Hub started".to_string(),
        HubEvent::Stopped => "Hub stopped".to_string(),
        HubEvent::Tempo(tempo) => format!("Tempo: {:.2} BPM", tempo),
        HubEvent::Playing(true) => "Transport playing".to_string(),
        HubEvent::Playing(false) => "Transport stopped".to_string(),
        HubEvent::Peers(n) => format!("Peers: {}", n),
        HubEvent::Clients(n) => format!("Clients: {}", n),
    }
}
