//! `slackline` - connect access tokens to real-time sessions and log what
//! happens until every session closes or Ctrl-C.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::Level;

use slackline_client::{ClientConfig, ConnectionOrchestrator};
use slackline_core::{Connection, LifecycleEvent};
use slackline_telemetry::{init_telemetry, LogFormat, TelemetryConfig};

#[derive(Debug, Parser)]
#[command(name = "slackline", version, about)]
struct Args {
    /// Access token to connect. Repeat the flag or separate with commas.
    #[arg(long = "token", env = "SLACKLINE_TOKENS", value_delimiter = ',')]
    tokens: Vec<String>,

    /// Handshake endpoint; the token is sent as the `token` query parameter.
    #[arg(long, default_value = slackline_client::config::DEFAULT_HANDSHAKE_URL)]
    handshake_url: String,

    /// Nameserver used to resolve service hosts.
    #[arg(long, default_value = "8.8.8.8")]
    dns_server: IpAddr,

    /// How often the scheduler reports outstanding work, in milliseconds.
    #[arg(long, default_value_t = 200)]
    tick_interval_ms: u64,

    /// Give up on a handshake after this many seconds.
    #[arg(long)]
    handshake_timeout_secs: Option<u64>,

    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Emit JSON log lines instead of text.
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            handshake_url: self.handshake_url.clone(),
            dns_server: self.dns_server,
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            handshake_timeout: self.handshake_timeout_secs.map(Duration::from_secs),
            ..ClientConfig::default()
        }
    }

    fn connections(&self) -> Vec<Connection> {
        self.tokens
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(Connection::new)
            .collect()
    }
}

fn log_event(event: &LifecycleEvent) {
    match event {
        LifecycleEvent::BeforeAll { connections } => {
            tracing::info!(count = connections.len(), "connecting");
        }
        LifecycleEvent::BeforeEach { connection } => {
            tracing::debug!(connection_id = %connection.id(), "handshake starting");
        }
        LifecycleEvent::Error { .. } => {}
        LifecycleEvent::AfterEach { connection, write } => {
            tracing::info!(
                connection_id = %connection.id(),
                connected = write.is_some(),
                "connection settled"
            );
        }
        LifecycleEvent::AfterAll { connections, .. } => {
            tracing::debug!(count = connections.len(), "all connections initiated");
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_telemetry(&TelemetryConfig {
        log_level: args.log_level,
        format: if args.json_logs {
            LogFormat::Json
        } else {
            LogFormat::Text
        },
        ..TelemetryConfig::default()
    })?;

    let connections = args.connections();
    if connections.is_empty() {
        bail!("no tokens given; pass --token or set SLACKLINE_TOKENS");
    }

    let orchestrator = ConnectionOrchestrator::new(args.client_config());
    orchestrator.subscribe(Arc::new(log_event));

    let scheduler = orchestrator
        .scheduler()
        .context("failed to start scheduler")?;
    let on_signal = orchestrator.clone();
    scheduler.handle().spawn_background(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, closing sessions");
            on_signal.shutdown();
        }
    });

    tracing::info!(dns_server = %orchestrator.dns_server(), "starting slackline");
    orchestrator.run(connections)?;
    tracing::info!("all sessions closed");
    Ok(())
}
