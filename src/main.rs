//! camlink - expose camera streams behind NAT through a cloud broker
//!
//! `camlink agent` runs on the device; `camlink broker` runs in the cloud.

use anyhow::{bail, Context, Result};
use camlink_agent::{
    AgentConfig, AgentSession, ArmbenvIdentity, ConnectionMode, IdentityResolver,
    PlatformIdentity,
};
use camlink_broker::{BrokerConfig, BrokerServer, PortRange};
use camlink_proto::{ConnectionState, StreamQuality};
use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

/// Camera agent and cloud broker
#[derive(Parser, Debug)]
#[command(name = "camlink")]
#[command(about = "Expose camera streams behind NAT through a cloud broker", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info", env = "CAMLINK_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the device agent
    #[command(long_about = r#"
Register this device with a broker and keep a tunnel to the local camera
open. Values from --config are overridden by flags and environment.

EXAMPLES:
  camlink agent --broker-url ws://broker.example.com:8080 --token $TOKEN

  camlink agent --config /etc/camlink/agent.yaml --device-id cam-lobby
    "#)]
    Agent(AgentArgs),

    /// Run the cloud broker
    Broker(BrokerArgs),
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// YAML configuration file
    #[arg(long, short, env = "CAMLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Explicit device identity (skips platform and MAC lookup)
    #[arg(long, env = "CAMLINK_DEVICE_ID")]
    device_id: Option<String>,

    /// Broker WebSocket URL (e.g., ws://broker.example.com:8080)
    #[arg(long, env = "CAMLINK_BROKER_URL")]
    broker_url: Option<String>,

    /// Bearer token presented to the broker
    #[arg(long, env = "CAMLINK_TOKEN")]
    token: Option<String>,

    /// Connection mode: tunnel, p2p or hybrid
    #[arg(long, env = "CAMLINK_MODE")]
    mode: Option<ConnectionMode>,

    /// Camera IP address
    #[arg(long)]
    camera_ip: Option<String>,

    /// Camera RTSP port
    #[arg(long)]
    camera_port: Option<u16>,

    /// Preferred relay port on the broker
    #[arg(long)]
    tunnel_port: Option<u16>,

    /// Stream quality: low, medium or high
    #[arg(long, value_parser = parse_quality)]
    quality: Option<StreamQuality>,

    /// Heartbeat interval in seconds
    #[arg(long)]
    heartbeat_interval: Option<u64>,

    /// Delay before a reconnect attempt in seconds
    #[arg(long)]
    reconnect_interval: Option<u64>,

    /// Command queried for the platform device id
    #[arg(long, default_value = "armbenv")]
    identity_command: String,

    /// Skip the platform device id query
    #[arg(long)]
    no_platform_identity: bool,
}

impl AgentArgs {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(ref device_id) = self.device_id {
            config.device_id = Some(device_id.clone());
        }
        if let Some(ref url) = self.broker_url {
            config.broker_url = url.clone();
        }
        if let Some(ref token) = self.token {
            config.auth_token = Some(token.clone());
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(ref ip) = self.camera_ip {
            config.camera.ip = ip.clone();
        }
        if let Some(port) = self.camera_port {
            config.camera.port = port;
        }
        if let Some(port) = self.tunnel_port {
            config.tunnel_port = port;
        }
        if let Some(quality) = self.quality {
            config.quality = quality;
        }
        if let Some(secs) = self.heartbeat_interval {
            config.timers.heartbeat_interval_secs = secs;
        }
        if let Some(secs) = self.reconnect_interval {
            config.timers.reconnect_interval_secs = secs;
        }
    }
}

#[derive(Args, Debug)]
struct BrokerArgs {
    /// YAML configuration file
    #[arg(long, short, env = "CAMLINK_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP and agent WebSocket bind address
    #[arg(long, env = "CAMLINK_BIND")]
    bind: Option<SocketAddr>,

    /// Host name used in stream URLs
    #[arg(long, env = "CAMLINK_PUBLIC_HOST")]
    public_host: Option<String>,

    /// Relay port range (e.g., 8554-8654) or "ephemeral"
    #[arg(long, value_parser = parse_relay_ports)]
    relay_ports: Option<RelayPorts>,

    /// Expected agent heartbeat interval in seconds
    #[arg(long)]
    heartbeat_interval: Option<u64>,

    /// Missed heartbeats before an agent is marked disconnected
    #[arg(long)]
    max_missed_heartbeats: Option<u32>,

    /// Bearer token agents must present
    #[arg(long, env = "CAMLINK_TOKEN")]
    token: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum RelayPorts {
    Range(PortRange),
    Ephemeral,
}

impl BrokerArgs {
    fn apply(&self, config: &mut BrokerConfig) {
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(ref host) = self.public_host {
            config.public_host = host.clone();
        }
        match self.relay_ports {
            Some(RelayPorts::Range(range)) => config.relay_ports = Some(range),
            Some(RelayPorts::Ephemeral) => config.relay_ports = None,
            None => {}
        }
        if let Some(secs) = self.heartbeat_interval {
            config.heartbeat_interval_secs = secs;
        }
        if let Some(missed) = self.max_missed_heartbeats {
            config.max_missed_heartbeats = missed;
        }
        if let Some(ref token) = self.token {
            config.auth_token = Some(token.clone());
        }
    }
}

fn parse_quality(value: &str) -> Result<StreamQuality, String> {
    match value.to_ascii_lowercase().as_str() {
        "low" => Ok(StreamQuality::Low),
        "medium" => Ok(StreamQuality::Medium),
        "high" => Ok(StreamQuality::High),
        other => Err(format!("unknown quality '{}'", other)),
    }
}

fn parse_relay_ports(value: &str) -> Result<RelayPorts, String> {
    if value.eq_ignore_ascii_case("ephemeral") {
        return Ok(RelayPorts::Ephemeral);
    }
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got '{}'", value))?;
    let start = start
        .trim()
        .parse()
        .map_err(|e| format!("invalid start port: {}", e))?;
    let end = end
        .trim()
        .parse()
        .map_err(|e| format!("invalid end port: {}", e))?;
    Ok(RelayPorts::Range(PortRange { start, end }))
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Load a YAML config file, or defaults when no file is given
fn load_config<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

async fn run_agent(args: AgentArgs) -> Result<()> {
    let mut config: AgentConfig = load_config(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate().context("Invalid agent configuration")?;

    let platform: Option<Box<dyn PlatformIdentity>> = if args.no_platform_identity {
        None
    } else {
        Some(Box::new(ArmbenvIdentity::new(
            args.identity_command.clone(),
            Duration::from_secs(5),
        )))
    };
    let identity = IdentityResolver::new(config.device_id.clone())
        .with_platform(platform)
        .resolve()
        .await;
    info!(agent_id = %identity.id, source = %identity.source, "Resolved device identity");
    info!("Broker: {}", config.broker_url);
    info!("Mode: {}", config.mode);
    info!("Camera: {}", config.camera.address());

    let session = AgentSession::builder(identity, config)
        .build()
        .context("Failed to create agent session")?;
    session
        .start()
        .await
        .context("Failed to start agent session")?;

    let mut state = session.subscribe_state();
    tokio::select! {
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Shutdown signal received, stopping agent..."),
                Err(e) => error!("Error listening for shutdown signal: {}", e),
            }
        }
        _ = state.wait_for(|s| *s == ConnectionState::Error) => {
            session.stop().await;
            bail!("Agent session could not reconnect to the broker");
        }
    }

    session.stop().await;
    info!("camlink agent stopped");
    Ok(())
}

async fn run_broker(args: BrokerArgs) -> Result<()> {
    let mut config: BrokerConfig = load_config(args.config.as_deref())?;
    args.apply(&mut config);
    if config.auth_token.is_none() {
        warn!("No auth token configured, any agent may connect");
    }

    let server = BrokerServer::bind(config)
        .await
        .context("Failed to start broker")?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping broker..."),
            Err(e) => error!("Error listening for shutdown signal: {}", e),
        }
        signal_token.cancel();
    });

    server
        .serve(shutdown)
        .await
        .context("Broker server error")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (required for wss:// brokers)
    let _ = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::ring::default_provider(),
    );

    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Agent(args) => run_agent(args).await,
        Commands::Broker(args) => run_broker(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relay_ports() {
        match parse_relay_ports("8554-8654").unwrap() {
            RelayPorts::Range(range) => assert_eq!((range.start, range.end), (8554, 8654)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            parse_relay_ports("ephemeral").unwrap(),
            RelayPorts::Ephemeral
        ));
        assert!(parse_relay_ports("8554").is_err());
    }

    #[test]
    fn test_cli_overrides_file_values() {
        let mut config: AgentConfig = serde_yaml::from_str(
            "broker_url: ws://file.example.com:8080\ncamera:\n  ip: 10.0.0.5\n",
        )
        .unwrap();
        let cli = Cli::parse_from([
            "camlink",
            "agent",
            "--broker-url",
            "ws://cli.example.com:8080",
            "--mode",
            "hybrid",
            "--quality",
            "high",
        ]);
        let Commands::Agent(args) = cli.command else {
            panic!("expected agent subcommand");
        };
        args.apply(&mut config);

        assert_eq!(config.broker_url, "ws://cli.example.com:8080");
        assert_eq!(config.camera.ip, "10.0.0.5");
        assert_eq!(config.camera.port, 554);
        assert_eq!(config.mode, ConnectionMode::Hybrid);
        assert_eq!(config.quality, StreamQuality::High);
    }
}
