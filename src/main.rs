//! JobPulse - real-time job event fan-out server
//!
//! Usage:
//!   jobpulse [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Configuration file path
//!   -b, --bind <ADDR>        WebSocket bind address (default: 0.0.0.0:8765)
//!   --ws-path <PATH>         WebSocket endpoint path (default: /ws)
//!   --pubsub-url <URL>       Redis URL of the event transport
//!   --namespace <NAME>       Topic namespace (default: websocket)
//!   -l, --log-level          Log level (error, warn, info, debug, trace)
//!   -h, --help               Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use jobpulse::config::Config;
use jobpulse::hub::Hub;
use jobpulse::metrics::{Metrics, MetricsServer};
use jobpulse::pubsub;
use jobpulse::server::Server;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// JobPulse - real-time job event fan-out over WebSocket
#[derive(Parser, Debug)]
#[command(name = "jobpulse")]
#[command(author = "JobPulse Contributors")]
#[command(version)]
#[command(about = "Real-time job event fan-out over WebSocket")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// WebSocket endpoint path
    #[arg(long)]
    ws_path: Option<String>,

    /// Redis URL of the event transport
    #[arg(long)]
    pubsub_url: Option<String>,

    /// Topic namespace events are published under
    #[arg(long)]
    namespace: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Missing file falls back to defaults plus JOBPULSE__* overrides
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config, config overrides default (info)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(ws_path) = args.ws_path {
        config.server.ws_path = ws_path;
    }
    if let Some(url) = args.pubsub_url {
        config.pubsub.url = url;
    }
    if let Some(namespace) = args.namespace {
        config.pubsub.namespace = namespace;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    info!("Starting JobPulse");
    info!("  Bind address: {}", config.server.bind);
    info!("  WebSocket path: {}", config.server.ws_path);
    info!(
        "  Pub/sub: {:?} (pattern {})",
        config.pubsub.backend,
        config.pubsub.pattern()
    );
    info!("  Max connections: {}", config.limits.max_connections);
    info!(
        "  Heartbeat: ping after {:?} idle, {:?} to answer",
        config.heartbeat.idle_interval, config.heartbeat.pong_timeout
    );

    let transport = match pubsub::connect(&config.pubsub).await {
        Ok(transport) => transport,
        Err(e) => {
            eprintln!("Error connecting to pub/sub transport: {}", e);
            std::process::exit(1);
        }
    };

    let metrics = config.metrics.enabled.then(|| Arc::new(Metrics::new()));
    let metrics_bind = config.metrics.bind;
    let hub = Hub::new(config, transport, metrics.clone());

    if let Some(metrics) = metrics {
        info!("  Metrics: enabled (http://{})", metrics_bind);
        let ready = Arc::downgrade(&hub);
        let metrics_server = MetricsServer::new(metrics, metrics_bind).with_readiness(Arc::new(
            move || ready.upgrade().is_some_and(|hub| hub.is_ready()),
        ));
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                error!("Metrics server error: {}", e);
            }
        });
    } else {
        info!("  Metrics: disabled");
    }

    let server = Server::bind(hub).await?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    Ok(())
}
