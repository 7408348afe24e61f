//! pulse-node: smart-meter ingestion node
//!
//! Subscribes to meter readings, prices them, stores predictions and logs
//! them to the ledger. `pulse-node simulate` runs synthetic meters instead.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use pulse_node::api::{create_router, AppState};
use pulse_node::config::Config;
use pulse_node::node::Services;
use pulse_node::simulator;
use pulse_node::store::{MemoryStore, SqliteStore, Stores};
use pulse_node::transport::MeterTransport;

#[derive(Parser)]
#[command(name = "pulse-node")]
#[command(about = "Smart-meter ingestion node with a hash-chained prediction ledger")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "pulse-node.toml", env = "PULSE_CONFIG")]
    config: PathBuf,

    /// Data directory
    #[arg(short, long, env = "PULSE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// NATS server URL (overrides config file)
    #[arg(long, env = "PULSE_NATS_URL")]
    nats_url: Option<String>,

    /// HTTP API port (overrides config file)
    #[arg(long, env = "PULSE_HTTP_PORT")]
    http_port: Option<u16>,

    /// Log level for the pulse_node target
    #[arg(long, default_value = "info", env = "PULSE_LOG_LEVEL")]
    log_level: String,

    /// Keep all records in memory instead of SQLite
    #[arg(long)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Publish synthetic meter readings to NATS
    Simulate {
        /// Meter ids to simulate (defaults to household_1..5)
        #[arg(long, value_delimiter = ',')]
        meters: Vec<String>,

        /// Seconds between publishing rounds
        #[arg(long, default_value_t = 30)]
        interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("pulse_node={}", cli.log_level).parse()?),
        )
        .init();

    info!("Starting pulse-node");
    info!("Config file: {}", cli.config.display());

    let mut config = Config::load(&cli.config)?;

    // Apply CLI overrides
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = data_dir;
    }
    if let Some(nats_url) = cli.nats_url {
        config.transport.nats_url = nats_url;
    }
    if let Some(http_port) = cli.http_port {
        config.api.http_port = http_port;
    }
    config.validate()?;

    if let Some(Command::Simulate {
        meters,
        interval_secs,
    }) = cli.command
    {
        let meters = if meters.is_empty() {
            simulator::default_meters()
        } else {
            meters
        };
        let transport =
            MeterTransport::connect(&config.transport, &format!("{}-simulator", config.node.id))
                .await?;
        simulator::run(&transport, &meters, Duration::from_secs(interval_secs.max(1))).await?;
        return Ok(());
    }

    info!("Node ID: {}", config.node.id);

    let stores = if cli.ephemeral {
        info!("Ephemeral mode, records are kept in memory");
        Stores::from_backend(Arc::new(MemoryStore::new()))
    } else {
        info!("Data dir: {}", config.node.data_dir.display());
        Stores::from_backend(Arc::new(SqliteStore::new(&config.node.data_dir)?))
    };

    let services = Services::build(&config, stores);
    services.seed(&config).await?;

    // --- Meter transport ---
    if config.transport.enabled {
        match MeterTransport::connect(&config.transport, &config.node.id).await {
            Ok(transport) => {
                let gateway = services.gateway.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.run(gateway).await {
                        error!(error = %e, "Meter transport stopped");
                    }
                });
                info!("Meter transport started");
            }
            Err(e) => {
                warn!(error = %e, "NATS unavailable, continuing with HTTP ingestion only");
            }
        }
    } else {
        info!("Meter transport is disabled");
    }

    let app = create_router(Arc::new(AppState {
        node_id: config.node.id.clone(),
        services,
    }));

    // Bind to HTTP port
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api.http_port));
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
