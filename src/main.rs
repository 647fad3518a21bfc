//! bacnet-events - forwards BACnet change events from the event broker
//!
//! Usage:
//!   bacnet-events [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Configuration file path
//!   -l, --log-level <LEVEL>  Log filter, overrides RUST_LOG and the configured level
//!   -h, --help               Print help
//!
//! Every forwarded message is written to stdout as one JSON object per line.

use bacnet_events::mqtt::transport::RumqttTransport;
use bacnet_events::{Config, EventsNode, ForwardedMessage};
use clap::Parser;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "bacnet-events", version, about)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `bacnet_events=trace`
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup()?;

    let path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };
    let config = Config::load(&path)
        .await
        .wrap_err_with(|| format!("Unable to load configuration from {}", path.display()))?;

    setup_logging_env(cli.log_level.as_deref(), &config.logging.level);
    info!("Configuration loaded from {}", path.display());

    let (downstream_tx, mut downstream_rx) =
        mpsc::channel::<ForwardedMessage>(config.mqtt.channel_capacity);

    let consumer = tokio::spawn(async move {
        while let Some(message) = downstream_rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Unable to serialize forwarded message: {}", e),
            }
        }
    });

    let node = EventsNode::create(config, Arc::new(RumqttTransport), downstream_tx).start();

    tokio::signal::ctrl_c()
        .await
        .wrap_err("Unable to listen for shutdown signal")?;
    info!("Shutdown requested");

    // Dropping the stopped node releases the last downstream sender.
    drop(node.shutdown().await);
    consumer.await?;

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

/// The CLI level wins over `RUST_LOG`, which wins over the configured level.
fn setup_logging_env(cli_level: Option<&str>, configured_level: &str) {
    let filter = match cli_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(configured_level)),
    };

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .pretty()
        .init();
}
