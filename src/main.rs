use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use dispatchd::bootstrap::Server;
use dispatchd::config::Config;
use dispatchd::telemetry::{init_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(name = "dispatchd")]
#[command(author, version, about = "Multi-channel outbound message dispatch engine")]
struct Args {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Validate config and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (to get log settings)
    let config = Config::load(&args.config)?;

    init_tracing(&TracingConfig::from_config(&config))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "starting dispatchd"
    );

    info!(
        vendors = config.vendors.len(),
        selector_channels = config.selector.len(),
        templates = config.templates.len(),
        "configuration loaded"
    );

    // Validate only mode
    if args.validate {
        info!("configuration is valid");
        return Ok(());
    }

    Server::new(config, args.config).run().await
}
