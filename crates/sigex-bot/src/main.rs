//! Signal-to-order execution bot - entry point.

use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;

use sigex_bot::{AppConfig, Application};

/// Signal-to-order execution bot
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via SIGEX_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    sigex_telemetry::init_logging()?;

    info!("Starting sigex-bot v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > SIGEX_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("SIGEX_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");
    let config = AppConfig::from_file(&config_path)?;
    info!(mode = ?config.mode, instruments = config.watchlist.len(), "Configuration loaded");

    if !config.is_paper_mode() {
        bail!("live mode needs an exchange transport supplied through Application::new; this binary only runs paper mode");
    }

    let app = Application::paper(config)?;
    app.run().await?;

    Ok(())
}
