//! perpsync daemon - Entry Point

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Client-side state sync daemon for perpetuals trading views
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via PERPSYNC_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // CLI arg > PERPSYNC_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("PERPSYNC_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    let config = perpsync_app::AppConfig::from_file(&config_path)?;
    perpsync_telemetry::init_logging_with_filter(&config.telemetry.log_filter)?;

    info!("Starting perpsync v{}", env!("CARGO_PKG_VERSION"));
    info!(
        config_path = %config_path,
        mode = ?config.mode,
        network = config.network.id,
        users = config.users.len(),
        "Configuration loaded"
    );

    let app = perpsync_app::Application::new(config)?;
    app.run().await?;

    Ok(())
}
