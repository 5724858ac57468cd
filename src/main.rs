use clap::Parser;
use tracing_subscriber::EnvFilter;
use trellis_router::config::RouterConfig;
use trellis_router::Server;

/// Trellis Router — edge proxy for multi-tenant app platforms
#[derive(Parser)]
#[command(name = "trellis-router", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "router.toml")]
    config: String,

    /// Override listen address (e.g., 0.0.0.0:8080)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    tracing::info!("Trellis Router v{}", env!("CARGO_PKG_VERSION"));

    let mut config = if std::path::Path::new(&cli.config).exists() {
        tracing::info!(config = cli.config, "Loading configuration");
        RouterConfig::from_file(&cli.config).await?
    } else {
        tracing::warn!("Config file not found, using defaults");
        RouterConfig::default()
    };

    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let server = Server::new(config)?;
    let (handles, addrs) = server.run().await?;
    for addr in &addrs {
        tracing::info!(address = %addr, "serving");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    for handle in handles {
        handle.abort();
    }

    Ok(())
}
