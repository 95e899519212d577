use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tunnel_relay::{
    ClientConfig, FileConfig, HttpForwarder, Relay, RelayConfig, Supervisor,
    cli::{Cli, Command},
    load_config,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(cli.log_level.parse()?)
                .from_env_lossy(),
        )
        .init();

    let file = match &cli.config {
        Some(path) => {
            let file = load_config(path)?;
            info!(config_file = %path.display(), "Configuration loaded");
            file
        }
        None => FileConfig::default(),
    };

    match cli.command {
        Command::Relay(args) => {
            let config = RelayConfig::new(&args, &file.relay)?;
            Relay::bind(config).await?.run(shutdown_signal()).await?;
        }
        Command::Client(args) => {
            let config = ClientConfig::new(&args, &file.client);
            let forwarder = HttpForwarder::new(config.local_host.clone(), config.local_port);
            Supervisor::new(config, forwarder).run(shutdown_signal()).await;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "Failed to register SIGTERM handler"),
        }
    }

    let _ = tokio::signal::ctrl_c().await;
    info!("Received SIGINT, shutting down");
}
