//! KiwiDB Server - Redis-compatible server with a replicated write path.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiwidb_server::{Args, ServerInstance};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiwidb_server=info,kiwidb_raft=info,kiwidb_storage=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting KiwiDB server");

    let config = Args::parse().into_config();
    tracing::info!(
        data_dir = %config.data_dir.display(),
        listen = %config.listen_address(),
        advertise = %config.client_address(),
        replicated = config.replicated,
        "configuration loaded"
    );

    let instance = ServerInstance::open(&config).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let shutdown_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl+c");
            return;
        }
        tracing::info!("received shutdown signal");
        let _ = shutdown_signal.send(());
    });

    tracing::info!("server ready, accepting connections");
    match instance.run_until_shutdown(shutdown_rx).await {
        Ok(()) => tracing::info!("server shutdown complete"),
        Err(e) => {
            tracing::error!(error = %e, "server error");
            return Err(e.into());
        }
    }

    Ok(())
}
