mod config;
mod routes;

use clap::Parser;
use tracing::info;

use opensync_transfer::{ReceiverConfig, receiver};

use crate::config::Args;
use crate::routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(
            |_| "opensyncd=debug,opensync_transfer=info,tower_http=debug".into(),
        ))
        .init();

    let args = Args::parse();

    std::fs::create_dir_all(&args.download_dir)?;

    // The receive side runs for the life of the process; failing to bind is fatal.
    let receiver_config = ReceiverConfig {
        output_dir: args.download_dir.clone(),
        ..ReceiverConfig::default()
    };
    let receiver = receiver::bind(args.udp_addr(), receiver_config).await?;
    info!(
        "UDP receiver bound on {}, writing to {}",
        receiver.local_addr(),
        args.download_dir.display()
    );

    let app = routes::router(AppState::default());

    let addr = args.api_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("OpenSync control plane listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    receiver.shutdown();
    info!("receiver stopped ({} transfers in flight dropped)", receiver.active_sessions().await);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::warn!("failed to install SIGTERM handler: {}", e);
                    ctrl_c.await.ok();
                    info!("Received Ctrl+C, shutting down...");
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
