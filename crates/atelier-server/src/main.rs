//! The `atelierd` binary: compose the core, start the background tasks, and
//! serve the edge until shutdown.

use atelier_server::{routes, Core, ServerConfig};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,atelier=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env();
    let listen_addr = config.listen_addr;
    let core = Arc::new(
        Core::build(config)
            .await
            .map_err(|e| anyhow::anyhow!("core composition failed: {e}"))?,
    );
    core.spawn_background();

    let app = routes::router(core.clone());
    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!(%listen_addr, "atelierd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("atelierd shutting down");
    core.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("received terminate signal, starting graceful shutdown");
        }
    }
}
