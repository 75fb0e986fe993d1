//! Server startup and graceful shutdown.

use crate::{routes::create_router, state::AppState};
use gateway_core::GatewayError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

/// Bind the configured address and serve until a shutdown signal arrives.
///
/// Also spawns the stale batch-window sweeper for the lifetime of the
/// process.
///
/// # Errors
/// Returns an error when the listener cannot bind or the server fails.
pub async fn serve(state: AppState) -> Result<(), GatewayError> {
    let addr: SocketAddr = format!("{}:{}", state.config.server.host, state.config.server.port)
        .parse()
        .map_err(|e| GatewayError::internal(format!("invalid bind address: {e}")))?;

    if state.config.batch.enabled {
        tokio::spawn(Arc::clone(&state.batcher).run_sweeper());
    }

    let app = create_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::internal(format!("bind {addr}: {e}")))?;

    info!(%addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| GatewayError::internal(format!("server error: {e}")))?;

    info!("gateway stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
