//! HTTP server for the Weft gateway (axum).
//!
//! Serves `/health` and `/v1/chat/completions` behind the API-key middleware;
//! `/v1/admin`, `/v1/portal`, and `/dashboard` prefixes are reserved for the
//! delegated management handlers and skip key auth here.
//!
//! **Public API**: [`run_serve`], [`run_serve_on_listener`], [`AppState`].

mod app;
mod auth;
mod chat;
mod response;

pub use app::AppState;

use std::sync::Arc;

use config::Settings;
use tokio::net::TcpListener;
use tracing::info;

use app::router;

/// Runs the gateway on an existing listener. Used by tests (bind to
/// `127.0.0.1:0`, then pass the listener). Returns after graceful shutdown.
pub async fn run_serve_on_listener(
    listener: TcpListener,
    state: Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    info!("weft gateway listening on http://{}", addr);

    let recorder = state.recorder.clone();
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Flush what the recorder still holds, then cancel its timer.
    recorder.flush().await;
    recorder.stop();
    info!("weft gateway stopped");
    Ok(())
}

/// Binds `settings.addr`, wires the collaborator set, and serves until
/// SIGTERM/ctrl-c.
pub async fn run_serve(
    settings: &Settings,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = AppState::from_settings(settings).await?;
    let listener = TcpListener::bind(&settings.addr).await?;
    run_serve_on_listener(listener, state).await
}

/// Completes on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
