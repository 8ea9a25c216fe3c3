//! HTTP boundary for Switchboard.
//!
//! Serves the client protocol over a WebSocket at `/ws`, a read-only state
//! snapshot under `/api`, and optionally a static web client.

pub mod connection;
pub mod protocol;
mod routes;
mod websocket;

use std::future::Future;
use std::path::PathBuf;

use axum::{routing::get, Router};
use switchboard_core::StreamManager;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

pub use connection::Connection;
pub use protocol::{ClientAction, ServerMessage};

/// Shared state available to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: StreamManager,
}

impl AppState {
    pub fn new(manager: StreamManager) -> Self {
        Self { manager }
    }
}

/// Build the router. Unmatched paths fall through to `static_dir` when set.
pub fn router(state: AppState, static_dir: Option<PathBuf>) -> Router {
    let mut app = Router::new()
        .route("/ws", get(websocket::ws_handler))
        .route("/api/state", get(routes::state_handler))
        .route("/api/streams", get(routes::streams_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    if let Some(dir) = static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }
    app
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    static_dir: Option<PathBuf>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("HTTP server listening on http://{}", addr);
    }

    axum::serve(listener, router(state, static_dir))
        .with_graceful_shutdown(async move {
            shutdown.await;
            log::info!("HTTP server shutting down");
        })
        .await
}
