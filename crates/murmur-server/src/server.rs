use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use murmur_core::Handshake;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::bridge;
use crate::client::{self, ClientRegistry};
use crate::config::ServerConfig;
use crate::connection;
use crate::services::Services;

const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub registry: Arc<ClientRegistry>,
    pub config: Arc<ServerConfig>,
    pub shutdown: CancellationToken,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Start serving. Returns once the listener is bound.
pub async fn start(config: ServerConfig, services: Services) -> Result<ServerHandle, std::io::Error> {
    let shutdown = CancellationToken::new();
    let registry = Arc::new(ClientRegistry::new(config.max_send_queue));
    let mut tasks = Vec::new();

    // Subscribe before the bus starts pumping so nothing published after
    // startup is missed.
    let bridge_rx = services.bus.subscribe();
    tasks.push(bridge::create_bridge(
        Arc::clone(&registry),
        bridge_rx,
        shutdown.clone(),
    ));

    match Arc::clone(&services.bus).start(shutdown.clone()).await {
        Ok(Some(handle)) => tasks.push(handle),
        Ok(None) => {}
        Err(e) => return Err(std::io::Error::other(e)),
    }

    let cleanup = client::start_cleanup_task(
        Arc::clone(&registry),
        config.heartbeat_interval(),
        config.client_timeout(),
    );

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let local_addr = listener.local_addr()?;

    let state = AppState {
        services,
        registry: Arc::clone(&registry),
        config: Arc::new(config),
        shutdown: shutdown.clone(),
    };
    let router = build_router(state);

    tracing::info!(addr = %local_addr, pid = std::process::id(), "Chat server listening");

    let serve_shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Server exited with error");
        }
    }));

    Ok(ServerHandle {
        port: local_addr.port(),
        registry,
        shutdown,
        tasks,
        cleanup,
    })
}

/// Handle returned by `start()`. Dropping it leaves the server running.
pub struct ServerHandle {
    pub port: u16,
    registry: Arc<ClientRegistry>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    cleanup: JoinHandle<()>,
}

impl ServerHandle {
    /// Number of live connections.
    pub fn connections(&self) -> usize {
        self.registry.count()
    }

    /// Stop accepting connections, close open ones, and wait for background
    /// tasks to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.cleanup.abort();
        for task in self.tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                tracing::warn!("Background task did not stop in time");
            }
        }
        tracing::info!("Chat server stopped");
    }
}

/// WebSocket upgrade handler. The handshake travels in the query string.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(handshake): Query<Handshake>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let heartbeat = state.config.heartbeat_interval();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| {
            connection::handle_connection(
                socket,
                handshake,
                state.services,
                state.registry,
                heartbeat,
                state.shutdown,
            )
        })
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.services.sessions.count().await {
        Ok(sessions) => (
            axum::http::StatusCode::OK,
            axum::Json(serde_json::json!({
                "status": "healthy",
                "connections": state.registry.count(),
                "sessions": sessions,
            })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed");
            (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(serde_json::json!({
                    "status": "unhealthy",
                    "connections": state.registry.count(),
                    "error": e.to_string(),
                })),
            )
        }
    }
}
