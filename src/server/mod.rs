//! Relay server
//!
//! Wires the session registry, command queue and relay behind an axum router:
//! the WebSocket endpoint carries the control protocol and audio frames, a
//! small read-only HTTP API exposes sessions and counters.

pub mod commands;
pub mod handlers;
pub mod registry;
pub mod relay;
pub mod socket;
pub mod websocket;

use axum::{routing::get, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

use crate::config::ServerConfig;
use crate::constants::WS_PATH;
use crate::error::{NetworkError, Result};

pub use commands::{Command, CommandQueue, CommandStatus};
pub use registry::{ConnectionId, Outbound, PeerHandle, SessionInfo, SessionRegistry};
pub use relay::{RelayOutcome, RelayStats};

/// Shared state for handlers
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub config: ServerConfig,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let commands = Arc::new(CommandQueue::new(
            config.command_capacity,
            config.session_timeout(),
        ));
        Self {
            registry: Arc::new(SessionRegistry::new(commands)),
            config,
            started_at: Instant::now(),
        }
    }
}

/// Build the router for the given state
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(WS_PATH, get(websocket::ws_handler))
        .route("/api/status", get(handlers::get_status))
        .route("/api/sessions", get(handlers::list_sessions))
        .route("/api/sessions/:device_id", get(handlers::get_session))
        .route(
            "/api/devices/:device_id/commands",
            get(handlers::get_pending_commands),
        )
        .layer(cors)
        .with_state(state)
}

/// Relay server composition root
pub struct RelayServer {
    state: Arc<AppState>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            state: Arc::new(AppState::new(config)),
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.state.registry
    }

    /// Bind the configured address
    pub fn bind(&self) -> Result<tokio::net::TcpListener> {
        let addr = self.state.config.socket_addr()?;
        Ok(socket::bind_listener(addr)?)
    }

    /// Serve on `listener` until `shutdown` completes
    pub async fn serve(
        self,
        listener: tokio::net::TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let local_addr = listener.local_addr()?;
        let sweeper = self
            .state
            .registry
            .commands()
            .spawn_sweeper(self.state.config.sweep_interval());

        tracing::info!("Relay listening on ws://{}{}", local_addr, WS_PATH);

        let app = router(self.state.clone());
        let result: Result<()> = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| NetworkError::ConnectionFailed(e.to_string()).into());

        sweeper.abort();
        tracing::info!("Relay stopped");
        result
    }

    /// Bind and serve until Ctrl-C
    pub async fn run(self) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
    }
}
