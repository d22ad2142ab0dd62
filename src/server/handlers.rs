//! HTTP inspection API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::server::commands::Command;
use crate::server::registry::SessionInfo;
use crate::server::relay::RelayStats;
use crate::server::AppState;

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Relay status
#[derive(Debug, Serialize)]
pub struct RelayStatus {
    pub uptime_seconds: u64,
    pub sessions: usize,
    pub connections: usize,
    pub active_streams: usize,
    pub queued_devices: usize,
    pub commands_evicted: u64,
    pub relay: RelayStats,
}

/// Get relay status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<RelayStatus>> {
    let commands = state.registry.commands();
    let status = RelayStatus {
        uptime_seconds: state.started_at.elapsed().as_secs(),
        sessions: state.registry.session_count(),
        connections: state.registry.connection_count(),
        active_streams: commands.active_sessions(),
        queued_devices: commands.queued_devices(),
        commands_evicted: commands.evicted_count(),
        relay: state.registry.stats(),
    };
    Json(ApiResponse::ok(status))
}

/// List all known devices and their sessions
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<Vec<SessionInfo>>> {
    Json(ApiResponse::ok(state.registry.sessions()))
}

/// Get one device's session
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> (StatusCode, Json<ApiResponse<SessionInfo>>) {
    match state.registry.session_info(&device_id) {
        Some(info) => (StatusCode::OK, Json(ApiResponse::ok(info))),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("No session for {}", device_id))),
        ),
    }
}

/// Pending commands for a device, left in the queue
pub async fn get_pending_commands(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Json<ApiResponse<Vec<Command>>> {
    Json(ApiResponse::ok(state.registry.commands().pending(&device_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::protocol::CommandType;
    use crate::server::registry::PeerHandle;

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(ServerConfig::default()))
    }

    #[tokio::test]
    async fn test_status_counts_sessions() {
        let state = state();
        let (listener, _rx) = PeerHandle::channel(8);
        state.registry.register_listener("dev-1", listener).unwrap();

        let Json(resp) = get_status(State(state)).await;
        assert!(resp.success);
        let status = resp.data.unwrap();
        assert_eq!(status.sessions, 1);
        assert_eq!(status.connections, 1);
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let (code, Json(resp)) = get_session(State(state()), Path("nope".to_string())).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert!(!resp.success);
        assert!(resp.error.is_some());
    }

    #[tokio::test]
    async fn test_pending_commands_are_not_drained() {
        let state = state();
        state
            .registry
            .route_command("dev-1", CommandType::StartStream, serde_json::json!({}))
            .unwrap();

        let Json(resp) = get_pending_commands(State(state.clone()), Path("dev-1".to_string())).await;
        assert_eq!(resp.data.unwrap().len(), 1);
        assert_eq!(state.registry.commands().pending_count("dev-1"), 1);
    }

    #[test]
    fn test_error_response_omits_data() {
        let json = serde_json::to_value(ApiResponse::<()>::error("boom")).unwrap();
        assert_eq!(json, serde_json::json!({ "success": false, "error": "boom" }));
    }
}
