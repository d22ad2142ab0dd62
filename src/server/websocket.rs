//! WebSocket endpoint
//!
//! Each connection runs a reader loop on the accepting task and a writer task
//! fed by the connection's bounded outbound queue. The writer also sends the
//! heartbeat pings; the reader closes connections that stay silent for too
//! many heartbeat intervals.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum_extra::headers::UserAgent;
use axum_extra::TypedHeader;
use bytes::Bytes;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::RegistryError;
use crate::protocol::{decode_frame, ClientMessage, ServerMessage};
use crate::server::registry::{CommandRouting, Outbound, PeerHandle};
use crate::server::relay::RelayOutcome;
use crate::server::AppState;

/// Time the writer gets to flush queued messages after the reader ends
const WRITER_SHUTDOWN: Duration = Duration::from_secs(5);

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    user_agent: Option<TypedHeader<UserAgent>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let agent = user_agent
        .map(|TypedHeader(ua)| ua.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    tracing::debug!("WebSocket upgrade from {} ({})", addr, agent);

    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let (peer, outbound_rx) = PeerHandle::channel(state.config.outbound_queue);
    let (sink, mut stream) = socket.split();
    tracing::info!("Connection {} opened from {}", peer.id(), addr);

    let writer = tokio::spawn(write_loop(
        sink,
        outbound_rx,
        state.config.heartbeat_interval(),
    ));

    let idle_timeout = state.config.idle_timeout();
    let mut warned_unbound = false;

    loop {
        let next = match tokio::time::timeout(idle_timeout, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                tracing::warn!(
                    "Connection {} silent for {:?}, closing",
                    peer.id(),
                    idle_timeout
                );
                break;
            }
        };

        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                tracing::debug!("Connection {} read error: {}", peer.id(), e);
                break;
            }
            None => break,
        };

        match msg {
            Message::Text(text) => handle_control(&state, &peer, &text),
            Message::Binary(data) => {
                let data = Bytes::from(data);
                let frame = match decode_frame(data.clone()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::debug!("Bad frame from {}: {}", peer.id(), e);
                        continue;
                    }
                };
                let outcome = state.registry.relay_frame(peer.id(), frame.producer_id(), data);
                if outcome == RelayOutcome::Unregistered && !warned_unbound {
                    warned_unbound = true;
                    let err = RegistryError::NotProducer(frame.producer_id().to_string());
                    tracing::warn!("Connection {}: {}", peer.id(), err);
                    peer.notify(ServerMessage::Error {
                        message: err.to_string(),
                    });
                }
            }
            // Pings are answered by the WebSocket layer; any traffic counts as alive
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
        }
    }

    let role = state.registry.unregister(peer.id());
    peer.close();
    drop(peer);
    let mut writer = writer;
    if tokio::time::timeout(WRITER_SHUTDOWN, &mut writer).await.is_err() {
        writer.abort();
    }
    tracing::info!("Connection from {} closed (role {:?})", addr, role);
}

fn handle_control(state: &AppState, peer: &PeerHandle, text: &str) {
    let msg = match ClientMessage::from_json(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!("Malformed message from {}: {}", peer.id(), e);
            peer.notify(ServerMessage::Error {
                message: e.to_string(),
            });
            return;
        }
    };

    let result = match msg {
        ClientMessage::RegisterProducer { device_id } => state
            .registry
            .register_producer(&device_id, peer.clone())
            .map(|_| ()),
        ClientMessage::RegisterListener { device_id } => state
            .registry
            .register_listener(&device_id, peer.clone())
            .map(|_| ()),
        ClientMessage::Command {
            command,
            data,
            device_id,
        } => state
            .registry
            .authorize_command(peer.id())
            .and_then(|()| state.registry.route_command(&device_id, command, data))
            .map(|routing| {
                if let CommandRouting::Queued(cmd) = routing {
                    peer.notify(ServerMessage::CommandQueued {
                        id: cmd.id,
                        device_id,
                        command: cmd.command,
                    });
                }
            }),
        ClientMessage::Ping { timestamp_ms } => {
            peer.notify(ServerMessage::Pong { timestamp_ms });
            Ok(())
        }
    };

    if let Err(e) = result {
        tracing::warn!("Rejected message from {}: {}", peer.id(), e);
        peer.notify(ServerMessage::Error {
            message: e.to_string(),
        });
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    heartbeat: Duration,
) {
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;

    loop {
        let message = tokio::select! {
            item = outbound.recv() => match item {
                Some(Outbound::Message(msg)) => match msg.to_json() {
                    Ok(json) => Message::Text(json),
                    Err(e) => {
                        tracing::error!("Failed to encode {:?}: {}", msg, e);
                        continue;
                    }
                },
                Some(Outbound::Frame(data)) => Message::Binary(data.to_vec()),
                Some(Outbound::Close) | None => break,
            },
            _ = ticker.tick() => Message::Ping(Vec::new()),
        };

        if sink.send(message).await.is_err() {
            break;
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}
