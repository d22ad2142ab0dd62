//! Listener client
//!
//! Subscribes to one producer on the relay and feeds the received frames into
//! a stream's jitter buffer. Connection state is mirrored into the stream's
//! diagnostics.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::config::ClientConfig;
use crate::diagnostics::{StreamDiagnostics, WsStatus};
use crate::error::NetworkError;
use crate::network::{
    check_url, connect, round_trip, send_json, shutdown_requested, spawn_client, wait_or_shutdown,
    Backoff, ClientChannels, ClientEvent, ClientHandle, SessionEnd, WsStream,
};
use crate::protocol::{now_ms, ClientMessage, DeviceId, ServerMessage};
use crate::stream::FrameIngest;

/// Relay connection of a listening device
pub struct ListenerClient {
    config: ClientConfig,
    device_id: DeviceId,
    ingest: FrameIngest,
}

impl ListenerClient {
    /// Listen to `device_id`, delivering its frames to `ingest`
    pub fn new(
        config: ClientConfig,
        device_id: impl Into<DeviceId>,
        ingest: FrameIngest,
    ) -> Result<Self, NetworkError> {
        check_url(&config.server_url)?;
        Ok(Self {
            config,
            device_id: device_id.into(),
            ingest,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Run the client on the tokio runtime
    pub fn spawn(self) -> ClientHandle {
        spawn_client(move |channels| self.run(channels))
    }

    async fn run(self, mut ch: ClientChannels) -> Result<(), NetworkError> {
        let diagnostics = self.ingest.diagnostics().clone();
        let mut backoff = Backoff::new(
            self.config.reconnect_delay(),
            self.config.max_reconnect_delay(),
        );

        loop {
            diagnostics.set_ws_status(WsStatus::Connecting);
            match connect(&self.config.server_url).await {
                Ok(ws) => {
                    backoff.reset();
                    diagnostics.set_ws_status(WsStatus::Connected);
                    ch.emit(ClientEvent::Connected);

                    let end = self.session(ws, &mut ch, &diagnostics).await;
                    ch.emit(ClientEvent::Disconnected);
                    match end {
                        Ok(SessionEnd::Shutdown) => break,
                        Ok(SessionEnd::Lost(reason)) => {
                            tracing::warn!("Connection to relay lost: {}", reason)
                        }
                        Err(e) => tracing::warn!("Connection to relay failed: {}", e),
                    }
                }
                Err(e) => {
                    tracing::warn!("{}", e);
                    if !self.config.reconnect {
                        diagnostics.set_ws_status(WsStatus::Error);
                        return Err(e);
                    }
                }
            }

            if !self.config.reconnect {
                break;
            }
            let delay = backoff.next_delay();
            diagnostics.set_ws_status(WsStatus::Retrying);
            ch.emit(ClientEvent::Reconnecting {
                attempt: backoff.attempt(),
                delay,
            });
            tracing::info!("Reconnecting in {:?} (attempt {})", delay, backoff.attempt());
            if !wait_or_shutdown(delay, &mut ch.shutdown).await {
                break;
            }
        }

        diagnostics.set_ws_status(WsStatus::Disconnected);
        Ok(())
    }

    async fn session(
        &self,
        ws: WsStream,
        ch: &mut ClientChannels,
        diagnostics: &Arc<StreamDiagnostics>,
    ) -> Result<SessionEnd, NetworkError> {
        let (mut sink, mut stream) = ws.split();
        send_json(
            &mut sink,
            &ClientMessage::RegisterListener {
                device_id: self.device_id.clone(),
            },
        )
        .await?;

        let mut ping = tokio::time::interval(self.config.ping_interval());
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut ch.shutdown) => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
                Some(msg) = ch.outgoing.recv() => send_json(&mut sink, &msg).await?,
                _ = ping.tick() => {
                    send_json(&mut sink, &ClientMessage::Ping { timestamp_ms: now_ms() }).await?;
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        if let Err(e) = self.ingest.push_bytes(Bytes::from(data)) {
                            tracing::debug!("Dropping undecodable frame: {}", e);
                        }
                    }
                    Some(Ok(Message::Text(text))) => self.handle_message(&text, ch, diagnostics),
                    Some(Ok(Message::Close(_))) | None => {
                        return Ok(SessionEnd::Lost("closed by relay".to_string()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Ok(SessionEnd::Lost(e.to_string())),
                },
            }
        }
    }

    fn handle_message(&self, text: &str, ch: &ClientChannels, diagnostics: &StreamDiagnostics) {
        let msg = match ServerMessage::from_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("Ignoring malformed relay message: {}", e);
                return;
            }
        };

        match msg {
            ServerMessage::Registered { device_id, role } => {
                tracing::info!("Listening to {}", device_id);
                ch.emit(ClientEvent::Registered { device_id, role });
            }
            ServerMessage::ProducerConnected { device_id } => {
                tracing::info!("Producer {} is online", device_id);
                ch.emit(ClientEvent::ProducerConnected { device_id });
            }
            ServerMessage::ProducerDisconnected { device_id } => {
                tracing::info!("Producer {} went offline", device_id);
                ch.emit(ClientEvent::ProducerDisconnected { device_id });
            }
            ServerMessage::CommandQueued { id, command, .. } => {
                tracing::info!("{:?} queued until the producer reconnects", command);
                ch.emit(ClientEvent::CommandQueued { id, command });
            }
            ServerMessage::Pong { timestamp_ms } => {
                let rtt = round_trip(timestamp_ms, now_ms());
                diagnostics.set_ping(rtt);
                ch.emit(ClientEvent::Ping(rtt));
            }
            ServerMessage::Error { message } => {
                tracing::warn!("Relay error: {}", message);
                ch.emit(ClientEvent::ServerError(message));
            }
            other => tracing::debug!("Unhandled relay message: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SharedEnhancerConfig;
    use crate::config::PlaybackConfig;
    use crate::diagnostics::QualityThresholds;
    use crate::stream::ListenStream;
    use std::time::Duration;

    fn stream() -> ListenStream {
        ListenStream::new(
            "dev-1",
            &PlaybackConfig::default(),
            SharedEnhancerConfig::default(),
            QualityThresholds::default(),
        )
    }

    #[test]
    fn test_rejects_non_websocket_url() {
        let config = ClientConfig {
            server_url: "http://127.0.0.1:3000".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            ListenerClient::new(config, "dev-1", stream().ingest()),
            Err(NetworkError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_relay_without_reconnect() {
        // Port 1 on loopback refuses connections
        let config = ClientConfig {
            server_url: "ws://127.0.0.1:1/ws".to_string(),
            reconnect: false,
            ..Default::default()
        };
        let stream = stream();
        let client = ListenerClient::new(config, "dev-1", stream.ingest()).unwrap();
        let handle = client.spawn();

        let result = tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .unwrap();
        assert!(matches!(result, Err(NetworkError::ConnectionFailed(_))));
        assert_eq!(stream.diagnostics().ws_status(), WsStatus::Error);
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff() {
        let config = ClientConfig {
            server_url: "ws://127.0.0.1:1/ws".to_string(),
            reconnect_delay_ms: 60_000,
            max_reconnect_delay_ms: 60_000,
            ..Default::default()
        };
        let stream = stream();
        let mut handle = ListenerClient::new(config, "dev-1", stream.ingest())
            .unwrap()
            .spawn();

        let event = tokio::time::timeout(Duration::from_secs(5), handle.next_event())
            .await
            .unwrap();
        assert!(matches!(event, Some(ClientEvent::Reconnecting { attempt: 1, .. })));
        assert_eq!(stream.diagnostics().ws_status(), WsStatus::Retrying);

        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stream.diagnostics().ws_status(), WsStatus::Disconnected);
    }
}
