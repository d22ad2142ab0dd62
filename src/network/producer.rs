//! Producer client
//!
//! Registers a monitored device with the relay and streams frames from a
//! [`FrameSource`] while listeners ask for them. Streaming is driven entirely
//! by relay commands, including the `start_stream` replayed after a reconnect.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::audio::capture::{FrameSource, SOURCE_QUEUE_FRAMES};
use crate::audio::AudioFrame;
use crate::config::ClientConfig;
use crate::error::NetworkError;
use crate::network::{
    check_url, connect, round_trip, send_json, shutdown_requested, spawn_client, wait_or_shutdown,
    Backoff, ClientChannels, ClientEvent, ClientHandle, SessionEnd, WsSink, WsStream,
};
use crate::protocol::{encode_frame, now_ms, ClientMessage, CommandType, DeviceId, ServerMessage};

/// Relay connection of a monitored device
pub struct ProducerClient {
    config: ClientConfig,
    device_id: DeviceId,
    source: Box<dyn FrameSource>,
    frames: Option<mpsc::Receiver<Vec<i16>>>,
    recording: bool,
    sequence: u64,
}

impl ProducerClient {
    pub fn new(
        config: ClientConfig,
        device_id: impl Into<DeviceId>,
        source: Box<dyn FrameSource>,
    ) -> Result<Self, NetworkError> {
        check_url(&config.server_url)?;
        Ok(Self {
            config,
            device_id: device_id.into(),
            source,
            frames: None,
            recording: false,
            sequence: 0,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Run the client on the tokio runtime
    pub fn spawn(self) -> ClientHandle {
        spawn_client(move |channels| self.run(channels))
    }

    async fn run(mut self, mut ch: ClientChannels) -> Result<(), NetworkError> {
        let mut backoff = Backoff::new(
            self.config.reconnect_delay(),
            self.config.max_reconnect_delay(),
        );

        loop {
            match connect(&self.config.server_url).await {
                Ok(ws) => {
                    backoff.reset();
                    ch.emit(ClientEvent::Connected);

                    let end = self.session(ws, &mut ch).await;
                    // The relay replays start_stream if the session is still wanted
                    self.stop_streaming(&ch);
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
                        return Err(e);
                    }
                }
            }

            if !self.config.reconnect {
                break;
            }
            let delay = backoff.next_delay();
            ch.emit(ClientEvent::Reconnecting {
                attempt: backoff.attempt(),
                delay,
            });
            tracing::info!("Reconnecting in {:?} (attempt {})", delay, backoff.attempt());
            if !wait_or_shutdown(delay, &mut ch.shutdown).await {
                break;
            }
        }

        Ok(())
    }

    async fn session(
        &mut self,
        ws: WsStream,
        ch: &mut ClientChannels,
    ) -> Result<SessionEnd, NetworkError> {
        let (mut sink, mut stream) = ws.split();
        send_json(
            &mut sink,
            &ClientMessage::RegisterProducer {
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
                frame = next_frame(&mut self.frames) => match frame {
                    Some(samples) => self.send_frame(&mut sink, &samples).await?,
                    None => {
                        tracing::info!("Frame source ended");
                        self.stop_streaming(ch);
                    }
                },
                Some(msg) = ch.outgoing.recv() => send_json(&mut sink, &msg).await?,
                _ = ping.tick() => {
                    send_json(&mut sink, &ClientMessage::Ping { timestamp_ms: now_ms() }).await?;
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_message(&text, ch),
                    Some(Ok(Message::Close(_))) | None => {
                        return Ok(SessionEnd::Lost("closed by relay".to_string()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Ok(SessionEnd::Lost(e.to_string())),
                },
            }
        }
    }

    async fn send_frame(&mut self, sink: &mut WsSink, samples: &[i16]) -> Result<(), NetworkError> {
        let frame = AudioFrame::from_samples(
            self.device_id.as_str(),
            self.sequence,
            now_ms(),
            samples,
            self.recording,
        );
        self.sequence += 1;
        let wire = encode_frame(&frame).map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        sink.send(Message::Binary(wire.to_vec())).await?;
        Ok(())
    }

    fn handle_message(&mut self, text: &str, ch: &ClientChannels) {
        let msg = match ServerMessage::from_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("Ignoring malformed relay message: {}", e);
                return;
            }
        };

        match msg {
            ServerMessage::Registered { device_id, role } => {
                tracing::info!("Registered {} as producer", device_id);
                ch.emit(ClientEvent::Registered { device_id, role });
            }
            ServerMessage::ProducerLinked { listeners, .. }
            | ServerMessage::ListenerConnected { listeners, .. } => {
                ch.emit(ClientEvent::ListenersChanged { listeners });
            }
            ServerMessage::ListenerDisconnected { listeners, .. } => {
                ch.emit(ClientEvent::ListenersChanged { listeners });
                if listeners == 0 && self.is_streaming() {
                    tracing::info!("Last listener left, stopping stream");
                    self.stop_streaming(ch);
                }
            }
            ServerMessage::Command {
                command,
                data,
                replay,
                ..
            } => {
                if replay {
                    tracing::info!("Resuming stream after reconnect");
                }
                ch.emit(ClientEvent::Command { command, replay });
                self.apply_command(command, &data, ch);
            }
            ServerMessage::Pong { timestamp_ms } => {
                ch.emit(ClientEvent::Ping(round_trip(timestamp_ms, now_ms())));
            }
            ServerMessage::Error { message } => {
                tracing::warn!("Relay error: {}", message);
                ch.emit(ClientEvent::ServerError(message));
            }
            other => tracing::debug!("Unhandled relay message: {:?}", other),
        }
    }

    fn apply_command(&mut self, command: CommandType, data: &serde_json::Value, ch: &ClientChannels) {
        match command {
            CommandType::StartStream => {
                if let Some(recording) = data.get("recording").and_then(|v| v.as_bool()) {
                    self.set_recording(recording, ch);
                }
                if self.is_streaming() {
                    tracing::debug!("Already streaming");
                    return;
                }
                if let Err(e) = self.start_streaming(ch) {
                    tracing::error!("Failed to start frame source: {}", e);
                    ch.emit(ClientEvent::ServerError(e.to_string()));
                }
            }
            CommandType::StopStream => self.stop_streaming(ch),
            CommandType::StartRecording => self.set_recording(true, ch),
            CommandType::StopRecording => self.set_recording(false, ch),
        }
    }

    fn is_streaming(&self) -> bool {
        self.frames.is_some()
    }

    /// Start the source and bridge its frames onto the runtime
    fn start_streaming(&mut self, ch: &ClientChannels) -> Result<(), crate::error::AudioError> {
        let source_rx = self.source.start()?;
        let (tx, rx) = mpsc::channel(SOURCE_QUEUE_FRAMES);
        tokio::task::spawn_blocking(move || {
            while let Ok(frame) = source_rx.recv() {
                if tx.blocking_send(frame).is_err() {
                    break;
                }
            }
        });
        self.frames = Some(rx);
        tracing::info!("Streaming {}", self.device_id);
        ch.emit(ClientEvent::StreamingChanged(true));
        Ok(())
    }

    fn stop_streaming(&mut self, ch: &ClientChannels) {
        // Dropping the receiver first unblocks the bridge, and through it the source
        let was_streaming = self.frames.take().is_some();
        if self.source.is_running() {
            self.source.stop();
        }
        if was_streaming {
            tracing::info!("Stopped streaming {}", self.device_id);
            ch.emit(ClientEvent::StreamingChanged(false));
        }
    }

    fn set_recording(&mut self, recording: bool, ch: &ClientChannels) {
        if self.recording != recording {
            self.recording = recording;
            ch.emit(ClientEvent::RecordingChanged(recording));
        }
    }
}

async fn next_frame(frames: &mut Option<mpsc::Receiver<Vec<i16>>>) -> Option<Vec<i16>> {
    match frames {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
