//! WebSocket clients for listeners and producers
//!
//! Both clients run on a tokio task that owns the socket, reconnects with
//! exponential backoff and reports what happens on an event channel. The
//! caller keeps a [`ClientHandle`] to send commands and request shutdown.

pub mod identity;
pub mod listener;
pub mod producer;

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::error::NetworkError;
use crate::protocol::{ClientMessage, CommandType, DeviceId, Role};

pub use identity::{DeviceIdentity, FileIdentity, StaticIdentity};
pub use listener::ListenerClient;
pub use producer::ProducerClient;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WsStream, Message>;

/// What a client observed on its connection
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Registered { device_id: DeviceId, role: Role },
    /// Listener side: the producer came online
    ProducerConnected { device_id: DeviceId },
    ProducerDisconnected { device_id: DeviceId },
    /// Producer side: current number of listeners
    ListenersChanged { listeners: usize },
    /// Producer side: a command arrived
    Command { command: CommandType, replay: bool },
    CommandQueued { id: Uuid, command: CommandType },
    StreamingChanged(bool),
    RecordingChanged(bool),
    /// Round trip of the last application ping
    Ping(Duration),
    ServerError(String),
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
}

/// Control side of a running client task
pub struct ClientHandle {
    outgoing: mpsc::Sender<ClientMessage>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<Result<(), NetworkError>>,
}

impl ClientHandle {
    /// Ask a producer to act on a command, queued by the relay while it is
    /// offline
    pub async fn send_command(
        &self,
        device_id: &str,
        command: CommandType,
        data: serde_json::Value,
    ) -> Result<(), NetworkError> {
        self.outgoing
            .send(ClientMessage::Command {
                command,
                data,
                device_id: device_id.to_string(),
            })
            .await
            .map_err(|_| NetworkError::Closed)
    }

    /// Next event, or `None` once the client task has ended
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Event without waiting
    pub fn try_event(&mut self) -> Option<ClientEvent> {
        self.events.try_recv().ok()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the connection and wait for the client task
    pub async fn shutdown(self) -> Result<(), NetworkError> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(NetworkError::ConnectionFailed(e.to_string())),
        }
    }
}

/// Channels a client task works with
pub(crate) struct ClientChannels {
    pub outgoing: mpsc::Receiver<ClientMessage>,
    pub events: mpsc::UnboundedSender<ClientEvent>,
    pub shutdown: watch::Receiver<bool>,
}

impl ClientChannels {
    pub fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

/// Spawn a client task with fresh channels
pub(crate) fn spawn_client<F, Fut>(run: F) -> ClientHandle
where
    F: FnOnce(ClientChannels) -> Fut,
    Fut: std::future::Future<Output = Result<(), NetworkError>> + Send + 'static,
{
    let (outgoing_tx, outgoing_rx) = mpsc::channel(32);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(run(ClientChannels {
        outgoing: outgoing_rx,
        events: events_tx,
        shutdown: shutdown_rx,
    }));

    ClientHandle {
        outgoing: outgoing_tx,
        events: events_rx,
        shutdown: shutdown_tx,
        task,
    }
}

/// Exponential reconnect delay
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, doubling up to the maximum
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        self.attempt += 1;
        delay
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }
}

/// Why a connected session ended
#[derive(Debug)]
pub(crate) enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// Validate a relay URL
pub(crate) fn check_url(url: &str) -> Result<(), NetworkError> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(())
    } else {
        Err(NetworkError::InvalidUrl(url.to_string()))
    }
}

pub(crate) async fn connect(url: &str) -> Result<WsStream, NetworkError> {
    let (ws, _response) = connect_async(url)
        .await
        .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", url, e)))?;
    tracing::info!("Connected to {}", url);
    Ok(ws)
}

pub(crate) async fn send_json(sink: &mut WsSink, message: &ClientMessage) -> Result<(), NetworkError> {
    let text = message
        .to_json()
        .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}

/// Wait out a reconnect delay; returns `false` if shutdown was requested
pub(crate) async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

/// Resolves once shutdown is requested or the handle is gone
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Round trip of a ping echoed by the relay
pub(crate) fn round_trip(sent_ms: i64, now_ms: i64) -> Duration {
    Duration::from_millis(now_ms.saturating_sub(sent_ms).max(0) as u64)
}
