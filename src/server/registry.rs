//! Session registry
//!
//! Maps each producing device to its bound producer connection and to the
//! session of listeners waiting on it. A device's producer binding and session
//! live in one map entry, so every registry operation on a device is
//! serialized by that entry's lock while unrelated devices proceed in
//! parallel. No socket I/O happens under a lock: notifications are queued on
//! the peers' outbound channels after the entry is released.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::protocol::{CommandType, DeviceId, Role, ServerMessage};
use crate::server::commands::{Command, CommandQueue, CommandStatus};
use crate::server::relay::{fan_out, RelayCounters, RelayOutcome, RelayStats};

/// Identifier of one WebSocket connection
pub type ConnectionId = Uuid;

/// Item queued for a connection's writer task
#[derive(Debug, Clone)]
pub enum Outbound {
    Message(ServerMessage),
    /// Binary audio frame, forwarded as received
    Frame(Bytes),
    Close,
}

/// Sending half of a connection, as held by the registry
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
}

impl PeerHandle {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Outbound>) -> Self {
        Self { id, tx }
    }

    /// New handle with a fresh id and an outbound queue of `capacity`
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(Uuid::new_v4(), tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<Outbound> {
        &self.tx
    }

    /// Queue a control message. Returns `false` if it could not be queued.
    pub fn notify(&self, message: ServerMessage) -> bool {
        match self.tx.try_send(Outbound::Message(message)) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Dropping notification for {}: {}", self.id, e);
                false
            }
        }
    }

    /// Ask the writer task to close the connection
    pub fn close(&self) {
        let _ = self.tx.try_send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Live pairing of one producer with its listener set
#[derive(Debug)]
pub struct Session {
    producer_id: DeviceId,
    listeners: HashMap<ConnectionId, PeerHandle>,
    recording: bool,
    started_at: DateTime<Utc>,
    frames_relayed: u64,
}

impl Session {
    fn new(producer_id: &str) -> Self {
        Self {
            producer_id: producer_id.to_string(),
            listeners: HashMap::new(),
            recording: false,
            started_at: Utc::now(),
            frames_relayed: 0,
        }
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn frames_relayed(&self) -> u64 {
        self.frames_relayed
    }
}

#[derive(Debug, Default)]
struct DeviceEntry {
    producer: Option<PeerHandle>,
    session: Option<Session>,
}

impl DeviceEntry {
    fn is_vacant(&self) -> bool {
        self.producer.is_none() && self.session.is_none()
    }
}

/// Serializable view of a device's session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub device_id: DeviceId,
    pub producer_online: bool,
    pub listeners: usize,
    pub recording: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub frames_relayed: u64,
    pub stream_active: bool,
    pub pending_commands: usize,
}

/// Outcome of a producer registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerRegistration {
    /// Listeners that were already waiting
    pub listeners: usize,
    /// Queued commands delivered on registration
    pub delivered: usize,
    /// Whether a StartStream replay was issued
    pub replayed: bool,
    /// Whether an older producer connection was displaced
    pub replaced: bool,
}

/// Outcome of a listener registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerRegistration {
    pub listeners: usize,
    pub producer_online: bool,
}

/// Where a routed command went
#[derive(Debug, Clone)]
pub enum CommandRouting {
    Delivered(Command),
    Queued(Command),
}

/// Producer/listener registry with relay and command routing
pub struct SessionRegistry {
    devices: DashMap<DeviceId, DeviceEntry>,
    connections: DashMap<ConnectionId, (Role, DeviceId)>,
    commands: Arc<CommandQueue>,
    counters: RelayCounters,
}

impl SessionRegistry {
    pub fn new(commands: Arc<CommandQueue>) -> Self {
        Self {
            devices: DashMap::new(),
            connections: DashMap::new(),
            commands,
            counters: RelayCounters::default(),
        }
    }

    pub fn commands(&self) -> &Arc<CommandQueue> {
        &self.commands
    }

    /// Bind `peer` as the producer of `device_id`, replacing any earlier
    /// binding. Delivers queued commands and, when listeners are waiting on an
    /// active stream, a single StartStream replay.
    pub fn register_producer(
        &self,
        device_id: &str,
        peer: PeerHandle,
    ) -> Result<ProducerRegistration, RegistryError> {
        if device_id.trim().is_empty() {
            return Err(RegistryError::MissingDeviceId);
        }
        if self.is_registered_as(peer.id(), Role::Producer, device_id) {
            tracing::debug!("Producer {} already registered for {}", peer.id(), device_id);
            peer.notify(ServerMessage::Registered {
                device_id: device_id.to_string(),
                role: Role::Producer,
            });
            return Ok(ProducerRegistration {
                listeners: self.listener_count(device_id),
                delivered: 0,
                replayed: false,
                replaced: false,
            });
        }
        self.release_previous_role(peer.id());

        let (displaced, waiting) = {
            let mut entry = self.devices.entry(device_id.to_string()).or_default();
            let displaced = entry.producer.replace(peer.clone());
            let waiting: Vec<PeerHandle> = entry
                .session
                .as_ref()
                .map(|s| s.listeners.values().cloned().collect())
                .unwrap_or_default();
            (displaced, waiting)
        };
        self.connections
            .insert(peer.id(), (Role::Producer, device_id.to_string()));

        let replaced = match displaced {
            Some(old) if old.id() != peer.id() => {
                tracing::info!("Producer for {} replaced by {}", device_id, peer.id());
                self.connections.remove(&old.id());
                old.close();
                true
            }
            _ => false,
        };

        peer.notify(ServerMessage::Registered {
            device_id: device_id.to_string(),
            role: Role::Producer,
        });

        let drained = self.commands.drain_pending(device_id);
        let drained_start = drained
            .iter()
            .any(|c| c.command == CommandType::StartStream);
        for cmd in &drained {
            peer.notify(cmd.to_message(false));
        }

        let mut replayed = false;
        if !waiting.is_empty() {
            peer.notify(ServerMessage::ProducerLinked {
                device_id: device_id.to_string(),
                listeners: waiting.len(),
            });
            for listener in &waiting {
                listener.notify(ServerMessage::ProducerConnected {
                    device_id: device_id.to_string(),
                });
            }

            if drained_start {
                self.commands.clear_replay(device_id);
            } else if let Some(replay) = self.commands.take_replay(device_id) {
                tracing::info!("Replaying StartStream to reconnected producer {}", device_id);
                let recording = replay.data["recording"].as_bool().unwrap_or(false);
                self.set_session_recording(device_id, recording);
                peer.notify(replay.to_message(true));
                replayed = true;
            }
        } else {
            self.commands.clear_replay(device_id);
        }

        tracing::info!(
            "Producer {} registered for {} ({} listener(s) waiting, {} queued command(s))",
            peer.id(),
            device_id,
            waiting.len(),
            drained.len()
        );

        Ok(ProducerRegistration {
            listeners: waiting.len(),
            delivered: drained.len(),
            replayed,
            replaced,
        })
    }

    /// Add `peer` to the listener set of `device_id`, creating the session if
    /// absent
    pub fn register_listener(
        &self,
        device_id: &str,
        peer: PeerHandle,
    ) -> Result<ListenerRegistration, RegistryError> {
        if device_id.trim().is_empty() {
            return Err(RegistryError::MissingDeviceId);
        }
        if self.is_registered_as(peer.id(), Role::Listener, device_id) {
            tracing::debug!("Listener {} already registered for {}", peer.id(), device_id);
            peer.notify(ServerMessage::Registered {
                device_id: device_id.to_string(),
                role: Role::Listener,
            });
            return Ok(ListenerRegistration {
                listeners: self.listener_count(device_id),
                producer_online: self.has_producer(device_id),
            });
        }
        self.release_previous_role(peer.id());

        let (listeners, producer) = {
            let mut guard = self.devices.entry(device_id.to_string()).or_default();
            let entry = &mut *guard;
            let session = entry.session.get_or_insert_with(|| {
                tracing::info!("Session created for {}", device_id);
                Session::new(device_id)
            });
            session.listeners.insert(peer.id(), peer.clone());
            (session.listeners.len(), entry.producer.clone())
        };
        self.connections
            .insert(peer.id(), (Role::Listener, device_id.to_string()));
        self.commands.touch(device_id);

        peer.notify(ServerMessage::Registered {
            device_id: device_id.to_string(),
            role: Role::Listener,
        });
        if let Some(producer) = &producer {
            producer.notify(ServerMessage::ListenerConnected {
                device_id: device_id.to_string(),
                listeners,
            });
            peer.notify(ServerMessage::ProducerConnected {
                device_id: device_id.to_string(),
            });
        }

        tracing::info!(
            "Listener {} registered for {} ({} listener(s), producer {})",
            peer.id(),
            device_id,
            listeners,
            if producer.is_some() { "online" } else { "offline" }
        );

        Ok(ListenerRegistration {
            listeners,
            producer_online: producer.is_some(),
        })
    }

    /// Forward a producer's binary message to every listener of its device.
    ///
    /// `device_id` is the device named in the frame header. Frames from a
    /// connection that is not that device's bound producer, or for a device
    /// with no listeners, are dropped and counted.
    pub fn relay_frame(&self, from: ConnectionId, device_id: &str, data: Bytes) -> RelayOutcome {
        self.counters.record_received();

        let bound = self
            .connections
            .get(&from)
            .map(|c| c.0 == Role::Producer && c.1 == device_id)
            .unwrap_or(false);
        if !bound {
            self.counters.record_unregistered();
            tracing::trace!("Frame for {} from unbound connection {}", device_id, from);
            return RelayOutcome::Unregistered;
        }

        let listeners: Vec<PeerHandle> = {
            let Some(mut entry) = self.devices.get_mut(device_id) else {
                self.counters.record_unregistered();
                return RelayOutcome::Unregistered;
            };
            if entry.producer.as_ref().map(|p| p.id()) != Some(from) {
                self.counters.record_unregistered();
                return RelayOutcome::Unregistered;
            }
            match entry.session.as_mut() {
                Some(session) if !session.listeners.is_empty() => {
                    session.frames_relayed += 1;
                    session.listeners.values().cloned().collect()
                }
                _ => {
                    self.counters.record_no_listener();
                    return RelayOutcome::NoListeners;
                }
            }
        };

        let result = fan_out(&listeners, &data, &self.counters);
        self.commands.touch(device_id);

        for stale in &result.stale {
            self.counters.record_stale();
            self.unregister(*stale);
        }

        RelayOutcome::Relayed {
            delivered: result.delivered,
            dropped: result.dropped,
        }
    }

    /// Remove a connection on disconnect. Returns the role it held.
    pub fn unregister(&self, id: ConnectionId) -> Option<Role> {
        let (_, (role, device_id)) = self.connections.remove(&id)?;
        match role {
            Role::Producer => self.remove_producer(id, &device_id),
            Role::Listener => self.remove_listener(id, &device_id),
        }
        Some(role)
    }

    /// Route a listener's command to the device's producer, queueing it while
    /// the producer is offline
    pub fn route_command(
        &self,
        device_id: &str,
        command: CommandType,
        data: serde_json::Value,
    ) -> Result<CommandRouting, RegistryError> {
        if device_id.trim().is_empty() {
            return Err(RegistryError::MissingDeviceId);
        }

        match command {
            CommandType::StartStream => self.commands.start_session(device_id),
            CommandType::StopStream => {
                self.commands.end_session(device_id);
            }
            CommandType::StartRecording | CommandType::StopRecording => {
                let recording = command == CommandType::StartRecording;
                self.commands.set_recording(device_id, recording);
                self.set_session_recording(device_id, recording);
            }
        }

        let producer = self
            .devices
            .get(device_id)
            .and_then(|entry| entry.producer.clone());

        if let Some(producer) = producer {
            let mut cmd = Command::new(command, data);
            cmd.status = CommandStatus::Delivered;
            if producer.notify(cmd.to_message(false)) {
                tracing::debug!("Delivered {:?} to {}", command, device_id);
                return Ok(CommandRouting::Delivered(cmd));
            }
            let queued = self.commands.enqueue(device_id, command, cmd.data);
            return Ok(CommandRouting::Queued(queued));
        }

        let queued = self.commands.enqueue(device_id, command, data);
        tracing::info!("Producer {} offline, queued {:?}", device_id, command);
        Ok(CommandRouting::Queued(queued))
    }

    /// Only registered listeners may send commands
    pub fn authorize_command(&self, from: ConnectionId) -> Result<(), RegistryError> {
        match self.connection(from) {
            Some((Role::Listener, _)) => Ok(()),
            _ => Err(RegistryError::NotListener),
        }
    }

    /// Role and device a connection registered under
    pub fn connection(&self, id: ConnectionId) -> Option<(Role, DeviceId)> {
        self.connections.get(&id).map(|c| c.value().clone())
    }

    pub fn has_producer(&self, device_id: &str) -> bool {
        self.devices
            .get(device_id)
            .map(|e| e.producer.is_some())
            .unwrap_or(false)
    }

    pub fn listener_count(&self, device_id: &str) -> usize {
        self.devices
            .get(device_id)
            .and_then(|e| e.session.as_ref().map(Session::listener_count))
            .unwrap_or(0)
    }

    pub fn session_info(&self, device_id: &str) -> Option<SessionInfo> {
        let info = {
            let entry = self.devices.get(device_id)?;
            self.describe(device_id, &entry)
        };
        Some(self.with_queue_state(info))
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let infos: Vec<SessionInfo> = self
            .devices
            .iter()
            .map(|entry| self.describe(entry.key(), entry.value()))
            .collect();
        let mut infos: Vec<SessionInfo> =
            infos.into_iter().map(|i| self.with_queue_state(i)).collect();
        infos.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        infos
    }

    /// Devices with a live session
    pub fn session_count(&self) -> usize {
        self.devices.iter().filter(|e| e.session.is_some()).count()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn stats(&self) -> RelayStats {
        self.counters.snapshot()
    }

    fn describe(&self, device_id: &str, entry: &DeviceEntry) -> SessionInfo {
        SessionInfo {
            device_id: device_id.to_string(),
            producer_online: entry.producer.is_some(),
            listeners: entry.session.as_ref().map_or(0, Session::listener_count),
            recording: entry.session.as_ref().is_some_and(Session::is_recording),
            started_at: entry.session.as_ref().map(|s| s.started_at),
            frames_relayed: entry.session.as_ref().map_or(0, Session::frames_relayed),
            stream_active: false,
            pending_commands: 0,
        }
    }

    fn with_queue_state(&self, mut info: SessionInfo) -> SessionInfo {
        info.stream_active = self.commands.is_session_active(&info.device_id);
        info.pending_commands = self.commands.pending_count(&info.device_id);
        info
    }

    fn is_registered_as(&self, id: ConnectionId, role: Role, device_id: &str) -> bool {
        self.connections
            .get(&id)
            .is_some_and(|c| c.0 == role && c.1 == device_id)
    }

    fn set_session_recording(&self, device_id: &str, recording: bool) {
        if let Some(mut entry) = self.devices.get_mut(device_id) {
            if let Some(session) = entry.session.as_mut() {
                session.recording = recording;
            }
        }
    }

    /// A connection registering under another role or device drops its
    /// earlier role first
    fn release_previous_role(&self, id: ConnectionId) {
        if self.connections.contains_key(&id) {
            tracing::debug!("Connection {} re-registering", id);
            self.unregister(id);
        }
    }

    fn remove_producer(&self, id: ConnectionId, device_id: &str) {
        let listeners: Vec<PeerHandle> = {
            let Some(mut entry) = self.devices.get_mut(device_id) else {
                return;
            };
            if entry.producer.as_ref().map(|p| p.id()) != Some(id) {
                // Already displaced by a newer producer connection
                return;
            }
            entry.producer = None;
            match entry.session.as_mut() {
                Some(session) => {
                    session.frames_relayed = 0;
                    session.recording = false;
                    session.listeners.values().cloned().collect()
                }
                None => Vec::new(),
            }
        };
        self.devices.remove_if(device_id, |_, e| e.is_vacant());

        for listener in &listeners {
            listener.notify(ServerMessage::ProducerDisconnected {
                device_id: device_id.to_string(),
            });
        }
        if self.commands.mark_replay_pending(device_id) {
            tracing::info!("Producer {} dropped mid-stream, replay armed", device_id);
        }
        tracing::info!(
            "Producer {} for {} disconnected ({} listener(s) waiting)",
            id,
            device_id,
            listeners.len()
        );
    }

    fn remove_listener(&self, id: ConnectionId, device_id: &str) {
        let (remaining, producer) = {
            let Some(mut guard) = self.devices.get_mut(device_id) else {
                return;
            };
            let entry = &mut *guard;
            let Some(session) = entry.session.as_mut() else {
                return;
            };
            if session.listeners.remove(&id).is_none() {
                return;
            }
            let remaining = session.listeners.len();
            if remaining == 0 {
                tracing::info!(
                    "Session for {} closed after {} frame(s)",
                    device_id,
                    session.frames_relayed
                );
                entry.session = None;
            }
            (remaining, entry.producer.clone())
        };
        self.devices.remove_if(device_id, |_, e| e.is_vacant());

        if remaining == 0 {
            self.commands.end_session(device_id);
        }
        if let Some(producer) = producer {
            producer.notify(ServerMessage::ListenerDisconnected {
                device_id: device_id.to_string(),
                listeners: remaining,
            });
        }
        tracing::info!(
            "Listener {} left {} ({} remaining)",
            id,
            device_id,
            remaining
        );
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(Arc::new(CommandQueue::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Message(msg) = item {
                out.push(msg);
            }
        }
        out
    }

    #[test]
    fn test_missing_device_id_rejected() {
        let registry = SessionRegistry::default();
        let (peer, _rx) = PeerHandle::channel(8);
        assert_eq!(
            registry.register_listener(" ", peer.clone()).unwrap_err(),
            RegistryError::MissingDeviceId
        );
        assert_eq!(
            registry.register_producer("", peer.clone()).unwrap_err(),
            RegistryError::MissingDeviceId
        );
        assert!(registry.connection(peer.id()).is_none());
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn test_link_notifications_both_orders() {
        let registry = SessionRegistry::default();
        let (producer, mut producer_rx) = PeerHandle::channel(8);
        let (listener, mut listener_rx) = PeerHandle::channel(8);

        registry.register_producer("dev-1", producer).unwrap();
        let reg = registry.register_listener("dev-1", listener).unwrap();
        assert_eq!(reg, ListenerRegistration { listeners: 1, producer_online: true });

        let producer_msgs = drain(&mut producer_rx);
        assert!(producer_msgs.contains(&ServerMessage::ListenerConnected {
            device_id: "dev-1".into(),
            listeners: 1
        }));
        let listener_msgs = drain(&mut listener_rx);
        assert_eq!(
            listener_msgs,
            vec![
                ServerMessage::Registered { device_id: "dev-1".into(), role: Role::Listener },
                ServerMessage::ProducerConnected { device_id: "dev-1".into() },
            ]
        );

        // Listener first, then producer
        let registry = SessionRegistry::default();
        let (producer, mut producer_rx) = PeerHandle::channel(8);
        let (listener, mut listener_rx) = PeerHandle::channel(8);
        let reg = registry.register_listener("dev-2", listener).unwrap();
        assert!(!reg.producer_online);
        let reg = registry.register_producer("dev-2", producer).unwrap();
        assert_eq!(reg.listeners, 1);

        assert!(drain(&mut producer_rx).contains(&ServerMessage::ProducerLinked {
            device_id: "dev-2".into(),
            listeners: 1
        }));
        assert!(drain(&mut listener_rx).contains(&ServerMessage::ProducerConnected {
            device_id: "dev-2".into()
        }));
    }

    #[test]
    fn test_relay_requires_bound_producer() {
        let registry = SessionRegistry::default();
        let (producer, _producer_rx) = PeerHandle::channel(8);
        let (imposter, _imposter_rx) = PeerHandle::channel(8);
        let (listener, _listener_rx) = PeerHandle::channel(8);

        registry.register_producer("dev-1", producer.clone()).unwrap();
        registry.register_listener("dev-1", listener).unwrap();

        let data = Bytes::from_static(b"pcm");
        assert_eq!(
            registry.relay_frame(imposter.id(), "dev-1", data.clone()),
            RelayOutcome::Unregistered
        );
        assert_eq!(
            registry.relay_frame(producer.id(), "dev-2", data.clone()),
            RelayOutcome::Unregistered
        );
        assert_eq!(
            registry.relay_frame(producer.id(), "dev-1", data),
            RelayOutcome::Relayed { delivered: 1, dropped: 0 }
        );
        assert_eq!(registry.stats().frames_dropped_unregistered, 2);
    }

    #[test]
    fn test_stale_listener_removed_during_relay() {
        let registry = SessionRegistry::default();
        let (producer, mut producer_rx) = PeerHandle::channel(8);
        let (alive, mut alive_rx) = PeerHandle::channel(8);
        let (dead, dead_rx) = PeerHandle::channel(8);

        registry.register_producer("dev-1", producer.clone()).unwrap();
        registry.register_listener("dev-1", alive).unwrap();
        registry.register_listener("dev-1", dead.clone()).unwrap();
        drop(dead_rx);
        drain(&mut producer_rx);
        drain(&mut alive_rx);

        let outcome = registry.relay_frame(producer.id(), "dev-1", Bytes::from_static(b"pcm"));
        assert_eq!(outcome, RelayOutcome::Relayed { delivered: 1, dropped: 0 });
        assert_eq!(registry.listener_count("dev-1"), 1);
        assert!(registry.connection(dead.id()).is_none());
        assert_eq!(registry.stats().stale_listeners_removed, 1);
        assert!(drain(&mut producer_rx).contains(&ServerMessage::ListenerDisconnected {
            device_id: "dev-1".into(),
            listeners: 1
        }));
    }

    #[test]
    fn test_last_listener_tears_down_session() {
        let registry = SessionRegistry::default();
        let (producer, mut producer_rx) = PeerHandle::channel(8);
        let (listener, _listener_rx) = PeerHandle::channel(8);

        registry.register_producer("dev-1", producer.clone()).unwrap();
        registry.register_listener("dev-1", listener.clone()).unwrap();
        registry
            .route_command("dev-1", CommandType::StartStream, json!({}))
            .unwrap();
        assert!(registry.commands().is_session_active("dev-1"));

        assert_eq!(registry.unregister(listener.id()), Some(Role::Listener));
        assert_eq!(registry.session_count(), 0);
        assert!(!registry.commands().is_session_active("dev-1"));
        assert!(drain(&mut producer_rx).contains(&ServerMessage::ListenerDisconnected {
            device_id: "dev-1".into(),
            listeners: 0
        }));
        assert_eq!(
            registry.relay_frame(producer.id(), "dev-1", Bytes::from_static(b"pcm")),
            RelayOutcome::NoListeners
        );
    }

    #[test]
    fn test_producer_disconnect_keeps_waiting_listeners() {
        let registry = SessionRegistry::default();
        let (producer, _producer_rx) = PeerHandle::channel(8);
        let (listener, mut listener_rx) = PeerHandle::channel(8);

        registry.register_producer("dev-1", producer.clone()).unwrap();
        registry.register_listener("dev-1", listener).unwrap();
        registry.relay_frame(producer.id(), "dev-1", Bytes::from_static(b"pcm"));
        drain(&mut listener_rx);

        assert_eq!(registry.unregister(producer.id()), Some(Role::Producer));
        assert!(!registry.has_producer("dev-1"));
        assert_eq!(registry.listener_count("dev-1"), 1);
        assert_eq!(registry.session_info("dev-1").unwrap().frames_relayed, 0);
        assert!(drain(&mut listener_rx).contains(&ServerMessage::ProducerDisconnected {
            device_id: "dev-1".into()
        }));
    }

    #[test]
    fn test_replaced_producer_is_closed_and_ignored() {
        let registry = SessionRegistry::default();
        let (old, mut old_rx) = PeerHandle::channel(8);
        let (new, _new_rx) = PeerHandle::channel(8);

        registry.register_producer("dev-1", old.clone()).unwrap();
        let reg = registry.register_producer("dev-1", new.clone()).unwrap();
        assert!(reg.replaced);

        let mut saw_close = false;
        while let Ok(item) = old_rx.try_recv() {
            saw_close |= matches!(item, Outbound::Close);
        }
        assert!(saw_close);

        // The old connection's late disconnect must not unbind the new one
        assert_eq!(registry.unregister(old.id()), None);
        assert!(registry.has_producer("dev-1"));
        assert_eq!(registry.connection(new.id()), Some((Role::Producer, "dev-1".into())));
    }

    #[test]
    fn test_command_routing_online_and_offline() {
        let registry = SessionRegistry::default();
        let routed = registry
            .route_command("dev-1", CommandType::StartRecording, json!({}))
            .unwrap();
        assert!(matches!(routed, CommandRouting::Queued(_)));
        assert_eq!(registry.commands().pending_count("dev-1"), 1);

        let (producer, mut producer_rx) = PeerHandle::channel(8);
        let reg = registry.register_producer("dev-1", producer).unwrap();
        assert_eq!(reg.delivered, 1);
        assert!(drain(&mut producer_rx).iter().any(|m| matches!(
            m,
            ServerMessage::Command { command: CommandType::StartRecording, replay: false, .. }
        )));

        let routed = registry
            .route_command("dev-1", CommandType::StopRecording, json!({}))
            .unwrap();
        assert!(matches!(routed, CommandRouting::Delivered(_)));
        assert_eq!(registry.commands().pending_count("dev-1"), 0);
    }

    #[test]
    fn test_drained_start_suppresses_replay() {
        let registry = SessionRegistry::default();
        let (producer, _rx) = PeerHandle::channel(16);
        let (listener, _lrx) = PeerHandle::channel(16);
        registry.register_listener("dev-1", listener).unwrap();
        registry.register_producer("dev-1", producer.clone()).unwrap();
        registry
            .route_command("dev-1", CommandType::StartStream, json!({}))
            .unwrap();
        registry.unregister(producer.id());

        // Listener asks again while the producer is offline
        registry
            .route_command("dev-1", CommandType::StartStream, json!({}))
            .unwrap();

        let (producer, mut rx) = PeerHandle::channel(16);
        let reg = registry.register_producer("dev-1", producer).unwrap();
        assert_eq!(reg.delivered, 1);
        assert!(!reg.replayed);
        let starts = drain(&mut rx)
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::Command { command: CommandType::StartStream, .. }))
            .count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn test_replay_restores_session_recording() {
        let registry = SessionRegistry::default();
        let (listener, _listener_rx) = PeerHandle::channel(16);
        registry.register_listener("dev-1", listener).unwrap();

        let (first, _first_rx) = PeerHandle::channel(16);
        registry.register_producer("dev-1", first.clone()).unwrap();
        registry
            .route_command("dev-1", CommandType::StartStream, json!({}))
            .unwrap();
        registry
            .route_command("dev-1", CommandType::StartRecording, json!({}))
            .unwrap();
        assert!(registry.session_info("dev-1").unwrap().recording);

        registry.unregister(first.id());
        assert!(!registry.session_info("dev-1").unwrap().recording);

        let (second, mut second_rx) = PeerHandle::channel(16);
        let reg = registry.register_producer("dev-1", second).unwrap();
        assert!(reg.replayed);
        assert!(drain(&mut second_rx).iter().any(|m| matches!(
            m,
            ServerMessage::Command { command: CommandType::StartStream, replay: true, data, .. }
                if data["recording"] == true
        )));
        assert!(registry.session_info("dev-1").unwrap().recording);
    }

    #[test]
    fn test_producer_reregistration_is_idempotent() {
        let registry = SessionRegistry::default();
        let (listener, mut listener_rx) = PeerHandle::channel(16);
        let (producer, mut producer_rx) = PeerHandle::channel(16);
        registry.register_listener("dev-1", listener).unwrap();
        registry.register_producer("dev-1", producer.clone()).unwrap();
        registry
            .route_command("dev-1", CommandType::StartStream, json!({}))
            .unwrap();
        drain(&mut listener_rx);
        drain(&mut producer_rx);

        let reg = registry.register_producer("dev-1", producer.clone()).unwrap();
        assert_eq!(
            reg,
            ProducerRegistration { listeners: 1, delivered: 0, replayed: false, replaced: false }
        );
        assert_eq!(
            drain(&mut producer_rx),
            vec![ServerMessage::Registered { device_id: "dev-1".into(), role: Role::Producer }]
        );
        assert!(drain(&mut listener_rx).is_empty());
        assert!(registry.commands().is_session_active("dev-1"));
        assert_eq!(registry.connection(producer.id()), Some((Role::Producer, "dev-1".into())));
    }

    #[test]
    fn test_listener_reregistration_is_idempotent() {
        let registry = SessionRegistry::default();
        let (producer, mut producer_rx) = PeerHandle::channel(16);
        let (listener, mut listener_rx) = PeerHandle::channel(16);
        registry.register_producer("dev-1", producer).unwrap();
        registry.register_listener("dev-1", listener.clone()).unwrap();
        drain(&mut producer_rx);
        drain(&mut listener_rx);

        let reg = registry.register_listener("dev-1", listener).unwrap();
        assert_eq!(reg, ListenerRegistration { listeners: 1, producer_online: true });
        assert_eq!(
            drain(&mut listener_rx),
            vec![ServerMessage::Registered { device_id: "dev-1".into(), role: Role::Listener }]
        );
        assert!(drain(&mut producer_rx).is_empty());
        assert_eq!(registry.session_count(), 1);
    }

    #[test]
    fn test_stop_stream_keeps_listeners_attached() {
        let registry = SessionRegistry::default();
        let (producer, _producer_rx) = PeerHandle::channel(16);
        let (listener, _listener_rx) = PeerHandle::channel(16);
        registry.register_producer("dev-1", producer.clone()).unwrap();
        registry.register_listener("dev-1", listener).unwrap();
        registry
            .route_command("dev-1", CommandType::StartStream, json!({}))
            .unwrap();
        registry
            .route_command("dev-1", CommandType::StopStream, json!({}))
            .unwrap();

        let info = registry.session_info("dev-1").unwrap();
        assert!(!info.stream_active);
        assert_eq!(info.listeners, 1);

        // Stopped stream arms no replay on reconnect
        registry.unregister(producer.id());
        let (producer, _rx) = PeerHandle::channel(16);
        assert!(!registry.register_producer("dev-1", producer).unwrap().replayed);
    }

    #[test]
    fn test_commands_require_registered_listener() {
        let registry = SessionRegistry::default();
        let (stranger, _stranger_rx) = PeerHandle::channel(8);
        let (producer, _producer_rx) = PeerHandle::channel(8);
        let (listener, _listener_rx) = PeerHandle::channel(8);
        registry.register_producer("dev-1", producer.clone()).unwrap();
        registry.register_listener("dev-1", listener.clone()).unwrap();

        assert_eq!(
            registry.authorize_command(stranger.id()),
            Err(RegistryError::NotListener)
        );
        assert_eq!(
            registry.authorize_command(producer.id()),
            Err(RegistryError::NotListener)
        );
        assert_eq!(registry.authorize_command(listener.id()), Ok(()));
    }
}
