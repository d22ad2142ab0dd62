//! Command queue
//!
//! Per-device FIFO of control commands for producers that are offline, plus
//! the stream-activity record the registry consults when a producer
//! reconnects. Each device's state sits in its own map entry, so operations on
//! different devices never contend.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::constants::{DEFAULT_COMMAND_CAPACITY, DEFAULT_SESSION_TIMEOUT_SECS};
use crate::protocol::{CommandType, DeviceId, ServerMessage};

/// Delivery state of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Delivered,
}

/// Control command addressed to a producer
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    pub id: Uuid,
    pub command: CommandType,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub status: CommandStatus,
}

impl Command {
    pub fn new(command: CommandType, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            command,
            data,
            created_at: Utc::now(),
            status: CommandStatus::Pending,
        }
    }

    /// Wire form sent to the producer
    pub fn to_message(&self, replay: bool) -> ServerMessage {
        ServerMessage::Command {
            id: self.id,
            command: self.command,
            data: self.data.clone(),
            replay,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug)]
struct DeviceQueue {
    commands: VecDeque<Command>,
    last_activity: Instant,
}

/// Stream activity of one device
#[derive(Debug, Clone)]
struct ActiveSession {
    started_at: DateTime<Utc>,
    last_activity: Instant,
    recording: bool,
    replay_pending: bool,
}

/// Snapshot of a device's stream activity
#[derive(Debug, Clone, Serialize)]
pub struct StreamActivity {
    pub device_id: DeviceId,
    pub started_at: DateTime<Utc>,
    pub recording: bool,
    pub replay_pending: bool,
    pub idle_secs: u64,
}

/// Result of one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub queues_removed: usize,
    pub commands_removed: usize,
    pub sessions_removed: usize,
}

/// Bounded per-device command queues with stream activity tracking
pub struct CommandQueue {
    queues: DashMap<DeviceId, DeviceQueue>,
    sessions: DashMap<DeviceId, ActiveSession>,
    capacity: usize,
    timeout: Duration,
    evicted: AtomicU64,
}

impl CommandQueue {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            queues: DashMap::new(),
            sessions: DashMap::new(),
            capacity: capacity.max(1),
            timeout,
            evicted: AtomicU64::new(0),
        }
    }

    /// Append a pending command, evicting the oldest when the device's queue
    /// is full
    pub fn enqueue(
        &self,
        device_id: &str,
        command: CommandType,
        data: serde_json::Value,
    ) -> Command {
        let cmd = Command::new(command, data);
        let mut queue = self
            .queues
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceQueue {
                commands: VecDeque::new(),
                last_activity: Instant::now(),
            });

        if queue.commands.len() >= self.capacity {
            if let Some(old) = queue.commands.pop_front() {
                self.evicted.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Command queue for {} full, evicted {:?} {}",
                    device_id,
                    old.command,
                    old.id
                );
            }
        }
        queue.commands.push_back(cmd.clone());
        queue.last_activity = Instant::now();
        tracing::debug!("Queued {:?} for {} ({} pending)", command, device_id, queue.commands.len());
        cmd
    }

    /// Remove and return all pending commands in FIFO order, marked delivered
    pub fn drain_pending(&self, device_id: &str) -> Vec<Command> {
        let Some((_, queue)) = self.queues.remove(device_id) else {
            return Vec::new();
        };
        queue
            .commands
            .into_iter()
            .map(|mut cmd| {
                cmd.status = CommandStatus::Delivered;
                cmd
            })
            .collect()
    }

    /// Pending commands without removing them
    pub fn pending(&self, device_id: &str) -> Vec<Command> {
        self.queues
            .get(device_id)
            .map(|q| q.commands.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, device_id: &str) -> usize {
        self.queues.get(device_id).map(|q| q.commands.len()).unwrap_or(0)
    }

    /// Mark the device's stream active
    pub fn start_session(&self, device_id: &str) {
        let now = Instant::now();
        self.sessions
            .entry(device_id.to_string())
            .and_modify(|s| s.last_activity = now)
            .or_insert_with(|| ActiveSession {
                started_at: Utc::now(),
                last_activity: now,
                recording: false,
                replay_pending: false,
            });
    }

    /// Mark the device's stream inactive. Returns whether it was active.
    pub fn end_session(&self, device_id: &str) -> bool {
        self.sessions.remove(device_id).is_some()
    }

    pub fn set_recording(&self, device_id: &str, recording: bool) {
        if let Some(mut session) = self.sessions.get_mut(device_id) {
            session.recording = recording;
            session.last_activity = Instant::now();
        }
    }

    /// Refresh the inactivity clock of an active stream
    pub fn touch(&self, device_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(device_id) {
            session.last_activity = Instant::now();
        }
    }

    pub fn is_session_active(&self, device_id: &str) -> bool {
        self.sessions.contains_key(device_id)
    }

    pub fn session_info(&self, device_id: &str) -> Option<StreamActivity> {
        self.sessions.get(device_id).map(|s| StreamActivity {
            device_id: device_id.to_string(),
            started_at: s.started_at,
            recording: s.recording,
            replay_pending: s.replay_pending,
            idle_secs: s.last_activity.elapsed().as_secs(),
        })
    }

    /// Arm a replay for the next producer registration. Only active streams
    /// are replayed.
    pub fn mark_replay_pending(&self, device_id: &str) -> bool {
        match self.sessions.get_mut(device_id) {
            Some(mut session) => {
                session.replay_pending = true;
                true
            }
            None => false,
        }
    }

    /// Disarm a pending replay without issuing it
    pub fn clear_replay(&self, device_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(device_id) {
            session.replay_pending = false;
        }
    }

    /// Consume an armed replay, synthesizing the StartStream to reissue.
    ///
    /// The synthesized command never enters the queue.
    pub fn take_replay(&self, device_id: &str) -> Option<Command> {
        let mut session = self.sessions.get_mut(device_id)?;
        if !session.replay_pending {
            return None;
        }
        session.replay_pending = false;
        session.last_activity = Instant::now();

        let data = serde_json::json!({ "recording": session.recording });
        let mut cmd = Command::new(CommandType::StartStream, data);
        cmd.status = CommandStatus::Delivered;
        Some(cmd)
    }

    /// Commands evicted by the capacity bound
    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn queued_devices(&self) -> usize {
        self.queues.len()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Remove queues and stream records idle longer than the timeout
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let timeout = self.timeout;
        let expired = |last: Instant| now.saturating_duration_since(last) >= timeout;

        self.queues.retain(|device_id, queue| {
            if expired(queue.last_activity) {
                tracing::info!(
                    "Dropping {} stale command(s) for {}",
                    queue.commands.len(),
                    device_id
                );
                report.queues_removed += 1;
                report.commands_removed += queue.commands.len();
                false
            } else {
                true
            }
        });

        self.sessions.retain(|device_id, session| {
            if expired(session.last_activity) {
                tracing::info!("Expiring inactive stream for {}", device_id);
                report.sessions_removed += 1;
                false
            } else {
                true
            }
        });

        report
    }

    /// Run the sweep periodically on the tokio runtime
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let queue = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(queue) = queue.upgrade() else { break };
                let report = queue.sweep_at(Instant::now());
                if report != SweepReport::default() {
                    tracing::debug!("Command sweep: {:?}", report);
                }
            }
        })
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new(
            DEFAULT_COMMAND_CAPACITY,
            Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
        )
    }
}
