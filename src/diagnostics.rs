//! Connection-quality estimation and live stream diagnostics

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::audio::buffer::JitterBuffer;

/// Connection quality derived from the gap between received chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityTier {
    /// Classify a chunk gap in milliseconds
    pub fn classify(gap_ms: u64, thresholds: &QualityThresholds) -> Self {
        if gap_ms < thresholds.excellent_ms {
            QualityTier::Excellent
        } else if gap_ms < thresholds.good_ms {
            QualityTier::Good
        } else if gap_ms < thresholds.fair_ms {
            QualityTier::Fair
        } else {
            QualityTier::Poor
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QualityTier::Excellent => "excellent",
            QualityTier::Good => "good",
            QualityTier::Fair => "fair",
            QualityTier::Poor => "poor",
        };
        f.write_str(s)
    }
}

/// Upper bounds (exclusive) of each quality tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub excellent_ms: u64,
    pub good_ms: u64,
    pub fair_ms: u64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            excellent_ms: 2_500,
            good_ms: 4_000,
            fair_ms: 6_000,
        }
    }
}

/// Socket state as reported by the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WsStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Retrying,
    Error,
}

/// Playback state surfaced to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioStatus {
    #[default]
    Idle,
    Buffering,
    Playing,
    Stopped,
    Error,
}

/// Point-in-time view of a stream's connection and audio health
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionMetrics {
    pub ws_status: WsStatus,
    pub audio_status: AudioStatus,
    pub quality: Option<QualityTier>,
    pub last_chunk_timestamp: Option<DateTime<Utc>>,
    pub last_chunk_gap_ms: Option<u64>,
    pub bytes_per_second: f64,
    pub bytes_received: u64,
    pub frames_received: u64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub underrun_count: u64,
    pub eviction_count: u64,
    pub network_type: String,
    pub ping_ms: Option<u64>,
}

/// A recorded socket state change
#[derive(Debug, Clone, Serialize)]
pub struct StatusTransition {
    pub at: DateTime<Utc>,
    pub from: WsStatus,
    pub to: WsStatus,
}

const TRANSITION_HISTORY: usize = 32;

struct ChunkClock {
    last_instant: Option<Instant>,
    last_wall: Option<DateTime<Utc>>,
    last_gap_ms: Option<u64>,
    quality: Option<QualityTier>,
}

struct StatusState {
    ws: WsStatus,
    audio: AudioStatus,
    network_type: String,
    ping_ms: Option<u64>,
    transitions: VecDeque<StatusTransition>,
}

/// Per-stream diagnostics shared by the network task, the playback loop and
/// any observer
pub struct StreamDiagnostics {
    thresholds: QualityThresholds,
    started_at: RwLock<Option<Instant>>,
    bytes_received: AtomicU64,
    frames_received: AtomicU64,
    clock: RwLock<ChunkClock>,
    status: RwLock<StatusState>,
    last_tick: RwLock<ConnectionMetrics>,
}

impl StreamDiagnostics {
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self {
            thresholds,
            started_at: RwLock::new(None),
            bytes_received: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            clock: RwLock::new(ChunkClock {
                last_instant: None,
                last_wall: None,
                last_gap_ms: None,
                quality: None,
            }),
            status: RwLock::new(StatusState {
                ws: WsStatus::Disconnected,
                audio: AudioStatus::Idle,
                network_type: "unknown".to_string(),
                ping_ms: None,
                transitions: VecDeque::with_capacity(TRANSITION_HISTORY),
            }),
            last_tick: RwLock::new(ConnectionMetrics::default()),
        }
    }

    /// Reset counters for a new stream
    pub fn start(&self, now: Instant) {
        *self.started_at.write() = Some(now);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.frames_received.store(0, Ordering::Relaxed);
        let mut clock = self.clock.write();
        clock.last_instant = None;
        clock.last_wall = None;
        clock.last_gap_ms = None;
        clock.quality = None;
    }

    /// Record a received chunk and classify the gap since the previous one.
    ///
    /// The first chunk of a stream has no gap and is classified excellent.
    pub fn on_chunk_received(&self, bytes: usize, now: Instant) -> QualityTier {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_received.fetch_add(1, Ordering::Relaxed);

        {
            let mut started = self.started_at.write();
            if started.is_none() {
                *started = Some(now);
            }
        }

        let mut clock = self.clock.write();
        let gap_ms = clock
            .last_instant
            .map(|last| now.saturating_duration_since(last).as_millis() as u64)
            .unwrap_or(0);
        let tier = QualityTier::classify(gap_ms, &self.thresholds);

        if clock.quality != Some(tier) {
            tracing::debug!("Connection quality {:?} -> {} ({} ms gap)", clock.quality, tier, gap_ms);
        }

        clock.last_instant = Some(now);
        clock.last_wall = Some(Utc::now());
        clock.last_gap_ms = Some(gap_ms);
        clock.quality = Some(tier);
        tier
    }

    /// Quality as of `now`, accounting for a stall since the last chunk
    pub fn current_quality(&self, now: Instant) -> Option<QualityTier> {
        let clock = self.clock.read();
        clock.last_instant.map(|last| {
            let gap = now.saturating_duration_since(last).as_millis() as u64;
            let stalled = QualityTier::classify(gap, &self.thresholds);
            stalled.max(clock.quality.unwrap_or(QualityTier::Excellent))
        })
    }

    /// Set the socket state, recording the transition
    pub fn set_ws_status(&self, status: WsStatus) {
        let mut state = self.status.write();
        if state.ws == status {
            return;
        }
        tracing::info!("Socket state {:?} -> {:?}", state.ws, status);
        if state.transitions.len() == TRANSITION_HISTORY {
            state.transitions.pop_front();
        }
        let from = state.ws;
        state.transitions.push_back(StatusTransition {
            at: Utc::now(),
            from,
            to: status,
        });
        state.ws = status;
    }

    pub fn ws_status(&self) -> WsStatus {
        self.status.read().ws
    }

    pub fn set_audio_status(&self, status: AudioStatus) {
        self.status.write().audio = status;
    }

    pub fn audio_status(&self) -> AudioStatus {
        self.status.read().audio
    }

    pub fn set_network_type(&self, network_type: impl Into<String>) {
        self.status.write().network_type = network_type.into();
    }

    pub fn set_ping(&self, ping: Duration) {
        self.status.write().ping_ms = Some(ping.as_millis() as u64);
    }

    pub fn transitions(&self) -> Vec<StatusTransition> {
        self.status.read().transitions.iter().cloned().collect()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Average receive rate since the stream started
    pub fn bytes_per_second(&self, now: Instant) -> f64 {
        let Some(start) = *self.started_at.read() else {
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(start).as_secs_f64();
        if elapsed > 0.0 {
            self.bytes_received() as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Recompute the full metrics snapshot; called on the periodic tick
    pub fn tick(&self, buffer: Option<&JitterBuffer>, now: Instant) -> ConnectionMetrics {
        let metrics = self.compute(buffer, now);
        *self.last_tick.write() = metrics.clone();
        metrics
    }

    /// Metrics computed on the most recent tick
    pub fn last_tick(&self) -> ConnectionMetrics {
        self.last_tick.read().clone()
    }

    fn compute(&self, buffer: Option<&JitterBuffer>, now: Instant) -> ConnectionMetrics {
        let quality = self.current_quality(now);
        let (last_chunk_timestamp, last_chunk_gap_ms) = {
            let clock = self.clock.read();
            (clock.last_wall, clock.last_gap_ms)
        };
        let status = self.status.read();

        ConnectionMetrics {
            ws_status: status.ws,
            audio_status: status.audio,
            quality,
            last_chunk_timestamp,
            last_chunk_gap_ms,
            bytes_per_second: self.bytes_per_second(now),
            bytes_received: self.bytes_received(),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            queue_depth: buffer.map_or(0, JitterBuffer::depth),
            queue_capacity: buffer.map_or(0, JitterBuffer::capacity),
            underrun_count: buffer.map_or(0, JitterBuffer::underrun_count),
            eviction_count: buffer.map_or(0, JitterBuffer::eviction_count),
            network_type: status.network_type.clone(),
            ping_ms: status.ping_ms,
        }
    }
}

impl Default for StreamDiagnostics {
    fn default() -> Self {
        Self::new(QualityThresholds::default())
    }
}
