//! Listening stream
//!
//! One `ListenStream` per subscribed producer. It owns the stream's jitter
//! buffer, diagnostics, enhancer settings and playback engine; nothing about a
//! stream lives in global state, so several streams (or tests) can run side by
//! side in one process.

use bytes::Bytes;
use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::audio::buffer::{JitterBuffer, SharedJitterBuffer};
use crate::audio::playback::{
    AudioSink, PlaybackEngine, PlaybackStats, ProcessedFrame, RecordingSink, StreamEvent,
};
use crate::audio::AudioFrame;
use crate::codec::{EnhancerConfig, SharedEnhancerConfig};
use crate::config::PlaybackConfig;
use crate::diagnostics::{ConnectionMetrics, QualityThresholds, QualityTier, StreamDiagnostics};
use crate::error::{AudioError, ProtocolError};
use crate::protocol::{decode_frame, DeviceId};

/// Network-side handle of a stream: the single producer of its jitter buffer
#[derive(Clone)]
pub struct FrameIngest {
    device_id: DeviceId,
    buffer: SharedJitterBuffer,
    diagnostics: Arc<StreamDiagnostics>,
}

impl FrameIngest {
    /// Queue a received frame. Returns `true` if an older frame was evicted.
    pub fn push(&self, frame: AudioFrame) -> bool {
        self.diagnostics
            .on_chunk_received(frame.byte_len(), Instant::now());
        self.buffer.push(frame)
    }

    /// Decode a binary message and queue it
    pub fn push_bytes(&self, data: Bytes) -> Result<QualityTier, ProtocolError> {
        let frame = decode_frame(data)?;
        if frame.producer_id() != self.device_id {
            tracing::debug!(
                "Ignoring frame for {} on stream {}",
                frame.producer_id(),
                self.device_id
            );
            return Ok(self.quality());
        }
        let tier = self
            .diagnostics
            .on_chunk_received(frame.byte_len(), Instant::now());
        self.buffer.push(frame);
        Ok(tier)
    }

    pub fn diagnostics(&self) -> &Arc<StreamDiagnostics> {
        &self.diagnostics
    }

    fn quality(&self) -> QualityTier {
        self.diagnostics
            .current_quality(Instant::now())
            .unwrap_or(QualityTier::Excellent)
    }
}

/// Per-stream state and playback for one producer
pub struct ListenStream {
    device_id: DeviceId,
    buffer: SharedJitterBuffer,
    diagnostics: Arc<StreamDiagnostics>,
    enhancer: SharedEnhancerConfig,
    engine: PlaybackEngine,
}

impl ListenStream {
    pub fn new(
        device_id: impl Into<DeviceId>,
        playback: &PlaybackConfig,
        enhancer: SharedEnhancerConfig,
        thresholds: QualityThresholds,
    ) -> Self {
        let buffer = Arc::new(JitterBuffer::new(playback.capacity, playback.min_fill));
        let diagnostics = Arc::new(StreamDiagnostics::new(thresholds));
        let engine = PlaybackEngine::new(buffer.clone(), enhancer.clone(), diagnostics.clone());
        Self {
            device_id: device_id.into(),
            buffer,
            diagnostics,
            enhancer,
            engine,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Handle for the network task feeding this stream
    pub fn ingest(&self) -> FrameIngest {
        FrameIngest {
            device_id: self.device_id.clone(),
            buffer: self.buffer.clone(),
            diagnostics: self.diagnostics.clone(),
        }
    }

    /// Start playback into `sink`
    pub fn start(
        &mut self,
        sink: Box<dyn AudioSink>,
        recorder: Option<Box<dyn RecordingSink>>,
    ) -> Result<(), AudioError> {
        self.buffer.clear();
        self.diagnostics.start(Instant::now());
        self.engine.start(sink, recorder)?;
        tracing::info!("Listening to {}", self.device_id);
        Ok(())
    }

    /// Stop playback; reports a sink failure that ended the stream
    pub fn stop(&mut self) -> Result<(), AudioError> {
        let result = self.engine.stop();
        self.buffer.clear();
        tracing::info!("Stopped listening to {}", self.device_id);
        result
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    pub fn events(&self) -> Receiver<StreamEvent> {
        self.engine.events()
    }

    pub fn subscribe_frames(&self, capacity: usize) -> Receiver<ProcessedFrame> {
        self.engine.subscribe_frames(capacity)
    }

    /// Current enhancer settings
    pub fn enhancer_config(&self) -> EnhancerConfig {
        self.enhancer.snapshot()
    }

    /// Replace the enhancer settings; applied from the next frame
    pub fn set_enhancer_config(&self, config: EnhancerConfig) {
        self.enhancer.store(config);
    }

    pub fn shared_enhancer(&self) -> &SharedEnhancerConfig {
        &self.enhancer
    }

    pub fn diagnostics(&self) -> &Arc<StreamDiagnostics> {
        &self.diagnostics
    }

    pub fn buffer(&self) -> &SharedJitterBuffer {
        &self.buffer
    }

    pub fn playback_stats(&self) -> PlaybackStats {
        self.engine.stats()
    }

    /// Recompute metrics now
    pub fn metrics(&self) -> ConnectionMetrics {
        self.diagnostics.tick(Some(&self.buffer), Instant::now())
    }

    /// Recompute metrics every `interval` on the tokio runtime, publishing
    /// each snapshot. The task ends when every receiver is dropped.
    pub fn spawn_metrics_ticker(
        &self,
        interval: Duration,
    ) -> (tokio::task::JoinHandle<()>, watch::Receiver<ConnectionMetrics>) {
        let buffer = self.buffer.clone();
        let diagnostics = self.diagnostics.clone();
        let (tx, rx) = watch::channel(diagnostics.last_tick());

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let metrics = diagnostics.tick(Some(&buffer), Instant::now());
                if tx.send(metrics).is_err() {
                    break;
                }
            }
        });

        (handle, rx)
    }
}
