//! Playback engine
//!
//! Drains a jitter buffer on a dedicated thread, enhances each frame and
//! writes it to an output sink. The sink write may block; the audio hardware
//! paces the whole pipeline.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::audio::buffer::{BufferState, SharedJitterBuffer};
use crate::audio::frame::frame_duration;
use crate::codec::{Enhancer, SharedEnhancerConfig};
use crate::constants::{SAMPLES_PER_FRAME, SAMPLE_RATE};
use crate::diagnostics::{AudioStatus, StreamDiagnostics};
use crate::error::AudioError;

/// Destination of processed PCM
pub trait AudioSink: Send {
    /// Write one frame of 16 kHz mono samples. May block.
    fn write(&mut self, samples: &[i16]) -> Result<(), AudioError>;

    /// Release the underlying device
    fn close(&mut self) {}
}

/// Sink that discards everything, for headless listeners
#[derive(Debug, Default)]
pub struct NullSink {
    pace: Option<Duration>,
}

impl NullSink {
    pub fn new() -> Self {
        Self { pace: None }
    }

    /// Sleep one frame duration per write to mimic hardware pacing
    pub fn paced() -> Self {
        Self {
            pace: Some(frame_duration()),
        }
    }
}

impl AudioSink for NullSink {
    fn write(&mut self, _samples: &[i16]) -> Result<(), AudioError> {
        if let Some(pace) = self.pace {
            thread::sleep(pace);
        }
        Ok(())
    }
}

/// Completed local recording
#[derive(Debug, Clone, Serialize)]
pub struct RecordingDescriptor {
    pub producer_id: String,
    pub started_at: DateTime<Utc>,
    pub frames: u64,
    pub duration_ms: u64,
    /// Where the sink stored the recording, if anywhere
    pub location: Option<String>,
}

/// Consumer of processed frames flagged for recording
pub trait RecordingSink: Send {
    fn write(&mut self, samples: &[i16]) -> Result<(), AudioError>;

    fn finish(self: Box<Self>) -> Result<RecordingDescriptor, AudioError>;
}

/// Processed frame handed to visualization taps
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    pub sequence: u64,
    pub timestamp_ms: i64,
    pub recording: bool,
    pub samples: Arc<[i16]>,
}

/// Stream lifecycle notifications
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Started,
    Buffering,
    Playing,
    Underrun { count: u64 },
    RecordingFinished(RecordingDescriptor),
    Error { message: String },
    Stopped,
}

/// Playback counters
#[derive(Debug, Default)]
struct PlaybackCounters {
    frames_played: AtomicU64,
    underruns: AtomicU64,
    tap_drops: AtomicU64,
}

/// Snapshot of playback counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlaybackStats {
    pub frames_played: u64,
    pub underruns: u64,
    pub tap_drops: u64,
}

impl PlaybackCounters {
    fn snapshot(&self) -> PlaybackStats {
        PlaybackStats {
            frames_played: self.frames_played.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            tap_drops: self.tap_drops.load(Ordering::Relaxed),
        }
    }
}

/// Everything the playback thread owns
struct LoopContext {
    buffer: SharedJitterBuffer,
    config: SharedEnhancerConfig,
    diagnostics: Arc<StreamDiagnostics>,
    running: Arc<AtomicBool>,
    stop_rx: Receiver<()>,
    events: Sender<StreamEvent>,
    taps: Arc<Mutex<Vec<Sender<ProcessedFrame>>>>,
    counters: Arc<PlaybackCounters>,
    idle_wait: Duration,
}

/// Consumer side of a stream: jitter buffer -> enhancer -> sink
pub struct PlaybackEngine {
    buffer: SharedJitterBuffer,
    config: SharedEnhancerConfig,
    diagnostics: Arc<StreamDiagnostics>,
    running: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
    thread_handle: Option<JoinHandle<Result<(), AudioError>>>,
    events_tx: Sender<StreamEvent>,
    events_rx: Receiver<StreamEvent>,
    taps: Arc<Mutex<Vec<Sender<ProcessedFrame>>>>,
    counters: Arc<PlaybackCounters>,
    idle_wait: Duration,
}

impl PlaybackEngine {
    pub fn new(
        buffer: SharedJitterBuffer,
        config: SharedEnhancerConfig,
        diagnostics: Arc<StreamDiagnostics>,
    ) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            buffer,
            config,
            diagnostics,
            running: Arc::new(AtomicBool::new(false)),
            stop_tx: None,
            thread_handle: None,
            events_tx,
            events_rx,
            taps: Arc::new(Mutex::new(Vec::new())),
            counters: Arc::new(PlaybackCounters::default()),
            idle_wait: frame_duration(),
        }
    }

    /// Override the wait between polls of an empty buffer
    pub fn with_idle_wait(mut self, wait: Duration) -> Self {
        self.idle_wait = wait;
        self
    }

    /// Lifecycle events of this engine
    pub fn events(&self) -> Receiver<StreamEvent> {
        self.events_rx.clone()
    }

    /// Receive a copy of every processed frame. Frames are dropped for a
    /// subscriber whose channel is full.
    pub fn subscribe_frames(&self, capacity: usize) -> Receiver<ProcessedFrame> {
        let (tx, rx) = bounded(capacity.max(1));
        self.taps.lock().push(tx);
        rx
    }

    /// Start the playback thread
    pub fn start(
        &mut self,
        sink: Box<dyn AudioSink>,
        recorder: Option<Box<dyn RecordingSink>>,
    ) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AudioError::AlreadyRunning);
        }
        // Reap a thread that exited on its own
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        self.stop_tx = Some(stop_tx);
        self.running.store(true, Ordering::SeqCst);

        let ctx = LoopContext {
            buffer: self.buffer.clone(),
            config: self.config.clone(),
            diagnostics: self.diagnostics.clone(),
            running: self.running.clone(),
            stop_rx,
            events: self.events_tx.clone(),
            taps: self.taps.clone(),
            counters: self.counters.clone(),
            idle_wait: self.idle_wait,
        };

        let _ = self.events_tx.send(StreamEvent::Started);

        let handle = thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || run_loop(ctx, sink, recorder))
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                AudioError::StreamError(e.to_string())
            })?;

        self.thread_handle = Some(handle);
        tracing::info!("Playback started");
        Ok(())
    }

    /// Signal the loop to stop and wait for teardown.
    ///
    /// Returns the sink error if the loop ended because the sink failed.
    pub fn stop(&mut self) -> Result<(), AudioError> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.try_send(());
        }

        match self.thread_handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| AudioError::StreamError("Playback thread panicked".to_string()))?,
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PlaybackStats {
        self.counters.snapshot()
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn run_loop(
    ctx: LoopContext,
    mut sink: Box<dyn AudioSink>,
    mut recorder: Option<Box<dyn RecordingSink>>,
) -> Result<(), AudioError> {
    let mut enhancer = Enhancer::new(SAMPLE_RATE);
    let mut pcm: Vec<i16> = Vec::with_capacity(SAMPLES_PER_FRAME);
    let mut processed: Vec<i16> = Vec::with_capacity(SAMPLES_PER_FRAME);
    let mut state = BufferState::Buffering;

    ctx.diagnostics.set_audio_status(AudioStatus::Buffering);
    let _ = ctx.events.send(StreamEvent::Buffering);

    let result = loop {
        if !ctx.running.load(Ordering::Relaxed) {
            break Ok(());
        }

        let Some(frame) = ctx.buffer.pop() else {
            if state == BufferState::Playing && ctx.buffer.state() == BufferState::Buffering {
                state = BufferState::Buffering;
                let count = ctx.counters.underruns.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!("Playback underrun #{}", count);
                ctx.diagnostics.set_audio_status(AudioStatus::Buffering);
                let _ = ctx.events.send(StreamEvent::Underrun { count });
                let _ = ctx.events.send(StreamEvent::Buffering);
            }

            match ctx.stop_rx.recv_timeout(ctx.idle_wait) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break Ok(()),
            }
        };

        if state == BufferState::Buffering {
            state = BufferState::Playing;
            ctx.diagnostics.set_audio_status(AudioStatus::Playing);
            let _ = ctx.events.send(StreamEvent::Playing);
        }

        let config = ctx.config.snapshot();
        frame.read_samples(&mut pcm);
        enhancer.process_into(&pcm, &config, &mut processed);

        if let Err(e) = sink.write(&processed) {
            tracing::error!("Output sink failed: {}", e);
            break Err(e);
        }
        ctx.counters.frames_played.fetch_add(1, Ordering::Relaxed);

        if frame.is_recording() {
            if let Some(rec) = recorder.as_mut() {
                if let Err(e) = rec.write(&processed) {
                    tracing::warn!("Recording sink failed, recording dropped: {}", e);
                    recorder = None;
                }
            }
        }

        forward_to_taps(&ctx, &frame, &processed);
    };

    ctx.running.store(false, Ordering::SeqCst);

    // Release the sink and the buffer before reporting the stop
    sink.close();
    drop(sink);
    let LoopContext {
        buffer,
        diagnostics,
        events,
        ..
    } = ctx;
    drop(buffer);

    if let Some(rec) = recorder {
        match rec.finish() {
            Ok(descriptor) => {
                let _ = events.send(StreamEvent::RecordingFinished(descriptor));
            }
            Err(e) => tracing::warn!("Failed to finalize recording: {}", e),
        }
    }

    match &result {
        Ok(()) => {
            diagnostics.set_audio_status(AudioStatus::Stopped);
        }
        Err(e) => {
            diagnostics.set_audio_status(AudioStatus::Error);
            let _ = events.send(StreamEvent::Error {
                message: e.to_string(),
            });
        }
    }
    let _ = events.send(StreamEvent::Stopped);
    tracing::info!("Playback stopped");

    result
}

fn forward_to_taps(ctx: &LoopContext, frame: &crate::audio::AudioFrame, processed: &[i16]) {
    let mut taps = ctx.taps.lock();
    if taps.is_empty() {
        return;
    }

    let shared = ProcessedFrame {
        sequence: frame.sequence(),
        timestamp_ms: frame.timestamp_ms(),
        recording: frame.is_recording(),
        samples: Arc::from(processed),
    };

    taps.retain(|tap| match tap.try_send(shared.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            ctx.counters.tap_drops.fetch_add(1, Ordering::Relaxed);
            true
        }
        Err(TrySendError::Disconnected(_)) => false,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::JitterBuffer;
    use crate::audio::AudioFrame;
    use std::time::Instant;

    #[derive(Clone, Default)]
    struct MemorySink {
        written: Arc<Mutex<Vec<Vec<i16>>>>,
        closed: Arc<AtomicBool>,
    }

    impl AudioSink for MemorySink {
        fn write(&mut self, samples: &[i16]) -> Result<(), AudioError> {
            self.written.lock().push(samples.to_vec());
            Ok(())
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct FailingSink {
        after: usize,
    }

    impl AudioSink for FailingSink {
        fn write(&mut self, _samples: &[i16]) -> Result<(), AudioError> {
            if self.after == 0 {
                return Err(AudioError::SinkFailed("device unplugged".to_string()));
            }
            self.after -= 1;
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct MemoryRecorder {
        frames: Arc<Mutex<u64>>,
    }

    impl RecordingSink for MemoryRecorder {
        fn write(&mut self, _samples: &[i16]) -> Result<(), AudioError> {
            *self.frames.lock() += 1;
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<RecordingDescriptor, AudioError> {
            let frames = *self.frames.lock();
            Ok(RecordingDescriptor {
                producer_id: "dev-1".to_string(),
                started_at: Utc::now(),
                frames,
                duration_ms: frames * 20,
                location: None,
            })
        }
    }

    fn engine(capacity: usize, min_fill: usize) -> (PlaybackEngine, SharedJitterBuffer) {
        let buffer = Arc::new(JitterBuffer::new(capacity, min_fill));
        let engine = PlaybackEngine::new(
            buffer.clone(),
            SharedEnhancerConfig::default(),
            Arc::new(StreamDiagnostics::default()),
        )
        .with_idle_wait(Duration::from_millis(2));
        (engine, buffer)
    }

    fn frame(seq: u64, recording: bool) -> AudioFrame {
        AudioFrame::from_samples("dev-1", seq, seq as i64 * 20, &vec![seq as i16; SAMPLES_PER_FRAME], recording)
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_plays_frames_in_order_then_underruns() {
        let (mut engine, buffer) = engine(100, 8);
        let sink = MemorySink::default();
        let events = engine.events();

        for seq in 0..8 {
            buffer.push(frame(seq, false));
        }
        engine.start(Box::new(sink.clone()), None).unwrap();

        assert!(wait_until(Duration::from_secs(2), || engine.stats().underruns == 1));
        engine.stop().unwrap();

        let written = sink.written.lock();
        assert_eq!(written.len(), 8);
        for (seq, samples) in written.iter().enumerate() {
            assert_eq!(samples.len(), SAMPLES_PER_FRAME);
            assert!(samples.iter().all(|s| *s == seq as i16));
        }
        assert!(sink.closed.load(Ordering::SeqCst));

        let events: Vec<StreamEvent> = events.try_iter().collect();
        assert!(matches!(events.first(), Some(StreamEvent::Started)));
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Playing)));
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Underrun { count: 1 })));
        assert!(matches!(events.last(), Some(StreamEvent::Stopped)));
        assert_eq!(buffer.underrun_count(), 1);
    }

    #[test]
    fn test_waits_for_fill_threshold() {
        let (mut engine, buffer) = engine(100, 8);
        let sink = MemorySink::default();
        for seq in 0..7 {
            buffer.push(frame(seq, false));
        }
        engine.start(Box::new(sink.clone()), None).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(sink.written.lock().is_empty());

        buffer.push(frame(7, false));
        assert!(wait_until(Duration::from_secs(2), || sink.written.lock().len() == 8));
        engine.stop().unwrap();
    }

    #[test]
    fn test_stop_is_responsive_while_buffering() {
        let (engine, _buffer) = engine(100, 8);
        let mut engine = engine.with_idle_wait(Duration::from_secs(10));
        engine.start(Box::new(NullSink::new()), None).unwrap();
        let started = Instant::now();
        engine.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!engine.is_running());
    }

    #[test]
    fn test_sink_failure_ends_stream() {
        let (mut engine, buffer) = engine(100, 1);
        let events = engine.events();
        for seq in 0..5 {
            buffer.push(frame(seq, false));
        }
        engine.start(Box::new(FailingSink { after: 2 }), None).unwrap();

        assert!(wait_until(Duration::from_secs(2), || !engine.is_running()));
        assert!(matches!(engine.stop(), Err(AudioError::SinkFailed(_))));
        assert_eq!(engine.stats().frames_played, 2);

        let events: Vec<StreamEvent> = events.try_iter().collect();
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));
        assert!(matches!(events.last(), Some(StreamEvent::Stopped)));
    }

    #[test]
    fn test_taps_and_recording() {
        let (mut engine, buffer) = engine(100, 1);
        let tap = engine.subscribe_frames(16);
        let recorder = MemoryRecorder::default();
        let events = engine.events();

        for seq in 0..4 {
            buffer.push(frame(seq, seq >= 2));
        }
        engine
            .start(Box::new(MemorySink::default()), Some(Box::new(recorder.clone())))
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || engine.stats().frames_played == 4));
        engine.stop().unwrap();

        let tapped: Vec<u64> = tap.try_iter().map(|f| f.sequence).collect();
        assert_eq!(tapped, vec![0, 1, 2, 3]);
        assert_eq!(*recorder.frames.lock(), 2);

        let finished = events
            .try_iter()
            .find_map(|e| match e {
                StreamEvent::RecordingFinished(d) => Some(d),
                _ => None,
            })
            .unwrap();
        assert_eq!(finished.frames, 2);
    }

    #[test]
    fn test_restart_after_stop() {
        let (mut engine, buffer) = engine(100, 1);
        engine.start(Box::new(NullSink::new()), None).unwrap();
        assert!(matches!(
            engine.start(Box::new(NullSink::new()), None),
            Err(AudioError::AlreadyRunning)
        ));
        engine.stop().unwrap();

        buffer.push(frame(0, false));
        engine.start(Box::new(NullSink::new()), None).unwrap();
        assert!(wait_until(Duration::from_secs(2), || engine.stats().frames_played == 1));
        engine.stop().unwrap();
    }
}
