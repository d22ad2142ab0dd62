//! Jitter buffer for received audio frames
//!
//! A bounded single-producer single-consumer queue built on a lock-free
//! [`ArrayQueue`]. The network task pushes, the playback loop pops. On overflow
//! the oldest frame is evicted so latency stays bounded.
//!
//! Frames are played in arrival order. There is no reordering by sequence
//! number: frames that arrive out of order over the network are played out of
//! order.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::audio::AudioFrame;
use crate::constants::{DEFAULT_JITTER_CAPACITY, DEFAULT_MIN_FILL_FRAMES};

/// Playback gate state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferState {
    /// Waiting for `min_fill` frames before releasing any
    Buffering,
    /// Releasing frames until the buffer runs dry
    Playing,
}

/// Bounded drop-oldest jitter buffer with a fill-threshold gate
pub struct JitterBuffer {
    queue: ArrayQueue<AudioFrame>,
    min_fill: usize,
    /// Written only by the consumer
    buffering: AtomicBool,
    underruns: AtomicU64,
    evictions: AtomicU64,
    pushed: AtomicU64,
}

impl JitterBuffer {
    /// Create a buffer holding at most `capacity` frames that starts
    /// releasing frames once `min_fill` are queued
    pub fn new(capacity: usize, min_fill: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: ArrayQueue::new(capacity),
            min_fill: min_fill.clamp(1, capacity),
            buffering: AtomicBool::new(true),
            underruns: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            pushed: AtomicU64::new(0),
        }
    }

    /// Enqueue a frame, evicting the oldest one when full.
    ///
    /// Returns `true` if a frame was evicted.
    pub fn push(&self, frame: AudioFrame) -> bool {
        self.pushed.fetch_add(1, Ordering::Relaxed);
        match self.queue.force_push(frame) {
            Some(evicted) => {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Jitter buffer full, evicted frame {}", evicted.sequence());
                true
            }
            None => false,
        }
    }

    /// Dequeue the next frame without blocking.
    ///
    /// Returns `None` while buffering below the fill threshold, or when the
    /// buffer is empty. Running dry while playing is an underrun and moves the
    /// buffer back to buffering.
    pub fn pop(&self) -> Option<AudioFrame> {
        if self.buffering.load(Ordering::Acquire) {
            if self.queue.len() < self.min_fill {
                return None;
            }
            self.buffering.store(false, Ordering::Release);
        }

        match self.queue.pop() {
            Some(frame) => Some(frame),
            None => {
                self.buffering.store(true, Ordering::Release);
                self.underruns.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Current gate state
    pub fn state(&self) -> BufferState {
        if self.buffering.load(Ordering::Acquire) {
            BufferState::Buffering
        } else {
            BufferState::Playing
        }
    }

    /// Whether the next `pop` may release a frame
    pub fn is_ready(&self) -> bool {
        !self.buffering.load(Ordering::Acquire) || self.queue.len() >= self.min_fill
    }

    /// Frames currently queued
    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn min_fill(&self) -> usize {
        self.min_fill
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Transitions from playing back to buffering
    pub fn underrun_count(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Frames discarded by drop-oldest
    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Frames ever pushed
    pub fn pushed_count(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Drop all queued frames and return to buffering
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
        self.buffering.store(true, Ordering::Release);
    }

    /// Fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.depth() as f32 / self.capacity() as f32
    }

    pub fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            state: self.state(),
            depth: self.depth(),
            capacity: self.capacity(),
            min_fill: self.min_fill,
            underruns: self.underrun_count(),
            evictions: self.eviction_count(),
            pushed: self.pushed_count(),
        }
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_JITTER_CAPACITY, DEFAULT_MIN_FILL_FRAMES)
    }
}

/// Thread-safe handle to a jitter buffer
pub type SharedJitterBuffer = Arc<JitterBuffer>;

/// Jitter buffer statistics
#[derive(Debug, Clone, Serialize)]
pub struct JitterBufferStats {
    pub state: BufferState,
    pub depth: usize,
    pub capacity: usize,
    pub min_fill: usize,
    pub underruns: u64,
    pub evictions: u64,
    pub pushed: u64,
}
