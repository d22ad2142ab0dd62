//! Audio frame carried from producer to listeners
//!
//! Frames hold 16-bit little-endian mono PCM. The payload is a shared
//! [`Bytes`] so one received frame can be handed to several consumers
//! without copying the samples.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::{FRAME_DURATION_MS, SAMPLE_RATE};

/// One fixed-duration unit of PCM audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    producer_id: Arc<str>,
    sequence: u64,
    timestamp_ms: i64,
    payload: Bytes,
    recording: bool,
}

impl AudioFrame {
    pub fn new(
        producer_id: impl Into<Arc<str>>,
        sequence: u64,
        timestamp_ms: i64,
        payload: impl Into<Bytes>,
        recording: bool,
    ) -> Self {
        Self {
            producer_id: producer_id.into(),
            sequence,
            timestamp_ms,
            payload: payload.into(),
            recording,
        }
    }

    /// Build a frame from i16 samples
    pub fn from_samples(
        producer_id: impl Into<Arc<str>>,
        sequence: u64,
        timestamp_ms: i64,
        samples: &[i16],
        recording: bool,
    ) -> Self {
        Self::new(producer_id, sequence, timestamp_ms, samples_to_bytes(samples), recording)
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Payload size in bytes
    pub fn byte_len(&self) -> usize {
        self.payload.len()
    }

    /// Number of 16-bit samples in the payload
    pub fn sample_count(&self) -> usize {
        self.payload.len() / 2
    }

    /// Frame duration in milliseconds at the relay sample rate
    pub fn duration_ms(&self) -> u64 {
        if self.payload.is_empty() {
            return 0;
        }
        (self.sample_count() as u64 * 1000) / SAMPLE_RATE as u64
    }

    /// Decode the payload into `out`, replacing its contents
    pub fn read_samples(&self, out: &mut Vec<i16>) {
        bytes_to_samples(&self.payload, out);
    }

    /// Decode the payload into a new sample vector
    pub fn samples(&self) -> Vec<i16> {
        let mut out = Vec::with_capacity(self.sample_count());
        self.read_samples(&mut out);
        out
    }
}

/// Encode samples as little-endian 16-bit PCM
pub fn samples_to_bytes(samples: &[i16]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for &s in samples {
        buf.put_i16_le(s);
    }
    buf.freeze()
}

/// Decode little-endian 16-bit PCM into `out`; a trailing odd byte is ignored
pub fn bytes_to_samples(bytes: &[u8], out: &mut Vec<i16>) {
    out.clear();
    out.extend(
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
    );
}

/// Nominal frame duration
pub fn frame_duration() -> std::time::Duration {
    std::time::Duration::from_millis(FRAME_DURATION_MS)
}
