//! Frame fan-out
//!
//! Forwards a producer's binary message to a snapshot of its listeners. The
//! snapshot is taken under the device's registry entry and sending happens
//! after the entry is released, so a slow listener never stalls registration
//! of other producers. Sends never wait: a full outbound queue drops the frame
//! for that listener only, a closed one marks the listener stale.

use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::error::TrySendError;

use crate::server::registry::{ConnectionId, Outbound, PeerHandle};

/// Relay counters shared by every connection
#[derive(Debug, Default)]
pub struct RelayCounters {
    frames_received: AtomicU64,
    frames_relayed: AtomicU64,
    deliveries: AtomicU64,
    bytes_relayed: AtomicU64,
    dropped_no_listener: AtomicU64,
    dropped_unregistered: AtomicU64,
    dropped_backpressure: AtomicU64,
    stale_removed: AtomicU64,
}

/// Snapshot of relay counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub frames_received: u64,
    /// Frames forwarded to at least one listener
    pub frames_relayed: u64,
    /// Individual listener deliveries
    pub deliveries: u64,
    pub bytes_relayed: u64,
    pub frames_dropped_no_listener: u64,
    pub frames_dropped_unregistered: u64,
    pub frames_dropped_backpressure: u64,
    pub stale_listeners_removed: u64,
}

impl RelayCounters {
    pub fn snapshot(&self) -> RelayStats {
        RelayStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_relayed: self.frames_relayed.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
            frames_dropped_no_listener: self.dropped_no_listener.load(Ordering::Relaxed),
            frames_dropped_unregistered: self.dropped_unregistered.load(Ordering::Relaxed),
            frames_dropped_backpressure: self.dropped_backpressure.load(Ordering::Relaxed),
            stale_listeners_removed: self.stale_removed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_no_listener(&self) {
        self.dropped_no_listener.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unregistered(&self) {
        self.dropped_unregistered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale(&self) {
        self.stale_removed.fetch_add(1, Ordering::Relaxed);
    }
}

/// What happened to one relayed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Forwarded; `delivered` listeners accepted it
    Relayed { delivered: usize, dropped: usize },
    /// No listener is registered for the producer
    NoListeners,
    /// Sender is not the bound producer of the frame's device
    Unregistered,
}

/// Result of sending one frame to a listener snapshot
#[derive(Debug, Default)]
pub(crate) struct FanOut {
    pub delivered: usize,
    pub dropped: usize,
    pub stale: Vec<ConnectionId>,
}

/// Send `data` to every listener in order, without waiting on any of them
pub(crate) fn fan_out(listeners: &[PeerHandle], data: &Bytes, counters: &RelayCounters) -> FanOut {
    let mut result = FanOut::default();

    for listener in listeners {
        match listener.sender().try_send(Outbound::Frame(data.clone())) {
            Ok(()) => result.delivered += 1,
            Err(TrySendError::Full(_)) => {
                result.dropped += 1;
                counters.dropped_backpressure.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Listener {} is behind, frame dropped", listener.id());
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!("Listener {} is gone, removing", listener.id());
                result.stale.push(listener.id());
            }
        }
    }

    if result.delivered > 0 {
        counters.frames_relayed.fetch_add(1, Ordering::Relaxed);
        counters
            .deliveries
            .fetch_add(result.delivered as u64, Ordering::Relaxed);
        counters
            .bytes_relayed
            .fetch_add((data.len() * result.delivered) as u64, Ordering::Relaxed);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out_isolates_failures() {
        let counters = RelayCounters::default();
        let (healthy, mut healthy_rx) = PeerHandle::channel(4);
        let (full, _full_rx) = PeerHandle::channel(1);
        let (closed, closed_rx) = PeerHandle::channel(4);
        drop(closed_rx);

        full.sender().try_send(Outbound::Close).unwrap();

        let data = Bytes::from_static(b"frame");
        let result = fan_out(&[closed.clone(), full, healthy], &data, &counters);

        assert_eq!(result.delivered, 1);
        assert_eq!(result.dropped, 1);
        assert_eq!(result.stale, vec![closed.id()]);

        match healthy_rx.try_recv().unwrap() {
            Outbound::Frame(bytes) => assert_eq!(bytes, data),
            other => panic!("unexpected {:?}", other),
        }

        let stats = counters.snapshot();
        assert_eq!(stats.frames_relayed, 1);
        assert_eq!(stats.deliveries, 1);
        assert_eq!(stats.frames_dropped_backpressure, 1);
        assert_eq!(stats.bytes_relayed, 5);
    }

    #[test]
    fn test_fan_out_to_nobody_is_not_relayed() {
        let counters = RelayCounters::default();
        let result = fan_out(&[], &Bytes::from_static(b"x"), &counters);
        assert_eq!(result.delivered, 0);
        assert_eq!(counters.snapshot().frames_relayed, 0);
    }
}
