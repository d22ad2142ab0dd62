//! Registry and relay scenarios across producer, listeners and the jitter
//! buffer, without sockets.

#![cfg(all(feature = "server", feature = "client"))]

use bytes::Bytes;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

use audio_relay::audio::{AudioFrame, BufferState};
use audio_relay::codec::SharedEnhancerConfig;
use audio_relay::config::PlaybackConfig;
use audio_relay::constants::{FRAME_BYTES, SAMPLES_PER_FRAME};
use audio_relay::diagnostics::QualityThresholds;
use audio_relay::protocol::{encode_frame, CommandType, Role, ServerMessage};
use audio_relay::server::{Outbound, PeerHandle, RelayOutcome, SessionRegistry};
use audio_relay::stream::ListenStream;

fn messages(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        if let Outbound::Message(msg) = item {
            out.push(msg);
        }
    }
    out
}

fn frames(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Bytes> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        if let Outbound::Frame(data) = item {
            out.push(data);
        }
    }
    out
}

fn wire(device: &str, seq: u64) -> Bytes {
    let samples: Vec<i16> = (0..SAMPLES_PER_FRAME).map(|i| (i as i16) * 10).collect();
    encode_frame(&AudioFrame::from_samples(device, seq, 1_700_000_000_000 + seq as i64 * 20, &samples, false)).unwrap()
}

#[test]
fn concurrent_listeners_share_one_session() {
    let registry = Arc::new(SessionRegistry::default());
    let mut receivers = Vec::new();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let (peer, rx) = PeerHandle::channel(16);
            receivers.push(rx);
            let registry = registry.clone();
            std::thread::spawn(move || registry.register_listener("dev-1", peer).unwrap())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(registry.session_count(), 1);
    assert_eq!(registry.listener_count("dev-1"), 16);
    assert_eq!(registry.connection_count(), 16);
}

#[test]
fn fan_out_is_byte_identical() {
    let registry = SessionRegistry::default();
    let (producer, _producer_rx) = PeerHandle::channel(16);
    let producer_id = producer.id();
    registry.register_producer("dev-1", producer).unwrap();

    let mut listener_rxs: Vec<_> = (0..3)
        .map(|_| {
            let (peer, rx) = PeerHandle::channel(16);
            registry.register_listener("dev-1", peer).unwrap();
            rx
        })
        .collect();

    let data = wire("dev-1", 0);
    let outcome = registry.relay_frame(producer_id, "dev-1", data.clone());
    assert_eq!(outcome, RelayOutcome::Relayed { delivered: 3, dropped: 0 });

    for rx in &mut listener_rxs {
        assert_eq!(frames(rx), vec![data.clone()]);
    }
    assert_eq!(registry.stats().bytes_relayed, 3 * data.len() as u64);
}

#[test]
fn frame_without_listeners_is_dropped() {
    let registry = SessionRegistry::default();
    let (producer, _rx) = PeerHandle::channel(16);
    let producer_id = producer.id();
    registry.register_producer("dev-1", producer).unwrap();

    assert_eq!(
        registry.relay_frame(producer_id, "dev-1", wire("dev-1", 0)),
        RelayOutcome::NoListeners
    );
    let stats = registry.stats();
    assert_eq!(stats.frames_dropped_no_listener, 1);
    assert_eq!(stats.frames_relayed, 0);
}

#[test]
fn replay_is_issued_once_per_reconnect() {
    let registry = SessionRegistry::default();
    let (listener, _listener_rx) = PeerHandle::channel(64);
    registry.register_listener("dev-1", listener).unwrap();
    registry
        .route_command("dev-1", CommandType::StartStream, json!({}))
        .unwrap();

    let (first, mut first_rx) = PeerHandle::channel(64);
    registry.register_producer("dev-1", first.clone()).unwrap();
    messages(&mut first_rx);
    registry.unregister(first.id());

    // Reconnect: exactly one replayed StartStream
    let (second, mut second_rx) = PeerHandle::channel(64);
    let registration = registry.register_producer("dev-1", second.clone()).unwrap();
    assert!(registration.replayed);
    let replays = messages(&mut second_rx)
        .into_iter()
        .filter(|m| matches!(m, ServerMessage::Command { replay: true, .. }))
        .count();
    assert_eq!(replays, 1);

    // A newer connection taking over without a drop gets no second replay
    let (third, mut third_rx) = PeerHandle::channel(64);
    let takeover = registry.register_producer("dev-1", third).unwrap();
    assert!(takeover.replaced);
    assert!(!takeover.replayed);
    assert!(!messages(&mut third_rx)
        .iter()
        .any(|m| matches!(m, ServerMessage::Command { replay: true, .. })));
}

#[test]
fn producer_stream_reaches_listener_playback() {
    let registry = SessionRegistry::default();
    let (producer, _producer_rx) = PeerHandle::channel(64);
    let producer_id = producer.id();
    registry.register_producer("dev-1", producer).unwrap();
    let (listener, mut listener_rx) = PeerHandle::channel(64);
    registry.register_listener("dev-1", listener).unwrap();

    let stream = ListenStream::new(
        "dev-1",
        &PlaybackConfig::default(),
        SharedEnhancerConfig::default(),
        QualityThresholds::default(),
    );
    let ingest = stream.ingest();

    for seq in 0..50 {
        let data = wire("dev-1", seq);
        registry.relay_frame(producer_id, "dev-1", data);

        for frame in frames(&mut listener_rx) {
            ingest.push_bytes(frame).unwrap();
        }
        if seq == 7 {
            // Fill threshold reached on the 8th frame
            assert!(stream.buffer().is_ready());
            let first = stream.buffer().pop().unwrap();
            assert_eq!(first.sequence(), 0);
            assert_eq!(first.byte_len(), FRAME_BYTES);
            assert_eq!(stream.buffer().state(), BufferState::Playing);
        }
    }

    assert_eq!(registry.stats().frames_relayed, 50);
    assert_eq!(registry.session_info("dev-1").unwrap().frames_relayed, 50);
    assert_eq!(stream.buffer().depth(), 49);
    assert_eq!(stream.metrics().frames_received, 50);
}

#[test]
fn listener_leaving_notifies_producer_and_drops_backlog() {
    let registry = SessionRegistry::default();
    let (producer, mut producer_rx) = PeerHandle::channel(64);
    let producer_id = producer.id();
    registry.register_producer("dev-1", producer).unwrap();

    let (first, _first_rx) = PeerHandle::channel(64);
    registry.register_listener("dev-1", first.clone()).unwrap();
    for seq in 0..5 {
        registry.relay_frame(producer_id, "dev-1", wire("dev-1", seq));
    }
    registry.unregister(first.id());

    assert!(messages(&mut producer_rx).contains(&ServerMessage::ListenerDisconnected {
        device_id: "dev-1".into(),
        listeners: 0,
    }));
    assert_eq!(registry.session_count(), 0);

    // A new listener only sees frames relayed after it joined
    let (second, mut second_rx) = PeerHandle::channel(64);
    registry.register_listener("dev-1", second).unwrap();
    let received = messages(&mut second_rx);
    assert!(received.contains(&ServerMessage::Registered {
        device_id: "dev-1".into(),
        role: Role::Listener,
    }));
    assert!(frames(&mut second_rx).is_empty());
    registry.relay_frame(producer_id, "dev-1", wire("dev-1", 5));
    assert_eq!(frames(&mut second_rx), vec![wire("dev-1", 5)]);
}
