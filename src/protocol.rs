//! Wire protocol shared by the relay server and its clients
//!
//! Control traffic is JSON text messages tagged by `type`. Audio travels as
//! binary messages laid out as:
//!
//! ```text
//! ┌──────────────────┬──────────────────────────┬─────────────────────┐
//! │ header len (u32) │ bincode(FrameHeader)     │ PCM payload (i16 LE)│
//! └──────────────────┴──────────────────────────┴─────────────────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audio::AudioFrame;
use crate::error::ProtocolError;

/// Opaque identifier of a producing device, stable across reconnects
pub type DeviceId = String;

/// Role a connection registers under
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Producer,
    Listener,
}

/// Control commands routed from listeners to producers
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    StartStream,
    StopStream,
    StartRecording,
    StopRecording,
}

/// Messages sent by clients to the relay
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    RegisterProducer {
        device_id: DeviceId,
    },
    RegisterListener {
        device_id: DeviceId,
    },
    Command {
        command: CommandType,
        #[serde(default)]
        data: serde_json::Value,
        device_id: DeviceId,
    },
    Ping {
        timestamp_ms: i64,
    },
}

/// Notifications sent by the relay to clients
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered {
        device_id: DeviceId,
        role: Role,
    },
    /// To listeners: the producer they wait for is online
    ProducerConnected {
        device_id: DeviceId,
    },
    /// To a producer: listeners were already waiting when it registered
    ProducerLinked {
        device_id: DeviceId,
        listeners: usize,
    },
    ProducerDisconnected {
        device_id: DeviceId,
    },
    ListenerConnected {
        device_id: DeviceId,
        listeners: usize,
    },
    ListenerDisconnected {
        device_id: DeviceId,
        listeners: usize,
    },
    Command {
        id: Uuid,
        command: CommandType,
        #[serde(default)]
        data: serde_json::Value,
        #[serde(default)]
        replay: bool,
        created_at: DateTime<Utc>,
    },
    /// To the requesting listener: the producer is offline, command queued
    CommandQueued {
        id: Uuid,
        device_id: DeviceId,
        command: CommandType,
    },
    Pong {
        timestamp_ms: i64,
    },
    Error {
        message: String,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Metadata preceding the PCM payload of a binary frame
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub device_id: DeviceId,
    pub sequence: u64,
    pub timestamp_ms: i64,
    pub recording: bool,
}

const HEADER_LEN_BYTES: usize = 4;

/// Encode a frame into a binary message
pub fn encode_frame(frame: &AudioFrame) -> Result<Bytes, ProtocolError> {
    let header = FrameHeader {
        device_id: frame.producer_id().to_string(),
        sequence: frame.sequence(),
        timestamp_ms: frame.timestamp_ms(),
        recording: frame.is_recording(),
    };
    let header = bincode::serialize(&header)?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN_BYTES + header.len() + frame.byte_len());
    buf.put_u32_le(header.len() as u32);
    buf.put_slice(&header);
    buf.put_slice(frame.payload());
    Ok(buf.freeze())
}

/// Decode a binary message; the payload shares the input buffer
pub fn decode_frame(data: Bytes) -> Result<AudioFrame, ProtocolError> {
    if data.len() < HEADER_LEN_BYTES {
        return Err(ProtocolError::TruncatedFrame(data.len()));
    }

    let header_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let payload_start = HEADER_LEN_BYTES
        .checked_add(header_len)
        .filter(|end| *end <= data.len())
        .ok_or(ProtocolError::TruncatedFrame(data.len()))?;

    let header: FrameHeader = bincode::deserialize(&data[HEADER_LEN_BYTES..payload_start])?;
    let payload = data.slice(payload_start..);
    if payload.len() % 2 != 0 {
        return Err(ProtocolError::OddPayload(payload.len()));
    }

    Ok(AudioFrame::new(
        header.device_id,
        header.sequence,
        header.timestamp_ms,
        payload,
        header.recording,
    ))
}

/// Milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_tags() {
        let msg = ClientMessage::RegisterListener {
            device_id: "dev-1".to_string(),
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"register_listener\""));
        assert!(json.contains("\"device_id\":\"dev-1\""));
    }

    #[test]
    fn test_command_without_data() {
        let msg = ClientMessage::from_json(
            r#"{"type":"command","command":"start_recording","device_id":"dev-1"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Command {
                command: CommandType::StartRecording,
                data: serde_json::Value::Null,
                device_id: "dev-1".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_message_rejected() {
        assert!(ClientMessage::from_json(r#"{"type":"teleport"}"#).is_err());
        assert!(ClientMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_server_message_serialization() {
        let msg = ServerMessage::Registered {
            device_id: "dev-1".to_string(),
            role: Role::Producer,
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"registered\""));
        assert!(json.contains("\"role\":\"producer\""));

        let msg = ServerMessage::ListenerDisconnected {
            device_id: "dev-1".to_string(),
            listeners: 0,
        };
        assert!(msg.to_json().unwrap().contains("\"type\":\"listener_disconnected\""));
    }

    #[test]
    fn test_frame_wire_layout() {
        let frame = AudioFrame::from_samples("dev-1", 42, 1_700_000_000_000, &[1, 2, 3], true);
        let wire = encode_frame(&frame).unwrap();

        let header_len = u32::from_le_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
        assert_eq!(wire.len(), 4 + header_len + 6);

        let decoded = decode_frame(wire).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_truncated_frames_rejected() {
        assert!(matches!(
            decode_frame(Bytes::from_static(&[1, 0])),
            Err(ProtocolError::TruncatedFrame(2))
        ));
        assert!(matches!(
            decode_frame(Bytes::from_static(&[200, 0, 0, 0, 1, 2])),
            Err(ProtocolError::TruncatedFrame(6))
        ));
    }

    #[test]
    fn test_odd_payload_rejected() {
        let frame = AudioFrame::new("dev-1", 0, 0, Bytes::from_static(&[1, 2, 3]), false);
        let wire = encode_frame(&frame).unwrap();
        assert!(matches!(decode_frame(wire), Err(ProtocolError::OddPayload(3))));
    }
}
