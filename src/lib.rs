//! # Audio Relay
//!
//! Live audio monitoring: a producing device streams PCM frames through a relay
//! server to one or more listening devices, which absorb network jitter and play
//! the stream back through a selectable enhancement pipeline.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────┐          ┌────────────────────────────────────────┐
//! │      PRODUCER DEVICE     │          │              RELAY SERVER              │
//! │  ┌────────────────────┐  │          │  ┌──────────────────────────────────┐  │
//! │  │ Microphone capture │  │          │  │  Session Registry (per device)   │  │
//! │  │ 16 kHz mono i16    │  │          │  │  producer ──► { listeners }      │  │
//! │  └─────────┬──────────┘  │          │  └───────────────┬──────────────────┘  │
//! │            ▼             │  binary  │                  │                     │
//! │  ┌────────────────────┐  │  frames  │  ┌───────────────▼──────────────────┐  │
//! │  │  ProducerClient    │──┼─────────►│  │  Relay (fan-out, drop on miss)   │  │
//! │  │  (command driven)  │◄─┼──────────┤  └───────────────┬──────────────────┘  │
//! │  └────────────────────┘  │ commands │  ┌───────────────┴──────────────────┐  │
//! └──────────────────────────┘          │  │  Command Queue (offline + replay)│  │
//!                                       │  └──────────────────────────────────┘  │
//!                                       └──────────────────┬─────────────────────┘
//!                                                          │ WebSocket
//!                                                          ▼
//! ┌────────────────────────────────────────────────────────────────────────────────┐
//! │                               LISTENER DEVICE                                  │
//! │  ┌────────────────┐   ┌───────────────┐   ┌───────────────┐   ┌─────────────┐  │
//! │  │ ListenerClient │──►│ Jitter Buffer │──►│ Playback loop │──►│ Output sink │  │
//! │  │ (network task) │   │ drop-oldest   │   │ + Enhancer    │   │ (cpal)      │  │
//! │  └───────┬────────┘   └───────────────┘   └───────┬───────┘   └─────────────┘  │
//! │          │                                        │                            │
//! │          └──────────► Diagnostics ◄───────────────┘──► taps / recording sink   │
//! └────────────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod diagnostics;
pub mod error;
#[cfg(feature = "client")]
pub mod network;
pub mod protocol;
#[cfg(feature = "server")]
pub mod server;
#[cfg(feature = "client")]
pub mod stream;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// PCM sample rate of every relayed frame
    pub const SAMPLE_RATE: u32 = 16_000;

    /// Relayed audio is mono
    pub const CHANNELS: u16 = 1;

    /// Duration of one frame in milliseconds
    pub const FRAME_DURATION_MS: u64 = 20;

    /// Samples in one frame (16 kHz * 20 ms)
    pub const SAMPLES_PER_FRAME: usize = (SAMPLE_RATE as usize * FRAME_DURATION_MS as usize) / 1000;

    /// Bytes in one 16-bit PCM frame
    pub const FRAME_BYTES: usize = SAMPLES_PER_FRAME * 2;

    /// Frames buffered before playback starts (160 ms)
    pub const DEFAULT_MIN_FILL_FRAMES: usize = 8;

    /// Jitter buffer capacity in frames (2 s)
    pub const DEFAULT_JITTER_CAPACITY: usize = 100;

    /// Default relay server port
    pub const DEFAULT_SERVER_PORT: u16 = 3000;

    /// WebSocket endpoint path
    pub const WS_PATH: &str = "/ws";

    /// Default heartbeat interval in seconds
    pub const DEFAULT_HEARTBEAT_SECS: u64 = 25;

    /// Missed heartbeat intervals before a connection is considered half-open
    pub const HEARTBEAT_MISSES: u32 = 3;

    /// Outbound messages queued per connection before frames are dropped
    pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

    /// Pending commands kept per offline device
    pub const DEFAULT_COMMAND_CAPACITY: usize = 64;

    /// Inactivity timeout for queued commands and stream sessions
    pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 300;

    /// Interval of the command queue sweep
    pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

    /// Interval of the diagnostics tick
    pub const METRICS_TICK_MS: u64 = 2_000;
}
