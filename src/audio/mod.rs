//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod frame;
pub mod output;
pub mod playback;
pub mod resample;

pub use buffer::{BufferState, JitterBuffer, JitterBufferStats, SharedJitterBuffer};
pub use capture::{FrameSource, MicrophoneSource, ToneSource};
pub use device::{find_device, list_devices, AudioDevice, AudioDeviceInfo, Direction};
pub use frame::AudioFrame;
pub use output::CpalSink;
pub use playback::{
    AudioSink, NullSink, PlaybackEngine, PlaybackStats, ProcessedFrame, RecordingDescriptor,
    RecordingSink, StreamEvent,
};
