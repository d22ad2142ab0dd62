//! Per-stream listening state

pub mod listen;

pub use listen::{FrameIngest, ListenStream};
