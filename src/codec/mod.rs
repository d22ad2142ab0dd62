//! Frame enhancement
//!
//! Pure PCM-in, PCM-out processing applied by the playback loop.

pub mod enhancer;
pub mod filter;

pub use enhancer::{Enhancer, EnhancerConfig, FilterMode, SharedEnhancerConfig, VolumeMode, MAX_GAIN_BOOST_DB};
